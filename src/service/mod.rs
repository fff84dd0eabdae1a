// Copyright 2025 jonefeewang@gmail.com
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

pub use app_error::{AppError, AppResult};
pub use self::config::{
    AcceptorConfig, CodecConfig, ConnectorConfig, NetConfig, DEFAULT_MAX_BUFFERED_SIZE,
    DEFAULT_READ_BUFFER_SIZE, DEFAULT_SEND_QUEUE_SIZE,
};
pub use shutdown::Shutdown;
pub use tracing_config::{setup_local_tracing, setup_tracing, LogGuard};

mod app_error;
mod config;
mod shutdown;
mod tracing_config;
