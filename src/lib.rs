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

mod codec;
mod filter;
mod network;
mod service;

pub use codec::{
    Decoder, Encoder, FrameDecoder, FrameEncoder, ProtocolDecoder, ProtocolEncoder,
    MAX_FRAME_SIZE,
};
pub use filter::{Bound, FilterChain, FilterContext, IoHandler};
pub use network::{
    Acceptor, AcceptorState, Connection, ConnectionOptions, ConnectionRegistry, ConnectionState,
    Connector,
};
pub use service::{
    setup_local_tracing, setup_tracing, AcceptorConfig, AppError, AppResult, CodecConfig,
    ConnectorConfig, LogGuard, NetConfig, Shutdown,
};
