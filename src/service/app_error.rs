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

pub type AppResult<T> = Result<T, AppError>;

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    /// connection errors
    #[error("connection has been shut down")]
    ConnectionShutdown,

    #[error("connection has been closed")]
    ConnectionClosed,

    #[error("write packet was blocking")]
    WriteBlocking,

    #[error("connection exception: {0}")]
    ConnectionException(String),

    /// codec errors
    #[error("malformed protocol: {0}")]
    MalformedProtocol(String),

    /// acceptor and connector errors
    #[error("resolve address error: {0}")]
    AddressResolution(String),

    #[error("bind error: {0}")]
    Bind(String),

    #[error("dial error: {0}")]
    Dial(String),

    /// general errors
    #[error("illegal state: {0}")]
    IllegalStateError(String),

    #[error("invalid value: {0}")]
    InvalidValue(String),

    #[error("io error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("config file error: {0}")]
    ConfigFileError(#[from] config::ConfigError),
}

impl AppError {
    /// Only a full send queue (or a flush timeout) is worth retrying, every other
    /// error is permanent for the connection it was raised on.
    pub fn is_transient(&self) -> bool {
        matches!(self, AppError::WriteBlocking)
    }
}
