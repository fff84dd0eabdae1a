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

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::network::ConnectionOptions;

use super::{AppError, AppResult};

pub const DEFAULT_SEND_QUEUE_SIZE: usize = 1024;
pub const DEFAULT_READ_BUFFER_SIZE: usize = 64 * 1024;
/// Ceiling on bytes read but not yet framed, independent from the message size limit.
pub const DEFAULT_MAX_BUFFERED_SIZE: usize = 8 * 1024 * 1024;

/// Configuration of a listening acceptor.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct AcceptorConfig {
    pub ip: String,
    pub port: u16,
    /// capacity of each accepted connection's outbound queue
    pub send_queue_size: usize,
    /// minimum seconds between two reads before the peer is considered dead, 0 disables it
    pub keep_alive_secs: u64,
    pub read_buffer_size: usize,
    pub max_buffered_size: usize,
}

impl Default for AcceptorConfig {
    fn default() -> Self {
        AcceptorConfig {
            ip: "0.0.0.0".to_string(),
            port: 0,
            send_queue_size: DEFAULT_SEND_QUEUE_SIZE,
            keep_alive_secs: 0,
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
            max_buffered_size: DEFAULT_MAX_BUFFERED_SIZE,
        }
    }
}

impl AcceptorConfig {
    pub fn new(port: u16, send_queue_size: usize, keep_alive_secs: u64) -> Self {
        AcceptorConfig {
            port,
            send_queue_size,
            keep_alive_secs,
            ..Default::default()
        }
    }

    pub fn with_ip(mut self, ip: impl Into<String>) -> Self {
        self.ip = ip.into();
        self
    }

    pub fn listen_address(&self) -> String {
        format!("{}:{}", self.ip, self.port)
    }

    pub fn connection_options(&self) -> ConnectionOptions {
        ConnectionOptions {
            send_queue_size: self.send_queue_size,
            keep_alive: Duration::from_secs(self.keep_alive_secs),
            read_buffer_size: self.read_buffer_size,
            max_buffered_size: self.max_buffered_size,
        }
    }
}

/// Configuration of an outbound connector.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ConnectorConfig {
    pub send_queue_size: usize,
    pub keep_alive_secs: u64,
    pub read_buffer_size: usize,
    pub max_buffered_size: usize,
}

impl Default for ConnectorConfig {
    fn default() -> Self {
        ConnectorConfig {
            send_queue_size: DEFAULT_SEND_QUEUE_SIZE,
            keep_alive_secs: 0,
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
            max_buffered_size: DEFAULT_MAX_BUFFERED_SIZE,
        }
    }
}

impl ConnectorConfig {
    pub fn new(send_queue_size: usize, keep_alive_secs: u64) -> Self {
        ConnectorConfig {
            send_queue_size,
            keep_alive_secs,
            ..Default::default()
        }
    }

    pub fn connection_options(&self) -> ConnectionOptions {
        ConnectionOptions {
            send_queue_size: self.send_queue_size,
            keep_alive: Duration::from_secs(self.keep_alive_secs),
            read_buffer_size: self.read_buffer_size,
            max_buffered_size: self.max_buffered_size,
        }
    }
}

/// Shape of the length-prefixed frames.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct CodecConfig {
    pub length_field_size: usize,
    /// whether the declared length counts the length field itself
    pub length_includes_header: bool,
}

impl Default for CodecConfig {
    fn default() -> Self {
        CodecConfig {
            length_field_size: 4,
            length_includes_header: true,
        }
    }
}

#[derive(Debug, Default, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct NetConfig {
    pub acceptor: AcceptorConfig,
    pub connector: ConnectorConfig,
    pub codec: CodecConfig,
}

impl NetConfig {
    /// Loads the configuration from a toml file, `STONENET_` prefixed environment
    /// variables override file values (`STONENET_ACCEPTOR__PORT=9000`).
    pub fn set_up_config<P: AsRef<Path>>(path: P) -> AppResult<NetConfig> {
        let path_str = path
            .as_ref()
            .to_str()
            .ok_or(AppError::InvalidValue(format!(
                "config file path: {}",
                path.as_ref().to_string_lossy()
            )))?;
        let config = config::Config::builder()
            .add_source(config::File::with_name(path_str))
            .add_source(
                config::Environment::with_prefix("STONENET")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let net_config: NetConfig = config.try_deserialize()?;
        Ok(net_config)
    }
}
