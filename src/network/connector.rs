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

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use bytes::BytesMut;
use parking_lot::{Mutex, RwLock};
use tokio::net::{lookup_host, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, warn};

use crate::filter::FilterChain;
use crate::network::connection::panic_message;
use crate::network::Connection;
use crate::service::ConnectorConfig;
use crate::AppError::{AddressResolution, Dial};
use crate::AppResult;

/// TCP client side, one outgoing connection at a time.
///
/// Unlike the acceptor, the connector binds its own chain directly to each
/// connection it makes instead of cloning it, so handler state survives a
/// reconnect. Clones share the same connector.
#[derive(Debug, Clone)]
pub struct Connector {
    inner: Arc<ConnectorInner>,
}

#[derive(Debug)]
struct ConnectorInner {
    name: String,
    config: ConnectorConfig,
    filter_chain: Arc<FilterChain>,
    conn: RwLock<Option<Arc<Connection>>>,
    notify_shutdown: broadcast::Sender<()>,
    shutdown_complete_tx: Mutex<Option<mpsc::Sender<()>>>,
    shutdown_complete_rx: tokio::sync::Mutex<mpsc::Receiver<()>>,
}

impl Connector {
    pub fn new(name: impl Into<String>, config: ConnectorConfig) -> Connector {
        let (notify_shutdown, _) = broadcast::channel(1);
        let (shutdown_complete_tx, shutdown_complete_rx) = mpsc::channel(1);
        Connector {
            inner: Arc::new(ConnectorInner {
                name: name.into(),
                config,
                filter_chain: Arc::new(FilterChain::new()),
                conn: RwLock::new(None),
                notify_shutdown,
                shutdown_complete_tx: Mutex::new(Some(shutdown_complete_tx)),
                shutdown_complete_rx: tokio::sync::Mutex::new(shutdown_complete_rx),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn filter_chain(&self) -> &FilterChain {
        &self.inner.filter_chain
    }

    /// The most recent connection, connected or not.
    pub fn connection(&self) -> Option<Arc<Connection>> {
        self.inner.conn.read().clone()
    }

    pub fn is_connected(&self) -> bool {
        self.connection().is_some_and(|conn| conn.is_connected())
    }

    pub fn is_shutdown(&self) -> bool {
        self.connection().is_some_and(|conn| conn.is_shutdown())
    }

    /// Dials `url` ("host:port") in the background and returns at once.
    ///
    /// A fresh connection bound to the shared chain replaces the previous one
    /// right away. On success the opened event fires, on failure the closed
    /// event fires, unless the connector was shut down meanwhile.
    pub fn async_connect(&self, url: impl Into<String>) {
        let url = url.into();
        if self.is_shutdown() {
            debug!("connector[{}] is shut down, ignore connect to {}", self.name(), url);
            return;
        }
        let Some(shutdown_complete_tx) = self.inner.shutdown_complete_tx.lock().clone() else {
            warn!("connector[{}] stopped, ignore connect to {}", self.name(), url);
            return;
        };
        let inner = self.inner.clone();
        tokio::spawn(async move { inner.connect(url, shutdown_complete_tx).await });
    }

    /// Writes through the chain of the current connection, `false` if there is
    /// none or it was shut down.
    pub fn write(&self, msg: BytesMut) -> bool {
        match self.connection() {
            Some(conn) if !conn.is_shutdown() => {
                conn.write(msg);
                true
            }
            _ => false,
        }
    }

    /// Shuts the current connection down silently.
    pub fn stop(&self) {
        if let Some(conn) = self.connection() {
            conn.shut_down();
        }
    }

    pub fn shut_down(&self) {
        self.stop();
    }

    /// Waits for every dial and connection task started by this connector.
    pub async fn wait_for_stop(&self) {
        drop(self.inner.shutdown_complete_tx.lock().take());
        let mut shutdown_complete_rx = self.inner.shutdown_complete_rx.lock().await;
        let _ = shutdown_complete_rx.recv().await;
        debug!("connector[{}] stopped", self.name());
    }
}

impl ConnectorInner {
    async fn connect(&self, url: String, shutdown_complete_tx: mpsc::Sender<()>) {
        let conn = Connection::new(
            None,
            self.config.connection_options(),
            self.notify_shutdown.subscribe(),
            shutdown_complete_tx,
        );
        conn.set_remote_addr(url.clone());
        conn.set_filter_chain(self.filter_chain.clone());
        *self.conn.write() = Some(conn.clone());

        match dial(&url).await {
            Ok(socket) => {
                if !conn.attach_socket(socket) {
                    debug!(
                        "connector[{}] connection to {} closed while dialing, drop the socket",
                        self.name, url
                    );
                    return;
                }
                info!("connector[{}] connected to {}", self.name, url);
                if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| conn.start())) {
                    error!(
                        "connector[{}] opened handler panicked with message: {}",
                        self.name,
                        panic_message(payload.as_ref())
                    );
                    conn.close();
                }
            }
            Err(e) => {
                error!("connector[{}] connect to {} failed: {}", self.name, url, e);
                // never opened, closing it still fires the closed event
                // unless a shutdown got there first
                conn.close();
            }
        }
    }
}

async fn dial(url: &str) -> AppResult<TcpStream> {
    let addr = lookup_host(url)
        .await
        .map_err(|e| AddressResolution(format!("{}: {}", url, e)))?
        .next()
        .ok_or_else(|| AddressResolution(format!("{}: no address found", url)))?;
    TcpStream::connect(addr)
        .await
        .map_err(|e| Dial(format!("{}: {}", addr, e)))
}
