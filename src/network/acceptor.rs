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

use std::net::SocketAddr;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::net::{lookup_host, TcpListener};
use tokio::sync::{broadcast, mpsc};
use tokio::time::{self, Duration};
use tracing::{debug, error, info};

use crate::filter::FilterChain;
use crate::network::connection::panic_message;
use crate::network::{Connection, ConnectionOptions};
use crate::service::{AcceptorConfig, Shutdown};
use crate::AppError::{AddressResolution, Bind, IllegalStateError};
use crate::AppResult;

const ACCEPT_BACKOFF_MIN: Duration = Duration::from_millis(5);
const ACCEPT_BACKOFF_MAX: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcceptorState {
    Idle,
    Listening,
    Stopped,
}

/// TCP server side.
///
/// Handlers are added to the template chain returned by [`Acceptor::filter_chain`]
/// before [`Acceptor::start`]. Every accepted socket becomes a [`Connection`]
/// with a fresh id and its own clone of the template chain.
///
/// Shutdown sequence: [`Acceptor::stop`] broadcasts the exit signal, the accept
/// loop and every connection loop see it and exit, each dropping its clone of
/// the completion sender. [`Acceptor::wait_for_stop`] drops the acceptor's own
/// sender and returns once the receiver reports every clone gone.
#[derive(Debug)]
pub struct Acceptor {
    config: AcceptorConfig,
    filter_chain: Arc<FilterChain>,
    next_connection_id: Arc<AtomicU32>,
    notify_shutdown: broadcast::Sender<()>,
    shutdown_complete_tx: Mutex<Option<mpsc::Sender<()>>>,
    shutdown_complete_rx: tokio::sync::Mutex<mpsc::Receiver<()>>,
    state: Mutex<AcceptorState>,
    local_addr: Mutex<Option<SocketAddr>>,
}

impl Acceptor {
    pub fn new(config: AcceptorConfig) -> Acceptor {
        let (notify_shutdown, _) = broadcast::channel(1);
        let (shutdown_complete_tx, shutdown_complete_rx) = mpsc::channel(1);
        Acceptor {
            config,
            filter_chain: Arc::new(FilterChain::new()),
            next_connection_id: Arc::new(AtomicU32::new(0)),
            notify_shutdown,
            shutdown_complete_tx: Mutex::new(Some(shutdown_complete_tx)),
            shutdown_complete_rx: tokio::sync::Mutex::new(shutdown_complete_rx),
            state: Mutex::new(AcceptorState::Idle),
            local_addr: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &AcceptorConfig {
        &self.config
    }

    /// Template chain cloned into every accepted connection.
    pub fn filter_chain(&self) -> &FilterChain {
        &self.filter_chain
    }

    pub fn state(&self) -> AcceptorState {
        *self.state.lock()
    }

    /// The bound address, useful when listening on port 0.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock()
    }

    /// Binds the listening socket and launches the accept loop in the background.
    pub async fn start(&self) -> AppResult<SocketAddr> {
        if self.state() != AcceptorState::Idle {
            return Err(IllegalStateError(format!(
                "acceptor can not start in state {:?}",
                self.state()
            )));
        }
        let shutdown_complete_tx = self
            .shutdown_complete_tx
            .lock()
            .clone()
            .ok_or_else(|| IllegalStateError("acceptor already waited for stop".to_string()))?;
        let listen_address = self.config.listen_address();
        let addr = lookup_host(&listen_address)
            .await
            .map_err(|e| AddressResolution(format!("{}: {}", listen_address, e)))?
            .next()
            .ok_or_else(|| AddressResolution(format!("{}: no address found", listen_address)))?;
        let listener = TcpListener::bind(addr).await.map_err(|e| {
            error!("acceptor bind {} failed: {}", addr, e);
            Bind(format!("{}: {}", addr, e))
        })?;
        let local_addr = listener.local_addr()?;

        let accept_loop = AcceptLoop {
            listener,
            template: self.filter_chain.clone(),
            options: self.config.connection_options(),
            next_connection_id: self.next_connection_id.clone(),
            shutdown: Shutdown::new(self.notify_shutdown.subscribe()),
            shutdown_complete_tx,
        };
        tokio::spawn(accept_loop.run());

        *self.state.lock() = AcceptorState::Listening;
        *self.local_addr.lock() = Some(local_addr);
        info!("acceptor listen to {}", local_addr);
        Ok(local_addr)
    }

    /// Broadcasts the exit signal to the accept loop and all connections.
    pub fn stop(&self) {
        *self.state.lock() = AcceptorState::Stopped;
        // no receiver left means nothing is running
        let _ = self.notify_shutdown.send(());
    }

    /// Waits until the accept loop and every connection task has finished.
    pub async fn wait_for_stop(&self) {
        drop(self.shutdown_complete_tx.lock().take());
        let mut shutdown_complete_rx = self.shutdown_complete_rx.lock().await;
        let _ = shutdown_complete_rx.recv().await;
        debug!("acceptor stopped");
    }
}

struct AcceptLoop {
    listener: TcpListener,
    template: Arc<FilterChain>,
    options: ConnectionOptions,
    next_connection_id: Arc<AtomicU32>,
    shutdown: Shutdown,
    shutdown_complete_tx: mpsc::Sender<()>,
}

impl AcceptLoop {
    async fn run(mut self) {
        let mut backoff = ACCEPT_BACKOFF_MIN;
        loop {
            if self.shutdown.poll_shutdown() {
                break;
            }
            let accepted = tokio::select! {
                res = self.listener.accept() => res,
                _ = self.shutdown.recv() => break,
            };
            let (socket, peer) = match accepted {
                Ok(accepted) => {
                    backoff = ACCEPT_BACKOFF_MIN;
                    accepted
                }
                Err(e) => {
                    error!("accept error: {}, retrying in {:?}", e, backoff);
                    tokio::select! {
                        _ = time::sleep(backoff) => {}
                        _ = self.shutdown.recv() => break,
                    }
                    backoff = (backoff * 2).min(ACCEPT_BACKOFF_MAX);
                    continue;
                }
            };

            // resubscribe before the second check so a stop racing with this
            // accept is seen either here or by the new connection
            let exit = self.shutdown.resubscribe();
            if self.shutdown.poll_shutdown() {
                break;
            }
            let conn = Connection::new(
                Some(socket),
                self.options.clone(),
                exit,
                self.shutdown_complete_tx.clone(),
            );
            let id = self.next_connection_id.fetch_add(1, Ordering::Relaxed) + 1;
            conn.set_id(id);
            debug!("accept a new connection[{}], id {}", peer, id);
            conn.set_filter_chain(self.template.new_instance_and_clone(&conn));
            // the opened event runs on this task, a faulty handler must not end the loop
            if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| conn.start())) {
                error!(
                    "connection[{}] opened handler panicked with message: {}",
                    conn.remote_addr(),
                    panic_message(payload.as_ref())
                );
                conn.close();
            }
        }
        info!("acceptor loop exit, stop listening on {:?}", self.listener.local_addr().ok());
    }
}
