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

use std::any::Any;
use std::fmt;
use std::future::Future;
use std::io::{self, ErrorKind};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_channel::TrySendError;
use bytes::BytesMut;
use futures::FutureExt;
use parking_lot::{Mutex, RwLock};
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufWriter};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc};
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::filter::FilterChain;
use crate::service::{
    Shutdown, DEFAULT_MAX_BUFFERED_SIZE, DEFAULT_READ_BUFFER_SIZE, DEFAULT_SEND_QUEUE_SIZE,
};
use crate::AppError::{
    ConnectionClosed, ConnectionException, ConnectionShutdown, MalformedProtocol, WriteBlocking,
};
use crate::AppResult;

/// Per-connection tuning, derived from the acceptor or connector config.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionOptions {
    /// capacity of the outbound queue, values below 1 are raised to 1
    pub send_queue_size: usize,
    /// read deadline between two reads, zero disables it
    pub keep_alive: Duration,
    pub read_buffer_size: usize,
    /// bytes read but not yet consumed by the chain before the peer is dropped
    pub max_buffered_size: usize,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        ConnectionOptions {
            send_queue_size: DEFAULT_SEND_QUEUE_SIZE,
            keep_alive: Duration::ZERO,
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
            max_buffered_size: DEFAULT_MAX_BUFFERED_SIZE,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Opened,
    Closed,
}

/// One socket endpoint plus its pipeline.
///
/// A connection is created closed, opened once by [`Connection::start`] and
/// closed for good by the first of: read error, write error, [`Connection::close`],
/// [`Connection::shut_down`] or the owner's global exit signal. Once opened it
/// runs two tasks: the read loop feeding the chain's inbound side and the write
/// loop draining the outbound queue in FIFO order.
pub struct Connection {
    id: AtomicU32,
    options: ConnectionOptions,
    socket: Mutex<Option<TcpStream>>,
    remote_addr: RwLock<String>,
    opened: AtomicBool,
    closed: AtomicBool,
    shutdown: AtomicBool,
    close_token: CancellationToken,
    send_tx: async_channel::Sender<BytesMut>,
    send_rx: async_channel::Receiver<BytesMut>,
    exit: Mutex<Option<broadcast::Receiver<()>>>,
    shutdown_complete_tx: Mutex<Option<mpsc::Sender<()>>>,
    chain: RwLock<Option<Arc<FilterChain>>>,
    custom_data: RwLock<Option<Arc<dyn Any + Send + Sync>>>,
}

impl Connection {
    /// `exit` is the owner's global exit signal, `shutdown_complete_tx` is the
    /// owner's completion group, handed to both loops on start.
    pub(crate) fn new(
        socket: Option<TcpStream>,
        options: ConnectionOptions,
        exit: broadcast::Receiver<()>,
        shutdown_complete_tx: mpsc::Sender<()>,
    ) -> Arc<Connection> {
        let (send_tx, send_rx) = async_channel::bounded(options.send_queue_size.max(1));
        let remote_addr = socket
            .as_ref()
            .and_then(|s| s.peer_addr().ok())
            .map(|addr| addr.to_string())
            .unwrap_or_default();
        Arc::new(Connection {
            id: AtomicU32::new(0),
            options,
            socket: Mutex::new(socket),
            remote_addr: RwLock::new(remote_addr),
            opened: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            shutdown: AtomicBool::new(false),
            close_token: CancellationToken::new(),
            send_tx,
            send_rx,
            exit: Mutex::new(Some(exit)),
            shutdown_complete_tx: Mutex::new(Some(shutdown_complete_tx)),
            chain: RwLock::new(None),
            custom_data: RwLock::new(None),
        })
    }

    /// A connection without a socket. Events and writes still travel through its
    /// chain and writes land in its send queue, which makes it handy to drive a
    /// pipeline without any I/O.
    pub fn detached(options: ConnectionOptions) -> Arc<Connection> {
        let (_, exit) = broadcast::channel(1);
        let (shutdown_complete_tx, _) = mpsc::channel(1);
        Connection::new(None, options, exit, shutdown_complete_tx)
    }

    /// Hands a dialed socket to a connection that has not started yet. A closed
    /// connection refuses it and the socket is dropped right away.
    pub(crate) fn attach_socket(&self, socket: TcpStream) -> bool {
        let mut slot = self.socket.lock();
        // close() raises the flag before it empties the slot under this lock
        if self.is_closed() {
            return false;
        }
        if let Ok(addr) = socket.peer_addr() {
            self.set_remote_addr(addr.to_string());
        }
        *slot = Some(socket);
        true
    }

    pub fn id(&self) -> u32 {
        self.id.load(Ordering::Relaxed)
    }

    pub fn set_id(&self, id: u32) {
        self.id.store(id, Ordering::Relaxed);
    }

    pub fn remote_addr(&self) -> String {
        self.remote_addr.read().clone()
    }

    pub fn set_remote_addr(&self, addr: impl Into<String>) {
        *self.remote_addr.write() = addr.into();
    }

    pub fn options(&self) -> &ConnectionOptions {
        &self.options
    }

    pub fn state(&self) -> ConnectionState {
        if self.opened.load(Ordering::Acquire) && !self.is_closed() {
            ConnectionState::Opened
        } else {
            ConnectionState::Closed
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Opened
    }

    pub fn set_custom_data<T: Any + Send + Sync>(&self, data: T) {
        *self.custom_data.write() = Some(Arc::new(data));
    }

    /// `None` when nothing is stored or the stored value is not a `T`.
    pub fn custom_data<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        let data = self.custom_data.read().clone()?;
        data.downcast::<T>().ok()
    }

    /// Binds `chain` to this connection, every event from now on goes through it.
    pub fn set_filter_chain(self: &Arc<Self>, chain: Arc<FilterChain>) {
        chain.set_con(self);
        *self.chain.write() = Some(chain);
    }

    pub fn filter_chain(&self) -> Option<Arc<FilterChain>> {
        self.chain.read().clone()
    }

    /// Number of framed buffers waiting for the write loop.
    pub fn pending_sends(&self) -> usize {
        self.send_rx.len()
    }

    /// Opens the connection: fires the opened event, then launches the read and
    /// write loops. Does nothing after a shutdown or on a connection without socket.
    pub fn start(self: &Arc<Self>) {
        if self.is_shutdown() {
            return;
        }
        if self.is_closed() {
            warn!("connection[{}] is closed and can not be reopened", self.remote_addr());
            return;
        }
        let Some(socket) = self.socket.lock().take() else {
            error!("connection[{}] start without a socket", self.remote_addr());
            return;
        };
        let (Some(exit), Some(complete_tx)) =
            (self.exit.lock().take(), self.shutdown_complete_tx.lock().take())
        else {
            error!("connection[{}] started twice", self.remote_addr());
            return;
        };
        if let Ok(addr) = socket.peer_addr() {
            self.set_remote_addr(addr.to_string());
        }

        self.opened.store(true, Ordering::Release);
        match self.filter_chain() {
            Some(chain) => chain.fire_conn_opened(),
            None => error!(
                "connection[{}] opened without a filter chain",
                self.remote_addr()
            ),
        }

        let (reader, writer) = socket.into_split();
        let write_exit = Shutdown::new(exit.resubscribe());
        let read_exit = Shutdown::new(exit);
        self.spawn_loop(
            "read loop",
            self.clone().read_loop(reader, read_exit),
            complete_tx.clone(),
        );
        self.spawn_loop(
            "write loop",
            self.clone().write_loop(writer, write_exit),
            complete_tx,
        );
    }

    /// Sends `msg` down the outbound side of the chain, starting at the tail.
    pub fn write(&self, msg: BytesMut) {
        match self.filter_chain() {
            Some(chain) => chain.fire_write(msg),
            None => error!(
                "connection[{}] write, but filter chain is not set, write failed",
                self.remote_addr()
            ),
        }
    }

    fn check_writable(&self) -> AppResult<()> {
        if self.is_shutdown() {
            return Err(ConnectionShutdown);
        }
        if self.is_closed() {
            return Err(ConnectionClosed);
        }
        Ok(())
    }

    /// Queues a framed buffer without waiting, `WriteBlocking` if the queue is full.
    pub fn try_flush(&self, msg: BytesMut) -> AppResult<()> {
        self.check_writable()?;
        self.send_tx.try_send(msg).map_err(|e| match e {
            TrySendError::Full(_) => WriteBlocking,
            TrySendError::Closed(_) => ConnectionException("send queue closed".to_string()),
        })
    }

    /// Queues a framed buffer. A zero `timeout` behaves like [`Connection::try_flush`],
    /// otherwise waits up to `timeout` for room in the queue, giving up early
    /// with `ConnectionClosed` if the connection closes meanwhile.
    pub async fn flush(&self, msg: BytesMut, timeout: Duration) -> AppResult<()> {
        if timeout.is_zero() {
            return self.try_flush(msg);
        }
        self.check_writable()?;
        tokio::select! {
            biased;
            res = self.send_tx.send(msg) => {
                res.map_err(|_| ConnectionException("send queue closed".to_string()))
            }
            _ = self.close_token.cancelled() => Err(ConnectionClosed),
            _ = time::sleep(timeout) => Err(WriteBlocking),
        }
    }

    /// Terminal transition, runs once no matter how many callers race here.
    /// Fires the closed event unless the connection was shut down first.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.close_token.cancel();
        self.send_tx.close();
        // only set when the loops never took them over
        drop(self.socket.lock().take());
        drop(self.exit.lock().take());
        drop(self.shutdown_complete_tx.lock().take());

        if self.is_shutdown() {
            debug!("connection[{}] shut down", self.remote_addr());
            return;
        }
        match self.filter_chain() {
            Some(chain) => chain.fire_conn_closed(),
            None => debug!(
                "connection[{}] closed without a filter chain",
                self.remote_addr()
            ),
        }
    }

    /// Silent close: the shutdown flag is set strictly before the teardown so the
    /// closed event is never fired.
    pub fn shut_down(&self) {
        if self.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        self.close();
    }

    fn spawn_loop<F>(self: &Arc<Self>, name: &'static str, task: F, complete_tx: mpsc::Sender<()>)
    where
        F: Future<Output = AppResult<()>> + Send + 'static,
    {
        let conn = self.clone();
        tokio::spawn(async move {
            let _complete_tx = complete_tx;
            debug!("connection[{}] {} start", conn.remote_addr(), name);
            match AssertUnwindSafe(task).catch_unwind().await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => info!("connection[{}] {} error: {}", conn.remote_addr(), name, e),
                Err(payload) => error!(
                    "connection[{}] {} panicked with message: {}",
                    conn.remote_addr(),
                    name,
                    panic_message(payload.as_ref())
                ),
            }
            conn.close();
            debug!("connection[{}] {} exit", conn.remote_addr(), name);
        });
    }

    async fn read_loop(self: Arc<Self>, mut reader: OwnedReadHalf, mut exit: Shutdown) -> AppResult<()> {
        let read_buffer_size = self.options.read_buffer_size.max(1);
        let mut buffer = BytesMut::with_capacity(read_buffer_size);
        loop {
            if exit.poll_shutdown() || self.is_closed() {
                return Ok(());
            }
            buffer.reserve(read_buffer_size);
            let read_len = tokio::select! {
                biased;
                _ = exit.recv() => return Ok(()),
                _ = self.close_token.cancelled() => return Ok(()),
                res = read_with_deadline(&mut reader, &mut buffer, self.options.keep_alive) => res?,
            };
            if read_len == 0 {
                debug!("connection[{}] read 0 bytes, peer closed", self.remote_addr());
                return Ok(());
            }
            if exit.poll_shutdown() || self.is_closed() {
                return Ok(());
            }
            if buffer.len() > self.options.max_buffered_size {
                return Err(MalformedProtocol(format!(
                    "{} unframed bytes buffered, limit is {}",
                    buffer.len(),
                    self.options.max_buffered_size
                )));
            }
            match self.filter_chain() {
                Some(chain) => chain.fire_message_received(&mut buffer),
                None => {
                    warn!(
                        "connection[{}] no filter chain, drop {} bytes",
                        self.remote_addr(),
                        buffer.len()
                    );
                    buffer.clear();
                }
            }
        }
    }

    async fn write_loop(self: Arc<Self>, writer: OwnedWriteHalf, mut exit: Shutdown) -> AppResult<()> {
        let mut writer = BufWriter::new(writer);
        loop {
            let msg = tokio::select! {
                biased;
                _ = exit.recv() => return Ok(()),
                _ = self.close_token.cancelled() => return Ok(()),
                msg = self.send_rx.recv() => match msg {
                    Ok(msg) => msg,
                    Err(_) => return Ok(()),
                },
            };
            if self.is_shutdown() || self.is_closed() {
                return Ok(());
            }
            // batch consecutive buffers, flush once the queue runs dry
            let flush = self.send_rx.is_empty();
            tokio::select! {
                biased;
                _ = self.close_token.cancelled() => return Ok(()),
                res = write_frame(&mut writer, &msg, flush) => res?,
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn try_recv_queued(&self) -> Option<BytesMut> {
        self.send_rx.try_recv().ok()
    }
}

async fn read_with_deadline(
    reader: &mut OwnedReadHalf,
    buffer: &mut BytesMut,
    keep_alive: Duration,
) -> AppResult<usize> {
    if keep_alive.is_zero() {
        return Ok(reader.read_buf(buffer).await?);
    }
    match time::timeout(keep_alive, reader.read_buf(buffer)).await {
        Ok(res) => Ok(res?),
        Err(_) => Err(io::Error::new(
            ErrorKind::TimedOut,
            format!("nothing read within {:?}", keep_alive),
        )
        .into()),
    }
}

async fn write_frame(
    writer: &mut BufWriter<OwnedWriteHalf>,
    msg: &[u8],
    flush: bool,
) -> AppResult<()> {
    writer.write_all(msg).await?;
    if flush {
        writer.flush().await?;
    }
    Ok(())
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&'static str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id())
            .field("remote_addr", &self.remote_addr())
            .field("state", &self.state())
            .field("shutdown", &self.is_shutdown())
            .field("pending_sends", &self.pending_sends())
            .finish()
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        debug!("connection[{}] dropped", self.remote_addr.get_mut());
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use rstest::{fixture, rstest};
    use tokio::net::TcpListener;

    use super::*;
    use crate::filter::{Bound, FilterContext, IoHandler};
    use crate::service::setup_local_tracing;

    #[fixture]
    #[once]
    fn setup() {
        setup_local_tracing().expect("failed to setup tracing");
    }

    #[derive(Default)]
    struct Events {
        opened: AtomicUsize,
        closed: AtomicUsize,
        received: Mutex<BytesMut>,
    }

    /// Counts lifecycle events and swallows every byte it reads.
    struct EventRecorder {
        events: Arc<Events>,
        panic_on_read: bool,
    }

    impl IoHandler for EventRecorder {
        fn bound(&self) -> Bound {
            Bound::INBOUND
        }

        fn conn_opened(&self, _ctx: &FilterContext<'_>) {
            self.events.opened.fetch_add(1, Ordering::SeqCst);
        }

        fn conn_closed(&self, _ctx: &FilterContext<'_>) {
            self.events.closed.fetch_add(1, Ordering::SeqCst);
        }

        fn message_received(&self, _ctx: &FilterContext<'_>, msg: &mut BytesMut) {
            if self.panic_on_read {
                panic!("recorder asked to panic");
            }
            self.events.received.lock().extend_from_slice(&msg.split());
        }

        fn clone_handler(&self) -> Box<dyn IoHandler> {
            Box::new(EventRecorder {
                events: self.events.clone(),
                panic_on_read: self.panic_on_read,
            })
        }
    }

    fn recorded(conn: &Arc<Connection>, panic_on_read: bool) -> Arc<Events> {
        let events = Arc::new(Events::default());
        let chain = Arc::new(FilterChain::new());
        chain.add_last(
            "recorder",
            EventRecorder {
                events: events.clone(),
                panic_on_read,
            },
        );
        conn.set_filter_chain(chain);
        events
    }

    fn options(send_queue_size: usize) -> ConnectionOptions {
        ConnectionOptions {
            send_queue_size,
            ..Default::default()
        }
    }

    async fn socket_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (client, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
        (client.unwrap(), accepted.unwrap().0)
    }

    async fn wait_until(cond: impl Fn() -> bool) {
        time::timeout(Duration::from_secs(5), async {
            while !cond() {
                time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    #[rstest]
    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_close_fires_once(_setup: ()) {
        let conn = Connection::detached(options(4));
        let events = recorded(&conn, false);

        let mut handles = Vec::new();
        for _ in 0..16 {
            let conn = conn.clone();
            handles.push(tokio::spawn(async move { conn.close() }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert!(conn.is_closed());
        assert_eq!(events.closed.load(Ordering::SeqCst), 1);
    }

    #[rstest]
    #[tokio::test]
    async fn test_shutdown_suppresses_closed_event(_setup: ()) {
        let conn = Connection::detached(options(4));
        let events = recorded(&conn, false);
        conn.shut_down();
        conn.close();
        conn.shut_down();
        assert!(conn.is_closed() && conn.is_shutdown());
        assert_eq!(events.closed.load(Ordering::SeqCst), 0);

        let conn = Connection::detached(options(4));
        let events = recorded(&conn, false);
        conn.close();
        conn.shut_down();
        assert_eq!(events.closed.load(Ordering::SeqCst), 1);
    }

    #[rstest]
    #[tokio::test]
    async fn test_flush_zero_timeout_on_full_queue(_setup: ()) {
        let conn = Connection::detached(options(2));
        conn.flush(BytesMut::from(&b"1"[..]), Duration::ZERO).await.unwrap();
        conn.flush(BytesMut::from(&b"2"[..]), Duration::ZERO).await.unwrap();

        let started = time::Instant::now();
        let result = conn.flush(BytesMut::from(&b"3"[..]), Duration::ZERO).await;
        assert!(matches!(result, Err(WriteBlocking)));
        assert!(started.elapsed() < Duration::from_millis(100));
        assert_eq!(conn.pending_sends(), 2);
    }

    #[rstest]
    #[tokio::test(start_paused = true)]
    async fn test_flush_timeout_elapses(_setup: ()) {
        let conn = Connection::detached(options(1));
        conn.try_flush(BytesMut::from(&b"1"[..])).unwrap();
        let result = conn
            .flush(BytesMut::from(&b"2"[..]), Duration::from_millis(500))
            .await;
        assert!(matches!(result, Err(WriteBlocking)));
    }

    #[rstest]
    #[tokio::test]
    async fn test_flush_waiting_observes_close(_setup: ()) {
        let conn = Connection::detached(options(1));
        conn.try_flush(BytesMut::from(&b"1"[..])).unwrap();

        let waiter = {
            let conn = conn.clone();
            tokio::spawn(async move {
                conn.flush(BytesMut::from(&b"2"[..]), Duration::from_secs(30))
                    .await
            })
        };
        time::sleep(Duration::from_millis(50)).await;
        conn.close();
        assert!(matches!(waiter.await.unwrap(), Err(ConnectionClosed)));
    }

    #[rstest]
    #[tokio::test]
    async fn test_flush_after_close_and_shutdown(_setup: ()) {
        let conn = Connection::detached(options(4));
        conn.close();
        assert!(matches!(
            conn.try_flush(BytesMut::from(&b"x"[..])),
            Err(ConnectionClosed)
        ));

        let conn = Connection::detached(options(4));
        conn.shut_down();
        assert!(matches!(
            conn.flush(BytesMut::from(&b"x"[..]), Duration::from_secs(1))
                .await,
            Err(ConnectionShutdown)
        ));
    }

    #[rstest]
    #[tokio::test]
    async fn test_bytes_hit_the_wire_in_flush_order(_setup: ()) {
        let (mut client, server) = socket_pair().await;
        let (notify, _) = broadcast::channel(1);
        let (complete_tx, mut complete_rx) = mpsc::channel(1);
        let conn = Connection::new(Some(server), options(256), notify.subscribe(), complete_tx);
        let events = recorded(&conn, false);
        conn.start();
        assert!(conn.is_connected());
        assert_eq!(events.opened.load(Ordering::SeqCst), 1);

        let mut expected = Vec::new();
        for i in 0..200u32 {
            let chunk = format!("[{}]", i);
            expected.extend_from_slice(chunk.as_bytes());
            conn.flush(BytesMut::from(chunk.as_bytes()), Duration::from_secs(1))
                .await
                .unwrap();
        }

        let mut received = vec![0u8; expected.len()];
        client.read_exact(&mut received).await.unwrap();
        assert_eq!(received, expected);

        drop(client);
        wait_until(|| conn.is_closed()).await;
        assert_eq!(events.closed.load(Ordering::SeqCst), 1);
        // both loops released the completion group
        assert!(complete_rx.recv().await.is_none());
    }

    #[rstest]
    #[tokio::test]
    async fn test_read_loop_feeds_chain(_setup: ()) {
        let (mut client, server) = socket_pair().await;
        let (notify, _) = broadcast::channel(1);
        let (complete_tx, _complete_rx) = mpsc::channel(1);
        let conn = Connection::new(Some(server), options(8), notify.subscribe(), complete_tx);
        let events = recorded(&conn, false);
        conn.start();

        client.write_all(b"hello ").await.unwrap();
        client.write_all(b"world").await.unwrap();
        wait_until(|| events.received.lock().len() == 11).await;
        assert_eq!(&events.received.lock()[..], b"hello world");

        conn.shut_down();
        let mut rest = Vec::new();
        // the server side is gone, the client sees end of stream
        client.read_to_end(&mut rest).await.unwrap();
        assert_eq!(events.closed.load(Ordering::SeqCst), 0);
    }

    #[rstest]
    #[tokio::test]
    async fn test_global_exit_closes_connection(_setup: ()) {
        let (_client, server) = socket_pair().await;
        let (notify, _) = broadcast::channel(1);
        let (complete_tx, mut complete_rx) = mpsc::channel(1);
        let conn = Connection::new(Some(server), options(8), notify.subscribe(), complete_tx);
        let events = recorded(&conn, false);
        conn.start();

        notify.send(()).unwrap();
        assert!(time::timeout(Duration::from_secs(5), complete_rx.recv())
            .await
            .unwrap()
            .is_none());
        assert!(conn.is_closed());
        assert_eq!(events.closed.load(Ordering::SeqCst), 1);
    }

    #[rstest]
    #[tokio::test]
    async fn test_keep_alive_deadline_closes_idle_peer(_setup: ()) {
        let (_client, server) = socket_pair().await;
        let (notify, _) = broadcast::channel(1);
        let (complete_tx, _complete_rx) = mpsc::channel(1);
        let options = ConnectionOptions {
            keep_alive: Duration::from_millis(100),
            ..Default::default()
        };
        let conn = Connection::new(Some(server), options, notify.subscribe(), complete_tx);
        let events = recorded(&conn, false);
        conn.start();

        wait_until(|| conn.is_closed()).await;
        assert_eq!(events.closed.load(Ordering::SeqCst), 1);
    }

    #[rstest]
    #[tokio::test]
    async fn test_buffer_ceiling_closes_connection(_setup: ()) {
        let (mut client, server) = socket_pair().await;
        let (notify, _) = broadcast::channel(1);
        let (complete_tx, _complete_rx) = mpsc::channel(1);
        let options = ConnectionOptions {
            max_buffered_size: 16,
            ..Default::default()
        };
        let conn = Connection::new(Some(server), options, notify.subscribe(), complete_tx);
        // no handler consumes the bytes, they pile up in the accumulation buffer
        conn.set_filter_chain(Arc::new(FilterChain::new()));
        let chain = conn.filter_chain().unwrap();
        chain.add_last("hoarder", Hoarder);
        conn.start();

        client.write_all(&[7u8; 64]).await.unwrap();
        wait_until(|| conn.is_closed()).await;
    }

    struct Hoarder;

    impl IoHandler for Hoarder {
        fn bound(&self) -> Bound {
            Bound::INBOUND
        }

        fn message_received(&self, _ctx: &FilterContext<'_>, _msg: &mut BytesMut) {}

        fn clone_handler(&self) -> Box<dyn IoHandler> {
            Box::new(Hoarder)
        }
    }

    #[rstest]
    #[tokio::test]
    async fn test_panicking_handler_only_closes_its_connection(_setup: ()) {
        let (mut client, server) = socket_pair().await;
        let (notify, _) = broadcast::channel(1);
        let (complete_tx, mut complete_rx) = mpsc::channel(1);
        let conn = Connection::new(Some(server), options(8), notify.subscribe(), complete_tx);
        let events = recorded(&conn, true);
        conn.start();

        client.write_all(b"boom").await.unwrap();
        assert!(time::timeout(Duration::from_secs(5), complete_rx.recv())
            .await
            .unwrap()
            .is_none());
        assert!(conn.is_closed());
        assert_eq!(events.closed.load(Ordering::SeqCst), 1);
    }

    #[rstest]
    #[tokio::test]
    async fn test_start_is_noop_after_shutdown_or_without_socket(_setup: ()) {
        let conn = Connection::detached(options(1));
        let events = recorded(&conn, false);
        conn.start();
        assert!(!conn.is_connected());
        assert_eq!(events.opened.load(Ordering::SeqCst), 0);

        let (_client, server) = socket_pair().await;
        let (notify, _) = broadcast::channel(1);
        let (complete_tx, _complete_rx) = mpsc::channel(1);
        let conn = Connection::new(Some(server), options(1), notify.subscribe(), complete_tx);
        let events = recorded(&conn, false);
        conn.shut_down();
        conn.start();
        assert_eq!(conn.state(), ConnectionState::Closed);
        assert_eq!(events.opened.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_custom_data_downcast() {
        let conn = Connection::detached(options(1));
        assert!(conn.custom_data::<String>().is_none());
        conn.set_custom_data(String::from("player-42"));
        assert_eq!(conn.custom_data::<String>().unwrap().as_str(), "player-42");
        assert!(conn.custom_data::<u64>().is_none());
    }

    #[test]
    fn test_panic_message_payloads() {
        assert_eq!(panic_message(&"static"), "static");
        assert_eq!(panic_message(&String::from("owned")), "owned");
        assert_eq!(panic_message(&42u8), "unknown panic payload");
    }
}
