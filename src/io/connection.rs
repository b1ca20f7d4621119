//! Multiplexed connection to one node
//!
//! ## Design
//!
//! ```text
//!                       ┌──────────────────────────────┐
//!  send(op) ──► register in InFlightOperationSet       │
//!      │                                               │
//!      ▼                                               │
//!  write queue ──► writer task ──► socket ──► read task ┘
//!  (submission       (sole owner of      (FramedRead + FrameCodec,
//!   order)            the write half)     completes ops by opaque)
//! ```
//!
//! Many callers share one socket. Each request carries an opaque which the
//! server echoes; responses may arrive in any order and are matched by opaque,
//! never by position.
//!
//! All writes go through one task that owns the write half, so frames are
//! never interleaved and land in submission order. A caller that stops
//! waiting on `send` does not retract its frame: once queued it is written
//! in full, and the operation stays tracked until a response, the cleanup
//! timeout, or close completes it.
//!
//! Any read or write error, or EOF, marks the connection dead and fails every
//! tracked operation with `OperationError::Transport`. Deciding what to do
//! next is left to the pool.

use bytes::Bytes;
use futures::StreamExt;
use parking_lot::Mutex;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tokio_util::codec::FramedRead;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use super::frame::{is_server_request, read_opaque, FrameCodec, ServerPush, MAX_REQUEST_LEN};
use super::in_flight::{InFlightConfig, InFlightError, InFlightOperationSet};
use crate::operation::{Operation, OperationError};

/// Connection-level errors
#[derive(Debug)]
pub enum ConnectionError {
    /// The connection is dead or was closed
    Closed,
    /// The encoded request exceeds `MAX_REQUEST_LEN`
    ValueTooLarge { size: usize, max: usize },
    /// Socket failure
    Io(io::Error),
    /// The operation could not be tracked
    InFlight(InFlightError),
    /// Connecting did not finish in time
    ConnectTimeout(Duration),
    /// Bootstrap or bucket selection was rejected
    Handshake(String),
    /// TLS setup failed
    Tls(String),
}

impl std::fmt::Display for ConnectionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionError::Closed => write!(f, "Connection closed"),
            ConnectionError::ValueTooLarge { size, max } => {
                write!(f, "Request of {} bytes exceeds limit of {} bytes", size, max)
            }
            ConnectionError::Io(e) => write!(f, "I/O error: {}", e),
            ConnectionError::InFlight(e) => write!(f, "{}", e),
            ConnectionError::ConnectTimeout(after) => {
                write!(f, "Connect timed out after {:?}", after)
            }
            ConnectionError::Handshake(msg) => write!(f, "Handshake failed: {}", msg),
            ConnectionError::Tls(msg) => write!(f, "TLS error: {}", msg),
        }
    }
}

impl std::error::Error for ConnectionError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConnectionError::Io(e) => Some(e),
            ConnectionError::InFlight(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for ConnectionError {
    fn from(e: io::Error) -> Self {
        ConnectionError::Io(e)
    }
}

impl From<InFlightError> for ConnectionError {
    fn from(e: InFlightError) -> Self {
        match e {
            InFlightError::Disposed => ConnectionError::Closed,
            other => ConnectionError::InFlight(other),
        }
    }
}

/// Receiver of unsolicited server requests (cluster map announcements)
pub trait ServerPushSink: Send + Sync {
    fn on_server_push(&self, push: ServerPush);
}

/// A transport the pool can route operations through
pub trait Connection: Send + Sync {
    fn connection_id(&self) -> u64;

    fn local_addr(&self) -> Option<SocketAddr>;

    fn remote_addr(&self) -> Option<SocketAddr>;

    fn is_dead(&self) -> bool;

    fn is_authenticated(&self) -> bool;

    fn mark_authenticated(&self);

    /// Time since the last frame was received
    fn idle_time(&self) -> Duration;

    /// Operations awaiting a response
    fn in_flight(&self) -> usize;

    /// Register `op` and queue its request
    ///
    /// Resolves once the request has been written; the response completes
    /// the operation independently.
    fn send<'a>(
        &'a self,
        op: &'a Operation,
    ) -> Pin<Box<dyn Future<Output = Result<(), ConnectionError>> + Send + 'a>>;

    /// Close now, cancelling tracked operations. Idempotent.
    fn close(&self);

    /// Wait up to `timeout` for tracked operations, then close
    fn close_graceful<'a>(&'a self, timeout: Duration) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>>;
}

static LIVE_CONNECTIONS: AtomicUsize = AtomicUsize::new(0);

/// Number of open connections in this process
pub fn live_connection_count() -> usize {
    LIVE_CONNECTIONS.load(Ordering::Relaxed)
}

/// Per-connection settings
#[derive(Clone, Default)]
pub struct ConnectionSettings {
    pub in_flight: InFlightConfig,
    pub push_sink: Option<Arc<dyn ServerPushSink>>,
}

impl std::fmt::Debug for ConnectionSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionSettings")
            .field("in_flight", &self.in_flight)
            .field("push_sink", &self.push_sink.is_some())
            .finish()
    }
}

struct WriteRequest {
    frame: Bytes,
    done: oneshot::Sender<io::Result<()>>,
}

/// State shared by the connection handle and its two tasks
struct ConnectionShared {
    id: u64,
    in_flight: Arc<InFlightOperationSet>,
    push_sink: Option<Arc<dyn ServerPushSink>>,
    last_activity: Mutex<Instant>,
    dead: AtomicBool,
    authenticated: AtomicBool,
    cancel: CancellationToken,
}

impl ConnectionShared {
    fn touch(&self) {
        *self.last_activity.lock() = Instant::now();
    }

    /// Mark dead, stop both tasks and fail tracked operations with `error`
    fn close_with(&self, error: OperationError) {
        if self.dead.swap(true, Ordering::AcqRel) {
            return;
        }
        self.cancel.cancel();
        self.in_flight.dispose_with(error.clone());
        LIVE_CONNECTIONS.fetch_sub(1, Ordering::Relaxed);
        debug!(connection_id = self.id, reason = %error, "connection closed");
    }

    fn dispatch(&self, frame: Bytes) {
        if is_server_request(&frame) {
            match (ServerPush::decode(&frame), &self.push_sink) {
                (Some(push), Some(sink)) => {
                    trace!(connection_id = self.id, bucket = %push.bucket, version = %push.version, "server push");
                    sink.on_server_push(push);
                }
                _ => trace!(connection_id = self.id, "ignoring server request"),
            }
            return;
        }

        let Some(opaque) = read_opaque(&frame) else {
            return;
        };
        match self.in_flight.try_remove(opaque) {
            Some(op) => {
                op.complete(frame);
            }
            // Already timed out, or never ours
            None => trace!(connection_id = self.id, opaque, "discarding unmatched response"),
        }
    }
}

/// Connection multiplexing many operations over one stream
///
/// The stream can be anything bidirectional: TCP, TLS over TCP, or an
/// in-memory duplex in tests.
pub struct MultiplexingConnection {
    shared: Arc<ConnectionShared>,
    writes: mpsc::UnboundedSender<WriteRequest>,
    local_addr: Option<SocketAddr>,
    remote_addr: Option<SocketAddr>,
}

impl MultiplexingConnection {
    /// Take ownership of `stream` and start the read and write tasks
    ///
    /// Must be called within a tokio runtime.
    pub fn new<S>(
        stream: S,
        local_addr: Option<SocketAddr>,
        remote_addr: Option<SocketAddr>,
        settings: ConnectionSettings,
    ) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        let (writes, write_rx) = mpsc::unbounded_channel();

        let shared = Arc::new(ConnectionShared {
            id: rand::random(),
            in_flight: InFlightOperationSet::new(settings.in_flight),
            push_sink: settings.push_sink,
            last_activity: Mutex::new(Instant::now()),
            dead: AtomicBool::new(false),
            authenticated: AtomicBool::new(false),
            cancel: CancellationToken::new(),
        });
        LIVE_CONNECTIONS.fetch_add(1, Ordering::Relaxed);

        tokio::spawn(Self::read_loop(reader, shared.clone()));
        tokio::spawn(Self::write_loop(writer, write_rx, shared.clone()));

        info!(
            connection_id = shared.id,
            local = ?local_addr,
            remote = ?remote_addr,
            "connection opened"
        );
        MultiplexingConnection {
            shared,
            writes,
            local_addr,
            remote_addr,
        }
    }

    async fn read_loop<R>(reader: R, shared: Arc<ConnectionShared>)
    where
        R: AsyncRead + Unpin + Send,
    {
        let mut frames = FramedRead::new(reader, FrameCodec::default());
        let failure = loop {
            let next = tokio::select! {
                _ = shared.cancel.cancelled() => return,
                next = frames.next() => next,
            };
            match next {
                Some(Ok(frame)) => {
                    shared.touch();
                    shared.dispatch(frame);
                }
                Some(Err(e)) => {
                    warn!(connection_id = shared.id, error = %e, "read failed");
                    break OperationError::Transport(e.to_string());
                }
                None => {
                    debug!(connection_id = shared.id, "peer closed connection");
                    break OperationError::Transport("connection closed by peer".to_string());
                }
            }
        };
        shared.close_with(failure);
    }

    async fn write_loop<W>(
        mut writer: W,
        mut requests: mpsc::UnboundedReceiver<WriteRequest>,
        shared: Arc<ConnectionShared>,
    ) where
        W: AsyncWrite + Unpin + Send,
    {
        let mut batch = Vec::new();
        loop {
            let first = tokio::select! {
                _ = shared.cancel.cancelled() => break,
                request = requests.recv() => match request {
                    Some(request) => request,
                    None => break,
                },
            };
            batch.push(first);
            // Coalesce whatever is already queued into one flush
            while let Ok(next) = requests.try_recv() {
                batch.push(next);
            }

            let mut result = Ok(());
            for request in batch.iter() {
                result = writer.write_all(&request.frame).await;
                if result.is_err() {
                    break;
                }
            }
            if result.is_ok() {
                result = writer.flush().await;
            }

            match result {
                Ok(()) => {
                    for request in batch.drain(..) {
                        let _ = request.done.send(Ok(()));
                    }
                }
                Err(e) => {
                    warn!(connection_id = shared.id, error = %e, "write failed");
                    for request in batch.drain(..) {
                        let _ = request.done.send(Err(io::Error::new(e.kind(), e.to_string())));
                    }
                    shared.close_with(OperationError::Transport(e.to_string()));
                    break;
                }
            }
        }
        let _ = writer.shutdown().await;
    }

    async fn send_inner(&self, op: &Operation) -> Result<(), ConnectionError> {
        let size = op.request().len();
        if size > MAX_REQUEST_LEN {
            op.fail(OperationError::ValueTooLarge {
                size,
                max: MAX_REQUEST_LEN,
            });
            return Err(ConnectionError::ValueTooLarge {
                size,
                max: MAX_REQUEST_LEN,
            });
        }
        if self.is_dead() {
            op.fail(OperationError::NotSent("connection closed".to_string()));
            return Err(ConnectionError::Closed);
        }

        if let Err(e) = self.shared.in_flight.add(op.clone()).await {
            op.fail(OperationError::NotSent(e.to_string()));
            return Err(e.into());
        }

        let (done, written) = oneshot::channel();
        let request = WriteRequest {
            frame: op.request().clone(),
            done,
        };
        if self.writes.send(request).is_err() {
            // Writer gone: the close that stopped it fails the operation
            if let Some(op) = self.shared.in_flight.try_remove(op.opaque()) {
                op.fail(OperationError::NotSent("connection closed".to_string()));
            }
            return Err(ConnectionError::Closed);
        }

        match written.await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(ConnectionError::Io(e)),
            // Dropped unwritten because the connection closed
            Err(_) => Err(ConnectionError::Closed),
        }
    }
}

impl Connection for MultiplexingConnection {
    fn connection_id(&self) -> u64 {
        self.shared.id
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote_addr
    }

    fn is_dead(&self) -> bool {
        self.shared.dead.load(Ordering::Acquire)
    }

    fn is_authenticated(&self) -> bool {
        self.shared.authenticated.load(Ordering::Acquire)
    }

    fn mark_authenticated(&self) {
        self.shared.authenticated.store(true, Ordering::Release);
    }

    fn idle_time(&self) -> Duration {
        self.shared.last_activity.lock().elapsed()
    }

    fn in_flight(&self) -> usize {
        self.shared.in_flight.len()
    }

    fn send<'a>(
        &'a self,
        op: &'a Operation,
    ) -> Pin<Box<dyn Future<Output = Result<(), ConnectionError>> + Send + 'a>> {
        Box::pin(self.send_inner(op))
    }

    fn close(&self) {
        self.shared.close_with(OperationError::Cancelled);
    }

    fn close_graceful<'a>(&'a self, timeout: Duration) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>> {
        Box::pin(async move {
            if let Err(e) = self.shared.in_flight.wait_for_all(timeout).await {
                debug!(connection_id = self.shared.id, error = %e, "closing with operations outstanding");
            }
            self.close();
        })
    }
}

impl Drop for MultiplexingConnection {
    fn drop(&mut self) {
        self.shared.close_with(OperationError::Cancelled);
    }
}
