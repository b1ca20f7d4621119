//! Operation handle shared between the caller and the transport
//!
//! The transport never builds request payloads. It receives an `Operation`
//! carrying an already-encoded frame, tracks it by opaque while the request is
//! outstanding, and completes it exactly once:
//!
//! - with the response frame when the server answers,
//! - with `OperationError::Timeout` when the in-flight cleanup loop expires it,
//! - with `OperationError::Cancelled` when its connection is disposed,
//! - with `OperationError::Transport` when the socket fails.
//!
//! ```text
//! caller ──► Operation::new() ──► (Operation, OperationResult)
//!                 │                         │
//!                 ▼                         ▼
//!          pool / connection         caller awaits response
//! ```

use bytes::Bytes;
use parking_lot::Mutex;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};
use tokio::sync::{oneshot, Notify};

/// Failure kinds surfaced to the caller of an operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperationError {
    /// The operation exceeded its lifetime in the in-flight set
    Timeout { elapsed: Duration },
    /// The owning connection was disposed before a response arrived
    Cancelled,
    /// The socket failed while the operation was outstanding
    Transport(String),
    /// The encoded request exceeds the maximum frame size
    ValueTooLarge { size: usize, max: usize },
    /// The operation could not be routed to any connection
    NotSent(String),
}

impl std::fmt::Display for OperationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OperationError::Timeout { elapsed } => {
                write!(f, "Operation timed out after {:?}", elapsed)
            }
            OperationError::Cancelled => write!(f, "Operation cancelled"),
            OperationError::Transport(msg) => write!(f, "Transport failure: {}", msg),
            OperationError::ValueTooLarge { size, max } => {
                write!(f, "Encoded request of {} bytes exceeds limit of {} bytes", size, max)
            }
            OperationError::NotSent(msg) => write!(f, "Operation not sent: {}", msg),
        }
    }
}

impl std::error::Error for OperationError {}

type CompletionSender = oneshot::Sender<Result<Bytes, OperationError>>;

struct OperationState {
    opaque: u32,
    request: Bytes,
    created_at: Instant,
    idempotent: bool,
    sink: Mutex<Option<CompletionSender>>,
    completed: AtomicBool,
    completion: Notify,
}

/// An outstanding request: opaque, encoded bytes, and a one-shot completion sink
///
/// Cloning is cheap; all clones refer to the same completion sink.
#[derive(Clone)]
pub struct Operation {
    state: Arc<OperationState>,
}

impl std::fmt::Debug for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Operation")
            .field("opaque", &self.state.opaque)
            .field("len", &self.state.request.len())
            .field("idempotent", &self.state.idempotent)
            .field("completed", &self.is_completed())
            .finish()
    }
}

static NEXT_OPAQUE: AtomicU32 = AtomicU32::new(1);

/// Allocate a process-wide unique opaque
pub fn next_opaque() -> u32 {
    NEXT_OPAQUE.fetch_add(1, Ordering::Relaxed)
}

impl Operation {
    /// Create an operation and the future its caller awaits
    pub fn new(opaque: u32, request: Bytes, idempotent: bool) -> (Operation, OperationResult) {
        let (tx, rx) = oneshot::channel();
        let op = Operation {
            state: Arc::new(OperationState {
                opaque,
                request,
                created_at: Instant::now(),
                idempotent,
                sink: Mutex::new(Some(tx)),
                completed: AtomicBool::new(false),
                completion: Notify::new(),
            }),
        };
        (op, OperationResult { rx })
    }

    #[inline]
    pub fn opaque(&self) -> u32 {
        self.state.opaque
    }

    #[inline]
    pub fn request(&self) -> &Bytes {
        &self.state.request
    }

    #[inline]
    pub fn idempotent(&self) -> bool {
        self.state.idempotent
    }

    pub fn created_at(&self) -> Instant {
        self.state.created_at
    }

    pub fn is_completed(&self) -> bool {
        self.state.completed.load(Ordering::Acquire)
    }

    /// Whether two handles refer to the same operation
    pub fn same_as(&self, other: &Operation) -> bool {
        Arc::ptr_eq(&self.state, &other.state)
    }

    /// Complete with a response frame. Returns false if already completed.
    pub fn complete(&self, response: Bytes) -> bool {
        self.finish(Ok(response))
    }

    /// Complete with a failure. Returns false if already completed.
    pub fn fail(&self, error: OperationError) -> bool {
        self.finish(Err(error))
    }

    fn finish(&self, result: Result<Bytes, OperationError>) -> bool {
        let sender = self.state.sink.lock().take();
        let Some(sender) = sender else {
            return false;
        };
        // The caller may have stopped waiting; completion still counts.
        let _ = sender.send(result);
        self.state.completed.store(true, Ordering::Release);
        self.state.completion.notify_waiters();
        true
    }

    /// Resolves once the operation has been completed by any path
    ///
    /// Does not consume the result; the caller's `OperationResult` still
    /// receives it.
    pub async fn completed(&self) {
        loop {
            let notified = self.state.completion.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.is_completed() {
                return;
            }
            notified.await;
        }
    }
}

/// Future resolving to an operation's response or failure
///
/// Dropping it does not retract the request; the operation stays tracked until
/// a response, timeout or disposal completes it.
#[derive(Debug)]
pub struct OperationResult {
    rx: oneshot::Receiver<Result<Bytes, OperationError>>,
}

impl Future for OperationResult {
    type Output = Result<Bytes, OperationError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            // Sink dropped without completing: treat as cancellation
            Poll::Ready(Err(_)) => Poll::Ready(Err(OperationError::Cancelled)),
            Poll::Pending => Poll::Pending,
        }
    }
}
