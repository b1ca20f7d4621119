//! Connection pools: the set of connections to one node
//!
//! A pool routes each operation to one of its member connections, replaces
//! dead members lazily, and resizes on request of the scale controller.
//!
//! Resizing and bucket selection are serialized by the pool's freeze: a
//! `PoolFreeze` is an owned guard, and `scale` demands one as proof that the
//! caller holds it. Sends never wait for the freeze; they only pause while
//! bucket selection rewrites every member.

pub mod multiplexing;
pub mod scale_controller;
pub mod single;

pub use multiplexing::{MultiplexingConnectionPool, PoolSettings};
pub use scale_controller::{decide, ScaleController, ScaleControllerConfig, ScalingDecision};
pub use single::SingleConnectionPool;

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::OwnedMutexGuard;
use tracing::warn;

use crate::io::{Connection, ConnectionError, ConnectionFactory, ConnectionInitializer};
use crate::operation::Operation;
use crate::topology::HostEndpoint;

/// Pool-level errors surfaced to senders
#[derive(Debug)]
pub enum PoolError {
    /// The pool has been disposed
    Disposed,
    /// No member connection could be found or created
    NoConnections(String),
    /// The freeze passed to `scale` belongs to another pool
    ForeignFreeze,
    /// A member connection failed
    Connection(ConnectionError),
}

impl std::fmt::Display for PoolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PoolError::Disposed => write!(f, "Connection pool disposed"),
            PoolError::NoConnections(reason) => {
                write!(f, "No connection available: {}", reason)
            }
            PoolError::ForeignFreeze => write!(f, "Freeze does not belong to this pool"),
            PoolError::Connection(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for PoolError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            PoolError::Connection(e) => Some(e),
            _ => None,
        }
    }
}

impl From<ConnectionError> for PoolError {
    fn from(e: ConnectionError) -> Self {
        PoolError::Connection(e)
    }
}

/// Proof of holding a pool's freeze; released on drop
pub struct PoolFreeze {
    pool_id: u64,
    _guard: OwnedMutexGuard<()>,
}

impl PoolFreeze {
    pub(crate) fn new(pool_id: u64, guard: OwnedMutexGuard<()>) -> Self {
        PoolFreeze {
            pool_id,
            _guard: guard,
        }
    }

    pub(crate) fn pool_id(&self) -> u64 {
        self.pool_id
    }
}

impl std::fmt::Debug for PoolFreeze {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolFreeze").field("pool_id", &self.pool_id).finish()
    }
}

/// Connections to one node
pub trait ConnectionPool: Send + Sync {
    fn endpoint(&self) -> &HostEndpoint;

    /// Bucket selected on every member, if any
    fn bucket(&self) -> Option<String>;

    fn size(&self) -> usize;

    fn min_size(&self) -> usize;

    fn max_size(&self) -> usize;

    /// Sends waiting for a connection or for admission on one
    fn pending_sends(&self) -> usize;

    /// Point-in-time copy of the members
    fn connections(&self) -> Vec<Arc<dyn Connection>>;

    /// Open the minimum number of connections
    fn initialize<'a>(&'a self) -> Pin<Box<dyn Future<Output = Result<(), PoolError>> + Send + 'a>>;

    fn send<'a>(
        &'a self,
        op: &'a Operation,
    ) -> Pin<Box<dyn Future<Output = Result<(), PoolError>> + Send + 'a>>;

    /// Select `bucket` on every member and on all future members
    fn select_bucket<'a>(
        &'a self,
        bucket: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<(), PoolError>> + Send + 'a>>;

    /// Wait for exclusive rights to resize the pool
    fn freeze<'a>(&'a self) -> Pin<Box<dyn Future<Output = Result<PoolFreeze, PoolError>> + Send + 'a>>;

    /// Add (`delta > 0`) or drain and remove (`delta < 0`) members
    fn scale<'a>(
        &'a self,
        delta: i32,
        freeze: &'a PoolFreeze,
    ) -> Pin<Box<dyn Future<Output = Result<(), PoolError>> + Send + 'a>>;

    fn dispose<'a>(&'a self) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>>;
}

/// Decrements the pending-send gauge on drop, including cancellation
pub(crate) struct PendingSend<'a>(&'a AtomicUsize);

impl<'a> PendingSend<'a> {
    pub(crate) fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::AcqRel);
        PendingSend(counter)
    }
}

impl Drop for PendingSend<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Connect, run the handshake, and select `bucket` if one is set
///
/// A connection that fails any step is closed before the error is returned.
pub async fn create_connection(
    factory: &dyn ConnectionFactory,
    initializer: &dyn ConnectionInitializer,
    endpoint: &HostEndpoint,
    bucket: Option<&str>,
) -> Result<Arc<dyn Connection>, ConnectionError> {
    let connection = factory.connect(endpoint).await?;

    let handshake = async {
        initializer.initialize(connection.as_ref()).await?;
        if let Some(bucket) = bucket {
            initializer.select_bucket(connection.as_ref(), bucket).await?;
        }
        Ok::<(), ConnectionError>(())
    };

    if let Err(e) = handshake.await {
        warn!(endpoint = %endpoint, error = %e, "connection handshake failed");
        connection.close();
        return Err(e);
    }
    Ok(connection)
}
