//! Pool of exactly one connection
//!
//! Used when a node should not be multiplexed over several sockets. The
//! connection is reopened on demand after it dies; scaling is a no-op.

use parking_lot::RwLock;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info};

use super::{create_connection, ConnectionPool, PendingSend, PoolError, PoolFreeze};
use crate::io::{Connection, ConnectionFactory, ConnectionInitializer};
use crate::operation::{Operation, OperationError};
use crate::topology::HostEndpoint;

pub struct SingleConnectionPool {
    id: u64,
    endpoint: HostEndpoint,
    factory: Arc<dyn ConnectionFactory>,
    initializer: Arc<dyn ConnectionInitializer>,
    current: RwLock<Option<Arc<dyn Connection>>>,
    bucket: RwLock<Option<String>>,
    reconnect: AsyncMutex<()>,
    freeze_lock: Arc<AsyncMutex<()>>,
    pending: AtomicUsize,
    disposed: AtomicBool,
}

impl SingleConnectionPool {
    pub fn new(
        endpoint: HostEndpoint,
        factory: Arc<dyn ConnectionFactory>,
        initializer: Arc<dyn ConnectionInitializer>,
    ) -> Self {
        SingleConnectionPool {
            id: rand::random(),
            endpoint,
            factory,
            initializer,
            current: RwLock::new(None),
            bucket: RwLock::new(None),
            reconnect: AsyncMutex::new(()),
            freeze_lock: Arc::new(AsyncMutex::new(())),
            pending: AtomicUsize::new(0),
            disposed: AtomicBool::new(false),
        }
    }

    fn live(&self) -> Option<Arc<dyn Connection>> {
        self.current
            .read()
            .as_ref()
            .filter(|c| !c.is_dead())
            .cloned()
    }

    async fn ensure_connected(&self) -> Result<Arc<dyn Connection>, PoolError> {
        if let Some(connection) = self.live() {
            return Ok(connection);
        }

        let _reconnect = self.reconnect.lock().await;
        // Another sender may have reconnected while we waited
        if let Some(connection) = self.live() {
            return Ok(connection);
        }
        if self.disposed.load(Ordering::Acquire) {
            return Err(PoolError::Disposed);
        }

        let bucket = self.bucket.read().clone();
        let connection = create_connection(
            self.factory.as_ref(),
            self.initializer.as_ref(),
            &self.endpoint,
            bucket.as_deref(),
        )
        .await?;
        debug!(endpoint = %self.endpoint, id = connection.connection_id(), "single connection opened");
        *self.current.write() = Some(connection.clone());
        Ok(connection)
    }

    async fn send_inner(&self, op: &Operation) -> Result<(), PoolError> {
        if self.disposed.load(Ordering::Acquire) {
            op.fail(OperationError::NotSent("pool disposed".to_string()));
            return Err(PoolError::Disposed);
        }
        let connection = {
            let _pending = PendingSend::enter(&self.pending);
            self.ensure_connected().await
        };

        let connection = match connection {
            Ok(connection) => connection,
            Err(e) => {
                op.fail(OperationError::NotSent(e.to_string()));
                return Err(e);
            }
        };
        connection.send(op).await?;
        Ok(())
    }

    async fn select_bucket_inner(&self, bucket: &str) -> Result<(), PoolError> {
        let _freeze = self.freeze_lock.lock().await;
        let _reconnect = self.reconnect.lock().await;
        if let Some(connection) = self.live() {
            self.initializer
                .select_bucket(connection.as_ref(), bucket)
                .await?;
        }
        *self.bucket.write() = Some(bucket.to_string());
        info!(endpoint = %self.endpoint, bucket, "bucket selected");
        Ok(())
    }
}

impl ConnectionPool for SingleConnectionPool {
    fn endpoint(&self) -> &HostEndpoint {
        &self.endpoint
    }

    fn bucket(&self) -> Option<String> {
        self.bucket.read().clone()
    }

    fn size(&self) -> usize {
        usize::from(self.live().is_some())
    }

    fn min_size(&self) -> usize {
        1
    }

    fn max_size(&self) -> usize {
        1
    }

    fn pending_sends(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    fn connections(&self) -> Vec<Arc<dyn Connection>> {
        self.current.read().iter().cloned().collect()
    }

    fn initialize<'a>(&'a self) -> Pin<Box<dyn Future<Output = Result<(), PoolError>> + Send + 'a>> {
        Box::pin(async move {
            self.ensure_connected().await?;
            Ok(())
        })
    }

    fn send<'a>(
        &'a self,
        op: &'a Operation,
    ) -> Pin<Box<dyn Future<Output = Result<(), PoolError>> + Send + 'a>> {
        Box::pin(self.send_inner(op))
    }

    fn select_bucket<'a>(
        &'a self,
        bucket: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<(), PoolError>> + Send + 'a>> {
        Box::pin(self.select_bucket_inner(bucket))
    }

    fn freeze<'a>(&'a self) -> Pin<Box<dyn Future<Output = Result<PoolFreeze, PoolError>> + Send + 'a>> {
        Box::pin(async move {
            if self.disposed.load(Ordering::Acquire) {
                return Err(PoolError::Disposed);
            }
            let guard = self.freeze_lock.clone().lock_owned().await;
            Ok(PoolFreeze::new(self.id, guard))
        })
    }

    fn scale<'a>(
        &'a self,
        _delta: i32,
        freeze: &'a PoolFreeze,
    ) -> Pin<Box<dyn Future<Output = Result<(), PoolError>> + Send + 'a>> {
        Box::pin(async move {
            if freeze.pool_id() != self.id {
                return Err(PoolError::ForeignFreeze);
            }
            Ok(())
        })
    }

    fn dispose<'a>(&'a self) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>> {
        Box::pin(async move {
            if self.disposed.swap(true, Ordering::AcqRel) {
                return;
            }
            let _reconnect = self.reconnect.lock().await;
            if let Some(connection) = self.current.write().take() {
                connection.close();
            }
        })
    }
}
