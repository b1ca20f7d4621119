//! Per-bucket routing over the node pools
//!
//! ## Design
//!
//! A `BucketRouter` is the config subscriber of one bucket. Each accepted
//! cluster map reshapes its pools: new KV nodes get a pool (bucket selected,
//! scale controller started), nodes that left have theirs drained and
//! disposed. Keys are hashed to a vbucket and the vbucket map names the node
//! whose pool carries the request.
//!
//! ```text
//!   key ──crc32──► vbucket ──map──► HostEndpoint ──► pool ──► connection
//! ```
//!
//! A failed operation is re-routed through the current map on every retry,
//! so a request that failed because its node left is retried against the
//! node that took over the vbucket.

use bytes::Bytes;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{watch, Mutex as AsyncMutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::io::frame::stamp_request;
use crate::io::{ConnectionFactory, ConnectionInitializer};
use crate::operation::{next_opaque, Operation, OperationError};
use crate::pool::{
    ConnectionPool, MultiplexingConnectionPool, PoolError, PoolSettings, ScaleController,
    ScaleControllerConfig, SingleConnectionPool,
};
use crate::retry::{RetryAction, RetryClassifier};
use crate::topology::{
    BucketConfig, ClusterNode, ConfigError, ConfigSubscriber, ConfigVersion, HostEndpoint,
    NetworkResolution, VersionCell,
};

/// Errors routing a request to a node
#[derive(Debug)]
pub enum RoutingError {
    /// No cluster map has been applied yet
    NoConfig,
    /// The map has no vbucket routing table
    NoVBucketMap,
    /// The vbucket has no active node, or the node has no pool
    NoRoute { vbucket: u16 },
    /// The request is not a complete frame
    MalformedRequest,
    /// The bucket has been closed
    Disposed,
    Pool(PoolError),
    /// The operation failed and the retry policy gave up
    Operation(OperationError),
}

impl std::fmt::Display for RoutingError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RoutingError::NoConfig => write!(f, "No cluster map applied"),
            RoutingError::NoVBucketMap => write!(f, "Cluster map has no vbucket map"),
            RoutingError::NoRoute { vbucket } => write!(f, "No node serves vbucket {}", vbucket),
            RoutingError::MalformedRequest => write!(f, "Request is shorter than a frame header"),
            RoutingError::Disposed => write!(f, "Bucket closed"),
            RoutingError::Pool(e) => write!(f, "{}", e),
            RoutingError::Operation(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for RoutingError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            RoutingError::Pool(e) => Some(e),
            RoutingError::Operation(e) => Some(e),
            _ => None,
        }
    }
}

impl From<PoolError> for RoutingError {
    fn from(e: PoolError) -> Self {
        RoutingError::Pool(e)
    }
}

/// Map a key to its vbucket
#[inline]
pub fn vbucket_for_key(key: &[u8], num_vbuckets: usize) -> u16 {
    if num_vbuckets == 0 {
        return 0;
    }
    let crc = crc32fast::hash(key);
    (((crc >> 16) & 0x7fff) as usize % num_vbuckets) as u16
}

/// Fetches a node's cluster map over one of its pooled connections
///
/// Encoding the fetch request is protocol work left to the caller.
pub trait ClusterMapFetcher: Send + Sync {
    fn fetch<'a>(
        &'a self,
        pool: &'a dyn ConnectionPool,
        bucket: &'a str,
        latest: Option<ConfigVersion>,
    ) -> Pin<Box<dyn Future<Output = Result<Option<BucketConfig>, ConfigError>> + Send + 'a>>;
}

/// How a bucket dials and sizes its node pools
#[derive(Debug, Clone)]
pub struct BucketSettings {
    pub network: NetworkResolution,
    pub tls: bool,
    /// Host the cluster was bootstrapped from, for resolving `Auto`
    pub bootstrap_host: String,
    pub pool: PoolSettings,
    /// One connection per node, no scaling
    pub single_connection: bool,
    /// `None` disables the scale controller
    pub scaling: Option<ScaleControllerConfig>,
    /// Maps also arrive through a streaming listener
    pub streaming_configs: bool,
}

impl Default for BucketSettings {
    fn default() -> Self {
        BucketSettings {
            network: NetworkResolution::Auto,
            tls: false,
            bootstrap_host: String::new(),
            pool: PoolSettings::default(),
            single_connection: false,
            scaling: Some(ScaleControllerConfig::default()),
            streaming_configs: false,
        }
    }
}

struct NodePool {
    pool: Arc<dyn ConnectionPool>,
    controller: Option<Arc<ScaleController>>,
}

impl NodePool {
    async fn dispose(self) {
        if let Some(controller) = &self.controller {
            controller.dispose().await;
        }
        self.pool.dispose().await;
    }
}

/// A node as seen by one bucket: its pool plus a way to fetch its map
struct PooledNode {
    bucket: String,
    endpoint: HostEndpoint,
    pool: Arc<dyn ConnectionPool>,
    fetcher: Arc<dyn ClusterMapFetcher>,
}

impl ClusterNode for PooledNode {
    fn endpoint(&self) -> HostEndpoint {
        self.endpoint.clone()
    }

    fn has_kv(&self) -> bool {
        true
    }

    fn is_dead(&self) -> bool {
        let connections = self.pool.connections();
        connections.is_empty() || connections.iter().all(|c| c.is_dead())
    }

    fn get_cluster_map<'a>(
        &'a self,
        latest: Option<ConfigVersion>,
    ) -> Pin<Box<dyn Future<Output = Result<Option<BucketConfig>, ConfigError>> + Send + 'a>> {
        Box::pin(async move {
            let config = self
                .fetcher
                .fetch(self.pool.as_ref(), &self.bucket, latest)
                .await?;
            Ok(config.map(|mut config| {
                config.replace_host_placeholder(&self.endpoint.host);
                config
            }))
        })
    }
}

/// Routes one bucket's requests and keeps its pools matched to the cluster map
pub struct BucketRouter {
    name: String,
    settings: BucketSettings,
    factory: Arc<dyn ConnectionFactory>,
    initializer: Arc<dyn ConnectionInitializer>,
    fetcher: Arc<dyn ClusterMapFetcher>,
    retry: Arc<dyn RetryClassifier>,
    pools: RwLock<HashMap<HostEndpoint, NodePool>>,
    config: watch::Sender<Option<Arc<BucketConfig>>>,
    applied: VersionCell,
    reshape: AsyncMutex<()>,
    cancel: CancellationToken,
    disposed: AtomicBool,
}

impl std::fmt::Debug for BucketRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BucketRouter")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

impl BucketRouter {
    pub fn new(
        name: &str,
        settings: BucketSettings,
        factory: Arc<dyn ConnectionFactory>,
        initializer: Arc<dyn ConnectionInitializer>,
        fetcher: Arc<dyn ClusterMapFetcher>,
        retry: Arc<dyn RetryClassifier>,
        cancel: CancellationToken,
    ) -> Arc<Self> {
        let (config, _) = watch::channel(None);
        Arc::new(BucketRouter {
            name: name.to_string(),
            settings,
            factory,
            initializer,
            fetcher,
            retry,
            pools: RwLock::new(HashMap::new()),
            config,
            applied: VersionCell::new(ConfigVersion::ZERO),
            reshape: AsyncMutex::new(()),
            cancel,
            disposed: AtomicBool::new(false),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Map currently applied
    pub fn config(&self) -> Option<Arc<BucketConfig>> {
        self.config.borrow().clone()
    }

    /// Endpoints with a pool, sorted
    pub fn endpoints(&self) -> Vec<HostEndpoint> {
        let mut endpoints: Vec<_> = self.pools.read().keys().cloned().collect();
        endpoints.sort();
        endpoints
    }

    pub fn pool(&self, endpoint: &HostEndpoint) -> Option<Arc<dyn ConnectionPool>> {
        self.pools.read().get(endpoint).map(|p| p.pool.clone())
    }

    /// Wait until some map has been applied
    pub async fn wait_for_config(&self) -> Result<Arc<BucketConfig>, RoutingError> {
        let mut rx = self.config.subscribe();
        tokio::select! {
            _ = self.cancel.cancelled() => Err(RoutingError::Disposed),
            applied = rx.wait_for(Option::is_some) => match applied {
                Ok(config) => config.clone().ok_or(RoutingError::NoConfig),
                Err(_) => Err(RoutingError::Disposed),
            },
        }
    }

    fn build_pool(&self, endpoint: &HostEndpoint) -> Arc<dyn ConnectionPool> {
        if self.settings.single_connection {
            Arc::new(SingleConnectionPool::new(
                endpoint.clone(),
                self.factory.clone(),
                self.initializer.clone(),
            ))
        } else {
            MultiplexingConnectionPool::new(
                endpoint.clone(),
                self.factory.clone(),
                self.initializer.clone(),
                self.settings.pool.clone(),
            )
        }
    }

    /// Create, bucket-select and start a pool for `endpoint`
    async fn open_pool(&self, endpoint: &HostEndpoint) -> NodePool {
        let pool = self.build_pool(endpoint);
        // Records the bucket first so the initial connections select it
        if let Err(e) = pool.select_bucket(&self.name).await {
            warn!(bucket = %self.name, endpoint = %endpoint, error = %e, "bucket selection failed");
        }
        if let Err(e) = pool.initialize().await {
            // Sends connect inline, so the pool stays usable
            warn!(bucket = %self.name, endpoint = %endpoint, error = %e, "pool initialization failed");
        }

        let controller = match (&self.settings.scaling, self.settings.single_connection) {
            (Some(config), false) => {
                let controller =
                    ScaleController::new(pool.clone(), config.clone(), self.cancel.child_token());
                if let Err(e) = controller.start() {
                    warn!(bucket = %self.name, endpoint = %endpoint, error = %e, "scale controller not started");
                }
                Some(controller)
            }
            _ => None,
        };
        NodePool { pool, controller }
    }

    /// Fetch the first map from a seed node
    ///
    /// The seed's pool is kept and reused if the map lists the node.
    pub async fn bootstrap(&self, seeds: &[HostEndpoint]) -> Result<BucketConfig, ConfigError> {
        if seeds.is_empty() {
            return Err(ConfigError::NoNodes);
        }
        let mut last_error = ConfigError::NoNodes;
        for seed in seeds {
            if self.disposed.load(Ordering::Acquire) {
                return Err(ConfigError::ContextStopped);
            }
            let pool = match self.pool(seed) {
                Some(pool) => pool,
                None => {
                    let node = self.open_pool(seed).await;
                    let pool = node.pool.clone();
                    self.pools.write().insert(seed.clone(), node);
                    pool
                }
            };
            let node = PooledNode {
                bucket: self.name.clone(),
                endpoint: seed.clone(),
                pool,
                fetcher: self.fetcher.clone(),
            };
            match node.get_cluster_map(None).await {
                Ok(Some(config)) => {
                    info!(bucket = %self.name, seed = %seed, version = %config.version(), "bootstrapped");
                    return Ok(config);
                }
                Ok(None) => {
                    last_error = ConfigError::Fetch(format!("{} returned no cluster map", seed));
                }
                Err(e) => {
                    warn!(bucket = %self.name, seed = %seed, error = %e, "bootstrap from seed failed");
                    last_error = e;
                }
            }
        }
        Err(last_error)
    }

    /// Bring the pools in line with `config`
    ///
    /// Maps are broadcast to every bucket; those naming another bucket are
    /// ignored.
    async fn apply(&self, config: Arc<BucketConfig>) -> Result<(), ConfigError> {
        let _reshape = self.reshape.lock().await;
        if self.disposed.load(Ordering::Acquire) {
            return Err(ConfigError::ContextStopped);
        }
        if config.name != self.name {
            trace!(bucket = %self.name, map = %config.name, "ignoring map of another bucket");
            return Ok(());
        }
        let version = config.version();
        if !version.is_newer_than(&self.applied.load()) {
            debug!(bucket = %self.name, version = %version, "map already applied");
            return Ok(());
        }

        let resolution = self.resolution(&config);
        let wanted = config.kv_endpoints(resolution, self.settings.tls);
        let current = self.config();
        if config.has_vbucket_map_changed(current.as_deref()) {
            debug!(bucket = %self.name, version = %version, "vbucket map changed");
        }
        if !config.has_nodes_changed(current.as_deref()) {
            // Same nodes: only the routing table moves
            self.applied.advance_if_newer(version);
            self.config.send_replace(Some(config));
            debug!(bucket = %self.name, version = %version, "cluster map applied without reshaping");
            return Ok(());
        }

        let missing: Vec<HostEndpoint> = {
            let pools = self.pools.read();
            wanted
                .iter()
                .filter(|e| !pools.contains_key(e))
                .cloned()
                .collect()
        };
        let opened = futures::future::join_all(missing.iter().map(|e| self.open_pool(e))).await;

        let removed: Vec<(HostEndpoint, NodePool)> = {
            let mut pools = self.pools.write();
            for (endpoint, node) in missing.into_iter().zip(opened) {
                pools.insert(endpoint, node);
            }
            let gone: Vec<HostEndpoint> = pools
                .keys()
                .filter(|e| !wanted.contains(e))
                .cloned()
                .collect();
            gone.into_iter()
                .filter_map(|e| pools.remove(&e).map(|node| (e, node)))
                .collect()
        };
        for (endpoint, node) in removed {
            debug!(bucket = %self.name, endpoint = %endpoint, "node left, disposing pool");
            node.dispose().await;
        }

        self.applied.advance_if_newer(version);
        self.config.send_replace(Some(config));
        info!(
            bucket = %self.name,
            version = %version,
            nodes = wanted.len(),
            "cluster map applied"
        );
        Ok(())
    }

    fn resolution(&self, config: &BucketConfig) -> NetworkResolution {
        config.effective_resolution(self.settings.network, &self.settings.bootstrap_host)
    }

    /// Pool serving `vbucket` under the current map
    ///
    /// Resolved with the same network and TLS choice the pools were keyed by.
    fn route(&self, vbucket: u16) -> Result<Arc<dyn ConnectionPool>, RoutingError> {
        let config = self.config().ok_or(RoutingError::NoConfig)?;
        let endpoint = config
            .active_kv_endpoint(vbucket as usize, self.resolution(&config), self.settings.tls)
            .ok_or(RoutingError::NoRoute { vbucket })?;
        self.pool(&endpoint).ok_or(RoutingError::NoRoute { vbucket })
    }

    /// vbucket of `key` under the current map
    pub fn vbucket(&self, key: &[u8]) -> Result<u16, RoutingError> {
        let config = self.config().ok_or(RoutingError::NoConfig)?;
        let n = config.num_vbuckets();
        if n == 0 {
            return Err(RoutingError::NoVBucketMap);
        }
        Ok(vbucket_for_key(key, n))
    }

    /// Send an encoded request for `key` and await its response
    ///
    /// Each attempt gets a fresh opaque and is routed through the map current
    /// at that moment. Whether a failure is retried is up to the retry
    /// classifier.
    pub async fn send(&self, key: &[u8], request: Bytes, idempotent: bool) -> Result<Bytes, RoutingError> {
        let mut attempt = 0u32;
        loop {
            if self.disposed.load(Ordering::Acquire) {
                return Err(RoutingError::Disposed);
            }
            let vbucket = self.vbucket(key)?;
            let pool = self.route(vbucket)?;
            let opaque = next_opaque();
            let frame =
                stamp_request(&request, vbucket, opaque).ok_or(RoutingError::MalformedRequest)?;
            let (op, result) = Operation::new(opaque, frame, idempotent);

            if let Err(e) = pool.send(&op).await {
                debug!(bucket = %self.name, vbucket, error = %e, "send failed");
                op.fail(OperationError::NotSent(e.to_string()));
            }
            let error = match result.await {
                Ok(response) => return Ok(response),
                Err(error) => error,
            };

            let action = self.retry.classify(&op, &error, attempt);
            attempt += 1;
            match action {
                RetryAction::Retry(delay) => {
                    debug!(bucket = %self.name, attempt, delay = ?delay, error = %error, "retrying operation");
                    tokio::select! {
                        _ = self.cancel.cancelled() => return Err(RoutingError::Disposed),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                RetryAction::Stop => return Err(RoutingError::Operation(error)),
            }
        }
    }

    /// Close every pool; the router refuses work afterwards
    pub async fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.cancel.cancel();
        let _reshape = self.reshape.lock().await;
        let pools: Vec<NodePool> = self.pools.write().drain().map(|(_, node)| node).collect();
        for node in pools {
            node.dispose().await;
        }
        self.config.send_replace(None);
        info!(bucket = %self.name, "bucket closed");
    }
}

impl ConfigSubscriber for BucketRouter {
    fn name(&self) -> &str {
        &self.name
    }

    fn on_config_updated<'a>(
        &'a self,
        config: Arc<BucketConfig>,
    ) -> Pin<Box<dyn Future<Output = Result<(), ConfigError>> + Send + 'a>> {
        Box::pin(self.apply(config))
    }

    fn nodes(&self) -> Vec<Arc<dyn ClusterNode>> {
        self.pools
            .read()
            .iter()
            .map(|(endpoint, node)| {
                Arc::new(PooledNode {
                    bucket: self.name.clone(),
                    endpoint: endpoint.clone(),
                    pool: node.pool.clone(),
                    fetcher: self.fetcher.clone(),
                }) as Arc<dyn ClusterNode>
            })
            .collect()
    }

    fn applied_version(&self) -> Option<ConfigVersion> {
        self.config.borrow().as_ref().map(|_| self.applied.load())
    }

    fn uses_streaming_listener(&self) -> bool {
        self.settings.streaming_configs
    }
}
