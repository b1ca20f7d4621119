//! Cluster context: owns every background loop of a client
//!
//! ## Wiring
//!
//! ```text
//!                   ┌──────────── CancellationToken (root) ────────────┐
//!                   │                                                  │
//!  ConnectionFactory ──server push──► PushRelay ──► ConfigPushHandler (per bucket)
//!        ▲                                                 │ publish
//!        │                                                 ▼
//!  BucketRouter ◄──on_config_updated── ConfigHandler ◄── polling / listeners
//!   (pools, scale controllers)
//! ```
//!
//! Connections are created before any push handler exists, so they report
//! pushes to the relay, which dispatches by bucket name. Closing a bucket
//! unregisters its handler from the relay first; that breaks the
//! handler → router → pool → factory → relay reference cycle.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::bucket::{BucketRouter, ClusterMapFetcher, RoutingError};
use crate::io::{
    ConnectionFactory, ConnectionInitializer, ConnectionSettings, ServerPush, ServerPushSink,
    TcpConnectionFactory,
};
use crate::options::ClusterOptions;
use crate::retry::{BestEffortRetry, RetryClassifier};
use crate::topology::{BucketConfig, ConfigError, ConfigHandler, ConfigListenerFactory, ConfigPushHandler};

/// Errors opening or using a cluster
#[derive(Debug)]
pub enum ClusterError {
    /// The context has been disposed
    Disposed,
    /// A bucket with this name is already open
    BucketOpen(String),
    /// The TLS connector could not be built
    Tls(String),
    Config(ConfigError),
    Routing(RoutingError),
}

impl std::fmt::Display for ClusterError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ClusterError::Disposed => write!(f, "Cluster context disposed"),
            ClusterError::BucketOpen(name) => write!(f, "Bucket '{}' is already open", name),
            ClusterError::Tls(reason) => write!(f, "TLS setup failed: {}", reason),
            ClusterError::Config(e) => write!(f, "{}", e),
            ClusterError::Routing(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for ClusterError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ClusterError::Config(e) => Some(e),
            ClusterError::Routing(e) => Some(e),
            _ => None,
        }
    }
}

impl From<ConfigError> for ClusterError {
    fn from(e: ConfigError) -> Self {
        ClusterError::Config(e)
    }
}

impl From<RoutingError> for ClusterError {
    fn from(e: RoutingError) -> Self {
        ClusterError::Routing(e)
    }
}

/// Dispatches server pushes to the push handler of the named bucket
///
/// Pushes without a bucket name concern every bucket.
#[derive(Default)]
pub struct PushRelay {
    handlers: DashMap<String, Arc<ConfigPushHandler>>,
}

impl PushRelay {
    pub fn new() -> Arc<Self> {
        Arc::new(PushRelay::default())
    }

    fn register(&self, bucket: &str, handler: Arc<ConfigPushHandler>) {
        self.handlers.insert(bucket.to_string(), handler);
    }

    fn unregister(&self, bucket: &str) -> Option<Arc<ConfigPushHandler>> {
        self.handlers.remove(bucket).map(|(_, handler)| handler)
    }

    fn drain(&self) -> Vec<Arc<ConfigPushHandler>> {
        let names: Vec<String> = self.handlers.iter().map(|e| e.key().clone()).collect();
        names.iter().filter_map(|n| self.unregister(n)).collect()
    }
}

impl ServerPushSink for PushRelay {
    fn on_server_push(&self, push: ServerPush) {
        if push.bucket.is_empty() {
            for handler in self.handlers.iter() {
                handler.on_server_push(push.clone());
            }
            return;
        }
        match self.handlers.get(&push.bucket) {
            Some(handler) => handler.on_server_push(push),
            None => debug!(bucket = %push.bucket, "config push for unknown bucket"),
        }
    }
}

/// Collaborators the transport consumes but does not implement
pub struct ClusterServices {
    pub initializer: Arc<dyn ConnectionInitializer>,
    pub fetcher: Arc<dyn ClusterMapFetcher>,
    /// `None` retries idempotent operations up to `retry_max_attempts`
    pub retry: Option<Arc<dyn RetryClassifier>>,
    pub listener_factory: Option<Arc<dyn ConfigListenerFactory>>,
}

impl ClusterServices {
    pub fn new(initializer: Arc<dyn ConnectionInitializer>, fetcher: Arc<dyn ClusterMapFetcher>) -> Self {
        ClusterServices {
            initializer,
            fetcher,
            retry: None,
            listener_factory: None,
        }
    }
}

/// One client's view of a cluster
pub struct ClusterContext {
    options: ClusterOptions,
    services: ClusterServices,
    retry: Arc<dyn RetryClassifier>,
    factory: Arc<dyn ConnectionFactory>,
    relay: Arc<PushRelay>,
    handler: Arc<ConfigHandler>,
    buckets: DashMap<String, Arc<BucketRouter>>,
    cancel: CancellationToken,
    disposed: AtomicBool,
}

impl ClusterContext {
    /// Context dialing nodes over TCP, or TLS when enabled in `options`
    pub fn new(options: ClusterOptions, services: ClusterServices) -> Result<Self, ClusterError> {
        #[cfg(feature = "tls")]
        let connector = match options.tls_client_config() {
            Some(tls) => Some(
                tls.build_connector()
                    .map_err(|e| ClusterError::Tls(e.to_string()))?,
            ),
            None => None,
        };
        #[cfg(not(feature = "tls"))]
        if options.tls {
            warn!("TLS requested but the 'tls' feature is not enabled; dialing plain TCP");
        }

        let settings = options.in_flight_config();
        let connect_timeout = options.connect_timeout;
        Ok(Self::with_factory(options, services, move |push_sink| {
            let factory = TcpConnectionFactory::new(
                connect_timeout,
                ConnectionSettings {
                    in_flight: settings,
                    push_sink: Some(push_sink),
                },
            );
            #[cfg(feature = "tls")]
            let factory = match connector {
                Some(connector) => factory.with_tls(connector),
                None => factory,
            };
            Arc::new(factory)
        }))
    }

    /// Context using a custom transport
    ///
    /// `make_factory` receives the sink its connections must report server
    /// pushes to.
    pub fn with_factory<F>(options: ClusterOptions, services: ClusterServices, make_factory: F) -> Self
    where
        F: FnOnce(Arc<dyn ServerPushSink>) -> Arc<dyn ConnectionFactory>,
    {
        let cancel = CancellationToken::new();
        let relay = PushRelay::new();
        let factory = make_factory(relay.clone());
        let retry = services
            .retry
            .clone()
            .unwrap_or_else(|| Arc::new(BestEffortRetry::new(options.retry_max_attempts)));
        let handler = match &services.listener_factory {
            Some(listeners) => ConfigHandler::with_listener_factory(
                options.config_poll_interval,
                cancel.child_token(),
                listeners.clone(),
            ),
            None => ConfigHandler::new(options.config_poll_interval, cancel.child_token()),
        };
        ClusterContext {
            options,
            services,
            retry,
            factory,
            relay,
            handler,
            buckets: DashMap::new(),
            cancel,
            disposed: AtomicBool::new(false),
        }
    }

    pub fn options(&self) -> &ClusterOptions {
        &self.options
    }

    pub fn config_handler(&self) -> &Arc<ConfigHandler> {
        &self.handler
    }

    /// Start the config loops
    pub fn start(&self) -> Result<(), ClusterError> {
        self.check_running()?;
        self.handler.start(self.options.enable_config_polling)?;
        info!(seeds = ?self.options.seeds, polling = self.options.enable_config_polling, "cluster context started");
        Ok(())
    }

    fn check_running(&self) -> Result<(), ClusterError> {
        if self.disposed.load(Ordering::Acquire) {
            return Err(ClusterError::Disposed);
        }
        Ok(())
    }

    /// Bootstrap `name` from the seeds and wait for its first map to apply
    ///
    /// The name is reserved before bootstrapping, so a concurrent open of the
    /// same bucket fails with `BucketOpen` instead of replacing this one.
    pub async fn open_bucket(&self, name: &str) -> Result<Arc<BucketRouter>, ClusterError> {
        self.check_running()?;
        let router = match self.buckets.entry(name.to_string()) {
            Entry::Occupied(_) => return Err(ClusterError::BucketOpen(name.to_string())),
            Entry::Vacant(vacant) => {
                let router = BucketRouter::new(
                    name,
                    self.options.bucket_settings(),
                    self.factory.clone(),
                    self.services.initializer.clone(),
                    self.services.fetcher.clone(),
                    self.retry.clone(),
                    self.cancel.child_token(),
                );
                vacant.insert(router.clone());
                router
            }
        };

        let config = match router.bootstrap(&self.options.seed_endpoints()).await {
            Ok(config) => config,
            Err(e) => {
                self.buckets.remove_if(name, |_, reserved| Arc::ptr_eq(reserved, &router));
                router.dispose().await;
                return Err(e.into());
            }
        };
        // Closed while bootstrapping
        if !self
            .buckets
            .get(name)
            .is_some_and(|reserved| Arc::ptr_eq(reserved.value(), &router))
        {
            router.dispose().await;
            return Err(RoutingError::Disposed.into());
        }

        let push = Arc::new(ConfigPushHandler::new(
            router.clone(),
            self.handler.clone(),
            self.cancel.child_token(),
        ));
        self.relay.register(name, push);

        let opened = async {
            self.handler.subscribe(router.clone())?;
            self.handler.publish(config)?;
            router.wait_for_config().await?;
            Ok::<(), ClusterError>(())
        };
        if let Err(e) = opened.await {
            warn!(bucket = name, error = %e, "bucket open failed");
            self.close_bucket(name).await;
            return Err(e);
        }

        info!(bucket = name, endpoints = router.endpoints().len(), "bucket opened");
        Ok(router)
    }

    pub fn bucket(&self, name: &str) -> Option<Arc<BucketRouter>> {
        self.buckets.get(name).map(|r| r.clone())
    }

    /// Newest accepted map for `name`
    pub fn config(&self, name: &str) -> Result<Arc<BucketConfig>, ClusterError> {
        Ok(self.handler.get(name)?)
    }

    /// Stop delivering maps to `name` and close its pools
    pub async fn close_bucket(&self, name: &str) {
        if let Some(push) = self.relay.unregister(name) {
            push.dispose().await;
        }
        if let Err(e) = self.handler.unsubscribe(name) {
            debug!(bucket = name, error = %e, "unsubscribe skipped");
        }
        if let Some((_, router)) = self.buckets.remove(name) {
            router.dispose().await;
        }
    }

    /// Stop every loop, close every bucket and clear the config store
    pub async fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        for push in self.relay.drain() {
            push.dispose().await;
        }
        let names: Vec<String> = self.buckets.iter().map(|e| e.key().clone()).collect();
        for name in names {
            self.close_bucket(&name).await;
        }
        self.handler.dispose().await;
        self.cancel.cancel();
        info!("cluster context disposed");
    }
}

impl Drop for ClusterContext {
    fn drop(&mut self) {
        self.relay.drain();
        self.cancel.cancel();
    }
}
