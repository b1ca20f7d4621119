//! Process-wide cluster map store
//!
//! ## Design
//!
//! ```text
//!  publish() ──► unbounded queue ──► consumer loop ──► DashMap<bucket, Arc<BucketConfig>>
//!  (any task)                        (single writer)          │
//!                                                             │ accepted only if not equal
//!                                                             │ and strictly newer
//!                                                             ▼
//!                                          per-subscriber queue ──► delivery task
//! ```
//!
//! The consumer loop is the only writer of the store, so accept-or-ignore is
//! decided without racing another writer. Fan-out happens after the store
//! entry lock has been released: each subscriber owns a queue drained by its
//! own task, so a slow subscriber delays only itself and still receives maps
//! in the order they were accepted.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use super::bucket_config::BucketConfig;
use super::node::{pick_live_kv_node, ClusterNode, ConfigListener, ConfigListenerFactory};
use super::version::ConfigVersion;
use super::ConfigError;

/// Default interval of the polling loop
pub const DEFAULT_CONFIG_POLL_INTERVAL: Duration = Duration::from_millis(2500);

/// Sink for cluster maps; implemented by `ConfigHandler`
pub trait ConfigPublisher: Send + Sync {
    fn publish(&self, config: BucketConfig) -> Result<(), ConfigError>;
}

/// A party interested in accepted cluster maps, usually a bucket
pub trait ConfigSubscriber: Send + Sync {
    /// Unique name; subscribing a second subscriber with the same name replaces the first
    fn name(&self) -> &str;

    /// Called once per accepted, strictly newer map, in acceptance order
    fn on_config_updated<'a>(
        &'a self,
        config: Arc<BucketConfig>,
    ) -> Pin<Box<dyn Future<Output = Result<(), ConfigError>> + Send + 'a>>;

    /// Nodes that may be polled for this subscriber's map
    fn nodes(&self) -> Vec<Arc<dyn ClusterNode>> {
        Vec::new()
    }

    /// Version of the map the subscriber has applied, if any
    fn applied_version(&self) -> Option<ConfigVersion> {
        None
    }

    /// Whether maps for this subscriber also arrive through a `ConfigListener`
    fn uses_streaming_listener(&self) -> bool {
        false
    }
}

struct Subscription {
    subscriber: Arc<dyn ConfigSubscriber>,
    queue: mpsc::UnboundedSender<Arc<BucketConfig>>,
    delivery: JoinHandle<()>,
    listener: Option<Arc<dyn ConfigListener>>,
}

impl Subscription {
    fn shutdown(self) {
        if let Some(listener) = &self.listener {
            listener.stop();
        }
        // Dropping the sender ends the delivery task once the queue drains
        drop(self.queue);
        drop(self.delivery);
    }
}

/// Shared cluster map store with subscriber fan-out
pub struct ConfigHandler {
    sender: mpsc::UnboundedSender<Arc<BucketConfig>>,
    receiver: Mutex<Option<mpsc::UnboundedReceiver<Arc<BucketConfig>>>>,
    store: DashMap<String, Arc<BucketConfig>>,
    subscriptions: DashMap<String, Subscription>,
    listener_factory: Option<Arc<dyn ConfigListenerFactory>>,
    poll_interval: Duration,
    cancel: CancellationToken,
    stopped: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    accepted: AtomicU64,
    ignored: AtomicU64,
}

impl ConfigHandler {
    pub fn new(poll_interval: Duration, cancel: CancellationToken) -> Arc<Self> {
        Self::build(poll_interval, cancel, None)
    }

    pub fn with_listener_factory(
        poll_interval: Duration,
        cancel: CancellationToken,
        factory: Arc<dyn ConfigListenerFactory>,
    ) -> Arc<Self> {
        Self::build(poll_interval, cancel, Some(factory))
    }

    fn build(
        poll_interval: Duration,
        cancel: CancellationToken,
        listener_factory: Option<Arc<dyn ConfigListenerFactory>>,
    ) -> Arc<Self> {
        let (sender, receiver) = mpsc::unbounded_channel();
        Arc::new(ConfigHandler {
            sender,
            receiver: Mutex::new(Some(receiver)),
            store: DashMap::new(),
            subscriptions: DashMap::new(),
            listener_factory,
            poll_interval,
            cancel,
            stopped: AtomicBool::new(false),
            tasks: Mutex::new(Vec::new()),
            accepted: AtomicU64::new(0),
            ignored: AtomicU64::new(0),
        })
    }

    fn check_running(&self) -> Result<(), ConfigError> {
        if self.stopped.load(Ordering::Acquire) {
            Err(ConfigError::ContextStopped)
        } else {
            Ok(())
        }
    }

    /// Start the consumer loop and, optionally, the polling loop
    ///
    /// Calling `start` again is a no-op.
    pub fn start(self: &Arc<Self>, enable_polling: bool) -> Result<(), ConfigError> {
        self.check_running()?;
        let Some(receiver) = self.receiver.lock().take() else {
            debug!("config handler already started");
            return Ok(());
        };

        let mut tasks = self.tasks.lock();
        tasks.push(tokio::spawn(Self::process_loop(
            self.clone(),
            receiver,
            self.cancel.clone(),
        )));
        if enable_polling {
            tasks.push(tokio::spawn(Self::poll_loop(self.clone(), self.cancel.clone())));
        }
        info!(polling = enable_polling, "config handler started");
        Ok(())
    }

    /// Queue a map for the consumer loop
    pub fn publish(&self, config: BucketConfig) -> Result<(), ConfigError> {
        self.publish_shared(Arc::new(config))
    }

    pub fn publish_shared(&self, config: Arc<BucketConfig>) -> Result<(), ConfigError> {
        self.check_running()?;
        self.sender
            .send(config)
            .map_err(|_| ConfigError::ContextStopped)
    }

    /// Newest accepted map for `bucket`
    pub fn get(&self, bucket: &str) -> Result<Arc<BucketConfig>, ConfigError> {
        self.check_running()?;
        self.store
            .get(bucket)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| ConfigError::BucketMissing(bucket.to_string()))
    }

    pub fn subscribe(self: &Arc<Self>, subscriber: Arc<dyn ConfigSubscriber>) -> Result<(), ConfigError> {
        self.check_running()?;
        let name = subscriber.name().to_string();

        let (queue, mut rx) = mpsc::unbounded_channel::<Arc<BucketConfig>>();
        let delivery = {
            let subscriber = subscriber.clone();
            let cancel = self.cancel.clone();
            tokio::spawn(async move {
                loop {
                    let config = tokio::select! {
                        _ = cancel.cancelled() => break,
                        config = rx.recv() => match config {
                            Some(config) => config,
                            None => break,
                        },
                    };
                    let version = config.version();
                    if let Err(e) = subscriber.on_config_updated(config).await {
                        warn!(subscriber = subscriber.name(), %version, error = %e, "config update failed");
                    }
                }
            })
        };

        let listener = match (&self.listener_factory, subscriber.uses_streaming_listener()) {
            (Some(factory), true) => {
                let publisher: Arc<dyn ConfigPublisher> = self.clone();
                let listener = factory.create(&name, publisher);
                listener.start();
                Some(listener)
            }
            _ => None,
        };

        let previous = self.subscriptions.insert(
            name.clone(),
            Subscription {
                subscriber,
                queue,
                delivery,
                listener,
            },
        );
        if let Some(previous) = previous {
            previous.shutdown();
        }
        debug!(subscriber = %name, "config subscriber added");
        Ok(())
    }

    pub fn unsubscribe(&self, name: &str) -> Result<(), ConfigError> {
        self.check_running()?;
        if let Some((_, subscription)) = self.subscriptions.remove(name) {
            subscription.shutdown();
            debug!(subscriber = %name, "config subscriber removed");
        }
        Ok(())
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscriptions.len()
    }

    /// Maps accepted and ignored so far
    pub fn stats(&self) -> (u64, u64) {
        (
            self.accepted.load(Ordering::Relaxed),
            self.ignored.load(Ordering::Relaxed),
        )
    }

    /// Store the map if it is new for its bucket; returns whether it was accepted
    ///
    /// Only the consumer loop calls this.
    fn ingest(&self, config: Arc<BucketConfig>) -> bool {
        let accepted = match self.store.entry(config.name.clone()) {
            Entry::Vacant(vacant) => {
                vacant.insert(config.clone());
                true
            }
            Entry::Occupied(mut occupied) => {
                let current = occupied.get();
                if **current != *config && config.version() > current.version() {
                    occupied.insert(config.clone());
                    true
                } else {
                    false
                }
            }
        };

        if !accepted {
            self.ignored.fetch_add(1, Ordering::Relaxed);
            trace!(bucket = %config.name, version = %config.version(), "ignoring stale or duplicate config");
            return false;
        }
        self.accepted.fetch_add(1, Ordering::Relaxed);
        debug!(bucket = %config.name, version = %config.version(), "accepted config");

        // Snapshot the queues first; no map lock is held while sending
        let queues: Vec<_> = self
            .subscriptions
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().queue.clone()))
            .collect();
        for (name, queue) in queues {
            if queue.send(config.clone()).is_err() {
                trace!(subscriber = %name, "subscriber queue closed");
            }
        }
        true
    }

    async fn process_loop(
        handler: Arc<Self>,
        mut receiver: mpsc::UnboundedReceiver<Arc<BucketConfig>>,
        cancel: CancellationToken,
    ) {
        loop {
            let config = tokio::select! {
                _ = cancel.cancelled() => break,
                config = receiver.recv() => match config {
                    Some(config) => config,
                    None => break,
                },
            };
            handler.ingest(config);
        }
        debug!("config processing loop stopped");
    }

    async fn poll_loop(handler: Arc<Self>, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(handler.poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            let subscribers: Vec<_> = handler
                .subscriptions
                .iter()
                .map(|entry| entry.value().subscriber.clone())
                .collect();
            for subscriber in subscribers {
                if let Err(e) = handler.poll_once(subscriber.as_ref()).await {
                    match e {
                        ConfigError::ContextStopped => return,
                        ConfigError::NoNodes => {
                            trace!(subscriber = subscriber.name(), "no node to poll")
                        }
                        e => warn!(subscriber = subscriber.name(), error = %e, "config poll failed"),
                    }
                }
            }
        }
        debug!("config polling loop stopped");
    }

    async fn poll_once(&self, subscriber: &dyn ConfigSubscriber) -> Result<(), ConfigError> {
        let node = pick_live_kv_node(&subscriber.nodes()).ok_or(ConfigError::NoNodes)?;
        let latest = self
            .store
            .get(subscriber.name())
            .map(|entry| entry.value().version());
        if let Some(config) = node.get_cluster_map(latest).await? {
            self.publish(config)?;
        }
        Ok(())
    }

    /// Stop every loop and listener and clear the store
    ///
    /// Subsequent calls on the handler fail with `ConfigError::ContextStopped`.
    pub async fn dispose(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        self.cancel.cancel();

        let names: Vec<String> = self
            .subscriptions
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        for name in names {
            if let Some((_, subscription)) = self.subscriptions.remove(&name) {
                subscription.shutdown();
            }
        }

        let tasks: Vec<_> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await {
                if !e.is_cancelled() {
                    error!(error = %e, "config handler task panicked");
                }
            }
        }
        self.store.clear();
        info!("config handler disposed");
    }
}

impl ConfigPublisher for ConfigHandler {
    fn publish(&self, config: BucketConfig) -> Result<(), ConfigError> {
        ConfigHandler::publish(self, config)
    }
}
