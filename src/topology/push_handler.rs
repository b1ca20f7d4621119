//! Per-bucket handling of out-of-band cluster map announcements
//!
//! ## State machine
//!
//! ```text
//!            push(v) newer than queued and applied
//!   ┌──────┐ ───────────────────────────────────► signal (coalesced)
//!   │ Idle │ ◄──────────────────────┐                 │
//!   └──────┘                        │                 ▼
//!       ▲                    target already     ┌──────────┐
//!       │                    applied            │ Fetching │
//!       │                           └────────── └──────────┘
//!       │                                             │ map ≥ target
//!       │        ┌───────────┐                        ▼
//!       └─────── │ Published │ ◄──── ConfigPublisher::publish
//!                └───────────┘
//! ```
//!
//! Bursts of pushes collapse into one wake-up: `Notify::notify_one` stores at
//! most one permit. If the node serves a map older than the announced one
//! (it has not caught up yet) the handler waits and signals itself again
//! until the announced version, or a newer one, is published.

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace, warn};

use super::handler::{ConfigPublisher, ConfigSubscriber};
use super::node::pick_live_kv_node;
use super::version::ConfigVersion;
use super::ConfigError;
use crate::io::connection::ServerPushSink;
use crate::io::frame::ServerPush;
use crate::retry::Backoff;

const RETRY_INITIAL: Duration = Duration::from_millis(10);
const RETRY_MAX: Duration = Duration::from_secs(1);

/// Outcome of one fetch attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FetchOutcome {
    /// A map at or beyond the target was published
    CaughtUp,
    /// The node served nothing, or something older than the target
    Behind,
}

struct PushShared {
    bucket: Arc<dyn ConfigSubscriber>,
    publisher: Arc<dyn ConfigPublisher>,
    /// Newest announced version not yet known to be applied
    queued: Mutex<ConfigVersion>,
    signal: Notify,
}

impl PushShared {
    fn applied(&self) -> ConfigVersion {
        self.bucket.applied_version().unwrap_or(ConfigVersion::ZERO)
    }
}

/// Coalesces cluster map announcements for one bucket and fetches the map
pub struct ConfigPushHandler {
    shared: Arc<PushShared>,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ConfigPushHandler {
    /// Create the handler and start its loop
    pub fn new(
        bucket: Arc<dyn ConfigSubscriber>,
        publisher: Arc<dyn ConfigPublisher>,
        cancel: CancellationToken,
    ) -> Self {
        let shared = Arc::new(PushShared {
            bucket,
            publisher,
            queued: Mutex::new(ConfigVersion::ZERO),
            signal: Notify::new(),
        });
        let task = tokio::spawn(Self::run(shared.clone(), cancel.clone()));
        ConfigPushHandler {
            shared,
            cancel,
            task: Mutex::new(Some(task)),
        }
    }

    /// Record an announced version and wake the loop if it is new
    ///
    /// Called from the connection read loop; never blocks on I/O.
    pub fn process_config_push(&self, version: ConfigVersion) {
        if self.cancel.is_cancelled() {
            return;
        }
        let applied = self.shared.applied();
        {
            let mut queued = self.shared.queued.lock();
            if version <= *queued || version <= applied {
                trace!(bucket = self.shared.bucket.name(), %version, "dropping stale config push");
                return;
            }
            *queued = version;
        }
        debug!(bucket = self.shared.bucket.name(), %version, "config push queued");
        self.shared.signal.notify_one();
    }

    /// Newest announced version
    pub fn queued_version(&self) -> ConfigVersion {
        *self.shared.queued.lock()
    }

    async fn run(shared: Arc<PushShared>, cancel: CancellationToken) {
        let mut backoff = Backoff::exponential(RETRY_INITIAL, 2, RETRY_MAX);
        let bucket = shared.bucket.name().to_string();

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = shared.signal.notified() => {}
            }

            let target = *shared.queued.lock();
            if target <= shared.applied() {
                // Superseded by a map that arrived while we waited
                backoff.reset();
                continue;
            }

            let outcome = match Self::fetch_and_publish(&shared, target).await {
                Ok(outcome) => outcome,
                Err(ConfigError::ContextStopped) => break,
                Err(e) => {
                    warn!(bucket = %bucket, %target, error = %e, "config push fetch failed");
                    FetchOutcome::Behind
                }
            };

            if outcome == FetchOutcome::CaughtUp {
                backoff.reset();
                continue;
            }

            let delay = backoff.next_delay();
            trace!(bucket = %bucket, %target, ?delay, "node behind announced version, retrying");
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
            // Retry unless something newer or already applied changed the picture
            if *shared.queued.lock() > shared.applied() {
                shared.signal.notify_one();
            }
        }
        debug!(bucket = %bucket, "config push loop stopped");
    }

    async fn fetch_and_publish(
        shared: &PushShared,
        target: ConfigVersion,
    ) -> Result<FetchOutcome, ConfigError> {
        let node = pick_live_kv_node(&shared.bucket.nodes()).ok_or(ConfigError::NoNodes)?;
        let applied = shared.applied();

        let Some(config) = node.get_cluster_map(Some(applied)).await? else {
            return Ok(FetchOutcome::Behind);
        };
        let version = config.version();
        if version > applied {
            shared.publisher.publish(config)?;
            debug!(bucket = shared.bucket.name(), %version, "published pushed config");
        }
        if version >= target {
            Ok(FetchOutcome::CaughtUp)
        } else {
            Ok(FetchOutcome::Behind)
        }
    }

    /// Stop the loop and wait for it to exit
    pub async fn dispose(&self) {
        self.cancel.cancel();
        let task = self.task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                if !e.is_cancelled() {
                    error!(error = %e, "config push loop panicked");
                }
            }
        }
    }
}

impl Drop for ConfigPushHandler {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl ServerPushSink for ConfigPushHandler {
    fn on_server_push(&self, push: ServerPush) {
        if push.bucket.is_empty() || push.bucket == self.shared.bucket.name() {
            self.process_config_push(push.version);
        }
    }
}
