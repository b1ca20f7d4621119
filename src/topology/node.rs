//! Topology sources: cluster nodes and streaming config listeners

use futures::stream::BoxStream;
use futures::StreamExt;
use parking_lot::Mutex;
use rand::seq::SliceRandom;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::bucket_config::{BucketConfig, HostEndpoint};
use super::handler::ConfigPublisher;
use super::version::ConfigVersion;
use super::ConfigError;
use crate::retry::Backoff;

/// A cluster node able to serve its current cluster map
pub trait ClusterNode: Send + Sync {
    fn endpoint(&self) -> HostEndpoint;

    /// Whether the node runs the KV service
    fn has_kv(&self) -> bool;

    /// Whether the node's KV connections are all dead
    fn is_dead(&self) -> bool;

    /// Fetch the node's map for the bucket
    ///
    /// Returns `Ok(None)` when the node has nothing newer than `latest`.
    fn get_cluster_map<'a>(
        &'a self,
        latest: Option<ConfigVersion>,
    ) -> Pin<Box<dyn Future<Output = Result<Option<BucketConfig>, ConfigError>> + Send + 'a>>;
}

/// Pick a random live node running the KV service
pub fn pick_live_kv_node(nodes: &[Arc<dyn ClusterNode>]) -> Option<Arc<dyn ClusterNode>> {
    let live: Vec<&Arc<dyn ClusterNode>> = nodes
        .iter()
        .filter(|n| n.has_kv() && !n.is_dead())
        .collect();
    live.choose(&mut rand::thread_rng()).map(|n| Arc::clone(n))
}

/// Long-lived secondary source of cluster maps for one bucket
pub trait ConfigListener: Send + Sync {
    fn start(&self);
    fn stop(&self);
    fn is_started(&self) -> bool;
}

/// Creates a listener for buckets that are served through one
pub trait ConfigListenerFactory: Send + Sync {
    fn create(&self, bucket: &str, publisher: Arc<dyn ConfigPublisher>) -> Arc<dyn ConfigListener>;
}

// ============================================================================
// Streaming listener
// ============================================================================

/// Newline-delimited stream of terse cluster maps
pub type ConfigLines = BoxStream<'static, Result<String, ConfigError>>;

/// Opens a config stream against one server
pub trait ConfigStreamSource: Send + Sync {
    /// Servers to try, in no particular order
    fn servers(&self) -> Vec<HostEndpoint>;

    fn open<'a>(
        &'a self,
        server: &'a HostEndpoint,
        bucket: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<ConfigLines, ConfigError>> + Send + 'a>>;
}

/// Delay after the first failed pass over every server
const STREAM_FIRST_RETRY: Duration = Duration::from_millis(10);
const STREAM_MAX_RETRY: Duration = Duration::from_secs(10);

/// Publishes every map read from a config stream
///
/// Servers are tried in random order. When all of them fail the listener
/// starts over after an exponential delay: none on the first pass, then
/// 10 ms growing tenfold up to 10 s. Any map received resets the delay.
pub struct StreamingConfigListener {
    bucket: String,
    source: Arc<dyn ConfigStreamSource>,
    publisher: Arc<dyn ConfigPublisher>,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl StreamingConfigListener {
    pub fn new(
        bucket: &str,
        source: Arc<dyn ConfigStreamSource>,
        publisher: Arc<dyn ConfigPublisher>,
        cancel: CancellationToken,
    ) -> Self {
        StreamingConfigListener {
            bucket: bucket.to_string(),
            source,
            publisher,
            cancel,
            task: Mutex::new(None),
        }
    }

    async fn run(
        bucket: String,
        source: Arc<dyn ConfigStreamSource>,
        publisher: Arc<dyn ConfigPublisher>,
        cancel: CancellationToken,
    ) {
        let mut backoff = Backoff::exponential(STREAM_FIRST_RETRY, 10, STREAM_MAX_RETRY);
        let mut delay = Duration::ZERO;

        while !cancel.is_cancelled() {
            let mut servers = source.servers();
            servers.shuffle(&mut rand::thread_rng());

            for server in servers {
                if cancel.is_cancelled() {
                    return;
                }
                let mut lines = match source.open(&server, &bucket).await {
                    Ok(lines) => lines,
                    Err(e) => {
                        error!(bucket = %bucket, server = %server, error = %e, "config stream open failed");
                        continue;
                    }
                };

                loop {
                    let line = tokio::select! {
                        _ = cancel.cancelled() => return,
                        line = lines.next() => line,
                    };
                    let line = match line {
                        None => break,
                        Some(Ok(line)) => line,
                        Some(Err(e)) => {
                            error!(bucket = %bucket, server = %server, error = %e, "config stream read failed");
                            break;
                        }
                    };
                    if line.trim().is_empty() {
                        continue;
                    }
                    match BucketConfig::parse(&line, &server.host) {
                        Ok(config) => {
                            if let Err(e) = publisher.publish(config) {
                                debug!(bucket = %bucket, error = %e, "config stream stopping");
                                return;
                            }
                        }
                        Err(e) => warn!(bucket = %bucket, error = %e, "unparseable streamed config"),
                    }
                    backoff.reset();
                    delay = Duration::ZERO;
                }
            }

            // Every server failed; start over without flooding the logs
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }
            delay = backoff.next_delay();
        }
    }
}

impl ConfigListener for StreamingConfigListener {
    fn start(&self) {
        let mut task = self.task.lock();
        if task.as_ref().is_some_and(|t| !t.is_finished()) || self.cancel.is_cancelled() {
            return;
        }
        info!(bucket = %self.bucket, "starting config stream listener");
        *task = Some(tokio::spawn(Self::run(
            self.bucket.clone(),
            self.source.clone(),
            self.publisher.clone(),
            self.cancel.clone(),
        )));
    }

    fn stop(&self) {
        self.cancel.cancel();
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
    }

    fn is_started(&self) -> bool {
        self.task.lock().as_ref().is_some_and(|t| !t.is_finished())
    }
}

/// Factory for `StreamingConfigListener`s sharing one stream source
pub struct StreamingListenerFactory {
    source: Arc<dyn ConfigStreamSource>,
    cancel: CancellationToken,
}

impl StreamingListenerFactory {
    pub fn new(source: Arc<dyn ConfigStreamSource>, cancel: CancellationToken) -> Self {
        StreamingListenerFactory { source, cancel }
    }
}

impl ConfigListenerFactory for StreamingListenerFactory {
    fn create(&self, bucket: &str, publisher: Arc<dyn ConfigPublisher>) -> Arc<dyn ConfigListener> {
        Arc::new(StreamingConfigListener::new(
            bucket,
            self.source.clone(),
            publisher,
            self.cancel.child_token(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct RecordingPublisher {
        published: Mutex<Vec<BucketConfig>>,
    }

    impl ConfigPublisher for RecordingPublisher {
        fn publish(&self, config: BucketConfig) -> Result<(), ConfigError> {
            self.published.lock().push(config);
            Ok(())
        }
    }

    struct FlakySource {
        opens: AtomicUsize,
    }

    impl ConfigStreamSource for FlakySource {
        fn servers(&self) -> Vec<HostEndpoint> {
            vec![HostEndpoint::new("10.0.0.9", 8091)]
        }

        fn open<'a>(
            &'a self,
            _server: &'a HostEndpoint,
            _bucket: &'a str,
        ) -> Pin<Box<dyn Future<Output = Result<ConfigLines, ConfigError>> + Send + 'a>> {
            Box::pin(async move {
                if self.opens.fetch_add(1, Ordering::SeqCst) == 0 {
                    return Err(ConfigError::Fetch("connection refused".into()));
                }
                let lines = vec![
                    Ok(String::new()),
                    Ok(r#"{"rev": 4, "name": "default", "nodesExt": [{"hostname": "$HOST"}]}"#
                        .to_string()),
                ];
                Ok(futures::stream::iter(lines).chain(futures::stream::pending()).boxed())
            })
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_streaming_listener_retries_and_publishes() {
        let publisher = Arc::new(RecordingPublisher {
            published: Mutex::new(Vec::new()),
        });
        let source = Arc::new(FlakySource {
            opens: AtomicUsize::new(0),
        });
        let listener = StreamingConfigListener::new(
            "default",
            source.clone(),
            publisher.clone(),
            CancellationToken::new(),
        );
        listener.start();
        assert!(listener.is_started());

        tokio::time::sleep(Duration::from_secs(1)).await;

        let published = publisher.published.lock().clone();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].rev, 4);
        assert_eq!(published[0].nodes_ext[0].hostname, "10.0.0.9");
        assert_eq!(source.opens.load(Ordering::SeqCst), 2);

        listener.stop();
        tokio::task::yield_now().await;
        assert!(!listener.is_started());
    }
}
