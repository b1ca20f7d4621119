//! Cluster map pipeline tests
//!
//! A `ClusterContext` is wired to an in-memory transport whose connections
//! answer every request with the host they belong to, and to a fetcher that
//! serves whatever map the test installs. Server pushes are injected through
//! the sink the context hands its connection factory.

use bytes::Bytes;
use kvlink::io::frame::{build_frame, read_opaque, HEADER_LEN, MAGIC_RESPONSE};
use kvlink::io::{
    Connection, ConnectionError, ConnectionFactory, NoopInitializer, ServerPush, ServerPushSink,
};
use kvlink::operation::Operation;
use kvlink::pool::ConnectionPool;
use kvlink::topology::{BucketConfig, ConfigError, ConfigVersion, HostEndpoint, NetworkResolution};
use kvlink::{ClusterContext, ClusterError, ClusterMapFetcher, ClusterOptions, ClusterServices};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

struct HostConnection {
    id: u64,
    host: String,
    dead: AtomicBool,
}

impl Connection for HostConnection {
    fn connection_id(&self) -> u64 {
        self.id
    }
    fn local_addr(&self) -> Option<std::net::SocketAddr> {
        None
    }
    fn remote_addr(&self) -> Option<std::net::SocketAddr> {
        None
    }
    fn is_dead(&self) -> bool {
        self.dead.load(Ordering::SeqCst)
    }
    fn is_authenticated(&self) -> bool {
        true
    }
    fn mark_authenticated(&self) {}
    fn idle_time(&self) -> Duration {
        Duration::ZERO
    }
    fn in_flight(&self) -> usize {
        0
    }
    fn send<'a>(
        &'a self,
        op: &'a Operation,
    ) -> Pin<Box<dyn Future<Output = Result<(), ConnectionError>> + Send + 'a>> {
        Box::pin(async move {
            let opaque = read_opaque(op.request()).unwrap_or_default();
            op.complete(build_frame(MAGIC_RESPONSE, 0, opaque, self.host.as_bytes()));
            Ok(())
        })
    }
    fn close(&self) {
        self.dead.store(true, Ordering::SeqCst);
    }
    fn close_graceful<'a>(&'a self, _timeout: Duration) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>> {
        Box::pin(async move { self.close() })
    }
}

#[derive(Default)]
struct HostFactory {
    next_id: AtomicU64,
}

impl ConnectionFactory for HostFactory {
    fn connect<'a>(
        &'a self,
        endpoint: &'a HostEndpoint,
    ) -> Pin<Box<dyn Future<Output = Result<Arc<dyn Connection>, ConnectionError>> + Send + 'a>> {
        Box::pin(async move {
            Ok(Arc::new(HostConnection {
                id: self.next_id.fetch_add(1, Ordering::SeqCst),
                host: endpoint.host.clone(),
                dead: AtomicBool::new(false),
            }) as Arc<dyn Connection>)
        })
    }
}

/// Serves the installed map per bucket and counts fetches
#[derive(Default)]
struct MapServer {
    maps: Mutex<HashMap<String, BucketConfig>>,
    fetches: AtomicUsize,
}

impl MapServer {
    fn install(&self, config: BucketConfig) {
        self.maps.lock().insert(config.name.clone(), config);
    }
}

impl ClusterMapFetcher for MapServer {
    fn fetch<'a>(
        &'a self,
        _pool: &'a dyn ConnectionPool,
        bucket: &'a str,
        _latest: Option<ConfigVersion>,
    ) -> Pin<Box<dyn Future<Output = Result<Option<BucketConfig>, ConfigError>> + Send + 'a>> {
        Box::pin(async move {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            // A fetch is a network round trip
            tokio::task::yield_now().await;
            Ok(self.maps.lock().get(bucket).cloned())
        })
    }
}

fn bucket_map(bucket: &str, rev: u64, hosts: &[&str]) -> BucketConfig {
    let nodes: Vec<String> = hosts
        .iter()
        .map(|h| format!(r#"{{"hostname": "{h}", "services": {{"kv": 11210}}}}"#))
        .collect();
    let servers: Vec<String> = hosts.iter().map(|h| format!(r#""{h}:11210""#)).collect();
    let vbuckets: Vec<String> = (0..8).map(|vb| format!("[{}]", vb % hosts.len())).collect();
    let json = format!(
        r#"{{
            "rev": {rev},
            "revEpoch": 1,
            "name": "{bucket}",
            "nodeLocator": "vbucket",
            "nodesExt": [{}],
            "vBucketServerMap": {{
                "hashAlgorithm": "CRC",
                "numReplicas": 0,
                "serverList": [{}],
                "vBucketMap": [{}]
            }}
        }}"#,
        nodes.join(","),
        servers.join(","),
        vbuckets.join(",")
    );
    BucketConfig::parse(&json, "10.0.0.1").unwrap()
}

/// Nodes with TLS ports and an external address `ext.<host>`
fn dual_network_map(bucket: &str, rev: u64, hosts: &[&str]) -> BucketConfig {
    let nodes: Vec<String> = hosts
        .iter()
        .map(|h| {
            format!(
                r#"{{"hostname": "{h}", "services": {{"kv": 11210, "kvSSL": 11207}},
                    "alternateAddresses": {{"external": {{"hostname": "ext.{h}", "ports": {{"kv": 31210}}}}}}}}"#
            )
        })
        .collect();
    let servers: Vec<String> = hosts.iter().map(|h| format!(r#""{h}:11210""#)).collect();
    let vbuckets: Vec<String> = (0..8).map(|vb| format!("[{}]", vb % hosts.len())).collect();
    let json = format!(
        r#"{{
            "rev": {rev},
            "revEpoch": 1,
            "name": "{bucket}",
            "nodesExt": [{}],
            "vBucketServerMap": {{
                "hashAlgorithm": "CRC",
                "numReplicas": 0,
                "serverList": [{}],
                "vBucketMap": [{}]
            }}
        }}"#,
        nodes.join(","),
        servers.join(","),
        vbuckets.join(",")
    );
    BucketConfig::parse(&json, "10.0.0.1").unwrap()
}

fn options() -> ClusterOptions {
    ClusterOptions {
        seeds: vec!["10.0.0.1:11210".to_string()],
        min_connections: 1,
        max_connections: 2,
        enable_scaling: false,
        enable_config_polling: false,
        ..ClusterOptions::default()
    }
}

struct Harness {
    context: ClusterContext,
    server: Arc<MapServer>,
    push_sink: Arc<dyn ServerPushSink>,
}

fn harness() -> Harness {
    harness_with(options())
}

fn harness_with(options: ClusterOptions) -> Harness {
    let server = Arc::new(MapServer::default());
    let captured: Arc<Mutex<Option<Arc<dyn ServerPushSink>>>> = Arc::new(Mutex::new(None));
    let context = ClusterContext::with_factory(
        options,
        ClusterServices::new(Arc::new(NoopInitializer), server.clone()),
        {
            let captured = captured.clone();
            move |sink| {
                *captured.lock() = Some(sink);
                Arc::new(HostFactory::default()) as Arc<dyn ConnectionFactory>
            }
        },
    );
    let push_sink = captured.lock().take().unwrap();
    Harness {
        context,
        server,
        push_sink,
    }
}

async fn wait_for_version(context: &ClusterContext, bucket: &str, version: ConfigVersion) {
    let router = context.bucket(bucket).unwrap();
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if router.config().map(|c| c.version()) == Some(version) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn test_open_bucket_bootstraps_and_routes() {
    let h = harness();
    h.server.install(bucket_map("travel", 3, &["10.0.0.1", "10.0.0.2"]));
    h.context.start().unwrap();

    let router = h.context.open_bucket("travel").await.unwrap();
    assert_eq!(router.config().unwrap().version(), ConfigVersion::new(1, 3));
    assert_eq!(
        router.endpoints(),
        vec![HostEndpoint::new("10.0.0.1", 11210), HostEndpoint::new("10.0.0.2", 11210)]
    );
    assert_eq!(h.context.config("travel").unwrap().rev, 3);

    let request = build_frame(0x80, 0x00, 0, b"");
    for key in ["a", "b", "c", "d", "e"] {
        let vb = router.vbucket(key.as_bytes()).unwrap();
        let expected = if vb % 2 == 0 { "10.0.0.1" } else { "10.0.0.2" };
        let response: Bytes = router.send(key.as_bytes(), request.clone(), true).await.unwrap();
        assert_eq!(&response[HEADER_LEN..], expected.as_bytes());
    }

    h.context.dispose().await;
}

#[tokio::test]
async fn test_server_push_reshapes_bucket() {
    let h = harness();
    h.server.install(bucket_map("travel", 3, &["10.0.0.1", "10.0.0.2"]));
    h.context.start().unwrap();
    let router = h.context.open_bucket("travel").await.unwrap();

    // Node 2 leaves, node 3 joins
    h.server.install(bucket_map("travel", 4, &["10.0.0.1", "10.0.0.3"]));
    h.push_sink.on_server_push(ServerPush {
        bucket: "travel".to_string(),
        version: ConfigVersion::new(1, 4),
    });
    wait_for_version(&h.context, "travel", ConfigVersion::new(1, 4)).await;

    assert_eq!(
        router.endpoints(),
        vec![HostEndpoint::new("10.0.0.1", 11210), HostEndpoint::new("10.0.0.3", 11210)]
    );
    assert_eq!(h.context.config("travel").unwrap().rev, 4);

    h.context.dispose().await;
}

#[tokio::test]
async fn test_stale_push_does_not_fetch() {
    let h = harness();
    h.server.install(bucket_map("travel", 7, &["10.0.0.1"]));
    h.context.start().unwrap();
    h.context.open_bucket("travel").await.unwrap();
    let fetches = h.server.fetches.load(Ordering::SeqCst);

    for rev in [5, 7] {
        h.push_sink.on_server_push(ServerPush {
            bucket: "travel".to_string(),
            version: ConfigVersion::new(1, rev),
        });
    }
    // Unknown bucket is dropped by the relay
    h.push_sink.on_server_push(ServerPush {
        bucket: "unknown".to_string(),
        version: ConfigVersion::new(9, 9),
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(h.server.fetches.load(Ordering::SeqCst), fetches);

    h.context.dispose().await;
}

#[tokio::test]
async fn test_cluster_level_push_reaches_every_bucket() {
    let h = harness();
    h.server.install(bucket_map("travel", 1, &["10.0.0.1"]));
    h.server.install(bucket_map("beer", 1, &["10.0.0.4"]));
    h.context.start().unwrap();
    let travel = h.context.open_bucket("travel").await.unwrap();
    let beer = h.context.open_bucket("beer").await.unwrap();

    h.server.install(bucket_map("travel", 2, &["10.0.0.1", "10.0.0.2"]));
    h.server.install(bucket_map("beer", 2, &["10.0.0.4", "10.0.0.3"]));
    h.push_sink.on_server_push(ServerPush {
        bucket: String::new(),
        version: ConfigVersion::new(1, 2),
    });

    wait_for_version(&h.context, "travel", ConfigVersion::new(1, 2)).await;
    wait_for_version(&h.context, "beer", ConfigVersion::new(1, 2)).await;
    assert_eq!(
        travel.endpoints(),
        vec![HostEndpoint::new("10.0.0.1", 11210), HostEndpoint::new("10.0.0.2", 11210)]
    );
    assert_eq!(
        beer.endpoints(),
        vec![HostEndpoint::new("10.0.0.3", 11210), HostEndpoint::new("10.0.0.4", 11210)]
    );

    h.context.dispose().await;
}

#[tokio::test]
async fn test_buckets_keep_their_own_maps() {
    let h = harness();
    h.server.install(bucket_map("travel", 5, &["10.0.0.1", "10.0.0.2"]));
    h.server.install(bucket_map("beer", 40, &["10.0.0.1", "10.0.0.3"]));
    h.context.start().unwrap();
    let travel = h.context.open_bucket("travel").await.unwrap();
    let beer = h.context.open_bucket("beer").await.unwrap();

    // beer's newer map reaches travel's subscriber too and must not apply there
    h.server.install(bucket_map("beer", 41, &["10.0.0.3"]));
    h.push_sink.on_server_push(ServerPush {
        bucket: "beer".to_string(),
        version: ConfigVersion::new(1, 41),
    });
    wait_for_version(&h.context, "beer", ConfigVersion::new(1, 41)).await;
    // Give travel's delivery task the same chance to see the map
    tokio::time::sleep(Duration::from_millis(20)).await;

    let travel_config = travel.config().unwrap();
    assert_eq!(travel_config.name, "travel");
    assert_eq!(travel_config.version(), ConfigVersion::new(1, 5));
    assert_eq!(
        travel.endpoints(),
        vec![HostEndpoint::new("10.0.0.1", 11210), HostEndpoint::new("10.0.0.2", 11210)]
    );
    assert_eq!(beer.endpoints(), vec![HostEndpoint::new("10.0.0.3", 11210)]);

    let request = build_frame(0x80, 0x00, 0, b"");
    for key in ["a", "b", "c", "d"] {
        let response = beer.send(key.as_bytes(), request.clone(), true).await.unwrap();
        assert_eq!(&response[HEADER_LEN..], b"10.0.0.3");
        let vb = travel.vbucket(key.as_bytes()).unwrap();
        let expected = if vb % 2 == 0 { "10.0.0.1" } else { "10.0.0.2" };
        let response = travel.send(key.as_bytes(), request.clone(), true).await.unwrap();
        assert_eq!(&response[HEADER_LEN..], expected.as_bytes());
    }

    h.context.dispose().await;
}

#[tokio::test]
async fn test_tls_bucket_routes_to_tls_ports() {
    let h = harness_with(ClusterOptions {
        tls: true,
        network: NetworkResolution::Default,
        ..options()
    });
    h.server.install(dual_network_map("travel", 3, &["10.0.0.1", "10.0.0.2"]));
    h.context.start().unwrap();
    let router = h.context.open_bucket("travel").await.unwrap();
    assert_eq!(
        router.endpoints(),
        vec![HostEndpoint::new("10.0.0.1", 11207), HostEndpoint::new("10.0.0.2", 11207)]
    );

    let request = build_frame(0x80, 0x00, 0, b"");
    for key in ["a", "b", "c", "d", "e"] {
        let vb = router.vbucket(key.as_bytes()).unwrap();
        let expected = if vb % 2 == 0 { "10.0.0.1" } else { "10.0.0.2" };
        let response = router.send(key.as_bytes(), request.clone(), true).await.unwrap();
        assert_eq!(&response[HEADER_LEN..], expected.as_bytes());
    }

    h.context.dispose().await;
}

#[tokio::test]
async fn test_external_network_routes_to_alternate_addresses() {
    let h = harness_with(ClusterOptions {
        network: NetworkResolution::External,
        ..options()
    });
    h.server.install(dual_network_map("travel", 3, &["10.0.0.1", "10.0.0.2"]));
    h.context.start().unwrap();
    let router = h.context.open_bucket("travel").await.unwrap();
    assert_eq!(
        router.endpoints(),
        vec![
            HostEndpoint::new("ext.10.0.0.1", 31210),
            HostEndpoint::new("ext.10.0.0.2", 31210)
        ]
    );

    let request = build_frame(0x80, 0x00, 0, b"");
    for key in ["a", "b", "c", "d", "e"] {
        let vb = router.vbucket(key.as_bytes()).unwrap();
        let expected = if vb % 2 == 0 { "ext.10.0.0.1" } else { "ext.10.0.0.2" };
        let response = router.send(key.as_bytes(), request.clone(), true).await.unwrap();
        assert_eq!(&response[HEADER_LEN..], expected.as_bytes());
    }

    h.context.dispose().await;
}

#[tokio::test]
async fn test_concurrent_open_of_one_bucket_admits_one() {
    let h = harness();
    h.server.install(bucket_map("travel", 1, &["10.0.0.1"]));
    h.context.start().unwrap();

    let (first, second) = tokio::join!(
        h.context.open_bucket("travel"),
        h.context.open_bucket("travel")
    );
    let (opened, refused) = match (first, second) {
        (Ok(router), Err(e)) | (Err(e), Ok(router)) => (router, e),
        (a, b) => panic!("expected one open to win: {:?} / {:?}", a.is_ok(), b.is_ok()),
    };
    assert!(matches!(refused, ClusterError::BucketOpen(name) if name == "travel"));
    assert!(Arc::ptr_eq(&opened, &h.context.bucket("travel").unwrap()));
    assert_eq!(h.context.config_handler().subscriber_count(), 1);

    h.context.dispose().await;
    assert!(opened.endpoints().is_empty());
}

#[tokio::test]
async fn test_open_bucket_twice_fails() {
    let h = harness();
    h.server.install(bucket_map("travel", 1, &["10.0.0.1"]));
    h.context.start().unwrap();
    h.context.open_bucket("travel").await.unwrap();

    let err = h.context.open_bucket("travel").await.unwrap_err();
    assert!(matches!(err, ClusterError::BucketOpen(name) if name == "travel"));

    h.context.dispose().await;
}

#[tokio::test]
async fn test_bootstrap_without_map_leaves_no_bucket() {
    let h = harness();
    h.context.start().unwrap();

    let err = h.context.open_bucket("missing").await.unwrap_err();
    assert!(matches!(err, ClusterError::Config(ConfigError::Fetch(_))));
    assert!(h.context.bucket("missing").is_none());

    h.context.dispose().await;
}

#[tokio::test]
async fn test_close_bucket_stops_delivery() {
    let h = harness();
    h.server.install(bucket_map("travel", 1, &["10.0.0.1"]));
    h.context.start().unwrap();
    let router = h.context.open_bucket("travel").await.unwrap();

    h.context.close_bucket("travel").await;
    assert!(h.context.bucket("travel").is_none());
    assert!(router.endpoints().is_empty());
    assert_eq!(h.context.config_handler().subscriber_count(), 0);

    // A bucket can be reopened after closing
    h.server.install(bucket_map("travel", 2, &["10.0.0.1"]));
    let reopened = h.context.open_bucket("travel").await.unwrap();
    assert_eq!(reopened.config().unwrap().rev, 2);

    h.context.dispose().await;
}

#[tokio::test]
async fn test_dispose_refuses_further_work() {
    let h = harness();
    h.server.install(bucket_map("travel", 1, &["10.0.0.1"]));
    h.context.start().unwrap();
    let router = h.context.open_bucket("travel").await.unwrap();

    h.context.dispose().await;
    h.context.dispose().await;

    assert!(matches!(h.context.open_bucket("travel").await, Err(ClusterError::Disposed)));
    assert!(matches!(h.context.start(), Err(ClusterError::Disposed)));
    assert!(matches!(
        h.context.config("travel"),
        Err(ClusterError::Config(ConfigError::ContextStopped))
    ));
    assert!(router.endpoints().is_empty());
}
