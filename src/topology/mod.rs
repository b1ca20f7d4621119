//! Cluster topology propagation
//!
//! Nodes announce new cluster maps out of band. Each bucket owns a
//! `ConfigPushHandler` that coalesces those announcements and fetches the map;
//! every fetched or polled map is published into the process-wide
//! `ConfigHandler`, which keeps the newest map per bucket and fans accepted
//! maps out to subscribers.
//!
//! ```text
//!  node push ──► ConfigPushHandler ──fetch──► ClusterNode::get_cluster_map
//!                        │
//!                        ▼ publish
//!  polling ─────► ConfigHandler (single consumer) ──► store (newest per bucket)
//!                        │
//!                        ▼ accepted, strictly newer
//!                 ConfigSubscriber::on_config_updated (one task per subscriber)
//! ```

pub mod bucket_config;
pub mod handler;
pub mod node;
pub mod push_handler;
pub mod version;

pub use bucket_config::{BucketConfig, HostEndpoint, NetworkResolution, NodeInfo, VBucketMap};
pub use handler::{ConfigHandler, ConfigPublisher, ConfigSubscriber};
pub use node::{ClusterNode, ConfigListener, ConfigListenerFactory, StreamingConfigListener};
pub use push_handler::ConfigPushHandler;
pub use version::{ConfigVersion, VersionCell};

/// Errors from the configuration pipeline
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// The config handler has been disposed
    ContextStopped,
    /// No map has been accepted for the bucket yet
    BucketMissing(String),
    /// No live node runs the KV service
    NoNodes,
    /// A node failed to serve its cluster map
    Fetch(String),
    /// A cluster map could not be parsed
    Parse(String),
    /// A subscriber failed to apply a map
    Subscriber { name: String, reason: String },
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::ContextStopped => write!(f, "Cluster context has been stopped"),
            ConfigError::BucketMissing(name) => write!(f, "No config for bucket '{}'", name),
            ConfigError::NoNodes => write!(f, "No live KV node available"),
            ConfigError::Fetch(msg) => write!(f, "Cluster map fetch failed: {}", msg),
            ConfigError::Parse(msg) => write!(f, "Cluster map parse failed: {}", msg),
            ConfigError::Subscriber { name, reason } => {
                write!(f, "Subscriber '{}' failed to apply config: {}", name, reason)
            }
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<serde_json::Error> for ConfigError {
    fn from(e: serde_json::Error) -> Self {
        ConfigError::Parse(e.to_string())
    }
}
