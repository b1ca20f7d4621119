//! Immutable cluster map snapshots
//!
//! Nodes serve their map as "terse" JSON. A snapshot is parsed once, has its
//! `$HOST` placeholders resolved against the address it was fetched from, and
//! is then shared as `Arc<BucketConfig>`. A topology change always produces a
//! new snapshot; nothing mutates a published one.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::version::ConfigVersion;

/// Placeholder a single-node cluster uses instead of its own hostname
pub const HOST_PLACEHOLDER: &str = "$HOST";

pub const SERVICE_KV: &str = "kv";
pub const SERVICE_KV_TLS: &str = "kvSSL";

/// Which address set of a node the client dials
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkResolution {
    /// Pick `External` if the bootstrap host is one of the external names
    #[default]
    Auto,
    /// The addresses nodes use to talk to each other
    Default,
    /// The `alternateAddresses.external` set
    External,
}

impl std::str::FromStr for NetworkResolution {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "auto" => Ok(NetworkResolution::Auto),
            "default" | "internal" => Ok(NetworkResolution::Default),
            "external" => Ok(NetworkResolution::External),
            other => Err(format!("unknown network resolution '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlternateAddress {
    pub hostname: String,
    #[serde(default)]
    pub ports: BTreeMap<String, u16>,
}

/// One node of the cluster and the ports of the services it runs
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeInfo {
    #[serde(default)]
    pub hostname: String,
    #[serde(default)]
    pub services: BTreeMap<String, u16>,
    #[serde(default)]
    pub this_node: bool,
    #[serde(default)]
    pub alternate_addresses: BTreeMap<String, AlternateAddress>,
}

impl NodeInfo {
    pub fn has_kv(&self) -> bool {
        self.services.get(SERVICE_KV).is_some_and(|p| *p > 0)
    }

    /// Host and KV port for the given resolution
    ///
    /// `resolution` must already be resolved; `Auto` is treated as `Default`.
    pub fn kv_endpoint(&self, resolution: NetworkResolution, tls: bool) -> Option<HostEndpoint> {
        let service = if tls { SERVICE_KV_TLS } else { SERVICE_KV };
        if resolution == NetworkResolution::External {
            let external = self.alternate_addresses.get("external")?;
            // Alternate ports default to the internal ones
            let port = external
                .ports
                .get(service)
                .or_else(|| self.services.get(service))?;
            return Some(HostEndpoint::new(&external.hostname, *port));
        }
        let port = self.services.get(service)?;
        Some(HostEndpoint::new(&self.hostname, *port))
    }
}

/// `host:port` pair as written in cluster maps
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HostEndpoint {
    pub host: String,
    pub port: u16,
}

impl HostEndpoint {
    pub fn new(host: &str, port: u16) -> Self {
        HostEndpoint {
            host: host.to_string(),
            port,
        }
    }

    /// Parse `host:port`, accepting bracketed IPv6 hosts
    pub fn parse(s: &str) -> Option<Self> {
        let (host, port) = s.rsplit_once(':')?;
        let host = host.trim_start_matches('[').trim_end_matches(']');
        if host.is_empty() {
            return None;
        }
        Some(HostEndpoint::new(host, port.parse().ok()?))
    }
}

impl std::fmt::Display for HostEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// vbucket → node routing table
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VBucketMap {
    #[serde(default)]
    pub hash_algorithm: String,
    #[serde(default)]
    pub num_replicas: u32,
    #[serde(default)]
    pub server_list: Vec<String>,
    /// Per vbucket: active server index followed by replica indexes, -1 if none
    #[serde(default, rename = "vBucketMap")]
    pub vbucket_map: Vec<Vec<i16>>,
}

impl VBucketMap {
    pub fn num_vbuckets(&self) -> usize {
        self.vbucket_map.len()
    }

    /// Server hosting the active copy of `vbucket`
    pub fn active_server(&self, vbucket: usize) -> Option<&str> {
        let index = *self.vbucket_map.get(vbucket)?.first()?;
        if index < 0 {
            return None;
        }
        self.server_list.get(index as usize).map(String::as_str)
    }
}

/// A cluster map as served by a node
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BucketConfig {
    #[serde(default)]
    pub rev: u64,
    #[serde(default)]
    pub rev_epoch: u64,
    /// Empty for a cluster-level (global) map
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub node_locator: String,
    #[serde(default)]
    pub nodes_ext: Vec<NodeInfo>,
    #[serde(default, rename = "vBucketServerMap")]
    pub vbucket_server_map: Option<VBucketMap>,
    #[serde(default)]
    pub bucket_capabilities: Vec<String>,
    #[serde(default)]
    pub cluster_capabilities: BTreeMap<String, Vec<String>>,
}

impl BucketConfig {
    /// Parse a terse map and resolve `$HOST` against the node it came from
    pub fn parse(json: &str, origin_host: &str) -> Result<BucketConfig, serde_json::Error> {
        let mut config: BucketConfig = serde_json::from_str(json)?;
        config.replace_host_placeholder(origin_host);
        Ok(config)
    }

    #[inline]
    pub fn version(&self) -> ConfigVersion {
        ConfigVersion::new(self.rev_epoch, self.rev)
    }

    pub fn is_newer_than(&self, other: &BucketConfig) -> bool {
        self.version() > other.version()
    }

    pub fn has_capability(&self, capability: &str) -> bool {
        self.bucket_capabilities.iter().any(|c| c == capability)
    }

    /// Substitute `host` for missing hostnames and `$HOST` placeholders
    pub fn replace_host_placeholder(&mut self, host: &str) {
        for node in &mut self.nodes_ext {
            if node.hostname.is_empty() {
                node.hostname = host.to_string();
            } else if node.hostname.contains(HOST_PLACEHOLDER) {
                node.hostname = node.hostname.replace(HOST_PLACEHOLDER, host);
            }
        }
        if let Some(map) = &mut self.vbucket_server_map {
            for server in &mut map.server_list {
                if server.contains(HOST_PLACEHOLDER) {
                    *server = server.replace(HOST_PLACEHOLDER, host);
                }
            }
        }
    }

    /// Resolve `Auto` against the host the client bootstrapped from
    pub fn effective_resolution(
        &self,
        requested: NetworkResolution,
        bootstrap_host: &str,
    ) -> NetworkResolution {
        if requested != NetworkResolution::Auto {
            return requested;
        }
        let external = self.nodes_ext.iter().any(|node| {
            node.alternate_addresses
                .get("external")
                .is_some_and(|alt| alt.hostname == bootstrap_host)
        });
        if external {
            NetworkResolution::External
        } else {
            NetworkResolution::Default
        }
    }

    /// KV endpoints of every node that runs the KV service
    pub fn kv_endpoints(&self, resolution: NetworkResolution, tls: bool) -> Vec<HostEndpoint> {
        self.nodes_ext
            .iter()
            .filter(|node| node.has_kv())
            .filter_map(|node| node.kv_endpoint(resolution, tls))
            .collect()
    }

    pub fn num_vbuckets(&self) -> usize {
        self.vbucket_server_map
            .as_ref()
            .map_or(0, VBucketMap::num_vbuckets)
    }

    /// Endpoint hosting the active copy of `vbucket`
    pub fn active_endpoint(&self, vbucket: usize) -> Option<HostEndpoint> {
        let server = self.vbucket_server_map.as_ref()?.active_server(vbucket)?;
        HostEndpoint::parse(server)
    }

    /// Dialable KV endpoint hosting the active copy of `vbucket`
    ///
    /// The server list names nodes by internal host and plain KV port. The
    /// entry is matched to its node so the result follows `resolution` and
    /// `tls`, the same way `kv_endpoints` does.
    pub fn active_kv_endpoint(
        &self,
        vbucket: usize,
        resolution: NetworkResolution,
        tls: bool,
    ) -> Option<HostEndpoint> {
        let server = self.active_endpoint(vbucket)?;
        let node = self.nodes_ext.iter().find(|node| {
            node.hostname == server.host && node.services.get(SERVICE_KV) == Some(&server.port)
        });
        match node {
            Some(node) => node.kv_endpoint(resolution, tls),
            // Maps without nodesExt only carry the internal plain address
            None if !tls && resolution != NetworkResolution::External => Some(server),
            None => None,
        }
    }

    pub fn has_vbucket_map_changed(&self, other: Option<&BucketConfig>) -> bool {
        other.map_or(true, |o| self.vbucket_server_map != o.vbucket_server_map)
    }

    pub fn has_nodes_changed(&self, other: Option<&BucketConfig>) -> bool {
        other.map_or(true, |o| self.nodes_ext != o.nodes_ext)
    }
}
