//! Cluster client options
//!
//! Options are read from a TOML file, then individual values may be
//! overridden from the environment:
//!
//! - `KVLINK_SEEDS`: comma separated `host:port` bootstrap list
//! - `KVLINK_NETWORK`: `auto`, `default` or `external`
//! - `KVLINK_TLS`: use the TLS KV port (default: false)
//! - `KVLINK_TLS_CA`, `KVLINK_TLS_CERT`, `KVLINK_TLS_KEY`: PEM files for TLS
//! - `KVLINK_MIN_CONNECTIONS`, `KVLINK_MAX_CONNECTIONS`: pool size per node
//! - `KVLINK_SINGLE_CONNECTION`: one unscaled connection per node
//! - `KVLINK_IDLE_TIMEOUT_MS`, `KVLINK_BACKPRESSURE_THRESHOLD`,
//!   `KVLINK_SCALE_POLL_INTERVAL_MS`: scale controller policy
//! - `KVLINK_MAX_OPERATIONS`, `KVLINK_OPERATION_TIMEOUT_MS`,
//!   `KVLINK_CLEANUP_INTERVAL_MS`: per-connection in-flight limits
//! - `KVLINK_CONNECT_TIMEOUT_MS`
//! - `KVLINK_CONFIG_POLLING`, `KVLINK_CONFIG_POLL_INTERVAL_MS`
//! - `KVLINK_RETRY_MAX_ATTEMPTS`
//!
//! Durations are written in milliseconds.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use crate::bucket::BucketSettings;
use crate::io::InFlightConfig;
use crate::pool::{PoolSettings, ScaleControllerConfig};
use crate::topology::{HostEndpoint, NetworkResolution};

/// Errors loading or validating options
#[derive(Debug)]
pub enum OptionsError {
    /// Failed to read the options file
    Read {
        path: String,
        source: std::io::Error,
    },
    /// The file is not valid TOML for these options
    Parse(String),
    /// An environment override could not be parsed
    Env { var: String, value: String },
    /// A value is out of range
    Invalid(String),
}

impl std::fmt::Display for OptionsError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OptionsError::Read { path, source } => write!(f, "Failed to read {}: {}", path, source),
            OptionsError::Parse(reason) => write!(f, "Invalid options: {}", reason),
            OptionsError::Env { var, value } => write!(f, "Invalid value '{}' for {}", value, var),
            OptionsError::Invalid(reason) => write!(f, "Invalid options: {}", reason),
        }
    }
}

impl std::error::Error for OptionsError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            OptionsError::Read { source, .. } => Some(source),
            _ => None,
        }
    }
}

impl From<toml::de::Error> for OptionsError {
    fn from(e: toml::de::Error) -> Self {
        OptionsError::Parse(e.to_string())
    }
}

/// Everything a `ClusterContext` needs to know up front
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterOptions {
    /// Bootstrap nodes, `host:port`
    pub seeds: Vec<String>,
    pub network: NetworkResolution,
    pub tls: bool,
    /// CA bundle the nodes' certificates must chain to
    pub tls_ca_path: Option<PathBuf>,
    /// Client certificate and key for mutual TLS
    pub tls_cert_path: Option<PathBuf>,
    pub tls_key_path: Option<PathBuf>,
    /// Minimum connections per node (default: 2)
    pub min_connections: usize,
    /// Maximum connections per node (default: 5)
    pub max_connections: usize,
    /// Legacy mode: one unscaled connection per node
    pub single_connection: bool,
    pub enable_scaling: bool,
    /// Idle time after which a connection may be retired (default: 60s)
    #[serde(with = "duration_millis")]
    pub idle_timeout: Duration,
    /// Pending sends that trigger growth (default: 8)
    pub backpressure_threshold: usize,
    #[serde(with = "duration_millis")]
    pub scale_poll_interval: Duration,
    /// How long a retired connection may drain (default: 10s)
    #[serde(with = "duration_millis")]
    pub drain_timeout: Duration,
    /// Concurrent operations per connection (default: 32)
    pub max_operations: usize,
    /// Lifetime of an unanswered operation (default: 75s)
    #[serde(with = "duration_millis")]
    pub operation_timeout: Duration,
    #[serde(with = "duration_millis")]
    pub cleanup_interval: Duration,
    #[serde(with = "duration_millis")]
    pub connect_timeout: Duration,
    pub enable_config_polling: bool,
    /// Default: 2.5s
    #[serde(with = "duration_millis")]
    pub config_poll_interval: Duration,
    /// Buckets also served by a streaming config listener
    pub streaming_configs: bool,
    pub retry_max_attempts: u32,
}

impl Default for ClusterOptions {
    fn default() -> Self {
        let in_flight = InFlightConfig::default();
        let scaling = ScaleControllerConfig::default();
        let pool = PoolSettings::default();
        ClusterOptions {
            seeds: vec!["127.0.0.1:11210".to_string()],
            network: NetworkResolution::Auto,
            tls: false,
            tls_ca_path: None,
            tls_cert_path: None,
            tls_key_path: None,
            min_connections: pool.min_size,
            max_connections: pool.max_size,
            single_connection: false,
            enable_scaling: true,
            idle_timeout: scaling.idle_timeout,
            backpressure_threshold: scaling.backpressure_threshold,
            scale_poll_interval: scaling.poll_interval,
            drain_timeout: pool.drain_timeout,
            max_operations: in_flight.max_operations,
            operation_timeout: in_flight.timeout,
            cleanup_interval: in_flight.cleanup_interval,
            connect_timeout: crate::io::factory::DEFAULT_CONNECT_TIMEOUT,
            enable_config_polling: true,
            config_poll_interval: crate::topology::handler::DEFAULT_CONFIG_POLL_INTERVAL,
            streaming_configs: false,
            retry_max_attempts: 10,
        }
    }
}

impl ClusterOptions {
    /// Parse options from TOML; absent keys keep their defaults
    pub fn from_toml_str(s: &str) -> Result<Self, OptionsError> {
        let options: ClusterOptions = toml::from_str(s)?;
        options.validate()?;
        Ok(options)
    }

    /// Load a TOML file, apply environment overrides and validate
    pub fn load(path: impl AsRef<Path>) -> Result<Self, OptionsError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| OptionsError::Read {
            path: path.display().to_string(),
            source: e,
        })?;
        let mut options: ClusterOptions = toml::from_str(&text)?;
        options.apply_overrides(|var| std::env::var(var).ok())?;
        options.validate()?;
        Ok(options)
    }

    /// Defaults plus environment overrides
    pub fn from_env() -> Result<Self, OptionsError> {
        let mut options = ClusterOptions::default();
        options.apply_overrides(|var| std::env::var(var).ok())?;
        options.validate()?;
        Ok(options)
    }

    /// Override fields from `lookup`, which maps a variable name to its value
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), OptionsError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(seeds) = lookup("KVLINK_SEEDS") {
            self.seeds = seeds
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect();
        }
        override_parsed(&lookup, "KVLINK_NETWORK", &mut self.network)?;
        override_flag(&lookup, "KVLINK_TLS", &mut self.tls);
        override_path(&lookup, "KVLINK_TLS_CA", &mut self.tls_ca_path);
        override_path(&lookup, "KVLINK_TLS_CERT", &mut self.tls_cert_path);
        override_path(&lookup, "KVLINK_TLS_KEY", &mut self.tls_key_path);
        override_parsed(&lookup, "KVLINK_MIN_CONNECTIONS", &mut self.min_connections)?;
        override_parsed(&lookup, "KVLINK_MAX_CONNECTIONS", &mut self.max_connections)?;
        override_flag(&lookup, "KVLINK_SINGLE_CONNECTION", &mut self.single_connection);
        override_millis(&lookup, "KVLINK_IDLE_TIMEOUT_MS", &mut self.idle_timeout)?;
        override_parsed(&lookup, "KVLINK_BACKPRESSURE_THRESHOLD", &mut self.backpressure_threshold)?;
        override_millis(&lookup, "KVLINK_SCALE_POLL_INTERVAL_MS", &mut self.scale_poll_interval)?;
        override_parsed(&lookup, "KVLINK_MAX_OPERATIONS", &mut self.max_operations)?;
        override_millis(&lookup, "KVLINK_OPERATION_TIMEOUT_MS", &mut self.operation_timeout)?;
        override_millis(&lookup, "KVLINK_CLEANUP_INTERVAL_MS", &mut self.cleanup_interval)?;
        override_millis(&lookup, "KVLINK_CONNECT_TIMEOUT_MS", &mut self.connect_timeout)?;
        override_flag(&lookup, "KVLINK_CONFIG_POLLING", &mut self.enable_config_polling);
        override_millis(&lookup, "KVLINK_CONFIG_POLL_INTERVAL_MS", &mut self.config_poll_interval)?;
        override_parsed(&lookup, "KVLINK_RETRY_MAX_ATTEMPTS", &mut self.retry_max_attempts)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<(), OptionsError> {
        if self.seeds.is_empty() {
            return Err(OptionsError::Invalid("at least one seed is required".to_string()));
        }
        if let Some(bad) = self.seeds.iter().find(|s| HostEndpoint::parse(s).is_none()) {
            return Err(OptionsError::Invalid(format!("seed '{}' is not host:port", bad)));
        }
        if self.min_connections == 0 || self.max_connections == 0 {
            return Err(OptionsError::Invalid("pool sizes must be at least 1".to_string()));
        }
        if self.min_connections > self.max_connections {
            return Err(OptionsError::Invalid(format!(
                "min_connections {} exceeds max_connections {}",
                self.min_connections, self.max_connections
            )));
        }
        if self.tls_cert_path.is_some() != self.tls_key_path.is_some() {
            return Err(OptionsError::Invalid(
                "tls_cert_path and tls_key_path must be set together".to_string(),
            ));
        }
        if self.max_operations == 0 {
            return Err(OptionsError::Invalid("max_operations must be at least 1".to_string()));
        }
        let durations = [
            ("idle_timeout", self.idle_timeout),
            ("scale_poll_interval", self.scale_poll_interval),
            ("operation_timeout", self.operation_timeout),
            ("cleanup_interval", self.cleanup_interval),
            ("connect_timeout", self.connect_timeout),
            ("config_poll_interval", self.config_poll_interval),
        ];
        if let Some((name, _)) = durations.iter().find(|(_, d)| d.is_zero()) {
            return Err(OptionsError::Invalid(format!("{} must be non-zero", name)));
        }
        Ok(())
    }

    /// Parsed seed endpoints; invalid entries are skipped
    pub fn seed_endpoints(&self) -> Vec<HostEndpoint> {
        self.seeds.iter().filter_map(|s| HostEndpoint::parse(s)).collect()
    }

    /// TLS settings, if TLS is enabled
    #[cfg(feature = "tls")]
    pub fn tls_client_config(&self) -> Option<crate::io::tls::TlsClientConfig> {
        if !self.tls {
            return None;
        }
        let mut config = match &self.tls_ca_path {
            Some(ca) => crate::io::tls::TlsClientConfig::new(ca),
            None => crate::io::tls::TlsClientConfig::default(),
        };
        if let (Some(cert), Some(key)) = (&self.tls_cert_path, &self.tls_key_path) {
            config = config.with_client_cert(cert, key);
        }
        Some(config)
    }

    pub fn in_flight_config(&self) -> InFlightConfig {
        InFlightConfig {
            max_operations: self.max_operations,
            timeout: self.operation_timeout,
            cleanup_interval: self.cleanup_interval,
        }
    }

    pub fn pool_settings(&self) -> PoolSettings {
        PoolSettings {
            min_size: self.min_connections,
            max_size: self.max_connections,
            drain_timeout: self.drain_timeout,
        }
    }

    pub fn scale_config(&self) -> ScaleControllerConfig {
        ScaleControllerConfig {
            idle_timeout: self.idle_timeout,
            backpressure_threshold: self.backpressure_threshold,
            poll_interval: self.scale_poll_interval,
        }
    }

    pub fn bucket_settings(&self) -> BucketSettings {
        BucketSettings {
            network: self.network,
            tls: self.tls,
            bootstrap_host: self
                .seed_endpoints()
                .first()
                .map(|e| e.host.clone())
                .unwrap_or_default(),
            pool: self.pool_settings(),
            single_connection: self.single_connection,
            scaling: self.enable_scaling.then(|| self.scale_config()),
            streaming_configs: self.streaming_configs,
        }
    }
}

fn override_parsed<F, T>(lookup: &F, var: &str, target: &mut T) -> Result<(), OptionsError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    if let Some(value) = lookup(var) {
        *target = value.trim().parse().map_err(|_| OptionsError::Env {
            var: var.to_string(),
            value,
        })?;
    }
    Ok(())
}

fn override_millis<F>(lookup: &F, var: &str, target: &mut Duration) -> Result<(), OptionsError>
where
    F: Fn(&str) -> Option<String>,
{
    let mut millis = target.as_millis() as u64;
    override_parsed(lookup, var, &mut millis)?;
    *target = Duration::from_millis(millis);
    Ok(())
}

fn override_path<F>(lookup: &F, var: &str, target: &mut Option<PathBuf>)
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(value) = lookup(var).filter(|v| !v.trim().is_empty()) {
        *target = Some(PathBuf::from(value.trim()));
    }
}

fn override_flag<F>(lookup: &F, var: &str, target: &mut bool)
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(value) = lookup(var) {
        *target = value == "true" || value == "1";
    }
}

/// Serde helper for Duration as milliseconds
mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        (duration.as_millis() as u64).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
