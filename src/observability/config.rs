//! Logging configuration
//!
//! Loaded from environment variables:
//! - `KVLINK_LOG_FORMAT`: `pretty` (default), `compact` or `json`
//! - `RUST_LOG`: filter directives; falls back to `KVLINK_LOG_LEVEL`, then `info`
//! - `KVLINK_LOG_TARGETS`: include module targets in each line (default: true)

/// Output format of the fmt layer
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    #[default]
    Pretty,
    Compact,
    /// One JSON object per event, for log shippers
    Json,
}

impl std::str::FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pretty" | "full" => Ok(LogFormat::Pretty),
            "compact" => Ok(LogFormat::Compact),
            "json" => Ok(LogFormat::Json),
            other => Err(format!("unknown log format '{}'", other)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub format: LogFormat,
    /// Used when `RUST_LOG` is not set
    pub default_directives: String,
    pub with_target: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            format: LogFormat::Pretty,
            default_directives: "info".to_string(),
            with_target: true,
        }
    }
}

impl LoggingConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Self {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = LoggingConfig::default();
        LoggingConfig {
            format: lookup("KVLINK_LOG_FORMAT")
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.format),
            default_directives: lookup("KVLINK_LOG_LEVEL").unwrap_or(defaults.default_directives),
            with_target: lookup("KVLINK_LOG_TARGETS")
                .map(|v| v == "true" || v == "1")
                .unwrap_or(defaults.with_target),
        }
    }
}
