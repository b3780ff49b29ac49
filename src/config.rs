//! Configuration management for Quotaguard.

use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{QuotaError, Result};

/// Prefix of environment variables that override file configuration.
pub const ENV_PREFIX: &str = "QUOTAGUARD";

/// Main configuration for the Quotaguard service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QuotaguardConfig {
    /// Counter store configuration
    #[serde(default)]
    pub store: StoreConfig,

    /// Per-user quota limits
    #[serde(default)]
    pub quota: QuotaConfig,

    /// In-process fallback counter configuration
    #[serde(default)]
    pub fallback: FallbackConfig,

    /// Session store configuration
    #[serde(default)]
    pub session: SessionConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// How a multi-window charge is applied against the counter store.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AtomicityMode {
    /// Server-side script: check and increment of all windows in one atomic step.
    #[default]
    Script,
    /// Pipelined read, then a MULTI/EXEC increment batch with a compensating
    /// check. For stores that do not allow scripting.
    Pipeline,
}

/// Counter store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Connection string; when absent only the fallback counter is used
    #[serde(default)]
    pub url: Option<String>,

    /// Always connect with TLS
    #[serde(default)]
    pub require_tls: bool,

    /// Hosts of managed TLS-only services; matching URLs are upgraded to TLS
    #[serde(default = "default_tls_host_suffixes")]
    pub tls_host_suffixes: Vec<String>,

    /// Per-request bound on a store call in milliseconds; exceeding it
    /// answers the request from the fallback counter
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    /// Bound on establishing a connection in milliseconds. The handshake runs
    /// in the background, so a request that gives up earlier does not cancel it
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    /// Minimum delay between store probes while degraded, in milliseconds
    #[serde(default = "default_retry_interval_ms")]
    pub retry_interval_ms: u64,

    /// How the three window increments are applied
    #[serde(default)]
    pub atomicity: AtomicityMode,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            url: None,
            require_tls: false,
            tls_host_suffixes: default_tls_host_suffixes(),
            timeout_ms: default_timeout_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
            retry_interval_ms: default_retry_interval_ms(),
            atomicity: AtomicityMode::default(),
        }
    }
}

fn default_tls_host_suffixes() -> Vec<String> {
    vec![".upstash.io".to_string()]
}

fn default_timeout_ms() -> u64 {
    250
}

fn default_connect_timeout_ms() -> u64 {
    3000
}

fn default_retry_interval_ms() -> u64 {
    1000
}

/// Per-user quota configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuotaConfig {
    /// When false every request is admitted and no counters are touched
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    #[serde(default)]
    pub minute: WindowConfig,

    #[serde(default)]
    pub hour: WindowConfig,

    #[serde(default)]
    pub day: WindowConfig,
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            minute: WindowConfig::default(),
            hour: WindowConfig::default(),
            day: WindowConfig::default(),
        }
    }
}

fn default_enabled() -> bool {
    true
}

/// Limit and counter lifetime of one window. Unset values take the
/// window's default.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WindowConfig {
    #[serde(default)]
    pub limit: Option<u64>,

    #[serde(default)]
    pub ttl_secs: Option<u64>,
}

/// Fallback counter configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FallbackConfig {
    /// Interval of the background sweep of expired entries; 0 disables it
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
}

impl Default for FallbackConfig {
    fn default() -> Self {
        Self {
            sweep_interval_secs: default_sweep_interval(),
        }
    }
}

fn default_sweep_interval() -> u64 {
    300
}

/// Session store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Session lifetime in seconds
    #[serde(default = "default_session_ttl")]
    pub ttl_secs: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            ttl_secs: default_session_ttl(),
        }
    }
}

fn default_session_ttl() -> u64 {
    86400
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter directive when RUST_LOG is not set
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Emit JSON lines instead of human-readable output
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl QuotaguardConfig {
    /// Load configuration from an optional YAML file, then apply
    /// `QUOTAGUARD__SECTION__KEY` environment overrides.
    ///
    /// `REDIS_URL` is used as the store URL when none is configured.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            info!(path = %path.display(), "Loading configuration file");
            builder = builder.add_source(config::File::from(path).format(config::FileFormat::Yaml));
        }
        builder = builder.add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("__")
                .separator("__")
                .list_separator(",")
                .with_list_parse_key("store.tls_host_suffixes")
                .try_parsing(true),
        );

        let mut config: QuotaguardConfig = builder
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| QuotaError::Config(e.to_string()))?;

        if config.store.url.is_none() {
            config.store.url = std::env::var("REDIS_URL").ok().filter(|u| !u.is_empty());
        }

        Ok(config)
    }

    /// Load configuration from a YAML file without environment overrides.
    pub fn from_file(path: &str) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Parse configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml).map_err(|e| QuotaError::Config(e.to_string()))
    }
}
