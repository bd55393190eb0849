//! Configuration management for Turnstile.
//!
//! Values are layered: built-in defaults, then an optional YAML file, then
//! `TURNSTILE_`-prefixed environment variables using `__` between section and
//! field (`TURNSTILE_RATE_LIMITING__BURST=50`).

use serde::{Deserialize, Serialize};
use std::net::{Ipv4Addr, SocketAddr};
use std::path::Path;
use std::time::Duration;

use crate::error::{Result, TurnstileError};
use crate::ratelimit::{
    RateLimiterOptions, DEFAULT_BURST, DEFAULT_CLEANUP_INTERVAL, DEFAULT_INACTIVE_TTL,
    DEFAULT_REQUESTS_PER_SECOND,
};

/// Prefix for environment variable overrides.
pub const ENV_PREFIX: &str = "TURNSTILE";

/// Main configuration for the Turnstile service.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TurnstileConfig {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Rate limiting configuration
    #[serde(default)]
    pub rate_limiting: RateLimitingConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    /// HTTP listen address
    #[serde(default = "default_http_addr")]
    pub http_addr: SocketAddr,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_addr: default_http_addr(),
        }
    }
}

fn default_http_addr() -> SocketAddr {
    SocketAddr::from((Ipv4Addr::UNSPECIFIED, 8080))
}

/// Rate limiting configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateLimitingConfig {
    /// Sustained requests per second allowed per client
    #[serde(default = "default_requests_per_second")]
    pub requests_per_second: f64,

    /// Requests a client may make in a burst
    #[serde(default = "default_burst")]
    pub burst: u32,

    /// Seconds between idle bucket sweeps
    #[serde(default = "default_cleanup_interval")]
    pub cleanup_interval_secs: u64,

    /// Seconds a client may stay idle before its bucket is dropped
    #[serde(default = "default_inactive_ttl")]
    pub inactive_ttl_secs: u64,

    /// Number of registry partitions
    #[serde(default = "default_shards")]
    pub shards: usize,
}

impl Default for RateLimitingConfig {
    fn default() -> Self {
        Self {
            requests_per_second: default_requests_per_second(),
            burst: default_burst(),
            cleanup_interval_secs: default_cleanup_interval(),
            inactive_ttl_secs: default_inactive_ttl(),
            shards: default_shards(),
        }
    }
}

fn default_requests_per_second() -> f64 {
    DEFAULT_REQUESTS_PER_SECOND
}

fn default_burst() -> u32 {
    DEFAULT_BURST
}

fn default_cleanup_interval() -> u64 {
    DEFAULT_CLEANUP_INTERVAL.as_secs()
}

fn default_inactive_ttl() -> u64 {
    DEFAULT_INACTIVE_TTL.as_secs()
}

fn default_shards() -> usize {
    1
}

impl From<&RateLimitingConfig> for RateLimiterOptions {
    fn from(config: &RateLimitingConfig) -> Self {
        Self {
            requests_per_second: config.requests_per_second,
            burst: config.burst,
            cleanup_interval: Duration::from_secs(config.cleanup_interval_secs),
            inactive_ttl: Duration::from_secs(config.inactive_ttl_secs),
            shards: config.shards,
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter directive when `RUST_LOG` is unset
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

impl TurnstileConfig {
    /// Load configuration from an optional file plus environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = ::config::Config::builder();

        if let Some(path) = path {
            builder = builder.add_source(
                ::config::File::from(path).format(::config::FileFormat::Yaml),
            );
        }

        let settings = builder
            .add_source(
                ::config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        Ok(settings.try_deserialize()?)
    }

    /// Load configuration from a YAML file path, ignoring the environment.
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Parse configuration from YAML text.
    pub fn from_yaml(contents: &str) -> Result<Self> {
        serde_yaml::from_str(contents).map_err(|e| TurnstileError::Config(e.to_string()))
    }

    /// Render the configuration as YAML.
    pub fn to_yaml(&self) -> Result<String> {
        serde_yaml::to_string(self).map_err(|e| TurnstileError::Config(e.to_string()))
    }

    /// Rate limiter options derived from this configuration.
    pub fn limiter_options(&self) -> RateLimiterOptions {
        RateLimiterOptions::from(&self.rate_limiting)
    }
}
