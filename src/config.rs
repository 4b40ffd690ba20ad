//! Configuration management for Ratewall.

use config::{Config, Environment};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;
use tracing::info;

use crate::error::{RatewallError, Result};
use crate::ratelimit::{HeaderLimits, RedisStoreConfig, Timeframe, DEFAULT_LIMIT};

/// Prefix of the environment variables read by [`RateLimitingConfig::with_env_overrides`].
///
/// - `RATE_LIMITER_MAX_REQUESTS_PER_TIME`
/// - `RATE_LIMITER_TIMEFRAME`
/// - `RATE_LIMITER_HEADER_LIMITER`
pub const ENV_PREFIX: &str = "RATE_LIMITER";

/// Main configuration for the Ratewall service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RatewallConfig {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Rate limiting configuration
    #[serde(default)]
    pub rate_limiting: RateLimitingConfig,

    /// Score store configuration
    #[serde(default)]
    pub store: StoreConfig,
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// HTTP server address
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
    SocketAddr::from(([127, 0, 0, 1], 8080))
}

/// Rate limiting configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitingConfig {
    /// Requests allowed per window for address-derived keys
    #[serde(default = "default_max_requests")]
    pub max_requests_per_time: u64,

    /// Window granularity (`RPS` or `RPM`)
    #[serde(default)]
    pub timeframe: Timeframe,

    /// Header overrides; presence enables header limiting
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub header_limiter: Option<HeaderLimits>,
}

impl Default for RateLimitingConfig {
    fn default() -> Self {
        Self {
            max_requests_per_time: default_max_requests(),
            timeframe: Timeframe::default(),
            header_limiter: None,
        }
    }
}

fn default_max_requests() -> u64 {
    DEFAULT_LIMIT
}

impl RateLimitingConfig {
    /// Layer the `RATE_LIMITER_*` process environment over this configuration.
    pub fn with_env_overrides(&self) -> Result<Self> {
        self.layer_env(None)
    }

    /// Layer the given variables (as if read from the environment) over this
    /// configuration.
    pub fn with_env_source<I>(&self, vars: I) -> Result<Self>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        self.layer_env(Some(vars.into_iter().collect()))
    }

    fn layer_env(&self, vars: Option<config::Map<String, String>>) -> Result<Self> {
        let merged: Self = Config::builder()
            .add_source(Config::try_from(self)?)
            .add_source(Environment::with_prefix(ENV_PREFIX).source(vars))
            .build()?
            .try_deserialize()?;
        Ok(merged)
    }
}

/// Which score store backs the limiter.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "backend", rename_all = "lowercase")]
pub enum StoreConfig {
    /// In-process store, not shared between instances
    Memory {
        /// How often idle keys are swept, in seconds
        #[serde(default = "default_sweep_interval")]
        sweep_interval_secs: u64,
    },
    /// Shared Redis store
    Redis {
        /// Redis connection URL
        #[serde(default = "default_redis_url")]
        url: String,
        /// Prefix for every key written to Redis
        #[serde(default = "default_key_prefix")]
        key_prefix: String,
        /// Per-command deadline in milliseconds, 0 disables it
        #[serde(default = "default_command_timeout")]
        command_timeout_ms: u64,
    },
}

impl Default for StoreConfig {
    fn default() -> Self {
        StoreConfig::Memory {
            sweep_interval_secs: default_sweep_interval(),
        }
    }
}

fn default_sweep_interval() -> u64 {
    30
}

fn default_redis_url() -> String {
    "redis://127.0.0.1/".to_string()
}

fn default_key_prefix() -> String {
    "ratewall:".to_string()
}

fn default_command_timeout() -> u64 {
    500
}

impl StoreConfig {
    /// A Redis store at `url` with default settings.
    pub fn redis(url: impl Into<String>) -> Self {
        StoreConfig::Redis {
            url: url.into(),
            key_prefix: default_key_prefix(),
            command_timeout_ms: default_command_timeout(),
        }
    }

    /// Build the Redis client settings, if this is a Redis store.
    pub fn redis_settings(&self) -> Option<(&str, RedisStoreConfig)> {
        match self {
            StoreConfig::Redis {
                url,
                key_prefix,
                command_timeout_ms,
            } => Some((
                url.as_str(),
                RedisStoreConfig {
                    key_prefix: key_prefix.clone(),
                    command_timeout: (*command_timeout_ms > 0)
                        .then(|| Duration::from_millis(*command_timeout_ms)),
                },
            )),
            StoreConfig::Memory { .. } => None,
        }
    }
}

impl RatewallConfig {
    /// Load configuration from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading configuration");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml)
            .map_err(|e| RatewallError::Config(format!("Failed to parse configuration: {}", e)))
    }
}
