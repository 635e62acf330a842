//! Configuration management for loginguard.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{LoginGuardError, Result};
use crate::ratelimit::{
    RateLimitPolicy, RedisConnectOptions, DEFAULT_KEY_PREFIX, DEFAULT_LIMIT, DEFAULT_WINDOW,
};

/// Prefix for environment variable overrides, e.g.
/// `LOGINGUARD__LIMITER__LIMIT=10`.
pub const ENV_PREFIX: &str = "LOGINGUARD";

/// Main configuration for loginguard.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LoginGuardConfig {
    /// Rate limit policy
    #[serde(default)]
    pub limiter: LimiterConfig,

    /// Counter store configuration
    #[serde(default)]
    pub backend: BackendConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Rate limit policy configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LimiterConfig {
    /// Requests allowed per key per window
    #[serde(default = "default_limit")]
    pub limit: u64,

    /// Window length in seconds
    #[serde(default = "default_window_secs")]
    pub window_secs: u64,
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self {
            limit: default_limit(),
            window_secs: default_window_secs(),
        }
    }
}

impl LimiterConfig {
    pub fn policy(&self) -> Result<RateLimitPolicy> {
        RateLimitPolicy::new(self.limit, Duration::from_secs(self.window_secs))
    }
}

fn default_limit() -> u64 {
    DEFAULT_LIMIT
}

fn default_window_secs() -> u64 {
    DEFAULT_WINDOW.as_secs()
}

/// Which counter store to use.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    #[default]
    Memory,
    Redis,
}

/// Counter store configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendConfig {
    #[serde(default)]
    pub kind: BackendKind,

    /// Redis connection URL
    #[serde(default = "default_redis_url")]
    pub redis_url: String,

    /// Namespace for counter keys in Redis
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    /// Deadline for connecting to Redis, in milliseconds
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    /// Reconnect attempts after a failed Redis connection
    #[serde(default = "default_connect_retries")]
    pub connect_retries: usize,

    /// How often the memory store purges expired counters; 0 disables it
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            kind: BackendKind::default(),
            redis_url: default_redis_url(),
            key_prefix: default_key_prefix(),
            connect_timeout_ms: default_connect_timeout_ms(),
            connect_retries: default_connect_retries(),
            sweep_interval_secs: default_sweep_interval(),
        }
    }
}

fn default_redis_url() -> String {
    "redis://127.0.0.1:6379".to_string()
}

fn default_key_prefix() -> String {
    DEFAULT_KEY_PREFIX.to_string()
}

fn default_connect_timeout_ms() -> u64 {
    RedisConnectOptions::default().connect_timeout.as_millis() as u64
}

fn default_connect_retries() -> usize {
    RedisConnectOptions::default().retries
}

fn default_sweep_interval() -> u64 {
    30
}

impl BackendConfig {
    pub fn connect_options(&self) -> RedisConnectOptions {
        RedisConnectOptions {
            connect_timeout: Duration::from_millis(self.connect_timeout_ms),
            retries: self.connect_retries,
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Logging configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter directive; `RUST_LOG` takes precedence
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default)]
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl LoginGuardConfig {
    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: LoginGuardConfig = serde_yaml::from_str(yaml)
            .map_err(|e| LoginGuardError::Config(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a file path.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load configuration from defaults, an optional YAML file, then
    /// `LOGINGUARD__*` environment variables, in increasing precedence.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();

        if let Some(path) = path {
            if !path.exists() {
                return Err(LoginGuardError::Config(format!(
                    "config file not found: {}",
                    path.display()
                )));
            }
            builder = builder.add_source(
                config::File::from(path).format(config::FileFormat::Yaml),
            );
        }

        let config: LoginGuardConfig = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .and_then(|settings| settings.try_deserialize())
            .map_err(|e| LoginGuardError::Config(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    /// Reject settings that cannot produce a working limiter.
    pub fn validate(&self) -> Result<()> {
        self.limiter.policy()?;

        if self.backend.kind == BackendKind::Redis && self.backend.redis_url.trim().is_empty() {
            return Err(LoginGuardError::Config(
                "backend.redis_url is required for the redis backend".into(),
            ));
        }
        if self.backend.connect_timeout_ms == 0 {
            return Err(LoginGuardError::Config(
                "backend.connect_timeout_ms must be greater than 0".into(),
            ));
        }
        Ok(())
    }
}
