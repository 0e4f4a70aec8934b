//! Configuration for kvguard components
//!
//! Settings are layered: built-in defaults, then an optional TOML file
//! (`kvguard.toml`, or the path in `KVGUARD_CONFIG`), then `KVGUARD__*`
//! environment variables such as `KVGUARD__LOCK__TIMEOUT=30s`.

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::common::utils::parse_duration;
use crate::coordination::{LockConfig, RateLimitConfig};

/// Environment variable naming an alternative config file
pub const CONFIG_PATH_ENV: &str = "KVGUARD_CONFIG";

const DEFAULT_CONFIG_FILE: &str = "kvguard.toml";

/// Global configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Store connection
    pub store: StoreConfig,

    /// Defaults for distributed locks
    pub lock: LockSettings,

    /// Defaults for rate limit guards
    pub rate_limit: RateLimitSettings,

    /// Logging level
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            store: StoreConfig::default(),
            lock: LockSettings::default(),
            rate_limit: RateLimitSettings::default(),
            log_level: default_log_level(),
        }
    }
}

/// Store connection configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Redis URL (only used with the `redis` feature)
    pub url: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379/0".to_string(),
        }
    }
}

/// Lock settings, durations as human strings ("60s", "500ms")
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LockSettings {
    pub expires: String,
    pub timeout: String,
    pub check_interval: String,
}

impl Default for LockSettings {
    fn default() -> Self {
        Self {
            expires: "60s".to_string(),
            timeout: "10s".to_string(),
            check_interval: "1s".to_string(),
        }
    }
}

impl LockSettings {
    /// Convert into the runtime lock configuration
    pub fn to_lock_config(&self) -> crate::Result<LockConfig> {
        Ok(LockConfig {
            expires: parse_duration(&self.expires)?,
            timeout: parse_duration(&self.timeout)?,
            check_interval: parse_duration(&self.check_interval)?,
        })
    }
}

/// Rate limit settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitSettings {
    pub max_requests: u64,
    pub expire: String,
    pub blocking: bool,
    /// Unset means five windows; "0s" means wait forever
    #[serde(skip_serializing_if = "Option::is_none")]
    pub acquire_timeout: Option<String>,
    /// Unset means a tenth of the window
    #[serde(skip_serializing_if = "Option::is_none")]
    pub acquire_check_interval: Option<String>,
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            max_requests: 10,
            expire: "1s".to_string(),
            blocking: true,
            acquire_timeout: None,
            acquire_check_interval: None,
        }
    }
}

impl RateLimitSettings {
    /// Convert into the runtime rate limit configuration
    pub fn to_rate_limit_config(&self) -> crate::Result<RateLimitConfig> {
        Ok(RateLimitConfig {
            max_requests: self.max_requests,
            expire: parse_duration(&self.expire)?,
            blocking: self.blocking,
            acquire_timeout: self
                .acquire_timeout
                .as_deref()
                .map(parse_duration)
                .transpose()?,
            acquire_check_interval: self
                .acquire_check_interval
                .as_deref()
                .map(parse_duration)
                .transpose()?,
        })
    }
}

impl Config {
    /// Load configuration from the default file location and environment.
    pub fn load() -> crate::Result<Self> {
        let path =
            std::env::var(CONFIG_PATH_ENV).unwrap_or_else(|_| DEFAULT_CONFIG_FILE.to_string());
        Self::load_from(path)
    }

    /// Load configuration from a specific file (missing file is fine) and environment.
    pub fn load_from(path: impl AsRef<Path>) -> crate::Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::from(path.as_ref()).required(false))
            .add_source(
                config::Environment::with_prefix("KVGUARD")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: Config = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Check that every duration parses and the derived configs are usable.
    pub fn validate(&self) -> crate::Result<()> {
        self.lock.to_lock_config()?.validate()?;
        self.rate_limit.to_rate_limit_config()?.validate()?;
        Ok(())
    }
}
