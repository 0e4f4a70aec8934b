//! Error types for kvguard

use std::time::Duration;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    // === Lock Errors ===
    #[error("Timeout whilst waiting for lock '{key}' (waited {waited:?})")]
    LockTimeout { key: String, waited: Duration },

    // === Rate Limit Errors ===
    #[error("Too many requests: {resource} for {client} (limit {limit})")]
    TooManyRequests {
        resource: String,
        client: String,
        limit: u64,
    },

    #[error("Unable to acquire quota in {timeout:?}")]
    QuotaTimeout { timeout: Duration },

    #[error("Gave up: {0}")]
    GaveUp(String),

    // === Store Errors ===
    #[error("Store error: {0}")]
    Store(String),

    #[cfg(feature = "redis")]
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    // === Config Errors ===
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Config error: {0}")]
    Config(#[from] config::ConfigError),

    // === I/O Errors ===
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // === Generic ===
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Is this a retryable error?
    ///
    /// Only store-level failures qualify. Lock and quota outcomes are final
    /// decisions and retrying them here would hide contention from the caller.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Store(_) | Error::Io(_) => true,
            #[cfg(feature = "redis")]
            Error::Redis(e) => e.is_io_error() || e.is_connection_dropped() || e.is_timeout(),
            _ => false,
        }
    }

    /// Is this one of the rate limit outcomes?
    pub fn is_quota_error(&self) -> bool {
        matches!(
            self,
            Error::TooManyRequests { .. } | Error::QuotaTimeout { .. } | Error::GaveUp(_)
        )
    }
}

// Implement From for common error types
impl From<&str> for Error {
    fn from(s: &str) -> Self {
        Error::Other(s.to_string())
    }
}

impl From<String> for Error {
    fn from(s: String) -> Self {
        Error::Other(s)
    }
}
