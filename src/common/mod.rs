//! Common utilities and types shared across kvguard

pub mod config;
pub mod error;
pub mod metrics;
pub mod utils;

pub use config::{Config, LockSettings, RateLimitSettings, StoreConfig};
pub use error::{Error, Result};
pub use metrics::{CoordinationMetrics, MetricsSnapshot, METRICS};
pub use utils::{parse_duration, unix_timestamp_secs_f64, validate_key};
