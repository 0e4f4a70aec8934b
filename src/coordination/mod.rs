//! Coordination primitives built on [`CoordinationStore`](crate::store::CoordinationStore)
//!
//! - [`DistributedLock`]: mutual exclusion over one key with stale-holder takeover
//! - [`RateLimit`]: per resource/client quota over a fixed window

pub mod lock;
pub mod ratelimit;

pub use lock::{DistributedLock, LockConfig, LockGuard};
pub use ratelimit::{PostEnterCallback, RateLimit, RateLimitConfig, RateLimitScope};
