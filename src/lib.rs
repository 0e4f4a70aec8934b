//! # kvguard
//!
//! Distributed coordination on top of a shared key-value store:
//! - [`DistributedLock`]: a mutex over one key. The key holds the time the
//!   current claim lapses, so a crashed holder's lock can be taken over.
//! - [`RateLimit`]: caps how often a resource may be entered per client
//!   within a fixed window, optionally waiting for the next window.
//!
//! Participants share nothing but the store. Both primitives poll with a
//! bounded wait; there is no queueing and no wake-up from the releaser.
//!
//! ## Architecture
//!
//! ```text
//!   process A            process B            process C
//! ┌────────────┐      ┌────────────┐      ┌────────────┐
//! │ Lock       │      │ Lock       │      │ RateLimit  │
//! │ RateLimit  │      │            │      │            │
//! └─────┬──────┘      └─────┬──────┘      └─────┬──────┘
//!       │ SETNX/GETSET/DEL  │                   │ INCR+EXPIRE
//!       └──────────┬────────┴───────────────────┘
//!          ┌───────▼────────┐
//!          │ Redis / memory │
//!          └────────────────┘
//! ```
//!
//! ## Usage
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use kvguard::{DistributedLock, LockConfig, MemoryStore, RateLimit, RateLimitConfig};
//!
//! # async fn run() -> kvguard::Result<()> {
//! let store = Arc::new(MemoryStore::new());
//!
//! let lock = DistributedLock::new(store.clone(), "reports:nightly", LockConfig::default())?;
//! lock.with_lock(async {
//!     // critical section
//!     Ok::<_, kvguard::Error>(())
//! })
//! .await?;
//!
//! let limit = RateLimit::new(
//!     store,
//!     "user_pictures",
//!     "192.168.0.10",
//!     RateLimitConfig::new(10, Duration::from_secs(60)).blocking(false),
//! )?;
//! let _scope = limit.enter().await?;
//! # Ok(())
//! # }
//! ```

pub mod common;
pub mod coordination;
pub mod store;

// Re-export commonly used types
pub use common::{Config, Error, Result};
pub use coordination::{DistributedLock, LockConfig, LockGuard, RateLimit, RateLimitConfig, RateLimitScope};
pub use store::{CoordinationStore, MemoryStore};
#[cfg(feature = "redis")]
pub use store::RedisStore;

/// Current version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
