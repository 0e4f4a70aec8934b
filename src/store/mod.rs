//! Key-value store abstraction used by the coordination primitives
//!
//! The primitives only need a handful of atomic single-key operations.
//! Backends:
//! - [`MemoryStore`]: in-process, shared by cloning (tests, single node)
//! - `RedisStore`: Redis via a multiplexed connection manager (feature `redis`)

use std::future::Future;
use std::time::Duration;

use crate::Result;

pub mod memory;
#[cfg(feature = "redis")]
pub mod redis;

pub use memory::MemoryStore;
#[cfg(feature = "redis")]
pub use self::redis::RedisStore;

/// Trait for coordination store backends
///
/// Every operation is atomic on its own key. Errors are backend failures
/// (connectivity, protocol) and are passed through by the primitives.
pub trait CoordinationStore: Send + Sync {
    /// Create `key` only if it does not exist. Returns true if created.
    fn set_if_absent(&self, key: &str, value: &str) -> impl Future<Output = Result<bool>> + Send;

    fn get(&self, key: &str) -> impl Future<Output = Result<Option<String>>> + Send;

    /// Replace the value and return the previous one.
    fn get_set(&self, key: &str, value: &str)
        -> impl Future<Output = Result<Option<String>>> + Send;

    fn delete(&self, key: &str) -> impl Future<Output = Result<()>> + Send;

    /// Increment by one, creating the key at 1 if absent. Returns the new value.
    fn increment(&self, key: &str) -> impl Future<Output = Result<i64>> + Send;

    /// Decrement by one, creating the key at -1 if absent. Returns the new value.
    fn decrement(&self, key: &str) -> impl Future<Output = Result<i64>> + Send;

    /// Set or refresh the key's time to live. False if the key is absent.
    fn expire(&self, key: &str, ttl: Duration) -> impl Future<Output = Result<bool>> + Send;

    /// Remaining time to live; `None` if the key is absent or never expires.
    fn ttl(&self, key: &str) -> impl Future<Output = Result<Option<Duration>>> + Send;

    /// Increment and arm `ttl` when the counter was just created.
    ///
    /// The default runs two commands, so a crash in between leaves a
    /// counter without expiry. Backends should override it with an atomic
    /// version when they can.
    fn increment_with_expiry(
        &self,
        key: &str,
        ttl: Duration,
    ) -> impl Future<Output = Result<i64>> + Send {
        async move {
            let current = self.increment(key).await?;
            if current == 1 {
                self.expire(key, ttl).await?;
            }
            Ok::<_, crate::Error>(current)
        }
    }

    /// Native compare-and-swap.
    ///
    /// `None` means the backend has no such primitive and callers must fall
    /// back to [`get_set`](Self::get_set). `Some(true)` means `new` was
    /// written because the current value equalled `expected`.
    fn compare_and_swap(
        &self,
        _key: &str,
        _expected: &str,
        _new: &str,
    ) -> impl Future<Output = Result<Option<bool>>> + Send {
        async { Ok::<_, crate::Error>(None) }
    }
}
