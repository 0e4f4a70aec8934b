//! Fixed-window rate limit guard.
//!
//! Each `(resource, client)` pair owns one counter key. The first claim in a
//! window creates the counter and arms its expiry; the window ends when the
//! store expires the key. Claims are never handed back: leaving the scope
//! only clears the instance's re-entrancy flag.
//!
//! A guard instance is long-lived and may be entered many times, but never
//! twice at once: a nested (or concurrent) entry fails with `GaveUp` before
//! the store is touched.

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::common::metrics::METRICS;
use crate::common::utils::validate_key;
use crate::store::CoordinationStore;
use crate::{Error, Result};

/// Hook run once, right after a successful entry and before the body.
pub type PostEnterCallback<S> = Box<dyn FnOnce(&RateLimit<S>) + Send + 'static>;

/// Configuration for a rate limit guard.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitConfig {
    /// Claims allowed per window. Zero disables limiting.
    pub max_requests: u64,
    /// Window length.
    pub expire: Duration,
    /// Wait for the next window instead of failing with `TooManyRequests`.
    pub blocking: bool,
    /// Give up waiting after this long. `None` means five windows; zero
    /// means wait forever.
    pub acquire_timeout: Option<Duration>,
    /// Pause between checks while waiting. `None` means a tenth of the window.
    pub acquire_check_interval: Option<Duration>,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_requests: 10,
            expire: Duration::from_secs(1),
            blocking: true,
            acquire_timeout: None,
            acquire_check_interval: None,
        }
    }
}

impl RateLimitConfig {
    pub fn new(max_requests: u64, expire: Duration) -> Self {
        Self {
            max_requests,
            expire,
            ..Self::default()
        }
    }

    pub fn blocking(mut self, blocking: bool) -> Self {
        self.blocking = blocking;
        self
    }

    pub fn acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = Some(timeout);
        self
    }

    pub fn acquire_check_interval(mut self, interval: Duration) -> Self {
        self.acquire_check_interval = Some(interval);
        self
    }

    pub fn effective_acquire_timeout(&self) -> Duration {
        self.acquire_timeout.unwrap_or(self.expire * 5)
    }

    pub fn effective_check_interval(&self) -> Duration {
        self.acquire_check_interval.unwrap_or(self.expire / 10)
    }

    pub fn validate(&self) -> Result<()> {
        if self.expire.is_zero() {
            return Err(Error::InvalidConfig("rate limit expire must be positive".into()));
        }
        if self.blocking && self.effective_check_interval().is_zero() {
            return Err(Error::InvalidConfig(
                "rate limit acquire_check_interval must be positive".into(),
            ));
        }
        Ok(())
    }
}

/// Quota guard for one resource and client.
pub struct RateLimit<S: CoordinationStore> {
    store: Arc<S>,
    resource: String,
    client: String,
    rate_limit_key: String,
    waiting_key: String,
    config: RateLimitConfig,
    in_context: AtomicBool,
    acquire_attempt: AtomicU64,
    acquired_times: AtomicU64,
    callbacks: Mutex<Vec<PostEnterCallback<S>>>,
}

impl<S: CoordinationStore> RateLimit<S> {
    pub fn new(
        store: Arc<S>,
        resource: impl Into<String>,
        client: impl Into<String>,
        config: RateLimitConfig,
    ) -> Result<Self> {
        let resource = resource.into();
        let client = client.into();
        validate_key(&resource)?;
        validate_key(&client)?;
        config.validate()?;

        Ok(Self {
            rate_limit_key: format!("rate_limit:{}_{}", resource, client),
            waiting_key: format!("waiting_rate_limit:{}_{}", resource, client),
            store,
            resource,
            client,
            config,
            in_context: AtomicBool::new(false),
            acquire_attempt: AtomicU64::new(0),
            acquired_times: AtomicU64::new(0),
            callbacks: Mutex::new(Vec::new()),
        })
    }

    pub fn resource(&self) -> &str {
        &self.resource
    }

    pub fn client(&self) -> &str {
        &self.client
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    /// Store key of the window counter
    pub fn rate_limit_key(&self) -> &str {
        &self.rate_limit_key
    }

    /// True while an entry is in progress or its scope is open.
    pub fn in_context(&self) -> bool {
        self.in_context.load(Ordering::Acquire)
    }

    /// Checks made by the entry in progress (0 when idle).
    pub fn acquire_attempt(&self) -> u64 {
        self.acquire_attempt.load(Ordering::Relaxed)
    }

    /// Successful entries on this instance.
    pub fn acquired_times(&self) -> u64 {
        self.acquired_times.load(Ordering::Relaxed)
    }

    /// Queue a hook for the next successful entry. It runs once, then is dropped.
    pub fn add_post_enter_callback<F>(&self, callback: F)
    where
        F: FnOnce(&RateLimit<S>) + Send + 'static,
    {
        self.pending().push(Box::new(callback));
    }

    pub fn pending_callbacks(&self) -> usize {
        self.pending().len()
    }

    fn pending(&self) -> MutexGuard<'_, Vec<PostEnterCallback<S>>> {
        // a panicking callback must not wedge the guard
        self.callbacks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Claims recorded in the current window. May exceed `max_requests`
    /// when contenders raced past the pre-check.
    pub async fn usage(&self) -> Result<u64> {
        read_counter(self.store.as_ref(), &self.rate_limit_key).await
    }

    pub async fn has_been_reached(&self) -> Result<bool> {
        Ok(self.usage().await? >= self.config.max_requests)
    }

    /// Entries (from any process) currently blocked waiting for this quota.
    pub async fn waiting_for_quota(&self) -> Result<u64> {
        read_counter(self.store.as_ref(), &self.waiting_key).await
    }

    /// Time left in the current window, if one is open.
    pub async fn window_ttl(&self) -> Result<Option<Duration>> {
        self.store.ttl(&self.rate_limit_key).await
    }

    /// Drop the window counter and waiter gauge for this resource and client.
    pub async fn reset(&self) -> Result<()> {
        self.store.delete(&self.rate_limit_key).await?;
        self.store.delete(&self.waiting_key).await?;
        debug!(resource = %self.resource, client = %self.client, "rate limit reset");
        Ok(())
    }

    /// Record one claim if quota is left.
    ///
    /// Usage is checked first so an exhausted window is not incremented. The
    /// value returned by the increment is checked again because concurrent
    /// callers can all pass the first check.
    pub async fn increment_usage(&self) -> Result<u64> {
        if self.has_been_reached().await? {
            return Err(self.too_many_requests());
        }

        let current = self
            .store
            .increment_with_expiry(&self.rate_limit_key, self.config.expire)
            .await?;
        let current = u64::try_from(current).unwrap_or(0);

        if current > self.config.max_requests {
            return Err(self.too_many_requests());
        }

        METRICS.quota_claims.inc();
        debug!(
            resource = %self.resource,
            client = %self.client,
            usage = current,
            limit = self.config.max_requests,
            "quota claimed"
        );
        Ok(current)
    }

    /// Claim one unit of quota and open the scope.
    ///
    /// Fails with `GaveUp` if this instance is already inside a scope,
    /// `TooManyRequests` when over quota and not blocking, and
    /// `QuotaTimeout` when a blocking wait reaches `acquire_timeout`.
    pub async fn enter(&self) -> Result<RateLimitScope<'_, S>> {
        if self.in_context.swap(true, Ordering::AcqRel) {
            METRICS.quota_reentrancy.inc();
            warn!(resource = %self.resource, client = %self.client, "nested rate limit entry");
            return Err(Error::GaveUp(format!(
                "do not nest the usage of rate limit {}_{}",
                self.resource, self.client
            )));
        }

        // clears the flag again if the claim fails
        let scope = RateLimitScope { limit: self };

        if self.config.max_requests > 0 {
            self.claim().await?;
        }

        self.acquire_attempt.store(0, Ordering::Relaxed);
        self.acquired_times.fetch_add(1, Ordering::Relaxed);

        let callbacks = std::mem::take(&mut *self.pending());
        for callback in callbacks {
            callback(self);
        }

        Ok(scope)
    }

    /// Run `body` inside a claimed scope.
    pub async fn with_quota<F, T, E>(&self, body: F) -> std::result::Result<T, E>
    where
        F: Future<Output = std::result::Result<T, E>>,
        E: From<Error>,
    {
        let _scope = self.enter().await?;
        body.await
    }

    /// Check, then (when blocking) poll until a claim succeeds or the
    /// deadline `start + acquire_timeout` passes. The last check happens at
    /// the deadline itself.
    async fn claim(&self) -> Result<()> {
        let started = Instant::now();
        let timeout = self.config.effective_acquire_timeout();
        let deadline = (!timeout.is_zero()).then(|| started + timeout);
        let interval = self.config.effective_check_interval();
        let mut waiting = false;

        self.acquire_attempt.store(1, Ordering::Relaxed);

        let outcome = loop {
            match self.increment_usage().await {
                Ok(_) => break Ok(()),
                Err(Error::TooManyRequests { .. }) if self.config.blocking => {}
                Err(e) => {
                    if matches!(e, Error::TooManyRequests { .. }) {
                        METRICS.quota_rejections.inc();
                        debug!(resource = %self.resource, client = %self.client, "too many requests");
                    }
                    break Err(e);
                }
            }

            let now = Instant::now();
            let pause = match deadline {
                Some(deadline) if now >= deadline => {
                    METRICS.quota_timeouts.inc();
                    warn!(
                        resource = %self.resource,
                        client = %self.client,
                        attempts = self.acquire_attempt(),
                        "unable to acquire quota in {:?}",
                        timeout
                    );
                    break Err(Error::QuotaTimeout { timeout });
                }
                Some(deadline) => interval.min(deadline - now),
                None => interval,
            };

            if !waiting {
                if let Err(e) = self.store.increment(&self.waiting_key).await {
                    break Err(e);
                }
                waiting = true;
            }

            self.acquire_attempt.fetch_add(1, Ordering::Relaxed);
            METRICS.quota_waits.inc();
            trace!(
                resource = %self.resource,
                client = %self.client,
                attempt = self.acquire_attempt(),
                pause = ?pause,
                "quota exhausted, waiting"
            );
            tokio::time::sleep(pause).await;
        };

        if waiting {
            METRICS.quota_wait.observe(started.elapsed());
            if let Err(e) = self.store.decrement(&self.waiting_key).await {
                warn!(key = %self.waiting_key, error = %e, "failed to decrement waiter count");
            }
        }

        outcome
    }

    fn too_many_requests(&self) -> Error {
        Error::TooManyRequests {
            resource: self.resource.clone(),
            client: self.client.clone(),
            limit: self.config.max_requests,
        }
    }
}

async fn read_counter<S: CoordinationStore>(store: &S, key: &str) -> Result<u64> {
    match store.get(key).await? {
        Some(value) => value
            .trim()
            .parse::<i64>()
            .map(|n| u64::try_from(n).unwrap_or(0))
            .map_err(|_| Error::Store(format!("value at '{}' is not an integer", key))),
        None => Ok(0),
    }
}

/// An open rate limit scope. Dropping it leaves the scope; the claimed unit
/// stays counted until the window expires.
pub struct RateLimitScope<'a, S: CoordinationStore> {
    limit: &'a RateLimit<S>,
}

impl<'a, S: CoordinationStore> RateLimitScope<'a, S> {
    pub fn limit(&self) -> &'a RateLimit<S> {
        self.limit
    }
}

impl<S: CoordinationStore> Drop for RateLimitScope<'_, S> {
    fn drop(&mut self) {
        self.limit.acquire_attempt.store(0, Ordering::Relaxed);
        self.limit.in_context.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use std::sync::atomic::AtomicUsize;

    fn limiter(store: &Arc<MemoryStore>, config: RateLimitConfig) -> RateLimit<MemoryStore> {
        RateLimit::new(store.clone(), "test", "localhost", config).unwrap()
    }

    #[test]
    fn test_config_defaults() {
        let config = RateLimitConfig::new(10, Duration::from_secs(2));
        assert_eq!(config.effective_acquire_timeout(), Duration::from_secs(10));
        assert_eq!(config.effective_check_interval(), Duration::from_millis(200));
        assert!(config.validate().is_ok());

        assert!(RateLimitConfig::new(1, Duration::ZERO).validate().is_err());
        let no_pause = RateLimitConfig::new(1, Duration::from_secs(1))
            .acquire_check_interval(Duration::ZERO);
        assert!(no_pause.validate().is_err());
        assert!(no_pause.blocking(false).validate().is_ok());
    }

    #[test]
    fn test_keys() {
        let store = Arc::new(MemoryStore::new());
        let rl = limiter(&store, RateLimitConfig::default());
        assert_eq!(rl.rate_limit_key(), "rate_limit:test_localhost");
        assert!(RateLimit::new(store, "", "c", RateLimitConfig::default()).is_err());
    }

    #[tokio::test]
    async fn test_limit_10_max_requests() {
        let store = Arc::new(MemoryStore::new());
        let rl = limiter(&store, RateLimitConfig::new(10, Duration::from_secs(1)).blocking(false));

        assert_eq!(rl.usage().await.unwrap(), 0);
        assert!(!rl.has_been_reached().await.unwrap());

        for _ in 0..10 {
            rl.enter().await.unwrap();
        }
        assert_eq!(rl.usage().await.unwrap(), 10);
        assert!(rl.has_been_reached().await.unwrap());

        let err = rl.enter().await.err().unwrap();
        assert!(matches!(err, Error::TooManyRequests { limit: 10, .. }));
        assert_eq!(rl.usage().await.unwrap(), 10);
        assert!(!rl.in_context());
        assert_eq!(rl.acquire_attempt(), 0);
        assert_eq!(rl.acquired_times(), 10);
    }

    #[tokio::test]
    async fn test_nested_entry_gives_up() {
        let store = Arc::new(MemoryStore::new());
        let rl = limiter(&store, RateLimitConfig::new(10, Duration::from_secs(1)));

        let scope = rl.enter().await.unwrap();
        assert!(rl.in_context());
        let err = rl.enter().await.err().unwrap();
        assert!(matches!(err, Error::GaveUp(_)));
        // the refused entry did not claim anything
        assert_eq!(rl.usage().await.unwrap(), 1);

        drop(scope);
        assert!(!rl.in_context());
        rl.enter().await.unwrap();
        assert_eq!(rl.usage().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_callbacks_run_once() {
        let store = Arc::new(MemoryStore::new());
        let rl = limiter(&store, RateLimitConfig::new(10, Duration::from_secs(1)));
        let calls = Arc::new(AtomicUsize::new(0));

        let seen = calls.clone();
        rl.add_post_enter_callback(move |limit| {
            assert!(limit.in_context());
            assert_eq!(limit.acquired_times(), 1);
            seen.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(rl.pending_callbacks(), 1);

        {
            let _scope = rl.enter().await.unwrap();
            assert_eq!(calls.load(Ordering::SeqCst), 1);
            assert_eq!(rl.pending_callbacks(), 0);
        }

        rl.enter().await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_callbacks_wait_for_successful_entry() {
        let store = Arc::new(MemoryStore::new());
        let rl = limiter(&store, RateLimitConfig::new(1, Duration::from_secs(60)).blocking(false));
        rl.enter().await.unwrap();

        let calls = Arc::new(AtomicUsize::new(0));
        let seen = calls.clone();
        rl.add_post_enter_callback(move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
        });

        assert!(rl.enter().await.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(rl.pending_callbacks(), 1);

        rl.reset().await.unwrap();
        rl.enter().await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(rl.pending_callbacks(), 0);
    }

    #[tokio::test]
    async fn test_zero_max_requests_is_unlimited() {
        let store = Arc::new(MemoryStore::new());
        let rl = limiter(&store, RateLimitConfig::new(0, Duration::from_secs(1)).blocking(false));
        for _ in 0..100 {
            rl.enter().await.unwrap();
        }
        assert_eq!(rl.acquired_times(), 100);
        assert!(store.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_expires() {
        let store = Arc::new(MemoryStore::new());
        let rl = limiter(&store, RateLimitConfig::new(10, Duration::from_secs(2)).blocking(false));

        for _ in 0..10 {
            rl.enter().await.unwrap();
        }
        assert!(rl.window_ttl().await.unwrap().is_some());

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(matches!(
            rl.enter().await.err().unwrap(),
            Error::TooManyRequests { .. }
        ));

        tokio::time::sleep(Duration::from_millis(1100)).await;
        rl.enter().await.unwrap();
        assert_eq!(rl.usage().await.unwrap(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_blocking_waits_for_next_window() {
        let store = Arc::new(MemoryStore::new());
        let rl = limiter(&store, RateLimitConfig::new(10, Duration::from_secs(1)));
        for _ in 0..10 {
            rl.enter().await.unwrap();
        }

        let started = Instant::now();
        let scope = rl.enter().await.unwrap();
        assert!(started.elapsed() >= Duration::from_secs(1));
        assert!(scope.limit().usage().await.unwrap() <= 10);
        assert_eq!(rl.waiting_for_quota().await.unwrap(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_blocking_times_out() {
        let store = Arc::new(MemoryStore::new());
        let config = RateLimitConfig::new(1, Duration::from_secs(60))
            .acquire_timeout(Duration::from_secs(1))
            .acquire_check_interval(Duration::from_millis(300));
        let rl = limiter(&store, config);
        rl.enter().await.unwrap();

        let started = Instant::now();
        let err = rl.enter().await.err().unwrap();
        assert!(matches!(err, Error::QuotaTimeout { timeout } if timeout == Duration::from_secs(1)));
        // checks at 0, 300, 600, 900 and the deadline itself
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_secs(1), "gave up early: {:?}", elapsed);
        assert!(elapsed < Duration::from_millis(1100), "overshot deadline: {:?}", elapsed);
        assert!(!rl.in_context());
        assert_eq!(rl.waiting_for_quota().await.unwrap(), 0);
        assert_eq!(rl.usage().await.unwrap(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_waiter_count_visible_while_blocked() {
        let store = Arc::new(MemoryStore::new());
        let config = RateLimitConfig::new(1, Duration::from_secs(2));
        let first = limiter(&store, config.clone());
        first.enter().await.unwrap();

        let waiter = Arc::new(limiter(&store, config));
        let task = {
            let waiter = waiter.clone();
            tokio::spawn(async move {
                waiter.enter().await?;
                Ok::<_, Error>(())
            })
        };

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(first.waiting_for_quota().await.unwrap(), 1);
        assert!(waiter.acquire_attempt() > 1);

        task.await.unwrap().unwrap();
        assert_eq!(first.waiting_for_quota().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_with_quota() {
        let store = Arc::new(MemoryStore::new());
        let rl = limiter(&store, RateLimitConfig::new(1, Duration::from_secs(60)).blocking(false));

        let value = rl
            .with_quota(async { Ok::<_, Error>(rl.in_context()) })
            .await
            .unwrap();
        assert!(value);
        assert!(!rl.in_context());

        let err = rl.with_quota(async { Ok::<_, Error>(()) }).await.unwrap_err();
        assert!(matches!(err, Error::TooManyRequests { .. }));
    }

    /// Memory store where another claimer slips in between our check and increment.
    struct RacingStore(MemoryStore);

    impl CoordinationStore for RacingStore {
        async fn set_if_absent(&self, key: &str, value: &str) -> Result<bool> {
            self.0.set_if_absent(key, value).await
        }
        async fn get(&self, key: &str) -> Result<Option<String>> {
            self.0.get(key).await
        }
        async fn get_set(&self, key: &str, value: &str) -> Result<Option<String>> {
            self.0.get_set(key, value).await
        }
        async fn delete(&self, key: &str) -> Result<()> {
            self.0.delete(key).await
        }
        async fn increment(&self, key: &str) -> Result<i64> {
            self.0.increment(key).await
        }
        async fn decrement(&self, key: &str) -> Result<i64> {
            self.0.decrement(key).await
        }
        async fn expire(&self, key: &str, ttl: Duration) -> Result<bool> {
            self.0.expire(key, ttl).await
        }
        async fn ttl(&self, key: &str) -> Result<Option<Duration>> {
            self.0.ttl(key).await
        }
        async fn increment_with_expiry(&self, key: &str, ttl: Duration) -> Result<i64> {
            self.0.increment_with_expiry(key, ttl).await?;
            self.0.increment_with_expiry(key, ttl).await
        }
    }

    #[tokio::test]
    async fn test_raced_increment_rejected() {
        let store = Arc::new(RacingStore(MemoryStore::new()));
        let config = RateLimitConfig::new(2, Duration::from_secs(60)).blocking(false);
        let rl = RateLimit::new(store, "test", "localhost", config).unwrap();

        // pre-check sees 0, but the increment lands on 2 (ours plus the racer's)
        assert_eq!(rl.increment_usage().await.unwrap(), 2);

        // pre-check sees 2 and stops before incrementing
        assert!(matches!(
            rl.increment_usage().await,
            Err(Error::TooManyRequests { .. })
        ));
        assert_eq!(rl.usage().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_overshoot_after_check_is_rejected() {
        let store = Arc::new(RacingStore(MemoryStore::new()));
        let config = RateLimitConfig::new(3, Duration::from_secs(60)).blocking(false);
        let rl = RateLimit::new(store, "test", "localhost", config).unwrap();

        assert_eq!(rl.increment_usage().await.unwrap(), 2);
        // pre-check sees 2 < 3, the racer and we land on 3 and 4
        let err = rl.enter().await.err().unwrap();
        assert!(matches!(err, Error::TooManyRequests { limit: 3, .. }));
        assert_eq!(rl.usage().await.unwrap(), 4);
        assert!(!rl.in_context());
    }
}
