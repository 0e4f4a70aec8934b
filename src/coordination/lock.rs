//! Distributed lock on a single key.
//!
//! The key holds the absolute Unix time (fractional seconds) at which the
//! current claim lapses. A claim whose timestamp is in the past belongs to
//! a holder that crashed or forgot to release, and may be taken over.
//!
//! Takeover is read, blind write, then verify that the overwritten value is
//! the one that was read. Two contenders can both pass that check if a third
//! write interleaves exactly between them. When the store has a native
//! compare-and-swap it is used instead and the window disappears.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, warn};

use crate::common::metrics::METRICS;
use crate::common::utils::{unix_timestamp_secs_f64, validate_key};
use crate::store::CoordinationStore;
use crate::{Error, Result};

/// Configuration for a distributed lock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockConfig {
    /// Any existing claim older than this is considered abandoned. Must be
    /// longer than the critical section takes to run.
    pub expires: Duration,
    /// How long to wait for a held lock before giving up. Zero means one
    /// attempt and no waiting.
    pub timeout: Duration,
    /// Pause between attempts while waiting.
    pub check_interval: Duration,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            expires: Duration::from_secs(60),
            timeout: Duration::from_secs(10),
            check_interval: Duration::from_secs(1),
        }
    }
}

impl LockConfig {
    pub fn validate(&self) -> Result<()> {
        if self.check_interval.is_zero() && !self.timeout.is_zero() {
            return Err(Error::InvalidConfig(
                "lock check_interval must be positive when timeout is set".into(),
            ));
        }
        Ok(())
    }
}

/// Outcome of one claim attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Attempt {
    Acquired,
    TookOverStale,
    Held,
}

/// A mutex shared by every process using the same store and key.
pub struct DistributedLock<S: CoordinationStore> {
    store: Arc<S>,
    key: String,
    config: LockConfig,
}

impl<S: CoordinationStore + 'static> DistributedLock<S> {
    /// Create a lock handle. Nothing is written until [`acquire`](Self::acquire).
    pub fn new(store: Arc<S>, key: impl Into<String>, config: LockConfig) -> Result<Self> {
        let key = key.into();
        validate_key(&key)?;
        config.validate()?;
        Ok(Self { store, key, config })
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn config(&self) -> &LockConfig {
        &self.config
    }

    /// Wait until the lock is ours or `timeout` runs out.
    ///
    /// The budget starts at `timeout` and each failed attempt spends one
    /// `check_interval`, so `timeout = 10s, check_interval = 1s` makes eleven
    /// attempts over roughly ten seconds. Store errors are returned as-is.
    pub async fn acquire(&self) -> Result<LockGuard<S>> {
        let started = Instant::now();
        let mut remaining = Some(self.config.timeout);
        let mut attempts = 0u32;

        while let Some(budget) = remaining {
            attempts += 1;
            if self.attempt().await? != Attempt::Held {
                METRICS.lock_wait.observe(started.elapsed());
                return Ok(self.guard());
            }

            // a spent budget ends the loop even when check_interval is zero
            remaining = if budget.is_zero() {
                None
            } else {
                budget.checked_sub(self.config.check_interval)
            };
            if remaining.is_some() {
                tokio::time::sleep(self.config.check_interval).await;
            }
        }

        let waited = started.elapsed();
        METRICS.lock_timeouts.inc();
        warn!(key = %self.key, attempts, waited = ?waited, "timeout whilst waiting for lock");
        Err(Error::LockTimeout {
            key: self.key.clone(),
            waited,
        })
    }

    /// Single attempt without waiting. Returns a guard if the lock was free
    /// or its holder's claim had lapsed.
    pub async fn try_acquire(&self) -> Result<Option<LockGuard<S>>> {
        Ok(match self.attempt().await? {
            Attempt::Held => None,
            Attempt::Acquired | Attempt::TookOverStale => Some(self.guard()),
        })
    }

    /// Delete the key unconditionally, whoever holds it.
    pub async fn release(&self) -> Result<()> {
        release_key(self.store.as_ref(), &self.key).await
    }

    /// Run `body` while holding the lock.
    ///
    /// The lock is released on every exit path. An error from `body` wins
    /// over a failed release; the release failure is only logged then.
    pub async fn with_lock<F, T, E>(&self, body: F) -> std::result::Result<T, E>
    where
        F: Future<Output = std::result::Result<T, E>>,
        E: From<Error>,
    {
        let guard = self.acquire().await?;
        let outcome = body.await;
        match (outcome, guard.release().await) {
            (Ok(value), Ok(())) => Ok(value),
            (Ok(_), Err(e)) => Err(e.into()),
            (Err(e), Ok(())) => Err(e),
            (Err(e), Err(release_err)) => {
                warn!(key = %self.key, error = %release_err, "lock release failed after body error");
                Err(e)
            }
        }
    }

    /// Whether the key currently holds a claim that has not lapsed.
    pub async fn is_locked(&self) -> Result<bool> {
        Ok(match self.store.get(&self.key).await? {
            Some(value) => !is_stale(&value, unix_timestamp_secs_f64()),
            None => false,
        })
    }

    async fn attempt(&self) -> Result<Attempt> {
        let candidate = (unix_timestamp_secs_f64() + self.config.expires.as_secs_f64() + 1.0)
            .to_string();

        if self.store.set_if_absent(&self.key, &candidate).await? {
            METRICS.locks_acquired.inc();
            debug!(key = %self.key, expires_at = %candidate, "lock acquired");
            return Ok(Attempt::Acquired);
        }

        let current = match self.store.get(&self.key).await? {
            Some(current) => current,
            // released between the two calls; next attempt will SETNX again
            None => return Ok(Attempt::Held),
        };

        if !is_stale(&current, unix_timestamp_secs_f64()) {
            return Ok(Attempt::Held);
        }

        let won = match self
            .store
            .compare_and_swap(&self.key, &current, &candidate)
            .await?
        {
            Some(swapped) => swapped,
            None => {
                let previous = self.store.get_set(&self.key, &candidate).await?;
                previous.as_deref() == Some(current.as_str())
            }
        };

        if won {
            METRICS.locks_acquired.inc();
            METRICS.locks_stale_taken.inc();
            debug!(key = %self.key, previous = %current, expires_at = %candidate, "took over stale lock");
            Ok(Attempt::TookOverStale)
        } else {
            debug!(key = %self.key, "lost race for stale lock");
            Ok(Attempt::Held)
        }
    }

    fn guard(&self) -> LockGuard<S> {
        LockGuard {
            store: self.store.clone(),
            key: self.key.clone(),
            released: false,
        }
    }
}

/// A claim counts as stale once its declared expiry is strictly in the past.
/// Values that do not parse are never treated as stale.
fn is_stale(value: &str, now: f64) -> bool {
    value
        .trim()
        .parse::<f64>()
        .map(|expires_at| expires_at < now)
        .unwrap_or(false)
}

async fn release_key<S: CoordinationStore>(store: &S, key: &str) -> Result<()> {
    store.delete(key).await?;
    METRICS.locks_released.inc();
    debug!(key = %key, "lock released");
    Ok(())
}

/// RAII handle for a held lock.
///
/// Prefer [`release`](Self::release) so failures are visible. Dropping an
/// unreleased guard schedules the release on the current tokio runtime; with
/// no runtime the claim is left to lapse after `expires`.
pub struct LockGuard<S: CoordinationStore + 'static> {
    store: Arc<S>,
    key: String,
    released: bool,
}

impl<S: CoordinationStore + 'static> LockGuard<S> {
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Explicitly release the lock.
    pub async fn release(mut self) -> Result<()> {
        self.released = true;
        release_key(self.store.as_ref(), &self.key).await
    }
}

impl<S: CoordinationStore + 'static> Drop for LockGuard<S> {
    fn drop(&mut self) {
        if self.released {
            return;
        }

        let store = self.store.clone();
        let key = std::mem::take(&mut self.key);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = release_key(store.as_ref(), &key).await {
                        debug!(key = %key, error = %e, "lock release on drop failed (claim will lapse)");
                    }
                });
            }
            Err(_) => {
                debug!(key = %key, "lock guard dropped outside a runtime, claim will lapse");
            }
        }
    }
}
