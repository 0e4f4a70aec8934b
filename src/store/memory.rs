//! In-memory coordination store
//!
//! Follows Redis semantics for the subset of commands the primitives use:
//! plain writes clear any TTL, expired keys vanish on next access, and
//! counters are decimal strings. Deadlines use tokio's clock, so paused-time
//! tests see windows expire.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::time::Instant;

use super::CoordinationStore;
use crate::{Error, Result};

#[derive(Debug, Clone)]
struct Entry {
    value: String,
    expires_at: Option<Instant>,
}

impl Entry {
    fn new(value: String) -> Self {
        Self {
            value,
            expires_at: None,
        }
    }

    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// In-memory store; clones share the same keyspace.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    map: Arc<Mutex<HashMap<String, Entry>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live keys
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.entries()
            .map(|map| map.values().filter(|e| !e.is_expired(now)).count())
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn entries(&self) -> Result<MutexGuard<'_, HashMap<String, Entry>>> {
        self.map
            .lock()
            .map_err(|_| Error::Store("memory store mutex poisoned".into()))
    }

    /// Look up a key, dropping it first if its deadline has passed.
    fn live<'a>(map: &'a mut HashMap<String, Entry>, key: &str) -> Option<&'a mut Entry> {
        let now = Instant::now();
        if map.get(key).is_some_and(|e| e.is_expired(now)) {
            map.remove(key);
        }
        map.get_mut(key)
    }

    fn add(&self, key: &str, delta: i64, ttl_if_new: Option<Duration>) -> Result<i64> {
        let mut map = self.entries()?;
        let current = match Self::live(&mut map, key) {
            Some(entry) => entry.value.parse::<i64>().map_err(|_| {
                Error::Store(format!("value at '{}' is not an integer", key))
            })?,
            None => 0,
        };

        let next = current
            .checked_add(delta)
            .ok_or_else(|| Error::Store(format!("increment at '{}' would overflow", key)))?;

        match map.get_mut(key) {
            Some(entry) => entry.value = next.to_string(),
            None => {
                let mut entry = Entry::new(next.to_string());
                if next == 1 {
                    entry.expires_at = ttl_if_new.map(|ttl| Instant::now() + ttl);
                }
                map.insert(key.to_string(), entry);
            }
        }
        Ok(next)
    }
}

impl CoordinationStore for MemoryStore {
    async fn set_if_absent(&self, key: &str, value: &str) -> Result<bool> {
        let mut map = self.entries()?;
        if Self::live(&mut map, key).is_some() {
            return Ok(false);
        }
        map.insert(key.to_string(), Entry::new(value.to_string()));
        Ok(true)
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut map = self.entries()?;
        Ok(Self::live(&mut map, key).map(|e| e.value.clone()))
    }

    async fn get_set(&self, key: &str, value: &str) -> Result<Option<String>> {
        let mut map = self.entries()?;
        let old = Self::live(&mut map, key).map(|e| e.value.clone());
        map.insert(key.to_string(), Entry::new(value.to_string()));
        Ok(old)
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.entries()?.remove(key);
        Ok(())
    }

    async fn increment(&self, key: &str) -> Result<i64> {
        self.add(key, 1, None)
    }

    async fn decrement(&self, key: &str) -> Result<i64> {
        self.add(key, -1, None)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool> {
        let mut map = self.entries()?;
        if Self::live(&mut map, key).is_none() {
            return Ok(false);
        }
        if ttl.is_zero() {
            map.remove(key);
        } else if let Some(entry) = map.get_mut(key) {
            entry.expires_at = Some(Instant::now() + ttl);
        }
        Ok(true)
    }

    async fn ttl(&self, key: &str) -> Result<Option<Duration>> {
        let mut map = self.entries()?;
        let now = Instant::now();
        Ok(Self::live(&mut map, key)
            .and_then(|e| e.expires_at)
            .map(|at| at.saturating_duration_since(now)))
    }

    async fn increment_with_expiry(&self, key: &str, ttl: Duration) -> Result<i64> {
        // single critical section, so the counter can never exist without its TTL
        self.add(key, 1, Some(ttl))
    }

    async fn compare_and_swap(&self, key: &str, expected: &str, new: &str) -> Result<Option<bool>> {
        let mut map = self.entries()?;
        match Self::live(&mut map, key) {
            Some(entry) if entry.value == expected => {
                *entry = Entry::new(new.to_string());
                Ok(Some(true))
            }
            _ => Ok(Some(false)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_set_if_absent() {
        let store = MemoryStore::new();
        assert!(store.set_if_absent("k", "1").await.unwrap());
        assert!(!store.set_if_absent("k", "2").await.unwrap());
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("1"));

        store.delete("k").await.unwrap();
        assert!(store.get("k").await.unwrap().is_none());
        assert!(store.set_if_absent("k", "3").await.unwrap());
    }

    #[tokio::test]
    async fn test_get_set_returns_previous() {
        let store = MemoryStore::new();
        assert_eq!(store.get_set("k", "a").await.unwrap(), None);
        assert_eq!(store.get_set("k", "b").await.unwrap().as_deref(), Some("a"));
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("b"));
    }

    #[tokio::test]
    async fn test_counters() {
        let store = MemoryStore::new();
        assert_eq!(store.increment("c").await.unwrap(), 1);
        assert_eq!(store.increment("c").await.unwrap(), 2);
        assert_eq!(store.decrement("c").await.unwrap(), 1);
        assert_eq!(store.decrement("other").await.unwrap(), -1);

        store.get_set("text", "abc").await.unwrap();
        assert!(matches!(
            store.increment("text").await,
            Err(Error::Store(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_expire_and_ttl() {
        let store = MemoryStore::new();
        assert!(!store.expire("missing", Duration::from_secs(1)).await.unwrap());

        store.increment("c").await.unwrap();
        assert_eq!(store.ttl("c").await.unwrap(), None);
        assert!(store.expire("c", Duration::from_secs(2)).await.unwrap());
        assert_eq!(store.ttl("c").await.unwrap(), Some(Duration::from_secs(2)));

        tokio::time::sleep(Duration::from_millis(2100)).await;
        assert!(store.get("c").await.unwrap().is_none());
        assert_eq!(store.ttl("c").await.unwrap(), None);
        assert!(store.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_increment_with_expiry_arms_once() {
        let store = MemoryStore::new();
        let ttl = Duration::from_secs(2);
        assert_eq!(store.increment_with_expiry("w", ttl).await.unwrap(), 1);

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(store.increment_with_expiry("w", ttl).await.unwrap(), 2);
        // second increment must not push the window out
        let left = store.ttl("w").await.unwrap().unwrap();
        assert!(left <= Duration::from_secs(1) && left > Duration::from_millis(900));

        tokio::time::sleep(Duration::from_millis(1010)).await;
        assert_eq!(store.increment_with_expiry("w", ttl).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_plain_write_clears_ttl() {
        let store = MemoryStore::new();
        store.set_if_absent("k", "v").await.unwrap();
        store.expire("k", Duration::from_secs(30)).await.unwrap();
        store.get_set("k", "w").await.unwrap();
        assert_eq!(store.ttl("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_compare_and_swap() {
        let store = MemoryStore::new();
        assert_eq!(store.compare_and_swap("k", "a", "b").await.unwrap(), Some(false));

        store.set_if_absent("k", "a").await.unwrap();
        assert_eq!(store.compare_and_swap("k", "x", "b").await.unwrap(), Some(false));
        assert_eq!(store.compare_and_swap("k", "a", "b").await.unwrap(), Some(true));
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("b"));
    }

    #[tokio::test]
    async fn test_clones_share_state() {
        let a = MemoryStore::new();
        let b = a.clone();
        a.set_if_absent("shared", "1").await.unwrap();
        assert!(!b.set_if_absent("shared", "2").await.unwrap());
        assert_eq!(b.len(), 1);
    }
}
