//! Redis coordination store
//!
//! Uses a [`ConnectionManager`], which multiplexes one connection and
//! reconnects on failure; cloning it is cheap so every call works on its
//! own handle.

use std::time::Duration;

use redis::aio::ConnectionManager;
use redis::Script;
use tracing::debug;

use super::CoordinationStore;
use crate::Result;

/// Increment a counter and arm its expiry (milliseconds) when it was just created.
///
/// Adapted from the INCR rate limiter pattern; run as a script so the pair is atomic.
const INCREMENT_SCRIPT: &str = r#"
    local current
    current = tonumber(redis.call("incr", KEYS[1]))
    if current == 1 then
        redis.call("pexpire", KEYS[1], ARGV[1])
    end
    return current
"#;

/// Redis-backed store
#[derive(Clone)]
pub struct RedisStore {
    conn: ConnectionManager,
    increment_script: Script,
}

impl RedisStore {
    /// Connect to `url` (e.g. `redis://127.0.0.1:6379/0`).
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url)?;
        let conn = client.get_connection_manager().await?;
        debug!(url = %url, "connected to redis");
        Ok(Self::from_connection(conn))
    }

    /// Wrap an existing connection manager.
    pub fn from_connection(conn: ConnectionManager) -> Self {
        Self {
            conn,
            increment_script: Script::new(INCREMENT_SCRIPT),
        }
    }

    /// Round-trip check that the server is reachable.
    pub async fn ping(&self) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }
}

fn millis(d: Duration) -> u64 {
    // PEXPIRE 0 deletes the key, so anything under a millisecond becomes 1
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX).max(1)
}

impl CoordinationStore for RedisStore {
    async fn set_if_absent(&self, key: &str, value: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        let created: bool = redis::cmd("SETNX")
            .arg(key)
            .arg(value)
            .query_async(&mut conn)
            .await?;
        Ok(created)
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.conn.clone();
        let value: Option<String> = redis::cmd("GET").arg(key).query_async(&mut conn).await?;
        Ok(value)
    }

    async fn get_set(&self, key: &str, value: &str) -> Result<Option<String>> {
        let mut conn = self.conn.clone();
        let old: Option<String> = redis::cmd("GETSET")
            .arg(key)
            .arg(value)
            .query_async(&mut conn)
            .await?;
        Ok(old)
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: i64 = redis::cmd("DEL").arg(key).query_async(&mut conn).await?;
        Ok(())
    }

    async fn increment(&self, key: &str) -> Result<i64> {
        let mut conn = self.conn.clone();
        let value: i64 = redis::cmd("INCR").arg(key).query_async(&mut conn).await?;
        Ok(value)
    }

    async fn decrement(&self, key: &str) -> Result<i64> {
        let mut conn = self.conn.clone();
        let value: i64 = redis::cmd("DECR").arg(key).query_async(&mut conn).await?;
        Ok(value)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool> {
        let mut conn = self.conn.clone();
        let set: bool = redis::cmd("PEXPIRE")
            .arg(key)
            .arg(millis(ttl))
            .query_async(&mut conn)
            .await?;
        Ok(set)
    }

    async fn ttl(&self, key: &str) -> Result<Option<Duration>> {
        let mut conn = self.conn.clone();
        // -2: no such key, -1: no expiry
        let ms: i64 = redis::cmd("PTTL").arg(key).query_async(&mut conn).await?;
        Ok(u64::try_from(ms).ok().map(Duration::from_millis))
    }

    async fn increment_with_expiry(&self, key: &str, ttl: Duration) -> Result<i64> {
        let mut conn = self.conn.clone();
        // EVALSHA first, EVAL on NOSCRIPT
        let current: i64 = self
            .increment_script
            .key(key)
            .arg(millis(ttl))
            .invoke_async(&mut conn)
            .await?;
        Ok(current)
    }
}
