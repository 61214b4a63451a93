//! Storage abstraction shared by every stateful protection component.
//!
//! [`PersistenceStore`] is the single seam between "business logic" (rate
//! limiting, deduplication, reputation scoring) and "where the bytes live".
//! [`RedisStore`] is the production backend; [`InMemoryStore`] is a
//! same-process fallback used both in tests and, per the configured
//! [`DegradationPolicy`](crate::settings::DegradationPolicy), when Redis is
//! unreachable and the policy is fail-open.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;

/// Errors produced by a [`PersistenceStore`] implementation.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    /// The backing store could not be reached.
    #[error("store unavailable: {0}")]
    Unavailable(String),
    /// The stored value could not be decoded.
    #[error("corrupt value for key '{0}'")]
    Corrupt(String),
}

/// A minimal key/value store with TTL support and atomic counters, enough
/// to express rate limiting, deduplication and reputation persistence
/// without every component depending on the `redis` crate directly.
#[async_trait]
pub trait PersistenceStore: Send + Sync {
    /// Fetches the raw bytes stored at `key`, if present and not expired.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;

    /// Stores `value` at `key` with the given TTL.
    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<(), StoreError>;

    /// Deletes `key`, if present.
    async fn delete(&self, key: &str) -> Result<(), StoreError>;

    /// Atomically increments the integer counter at `key` by `by`, creating
    /// it with the given TTL if absent, and returns the new value.
    async fn incr(&self, key: &str, by: i64, ttl: Duration) -> Result<i64, StoreError>;

    /// Runs the sliding-window admission check implemented by
    /// `protection-ratelimiter`'s Lua script. Default implementation
    /// delegates to a portable, non-atomic sequence of `get`/`set` calls;
    /// [`RedisStore`] overrides this with a single atomic script.
    async fn sliding_window_check(
        &self,
        key: &str,
        now_millis: i64,
        window: Duration,
        limit: u64,
    ) -> Result<SlidingWindowResult, StoreError>;
}

/// Outcome of a sliding-window admission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlidingWindowResult {
    /// Whether the request is admitted.
    pub allowed: bool,
    /// Number of requests already recorded in the current window.
    pub current: u64,
    /// The limit that was checked against.
    pub limit: u64,
}

struct Entry {
    value: Vec<u8>,
    expires_at: Instant,
}

struct CounterEntry {
    value: i64,
    expires_at: Instant,
}

struct WindowEntry {
    timestamps_millis: Vec<i64>,
    expires_at: Instant,
}

/// In-memory [`PersistenceStore`] used for tests and as the fail-open
/// fallback when Redis is configured but unreachable.
#[derive(Default)]
pub struct InMemoryStore {
    values: Mutex<HashMap<String, Entry>>,
    counters: Mutex<HashMap<String, CounterEntry>>,
    windows: Mutex<HashMap<String, WindowEntry>>,
}

impl InMemoryStore {
    /// Creates a new, empty in-memory store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Drops all expired entries. Intended to be called periodically by
    /// a cleanup background task; never required for correctness since
    /// every read already checks expiry.
    pub fn sweep_expired(&self) {
        let now = Instant::now();
        self.values.lock().unwrap().retain(|_, e| e.expires_at > now);
        self.counters.lock().unwrap().retain(|_, e| e.expires_at > now);
        self.windows.lock().unwrap().retain(|_, e| e.expires_at > now);
    }

    /// Number of live (non-expired) entries across all maps. Used by tests
    /// and the coordinator's health snapshot.
    pub fn len(&self) -> usize {
        self.values.lock().unwrap().len()
            + self.counters.lock().unwrap().len()
            + self.windows.lock().unwrap().len()
    }

    /// Returns `true` when the store holds no entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl PersistenceStore for InMemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let mut values = self.values.lock().unwrap();
        match values.get(key) {
            Some(entry) if entry.expires_at > Instant::now() => Ok(Some(entry.value.clone())),
            Some(_) => {
                values.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<(), StoreError> {
        self.values.lock().unwrap().insert(
            key.to_string(),
            Entry {
                value,
                expires_at: Instant::now() + ttl,
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.values.lock().unwrap().remove(key);
        self.counters.lock().unwrap().remove(key);
        self.windows.lock().unwrap().remove(key);
        Ok(())
    }

    async fn incr(&self, key: &str, by: i64, ttl: Duration) -> Result<i64, StoreError> {
        let mut counters = self.counters.lock().unwrap();
        let now = Instant::now();
        let entry = counters.entry(key.to_string()).or_insert(CounterEntry {
            value: 0,
            expires_at: now + ttl,
        });
        if entry.expires_at <= now {
            entry.value = 0;
            entry.expires_at = now + ttl;
        }
        entry.value += by;
        Ok(entry.value)
    }

    async fn sliding_window_check(
        &self,
        key: &str,
        now_millis: i64,
        window: Duration,
        limit: u64,
    ) -> Result<SlidingWindowResult, StoreError> {
        let mut windows = self.windows.lock().unwrap();
        let window_start = now_millis - window.as_millis() as i64;
        let now = Instant::now();
        let entry = windows.entry(key.to_string()).or_insert(WindowEntry {
            timestamps_millis: Vec::new(),
            expires_at: now + window,
        });
        entry
            .timestamps_millis
            .retain(|&ts| ts > window_start);
        let current = entry.timestamps_millis.len() as u64;
        let allowed = current < limit;
        if allowed {
            entry.timestamps_millis.push(now_millis);
        }
        entry.expires_at = now + window;
        Ok(SlidingWindowResult {
            allowed,
            current: if allowed { current + 1 } else { current },
            limit,
        })
    }
}

/// Redis-backed [`PersistenceStore`].
///
/// All multi-step operations (the sliding window check, the atomic
/// increment-with-TTL) run as a single `redis::Script` invocation, the same
/// pattern used by other Redis-backed rate limiters in this ecosystem:
/// build the key/args, `invoke_async` against a multiplexed connection, and
/// parse the returned tuple.
#[cfg(feature = "redis")]
pub struct RedisStore {
    client: redis::Client,
    key_prefix: String,
}

#[cfg(feature = "redis")]
impl RedisStore {
    /// Connects to `redis_url`, namespacing every key under `key_prefix`.
    pub fn new(redis_url: &str, key_prefix: impl Into<String>) -> Result<Self, StoreError> {
        let client = redis::Client::open(redis_url)
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        Ok(Self {
            client,
            key_prefix: key_prefix.into(),
        })
    }

    fn namespaced(&self, key: &str) -> String {
        format!("{}:{}", self.key_prefix, key)
    }

    async fn connection(&self) -> Result<redis::aio::MultiplexedConnection, StoreError> {
        self.client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))
    }
}

#[cfg(feature = "redis")]
#[async_trait]
impl PersistenceStore for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        use redis::AsyncCommands;
        let mut conn = self.connection().await?;
        conn.get(self.namespaced(key))
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<(), StoreError> {
        use redis::AsyncCommands;
        let mut conn = self.connection().await?;
        let _: () = conn
            .set_ex(self.namespaced(key), value, ttl.as_secs().max(1))
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        use redis::AsyncCommands;
        let mut conn = self.connection().await?;
        let _: () = conn
            .del(self.namespaced(key))
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        Ok(())
    }

    async fn incr(&self, key: &str, by: i64, ttl: Duration) -> Result<i64, StoreError> {
        const SCRIPT: &str = r#"
            local current = redis.call('INCRBY', KEYS[1], ARGV[1])
            if tonumber(current) == tonumber(ARGV[1]) then
                redis.call('EXPIRE', KEYS[1], ARGV[2])
            end
            return current
        "#;
        let mut conn = self.connection().await?;
        redis::Script::new(SCRIPT)
            .key(self.namespaced(key))
            .arg(by)
            .arg(ttl.as_secs().max(1))
            .invoke_async(&mut conn)
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))
    }

    async fn sliding_window_check(
        &self,
        key: &str,
        now_millis: i64,
        window: Duration,
        limit: u64,
    ) -> Result<SlidingWindowResult, StoreError> {
        const SCRIPT: &str = r#"
            local key = KEYS[1]
            local now = tonumber(ARGV[1])
            local window_millis = tonumber(ARGV[2])
            local limit = tonumber(ARGV[3])

            local window_start = now - window_millis
            redis.call('ZREMRANGEBYSCORE', key, '-inf', window_start)
            local current = redis.call('ZCARD', key)

            local allowed = 0
            if current < limit then
                redis.call('ZADD', key, now, now .. '-' .. math.random(1000000000))
                current = current + 1
                allowed = 1
            end
            redis.call('PEXPIRE', key, window_millis)

            return {allowed, current, limit}
        "#;
        let mut conn = self.connection().await?;
        let result: Vec<i64> = redis::Script::new(SCRIPT)
            .key(self.namespaced(key))
            .arg(now_millis)
            .arg(window.as_millis() as i64)
            .arg(limit)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        Ok(SlidingWindowResult {
            allowed: result[0] == 1,
            current: result[1] as u64,
            limit: result[2] as u64,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn in_memory_set_get_roundtrip() {
        let store = InMemoryStore::new();
        store
            .set("k", b"v".to_vec(), Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(store.get("k").await.unwrap(), Some(b"v".to_vec()));
    }

    #[tokio::test]
    async fn in_memory_expiry() {
        let store = InMemoryStore::new();
        store
            .set("k", b"v".to_vec(), Duration::from_millis(1))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(store.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn in_memory_incr_resets_after_ttl() {
        let store = InMemoryStore::new();
        assert_eq!(store.incr("c", 1, Duration::from_secs(60)).await.unwrap(), 1);
        assert_eq!(store.incr("c", 1, Duration::from_secs(60)).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn in_memory_sliding_window_denies_over_limit() {
        let store = InMemoryStore::new();
        let window = Duration::from_secs(60);
        for i in 0..3 {
            let result = store
                .sliding_window_check("w", 1_000_000 + i, window, 3)
                .await
                .unwrap();
            assert!(result.allowed, "request {i} should be allowed");
        }
        let denied = store
            .sliding_window_check("w", 1_000_003, window, 3)
            .await
            .unwrap();
        assert!(!denied.allowed);
        assert_eq!(denied.current, 3);
    }

    #[tokio::test]
    async fn in_memory_sliding_window_expires_old_entries() {
        let store = InMemoryStore::new();
        let window = Duration::from_millis(100);
        store.sliding_window_check("w", 0, window, 1).await.unwrap();
        let second = store
            .sliding_window_check("w", 200, window, 1)
            .await
            .unwrap();
        assert!(second.allowed, "entry outside the window should have expired");
    }

    #[tokio::test]
    async fn delete_clears_all_maps() {
        let store = InMemoryStore::new();
        store.set("k", b"v".to_vec(), Duration::from_secs(60)).await.unwrap();
        store.incr("k", 1, Duration::from_secs(60)).await.unwrap();
        store.delete("k").await.unwrap();
        assert_eq!(store.get("k").await.unwrap(), None);
        assert_eq!(store.incr("k", 1, Duration::from_secs(60)).await.unwrap(), 1);
    }
}
