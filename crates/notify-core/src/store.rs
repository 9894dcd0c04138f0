use crate::clock::Timestamp;
use crate::duration::duration_ms;
use crate::rules::normalize_event_type;
use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::VecDeque;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EventKey {
    pub identity: String,
    pub event_type: String,
}

impl EventKey {
    pub fn new(identity: impl Into<String>, event_type: &str) -> Self {
        Self {
            identity: identity.into(),
            event_type: normalize_event_type(event_type),
        }
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store call timed out after {0:?}")]
    Timeout(Duration),
    #[error("store backend error: {0}")]
    Backend(String),
}

/// Admission timestamps per (identity, event type).
///
/// `record_if_under_limit` is the only call the admission path uses. It must
/// count and conditionally append as one step for a given key, so that
/// concurrent callers for the same key can never all observe a free slot.
#[async_trait]
pub trait EventStore: Send + Sync {
    fn name(&self) -> &'static str;

    /// Events for `key` with `timestamp >= window_start`.
    async fn count_since(&self, key: &EventKey, window_start: Timestamp) -> Result<u64, StoreError>;

    async fn record(&self, key: &EventKey, at: Timestamp) -> Result<(), StoreError>;

    /// Records an event at `now` if fewer than `max_count` events fall inside
    /// the trailing `window`. Returns whether the event was recorded.
    async fn record_if_under_limit(
        &self,
        key: &EventKey,
        window: Duration,
        max_count: u32,
        now: Timestamp,
    ) -> Result<bool, StoreError>;

    /// Drops events that no window can see any more. Returns how many went.
    async fn compact(&self, _now: Timestamp) -> Result<usize, StoreError> {
        Ok(0)
    }
}

fn expired(now: Timestamp, at: Timestamp, window_ms: u64) -> bool {
    now.saturating_sub(at) >= window_ms
}

/// Sliding log per key in a sharded map. Each key's update runs under its
/// shard guard, so unrelated keys on other shards proceed in parallel.
#[derive(Debug)]
pub struct InMemoryEventStore {
    logs: DashMap<EventKey, VecDeque<Timestamp>>,
    retention: Duration,
}

impl InMemoryEventStore {
    pub fn new(retention: Duration) -> Self {
        Self {
            logs: DashMap::new(),
            retention,
        }
    }

    pub fn key_count(&self) -> usize {
        self.logs.len()
    }
}

fn insert_sorted(log: &mut VecDeque<Timestamp>, at: Timestamp) {
    match log.back() {
        Some(last) if *last > at => {
            let idx = log.partition_point(|ts| *ts <= at);
            log.insert(idx, at);
        }
        _ => log.push_back(at),
    }
}

#[async_trait]
impl EventStore for InMemoryEventStore {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn count_since(&self, key: &EventKey, window_start: Timestamp) -> Result<u64, StoreError> {
        let count = self
            .logs
            .get(key)
            .map(|log| log.iter().filter(|ts| **ts >= window_start).count())
            .unwrap_or(0);
        Ok(count as u64)
    }

    async fn record(&self, key: &EventKey, at: Timestamp) -> Result<(), StoreError> {
        let mut log = self.logs.entry(key.clone()).or_default();
        insert_sorted(&mut log, at);
        Ok(())
    }

    async fn record_if_under_limit(
        &self,
        key: &EventKey,
        window: Duration,
        max_count: u32,
        now: Timestamp,
    ) -> Result<bool, StoreError> {
        let window_ms = duration_ms(window);
        let mut log = self.logs.entry(key.clone()).or_default();
        while log.front().is_some_and(|at| expired(now, *at, window_ms)) {
            log.pop_front();
        }
        if log.len() >= max_count as usize {
            return Ok(false);
        }
        insert_sorted(&mut log, now);
        Ok(true)
    }

    async fn compact(&self, now: Timestamp) -> Result<usize, StoreError> {
        let retention_ms = duration_ms(self.retention);
        let mut removed = 0;
        self.logs.retain(|_, log| {
            while log.front().is_some_and(|at| expired(now, *at, retention_ms)) {
                log.pop_front();
                removed += 1;
            }
            !log.is_empty()
        });
        debug!(removed, keys = self.logs.len(), "compacted event logs");
        Ok(removed)
    }
}

#[cfg(feature = "redis")]
pub mod redis_store {
    use super::*;
    use crate::clock::now_ms;
    use redis::aio::ConnectionManager;
    use std::fmt;
    use std::future::Future;
    use std::sync::atomic::{AtomicU64, Ordering};

    // KEYS[1] log key; ARGV: now, window ms, max, member, ttl ms.
    const ADMIT_SCRIPT: &str = r"
local key = KEYS[1]
local now = tonumber(ARGV[1])
local window = tonumber(ARGV[2])
redis.call('ZREMRANGEBYSCORE', key, '-inf', now - window)
if redis.call('ZCARD', key) < tonumber(ARGV[3]) then
  redis.call('ZADD', key, now, ARGV[4])
  redis.call('PEXPIRE', key, ARGV[5])
  return 1
end
return 0
";

    #[derive(Debug, Clone)]
    pub struct RedisStoreConfig {
        pub key_prefix: String,
        pub timeout: Duration,
        /// Expiry applied to every log key; at least the largest rule window.
        pub retention: Duration,
    }

    impl Default for RedisStoreConfig {
        fn default() -> Self {
            Self {
                key_prefix: "notify:events:".to_string(),
                timeout: Duration::from_millis(500),
                retention: Duration::from_secs(86_400),
            }
        }
    }

    /// One sorted set per key, scored by timestamp.
    pub struct RedisEventStore {
        conn: ConnectionManager,
        config: RedisStoreConfig,
        admit: redis::Script,
        nonce: String,
        seq: AtomicU64,
    }

    impl fmt::Debug for RedisEventStore {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.debug_struct("RedisEventStore")
                .field("config", &self.config)
                .finish_non_exhaustive()
        }
    }

    impl RedisEventStore {
        pub async fn connect(url: &str, config: RedisStoreConfig) -> Result<Self, StoreError> {
            let client =
                redis::Client::open(url).map_err(|err| StoreError::Backend(err.to_string()))?;
            let conn = bounded(config.timeout, ConnectionManager::new(client)).await?;
            Ok(Self {
                conn,
                admit: redis::Script::new(ADMIT_SCRIPT),
                nonce: format!("{}.{}", std::process::id(), now_ms()),
                seq: AtomicU64::new(0),
                config,
            })
        }

        fn key(&self, key: &EventKey) -> String {
            log_key(&self.config.key_prefix, key)
        }

        fn member(&self, at: Timestamp) -> String {
            let seq = self.seq.fetch_add(1, Ordering::Relaxed);
            format!("{at}-{}-{seq}", self.nonce)
        }

        fn ttl_ms(&self, window: Duration) -> u64 {
            duration_ms(window.max(self.config.retention))
        }
    }

    /// `<prefix><len>:<event_type>:<identity>`. The length makes the split
    /// unambiguous when either part contains `:`.
    fn log_key(prefix: &str, key: &EventKey) -> String {
        format!(
            "{prefix}{}:{}:{}",
            key.event_type.len(),
            key.event_type,
            key.identity
        )
    }

    async fn bounded<T, F>(timeout: Duration, fut: F) -> Result<T, StoreError>
    where
        F: Future<Output = redis::RedisResult<T>>,
    {
        match tokio::time::timeout(timeout, fut).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(err)) => Err(StoreError::Backend(err.to_string())),
            Err(_) => Err(StoreError::Timeout(timeout)),
        }
    }

    #[async_trait]
    impl EventStore for RedisEventStore {
        fn name(&self) -> &'static str {
            "redis"
        }

        async fn count_since(
            &self,
            key: &EventKey,
            window_start: Timestamp,
        ) -> Result<u64, StoreError> {
            let mut conn = self.conn.clone();
            let mut cmd = redis::cmd("ZCOUNT");
            cmd.arg(self.key(key)).arg(window_start).arg("+inf");
            bounded(self.config.timeout, cmd.query_async(&mut conn)).await
        }

        async fn record(&self, key: &EventKey, at: Timestamp) -> Result<(), StoreError> {
            let mut conn = self.conn.clone();
            let redis_key = self.key(key);
            let mut pipe = redis::pipe();
            pipe.atomic()
                .cmd("ZADD")
                .arg(&redis_key)
                .arg(at)
                .arg(self.member(at))
                .ignore()
                .cmd("PEXPIRE")
                .arg(&redis_key)
                .arg(self.ttl_ms(Duration::ZERO))
                .ignore();
            bounded(self.config.timeout, pipe.query_async(&mut conn)).await
        }

        async fn record_if_under_limit(
            &self,
            key: &EventKey,
            window: Duration,
            max_count: u32,
            now: Timestamp,
        ) -> Result<bool, StoreError> {
            let mut conn = self.conn.clone();
            let mut invocation = self.admit.prepare_invoke();
            invocation
                .key(self.key(key))
                .arg(now)
                .arg(duration_ms(window))
                .arg(max_count)
                .arg(self.member(now))
                .arg(self.ttl_ms(window));
            let admitted: i64 =
                bounded(self.config.timeout, invocation.invoke_async(&mut conn)).await?;
            Ok(admitted == 1)
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn log_keys_do_not_collide_across_split_points() {
            let a = log_key("notify:events:", &EventKey::new("x:u1", "news"));
            let b = log_key("notify:events:", &EventKey::new("u1", "news:x"));
            assert_ne!(a, b);
            assert_eq!(a, "notify:events:4:news:x:u1");
            assert_eq!(b, "notify:events:6:news:x:u1");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    const MINUTE: Duration = Duration::from_secs(60);

    #[tokio::test]
    async fn admits_up_to_limit_within_window() {
        let store = InMemoryEventStore::new(MINUTE);
        let key = EventKey::new("u1", "news");
        let t0 = 1_000_000;
        assert!(store.record_if_under_limit(&key, MINUTE, 2, t0).await.unwrap());
        assert!(store.record_if_under_limit(&key, MINUTE, 2, t0 + 10).await.unwrap());
        assert!(!store.record_if_under_limit(&key, MINUTE, 2, t0 + 20).await.unwrap());
        assert_eq!(store.count_since(&key, t0).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn window_slides_from_first_event() {
        let store = InMemoryEventStore::new(MINUTE);
        let key = EventKey::new("u1", "news");
        let t0 = 1_000_000;
        assert!(store.record_if_under_limit(&key, MINUTE, 1, t0).await.unwrap());
        assert!(!store.record_if_under_limit(&key, MINUTE, 1, t0 + 59_999).await.unwrap());
        assert!(store.record_if_under_limit(&key, MINUTE, 1, t0 + 60_000).await.unwrap());
    }

    #[tokio::test]
    async fn first_event_at_epoch_is_counted() {
        let store = InMemoryEventStore::new(MINUTE);
        let key = EventKey::new("u1", "x");
        assert!(store.record_if_under_limit(&key, MINUTE, 1, 0).await.unwrap());
        assert!(!store.record_if_under_limit(&key, MINUTE, 1, 5).await.unwrap());
    }

    #[tokio::test]
    async fn keys_are_isolated() {
        let store = InMemoryEventStore::new(MINUTE);
        let a = EventKey::new("u1", "news");
        let b = EventKey::new("u2", "news");
        let c = EventKey::new("u1", "promo");
        assert!(store.record_if_under_limit(&a, MINUTE, 1, 100).await.unwrap());
        assert!(!store.record_if_under_limit(&a, MINUTE, 1, 101).await.unwrap());
        assert!(store.record_if_under_limit(&b, MINUTE, 1, 102).await.unwrap());
        assert!(store.record_if_under_limit(&c, MINUTE, 1, 103).await.unwrap());
        assert_eq!(store.key_count(), 3);
    }

    #[tokio::test]
    async fn event_type_is_normalized_in_key() {
        assert_eq!(EventKey::new("u1", "News"), EventKey::new("u1", " news"));
    }

    #[tokio::test]
    async fn record_keeps_log_sorted() {
        let store = InMemoryEventStore::new(MINUTE);
        let key = EventKey::new("u1", "news");
        for at in [5_000, 1_000, 3_000] {
            store.record(&key, at).await.unwrap();
        }
        assert_eq!(store.count_since(&key, 2_000).await.unwrap(), 2);
        assert_eq!(store.count_since(&key, 0).await.unwrap(), 3);
        assert_eq!(store.count_since(&key, 5_001).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn compact_drops_old_events_and_empty_keys() {
        let store = InMemoryEventStore::new(MINUTE);
        let old = EventKey::new("u1", "news");
        let fresh = EventKey::new("u2", "news");
        store.record(&old, 1_000).await.unwrap();
        store.record(&fresh, 1_000).await.unwrap();
        store.record(&fresh, 100_000).await.unwrap();
        let removed = store.compact(120_000).await.unwrap();
        assert_eq!(removed, 2);
        assert_eq!(store.key_count(), 1);
        assert_eq!(store.count_since(&fresh, 0).await.unwrap(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_admission_never_over_admits() {
        let store = Arc::new(InMemoryEventStore::new(MINUTE));
        let key = EventKey::new("u1", "news");
        let mut tasks = Vec::new();
        for _ in 0..64 {
            let store = store.clone();
            let key = key.clone();
            tasks.push(tokio::spawn(async move {
                store.record_if_under_limit(&key, MINUTE, 5, 10_000).await.unwrap()
            }));
        }
        let mut admitted = 0;
        for task in tasks {
            if task.await.unwrap() {
                admitted += 1;
            }
        }
        assert_eq!(admitted, 5);
    }
}
