//! The backend trait, the typed store wrapper, and distributed locks.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::warn;
use uuid::Uuid;

use confab_core::config::ConfabConfig;
use confab_core::shutdown;

use crate::codec::{decode, encode};
use crate::{KvError, KvResult, MemoryBackend, RedisBackend};

/// Poll cadence of the generic blocking ops. The 1-second loop turns
/// uncancellable transport calls into cooperatively cancellable operations at
/// the cost of at most one extra second of shutdown latency.
pub const POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Which end of a list an `lmove` touches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListEnd {
    Left,
    Right,
}

/// Raw string-valued operations each backend must provide.
///
/// The blocking variants have generic 1-second polling implementations that
/// also watch the process-wide stopping signal; backends with native blocking
/// support (Redis) override them.
#[async_trait]
pub trait KvBackend: Send + Sync {
    async fn get(&self, key: &str) -> KvResult<Option<String>>;
    async fn mget(&self, keys: &[String]) -> KvResult<Vec<Option<String>>>;
    async fn set(&self, key: &str, value: String, ex: Option<u64>) -> KvResult<()>;
    async fn delete(&self, key: &str) -> KvResult<()>;
    async fn exists(&self, key: &str) -> KvResult<bool>;
    async fn expire(&self, key: &str, ex: u64) -> KvResult<bool>;

    async fn hget(&self, key: &str, field: &str) -> KvResult<Option<String>>;
    async fn hset(&self, key: &str, field: &str, value: String, ex: Option<u64>) -> KvResult<()>;
    async fn hgetall(&self, key: &str) -> KvResult<Vec<(String, String)>>;
    async fn hdel(&self, key: &str, field: &str) -> KvResult<()>;

    async fn lpush(&self, key: &str, value: String, ex: u64) -> KvResult<()>;
    async fn rpush(&self, key: &str, value: String, ex: u64) -> KvResult<()>;
    async fn lpop(&self, key: &str) -> KvResult<Option<String>>;
    async fn rpop(&self, key: &str) -> KvResult<Option<String>>;
    async fn lrange(&self, key: &str, start: i64, end: i64) -> KvResult<Vec<String>>;
    async fn lrem(&self, key: &str, value: &str) -> KvResult<()>;
    async fn lmove(
        &self,
        source_key: &str,
        target_key: &str,
        source_end: ListEnd,
        target_end: ListEnd,
    ) -> KvResult<Option<String>>;

    async fn sadd(&self, key: &str, value: String) -> KvResult<()>;
    async fn smembers(&self, key: &str) -> KvResult<Vec<String>>;
    async fn srem(&self, key: &str, value: &str) -> KvResult<()>;
    async fn smove(&self, source_key: &str, target_key: &str, value: &str) -> KvResult<bool>;
    async fn spop(&self, key: &str) -> KvResult<Option<String>>;

    async fn try_lock(&self, key: &str, token: &str, ttl_secs: u64) -> KvResult<bool>;
    async fn refresh_lock(&self, key: &str, token: &str, ttl_secs: u64) -> KvResult<bool>;
    async fn release_lock(&self, key: &str, token: &str) -> KvResult<bool>;

    async fn blpop(&self, key: &str, timeout_secs: u64) -> KvResult<Option<String>> {
        let mut remaining = timeout_secs;
        loop {
            if shutdown::is_stopping() {
                return Ok(None);
            }
            if let Some(value) = self.lpop(key).await? {
                return Ok(Some(value));
            }
            if remaining == 0 {
                return Ok(None);
            }
            remaining -= 1;
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    async fn brpop(&self, key: &str, timeout_secs: u64) -> KvResult<Option<String>> {
        let mut remaining = timeout_secs;
        loop {
            if shutdown::is_stopping() {
                return Ok(None);
            }
            if let Some(value) = self.rpop(key).await? {
                return Ok(Some(value));
            }
            if remaining == 0 {
                return Ok(None);
            }
            remaining -= 1;
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    async fn blmove(
        &self,
        source_key: &str,
        target_key: &str,
        source_end: ListEnd,
        target_end: ListEnd,
        timeout_secs: u64,
    ) -> KvResult<Option<String>> {
        let mut remaining = timeout_secs;
        loop {
            if shutdown::is_stopping() {
                return Ok(None);
            }
            if let Some(value) = self
                .lmove(source_key, target_key, source_end, target_end)
                .await?
            {
                return Ok(Some(value));
            }
            if remaining == 0 {
                return Ok(None);
            }
            remaining -= 1;
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }
}

/// Typed view over a [`KvBackend`]. Cheap to clone.
#[derive(Clone)]
pub struct KvStore {
    backend: Arc<dyn KvBackend>,
}

impl KvStore {
    pub fn new(backend: Arc<dyn KvBackend>) -> Self {
        Self { backend }
    }

    pub fn memory() -> Self {
        Self::new(Arc::new(MemoryBackend::new()))
    }

    pub async fn redis(url: &str) -> KvResult<Self> {
        Ok(Self::new(Arc::new(RedisBackend::connect(url).await?)))
    }

    /// Redis when configured, in-memory otherwise.
    pub async fn connect(config: &ConfabConfig) -> KvResult<Self> {
        match config.redis.url() {
            Some(url) => Self::redis(&url).await,
            None => Ok(Self::memory()),
        }
    }

    ///
    /// Values
    ///

    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> KvResult<Option<T>> {
        let raw = self.backend.get(key).await?;
        Ok(raw.and_then(|raw| decode(key, &raw)))
    }

    pub async fn mget<T: DeserializeOwned>(&self, keys: &[String]) -> KvResult<Vec<T>> {
        let raws = self.backend.mget(keys).await?;
        Ok(keys
            .iter()
            .zip(raws)
            .filter_map(|(key, raw)| decode(key, &raw?))
            .collect())
    }

    pub async fn set_one<T: Serialize>(&self, key: &str, value: &T, ex: Option<u64>) -> KvResult<()> {
        self.backend.set(key, encode(value)?, ex).await
    }

    pub async fn delete(&self, key: &str) -> KvResult<()> {
        self.backend.delete(key).await
    }

    pub async fn exists(&self, key: &str) -> KvResult<bool> {
        self.backend.exists(key).await
    }

    pub async fn expire(&self, key: &str, ex: u64) -> KvResult<bool> {
        self.backend.expire(key, ex).await
    }

    ///
    /// Hashes
    ///

    pub async fn hget<T: DeserializeOwned>(&self, key: &str, field: &str) -> KvResult<Option<T>> {
        let raw = self.backend.hget(key, field).await?;
        Ok(raw.and_then(|raw| decode(key, &raw)))
    }

    pub async fn hset<T: Serialize>(
        &self,
        key: &str,
        field: &str,
        value: &T,
        ex: Option<u64>,
    ) -> KvResult<()> {
        self.backend.hset(key, field, encode(value)?, ex).await
    }

    pub async fn hgetall<T: DeserializeOwned>(&self, key: &str) -> KvResult<Vec<(String, T)>> {
        let pairs = self.backend.hgetall(key).await?;
        Ok(pairs
            .into_iter()
            .filter_map(|(field, raw)| decode(key, &raw).map(|value| (field, value)))
            .collect())
    }

    pub async fn hdel(&self, key: &str, field: &str) -> KvResult<()> {
        self.backend.hdel(key, field).await
    }

    ///
    /// Lists
    ///

    pub async fn lpush<T: Serialize>(&self, key: &str, value: &T, ex: u64) -> KvResult<()> {
        self.backend.lpush(key, encode(value)?, ex).await
    }

    pub async fn rpush<T: Serialize>(&self, key: &str, value: &T, ex: u64) -> KvResult<()> {
        self.backend.rpush(key, encode(value)?, ex).await
    }

    pub async fn lpop<T: DeserializeOwned>(&self, key: &str) -> KvResult<Option<T>> {
        let raw = self.backend.lpop(key).await?;
        Ok(raw.and_then(|raw| decode(key, &raw)))
    }

    pub async fn rpop<T: DeserializeOwned>(&self, key: &str) -> KvResult<Option<T>> {
        let raw = self.backend.rpop(key).await?;
        Ok(raw.and_then(|raw| decode(key, &raw)))
    }

    pub async fn lrange<T: DeserializeOwned>(
        &self,
        key: &str,
        start: i64,
        end: i64,
    ) -> KvResult<Vec<T>> {
        let raws = self.backend.lrange(key, start, end).await?;
        Ok(raws.iter().filter_map(|raw| decode(key, raw)).collect())
    }

    pub async fn lrem<T: Serialize>(&self, key: &str, value: &T) -> KvResult<()> {
        self.backend.lrem(key, &encode(value)?).await
    }

    pub async fn lmove<T: DeserializeOwned>(
        &self,
        source_key: &str,
        target_key: &str,
        source_end: ListEnd,
        target_end: ListEnd,
    ) -> KvResult<Option<T>> {
        let raw = self
            .backend
            .lmove(source_key, target_key, source_end, target_end)
            .await?;
        Ok(raw.and_then(|raw| decode(source_key, &raw)))
    }

    /// Pop from the left, waiting up to `timeout_secs`. Returns `None` on
    /// timeout or when the stopping signal fires.
    pub async fn blpop<T: DeserializeOwned>(
        &self,
        key: &str,
        timeout_secs: u64,
    ) -> KvResult<Option<T>> {
        let raw = self.backend.blpop(key, timeout_secs).await?;
        Ok(raw.and_then(|raw| decode(key, &raw)))
    }

    pub async fn brpop<T: DeserializeOwned>(
        &self,
        key: &str,
        timeout_secs: u64,
    ) -> KvResult<Option<T>> {
        let raw = self.backend.brpop(key, timeout_secs).await?;
        Ok(raw.and_then(|raw| decode(key, &raw)))
    }

    pub async fn blmove<T: DeserializeOwned>(
        &self,
        source_key: &str,
        target_key: &str,
        source_end: ListEnd,
        target_end: ListEnd,
        timeout_secs: u64,
    ) -> KvResult<Option<T>> {
        let raw = self
            .backend
            .blmove(source_key, target_key, source_end, target_end, timeout_secs)
            .await?;
        Ok(raw.and_then(|raw| decode(source_key, &raw)))
    }

    ///
    /// Sets
    ///

    pub async fn sadd<T: Serialize>(&self, key: &str, value: &T) -> KvResult<()> {
        self.backend.sadd(key, encode(value)?).await
    }

    pub async fn smembers<T: DeserializeOwned>(&self, key: &str) -> KvResult<Vec<T>> {
        let raws = self.backend.smembers(key).await?;
        Ok(raws.iter().filter_map(|raw| decode(key, raw)).collect())
    }

    pub async fn srem<T: Serialize>(&self, key: &str, value: &T) -> KvResult<()> {
        self.backend.srem(key, &encode(value)?).await
    }

    pub async fn smove<T: Serialize>(
        &self,
        source_key: &str,
        target_key: &str,
        value: &T,
    ) -> KvResult<bool> {
        self.backend
            .smove(source_key, target_key, &encode(value)?)
            .await
    }

    pub async fn spop<T: DeserializeOwned>(&self, key: &str) -> KvResult<Option<T>> {
        let raw = self.backend.spop(key).await?;
        Ok(raw.and_then(|raw| decode(key, &raw)))
    }

    ///
    /// Locks
    ///

    /// Try to take the distributed lock at `key` for `ttl_secs`. Returns
    /// `None` when another holder owns it.
    pub async fn acquire_lock(&self, key: &str, ttl_secs: u64) -> KvResult<Option<KvLock>> {
        let token = Uuid::new_v4().to_string();
        if self.backend.try_lock(key, &token, ttl_secs).await? {
            Ok(Some(KvLock {
                backend: Arc::clone(&self.backend),
                key: key.to_string(),
                token,
                ttl_secs,
            }))
        } else {
            Ok(None)
        }
    }
}

/// A held distributed lock. Dropping it does NOT release: callers release
/// explicitly so a crashed holder expires via the TTL instead.
pub struct KvLock {
    backend: Arc<dyn KvBackend>,
    key: String,
    token: String,
    ttl_secs: u64,
}

impl KvLock {
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Extend the TTL. Returns false when the lock was lost.
    pub async fn refresh(&self) -> KvResult<bool> {
        let refreshed = self
            .backend
            .refresh_lock(&self.key, &self.token, self.ttl_secs)
            .await?;
        if !refreshed {
            warn!(key = %self.key, "lock refresh failed: no longer the holder");
        }
        Ok(refreshed)
    }

    /// Delete the lock if still owned.
    pub async fn release(&self) -> KvResult<bool> {
        self.backend.release_lock(&self.key, &self.token).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Item {
        id: u32,
    }

    #[tokio::test]
    async fn typed_round_trip_and_miss_on_schema_change() {
        let kv = KvStore::memory();
        kv.set_one("item:1", &Item { id: 7 }, Some(60)).await.unwrap();
        assert_eq!(kv.get::<Item>("item:1").await.unwrap(), Some(Item { id: 7 }));

        // Overwrite with an incompatible shape: typed read misses, not errors.
        kv.set_one("item:1", &"garbage".to_string(), Some(60))
            .await
            .unwrap();
        assert_eq!(kv.get::<Item>("item:1").await.unwrap(), None);
    }

    #[tokio::test]
    async fn list_ops_preserve_queue_order() {
        let kv = KvStore::memory();
        kv.lpush("queue", &1u32, 600).await.unwrap();
        kv.lpush("queue", &2u32, 600).await.unwrap();
        kv.lpush("queue", &3u32, 600).await.unwrap();

        // LPUSH + RPOP is a FIFO queue.
        assert_eq!(kv.rpop::<u32>("queue").await.unwrap(), Some(1));
        assert_eq!(kv.rpop::<u32>("queue").await.unwrap(), Some(2));
        assert_eq!(kv.rpop::<u32>("queue").await.unwrap(), Some(3));
        assert_eq!(kv.rpop::<u32>("queue").await.unwrap(), None);
    }

    #[tokio::test]
    async fn brpop_returns_early_when_value_arrives() {
        let kv = KvStore::memory();
        let producer = kv.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            producer.lpush("inbox", &"ping".to_string(), 600).await.unwrap();
        });

        let started = std::time::Instant::now();
        let value: Option<String> = kv.brpop("inbox", 5).await.unwrap();
        assert_eq!(value, Some("ping".to_string()));
        assert!(started.elapsed() < Duration::from_secs(3));
    }

    #[tokio::test]
    async fn locks_are_exclusive_until_released() {
        let kv = KvStore::memory();
        let lock = kv.acquire_lock("workspace:lock:test", 120).await.unwrap();
        let lock = lock.expect("first acquisition succeeds");

        assert!(kv.acquire_lock("workspace:lock:test", 120).await.unwrap().is_none());
        assert!(lock.refresh().await.unwrap());
        assert!(lock.release().await.unwrap());

        assert!(kv.acquire_lock("workspace:lock:test", 120).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn smove_transfers_membership() {
        let kv = KvStore::memory();
        kv.sadd("pending", &"svc-a".to_string()).await.unwrap();
        assert!(kv.smove("pending", "active", &"svc-a".to_string()).await.unwrap());
        assert!(!kv.smove("pending", "active", &"svc-a".to_string()).await.unwrap());
        let members: Vec<String> = kv.smembers("active").await.unwrap();
        assert_eq!(members, vec!["svc-a".to_string()]);
    }
}
