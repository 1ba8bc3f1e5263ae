//! Redis backend — the production path.
//!
//! Uses a `ConnectionManager` so transient connection drops reconnect
//! transparently. Native blocking pops are raced against the process-wide
//! stopping signal, since the transport call itself cannot be cancelled.

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tracing::info;

use confab_core::shutdown;

use crate::store::{KvBackend, ListEnd};
use crate::KvResult;

const SCRIPT_REFRESH_LOCK: &str = r"
if redis.call('get', KEYS[1]) == ARGV[1] then
  return redis.call('expire', KEYS[1], ARGV[2])
else
  return 0
end";

const SCRIPT_RELEASE_LOCK: &str = r"
if redis.call('get', KEYS[1]) == ARGV[1] then
  return redis.call('del', KEYS[1])
else
  return 0
end";

pub struct RedisBackend {
    manager: ConnectionManager,
}

impl RedisBackend {
    pub async fn connect(url: &str) -> KvResult<Self> {
        let client = redis::Client::open(url)?;
        let manager = client.get_connection_manager().await?;

        // Validate the connection before handing the backend out.
        let mut conn = manager.clone();
        redis::cmd("PING").query_async::<String>(&mut conn).await?;
        info!("connected to Redis");

        Ok(Self { manager })
    }

    fn conn(&self) -> ConnectionManager {
        self.manager.clone()
    }
}

fn end_arg(end: ListEnd) -> &'static str {
    match end {
        ListEnd::Left => "LEFT",
        ListEnd::Right => "RIGHT",
    }
}

#[async_trait]
impl KvBackend for RedisBackend {
    async fn get(&self, key: &str) -> KvResult<Option<String>> {
        Ok(self.conn().get(key).await?)
    }

    async fn mget(&self, keys: &[String]) -> KvResult<Vec<Option<String>>> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        Ok(redis::cmd("MGET")
            .arg(keys)
            .query_async(&mut self.conn())
            .await?)
    }

    async fn set(&self, key: &str, value: String, ex: Option<u64>) -> KvResult<()> {
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value);
        if let Some(ex) = ex {
            cmd.arg("EX").arg(ex);
        }
        cmd.query_async::<()>(&mut self.conn()).await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> KvResult<()> {
        self.conn().del::<_, ()>(key).await?;
        Ok(())
    }

    async fn exists(&self, key: &str) -> KvResult<bool> {
        Ok(self.conn().exists(key).await?)
    }

    async fn expire(&self, key: &str, ex: u64) -> KvResult<bool> {
        Ok(self.conn().expire(key, ex as i64).await?)
    }

    async fn hget(&self, key: &str, field: &str) -> KvResult<Option<String>> {
        Ok(self.conn().hget(key, field).await?)
    }

    async fn hset(&self, key: &str, field: &str, value: String, ex: Option<u64>) -> KvResult<()> {
        self.conn().hset::<_, _, _, ()>(key, field, value).await?;
        if let Some(ex) = ex {
            self.expire(key, ex).await?;
        }
        Ok(())
    }

    async fn hgetall(&self, key: &str) -> KvResult<Vec<(String, String)>> {
        Ok(self.conn().hgetall(key).await?)
    }

    async fn hdel(&self, key: &str, field: &str) -> KvResult<()> {
        self.conn().hdel::<_, _, ()>(key, field).await?;
        Ok(())
    }

    async fn lpush(&self, key: &str, value: String, ex: u64) -> KvResult<()> {
        self.conn().lpush::<_, _, ()>(key, value).await?;
        self.expire(key, ex).await?;
        Ok(())
    }

    async fn rpush(&self, key: &str, value: String, ex: u64) -> KvResult<()> {
        self.conn().rpush::<_, _, ()>(key, value).await?;
        self.expire(key, ex).await?;
        Ok(())
    }

    async fn lpop(&self, key: &str) -> KvResult<Option<String>> {
        Ok(self.conn().lpop(key, None).await?)
    }

    async fn rpop(&self, key: &str) -> KvResult<Option<String>> {
        Ok(self.conn().rpop(key, None).await?)
    }

    async fn lrange(&self, key: &str, start: i64, end: i64) -> KvResult<Vec<String>> {
        Ok(self
            .conn()
            .lrange(key, start as isize, end as isize)
            .await?)
    }

    async fn lrem(&self, key: &str, value: &str) -> KvResult<()> {
        self.conn().lrem::<_, _, ()>(key, 1, value).await?;
        Ok(())
    }

    async fn lmove(
        &self,
        source_key: &str,
        target_key: &str,
        source_end: ListEnd,
        target_end: ListEnd,
    ) -> KvResult<Option<String>> {
        Ok(redis::cmd("LMOVE")
            .arg(source_key)
            .arg(target_key)
            .arg(end_arg(source_end))
            .arg(end_arg(target_end))
            .query_async(&mut self.conn())
            .await?)
    }

    async fn sadd(&self, key: &str, value: String) -> KvResult<()> {
        self.conn().sadd::<_, _, ()>(key, value).await?;
        Ok(())
    }

    async fn smembers(&self, key: &str) -> KvResult<Vec<String>> {
        Ok(self.conn().smembers(key).await?)
    }

    async fn srem(&self, key: &str, value: &str) -> KvResult<()> {
        self.conn().srem::<_, _, ()>(key, value).await?;
        Ok(())
    }

    async fn smove(&self, source_key: &str, target_key: &str, value: &str) -> KvResult<bool> {
        Ok(redis::cmd("SMOVE")
            .arg(source_key)
            .arg(target_key)
            .arg(value)
            .query_async(&mut self.conn())
            .await?)
    }

    async fn spop(&self, key: &str) -> KvResult<Option<String>> {
        Ok(self.conn().spop(key).await?)
    }

    async fn try_lock(&self, key: &str, token: &str, ttl_secs: u64) -> KvResult<bool> {
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(token)
            .arg("NX")
            .arg("EX")
            .arg(ttl_secs)
            .query_async(&mut self.conn())
            .await?;
        Ok(reply.is_some())
    }

    async fn refresh_lock(&self, key: &str, token: &str, ttl_secs: u64) -> KvResult<bool> {
        let refreshed: i64 = redis::Script::new(SCRIPT_REFRESH_LOCK)
            .key(key)
            .arg(token)
            .arg(ttl_secs)
            .invoke_async(&mut self.conn())
            .await?;
        Ok(refreshed == 1)
    }

    async fn release_lock(&self, key: &str, token: &str) -> KvResult<bool> {
        let released: i64 = redis::Script::new(SCRIPT_RELEASE_LOCK)
            .key(key)
            .arg(token)
            .invoke_async(&mut self.conn())
            .await?;
        Ok(released == 1)
    }

    async fn blpop(&self, key: &str, timeout_secs: u64) -> KvResult<Option<String>> {
        let mut conn = self.conn();
        let request = async {
            redis::cmd("BLPOP")
                .arg(key)
                .arg(timeout_secs)
                .query_async::<Option<(String, String)>>(&mut conn)
                .await
        };
        match shutdown::with_timeout(request, None).await {
            Ok(reply) => Ok(reply?.map(|(_, value)| value)),
            Err(_) => Ok(None), // Stopping: the abandoned pop times out server-side.
        }
    }

    async fn brpop(&self, key: &str, timeout_secs: u64) -> KvResult<Option<String>> {
        let mut conn = self.conn();
        let request = async {
            redis::cmd("BRPOP")
                .arg(key)
                .arg(timeout_secs)
                .query_async::<Option<(String, String)>>(&mut conn)
                .await
        };
        match shutdown::with_timeout(request, None).await {
            Ok(reply) => Ok(reply?.map(|(_, value)| value)),
            Err(_) => Ok(None),
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
        let mut conn = self.conn();
        let request = async {
            redis::cmd("BLMOVE")
                .arg(source_key)
                .arg(target_key)
                .arg(end_arg(source_end))
                .arg(end_arg(target_end))
                .arg(timeout_secs)
                .query_async::<Option<String>>(&mut conn)
                .await
        };
        match shutdown::with_timeout(request, None).await {
            Ok(reply) => Ok(reply?),
            Err(_) => Ok(None),
        }
    }
}
