//! RedisListStore - Redis による ListStore
//!
//! take_front は `MULTI; LRANGE 0 n-1; LTRIM n -1; EXEC` で読み出しと trim を
//! 1 トランザクションにまとめます。
//! push_unique は SADD の結果で RPUSH するかを決めるので、MULTI ではなく Lua スクリプトで実行します。

use async_trait::async_trait;
use redis::AsyncCommands;
use redis::aio::MultiplexedConnection;

use crate::ports::list_store::{ListStore, StoreError};

/// KEYS[1] = set, KEYS[2] = list, ARGV[1] = member, ARGV[2] = value
const PUSH_UNIQUE: &str = r"
if redis.call('SADD', KEYS[1], ARGV[1]) == 1 then
    redis.call('RPUSH', KEYS[2], ARGV[2])
    return 1
end
return 0
";

fn map_redis_error(err: redis::RedisError) -> StoreError {
    if err.is_io_error() || err.is_connection_dropped() || err.is_connection_refusal() || err.is_timeout() {
        StoreError::Connection(err.to_string())
    } else {
        StoreError::Command(err.to_string())
    }
}

#[derive(Clone)]
pub struct RedisListStore {
    conn: MultiplexedConnection,
    push_unique: redis::Script,
}

impl RedisListStore {
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let client = redis::Client::open(url).map_err(map_redis_error)?;
        let conn = client
            .get_multiplexed_async_connection()
            .await
            .map_err(map_redis_error)?;
        Ok(Self {
            conn,
            push_unique: redis::Script::new(PUSH_UNIQUE),
        })
    }
}

#[async_trait]
impl ListStore for RedisListStore {
    async fn push_unique(&self, set: &str, member: &str, list: &str, value: String) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        let added: i64 = self
            .push_unique
            .key(set)
            .key(list)
            .arg(member)
            .arg(value)
            .invoke_async(&mut conn)
            .await
            .map_err(map_redis_error)?;
        Ok(added == 1)
    }

    async fn remove_members(&self, set: &str, members: &[String]) -> Result<(), StoreError> {
        if members.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn.clone();
        let _: i64 = conn.srem(set, members).await.map_err(map_redis_error)?;
        Ok(())
    }

    async fn push_back(&self, list: &str, value: String) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let _: i64 = conn.rpush(list, value).await.map_err(map_redis_error)?;
        Ok(())
    }

    async fn len(&self, list: &str) -> Result<usize, StoreError> {
        let mut conn = self.conn.clone();
        let len: usize = conn.llen(list).await.map_err(map_redis_error)?;
        Ok(len)
    }

    async fn take_front(&self, list: &str, count: usize) -> Result<Vec<String>, StoreError> {
        if count == 0 {
            return Ok(Vec::new());
        }
        let end = isize::try_from(count).unwrap_or(isize::MAX);
        let mut conn = self.conn.clone();
        let (items,): (Vec<String>,) = redis::pipe()
            .atomic()
            .lrange(list, 0, end - 1)
            .ltrim(list, end, -1)
            .ignore()
            .query_async(&mut conn)
            .await
            .map_err(map_redis_error)?;
        Ok(items)
    }
}
