//! Redis 集合实现的在线状态存储
//!
//! 在线集合之外用一个哈希记录每个用户在全部实例上的连接数，
//! 计数与集合成员通过 Lua 脚本一起修改。

use application::{connection_count_key, PresenceStore, PresenceStoreError};
use async_trait::async_trait;
use redis::{aio::ConnectionManager, AsyncCommands, Client, Script};

/// KEYS[1] = 在线集合，KEYS[2] = 连接计数哈希，ARGV[1] = 成员
///
/// 返回加一后的计数
const ACQUIRE_SCRIPT: &str = r#"
    local total = redis.call('HINCRBY', KEYS[2], ARGV[1], 1)
    redis.call('SADD', KEYS[1], ARGV[1])
    return total
"#;

/// KEYS[1] = 在线集合，KEYS[2] = 连接计数哈希，ARGV[1] = 成员，ARGV[2] = 释放数量
///
/// 返回剩余计数，归零时同时移出集合
const RELEASE_SCRIPT: &str = r#"
    local remaining = redis.call('HINCRBY', KEYS[2], ARGV[1], -tonumber(ARGV[2]))
    if remaining <= 0 then
        redis.call('HDEL', KEYS[2], ARGV[1])
        redis.call('SREM', KEYS[1], ARGV[1])
        return 0
    end
    return remaining
"#;

/// KEYS[1] = 在线集合，KEYS[2] = 连接计数哈希，ARGV[1] = 成员
const REMOVE_SCRIPT: &str = r#"
    redis.call('HDEL', KEYS[2], ARGV[1])
    return redis.call('SREM', KEYS[1], ARGV[1])
"#;

/// 基于 `ConnectionManager` 的集合存储，断线后自动重连
#[derive(Clone)]
pub struct RedisPresenceStore {
    connection: ConnectionManager,
}

impl RedisPresenceStore {
    pub fn new(connection: ConnectionManager) -> Self {
        Self { connection }
    }

    pub async fn connect(redis_url: &str) -> Result<Self, redis::RedisError> {
        let client = Client::open(redis_url)?;
        let connection = client.get_connection_manager().await?;
        Ok(Self::new(connection))
    }

    async fn run_script(
        &self,
        operation: &str,
        source: &str,
        key: &str,
        member: &str,
        extra: Option<u64>,
    ) -> Result<i64, PresenceStoreError> {
        let mut conn = self.connection.clone();
        let script = Script::new(source);
        let mut invocation = script.key(key);
        invocation.key(connection_count_key(key)).arg(member);
        if let Some(value) = extra {
            invocation.arg(value);
        }
        invocation
            .invoke_async(&mut conn)
            .await
            .map_err(|err| unavailable(operation, err))
    }
}

fn unavailable(operation: &str, err: redis::RedisError) -> PresenceStoreError {
    PresenceStoreError::unavailable(format!("redis {operation} failed: {err}"))
}

#[async_trait]
impl PresenceStore for RedisPresenceStore {
    async fn add_member(&self, key: &str, member: &str) -> Result<(), PresenceStoreError> {
        let mut conn = self.connection.clone();
        conn.sadd::<_, _, ()>(key, member)
            .await
            .map_err(|err| unavailable("SADD", err))
    }

    async fn remove_member(&self, key: &str, member: &str) -> Result<(), PresenceStoreError> {
        self.run_script("remove script", REMOVE_SCRIPT, key, member, None)
            .await
            .map(|_| ())
    }

    async fn members(&self, key: &str) -> Result<Vec<String>, PresenceStoreError> {
        let mut conn = self.connection.clone();
        conn.smembers::<_, Vec<String>>(key)
            .await
            .map_err(|err| unavailable("SMEMBERS", err))
    }

    async fn acquire_member(&self, key: &str, member: &str) -> Result<u64, PresenceStoreError> {
        let total = self
            .run_script("acquire script", ACQUIRE_SCRIPT, key, member, None)
            .await?;
        Ok(total.max(0) as u64)
    }

    async fn release_member(
        &self,
        key: &str,
        member: &str,
        count: u64,
    ) -> Result<u64, PresenceStoreError> {
        let remaining = self
            .run_script("release script", RELEASE_SCRIPT, key, member, Some(count))
            .await?;
        Ok(remaining.max(0) as u64)
    }
}
