use crate::models::{from_millis, LockRecord};
use crate::storage::LockStore;
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Script};
use std::collections::HashMap;
use std::str::FromStr;

/// KEYS[1] = 租约 hash，KEYS[2] = 新 id 索引
/// ARGV = id, job_name, locked_by, locked_at_ms, expires_at_ms, heartbeat_at_ms, id 索引前缀
const UPSERT_SCRIPT: &str = r#"
local current = redis.call('HGET', KEYS[1], 'expires_at_ms')
if current and tonumber(current) >= tonumber(ARGV[4]) then
  return 0
end
local previous = redis.call('HGET', KEYS[1], 'id')
if previous then
  redis.call('DEL', ARGV[7] .. previous)
end
redis.call('HSET', KEYS[1],
  'id', ARGV[1],
  'job_name', ARGV[2],
  'locked_by', ARGV[3],
  'locked_at_ms', ARGV[4],
  'expires_at_ms', ARGV[5],
  'heartbeat_at_ms', ARGV[6])
redis.call('SET', KEYS[2], ARGV[2])
redis.call('PEXPIREAT', KEYS[1], ARGV[5])
redis.call('PEXPIREAT', KEYS[2], ARGV[5])
return 1
"#;

/// KEYS[1] = id 索引；ARGV[1] = id，ARGV[2] = 租约 hash 前缀
const DELETE_SCRIPT: &str = r#"
local job_name = redis.call('GET', KEYS[1])
if not job_name then
  return 0
end
redis.call('DEL', KEYS[1])
local lock_key = ARGV[2] .. job_name
if redis.call('HGET', lock_key, 'id') == ARGV[1] then
  redis.call('DEL', lock_key)
  return 1
end
return 0
"#;

/// KEYS[1] = id 索引；ARGV[1] = id，ARGV[2] = 租约 hash 前缀，
/// ARGV[3] = heartbeat_at_ms，ARGV[4] = 新 expires_at_ms（空串表示不续约）
const TOUCH_SCRIPT: &str = r#"
local job_name = redis.call('GET', KEYS[1])
if not job_name then
  return 0
end
local lock_key = ARGV[2] .. job_name
if redis.call('HGET', lock_key, 'id') ~= ARGV[1] then
  return 0
end
redis.call('HSET', lock_key, 'heartbeat_at_ms', ARGV[3])
if ARGV[4] ~= '' then
  redis.call('HSET', lock_key, 'expires_at_ms', ARGV[4])
  redis.call('PEXPIREAT', lock_key, ARGV[4])
  redis.call('PEXPIREAT', KEYS[1], ARGV[4])
end
return 1
"#;

/// Redis 存储：每个 job 一个 hash，写操作都是单个 Lua 脚本
pub struct RedisStorage {
    client: ConnectionManager,
    prefix: String,
    upsert: Script,
    delete: Script,
    touch: Script,
}

impl RedisStorage {
    pub async fn new(
        redis_url: &str,
        username: Option<String>,
        password: Option<String>,
        db: Option<i64>,
        prefix: &str,
    ) -> Result<Self> {
        // 构建连接信息
        let mut connection_info = redis::ConnectionInfo::from_str(redis_url)?;

        // 设置认证信息
        if let Some(pwd) = password {
            connection_info.redis.password = Some(pwd);
        }
        if let Some(user) = username {
            connection_info.redis.username = Some(user);
        }
        if let Some(database) = db {
            connection_info.redis.db = database;
        }

        let client = redis::Client::open(connection_info)?;
        let connection = ConnectionManager::new(client).await?;
        Ok(Self {
            client: connection,
            prefix: prefix.to_string(),
            upsert: Script::new(UPSERT_SCRIPT),
            delete: Script::new(DELETE_SCRIPT),
            touch: Script::new(TOUCH_SCRIPT),
        })
    }

    fn lock_prefix(&self) -> String {
        format!("{}job:", self.prefix)
    }

    fn id_prefix(&self) -> String {
        format!("{}id:", self.prefix)
    }

    fn get_lock_key(&self, job_name: &str) -> String {
        format!("{}{}", self.lock_prefix(), job_name)
    }

    fn get_lock_id_key(&self, lock_id: &str) -> String {
        format!("{}{}", self.id_prefix(), lock_id)
    }
}

fn record_from_hash(fields: HashMap<String, String>) -> Result<Option<LockRecord>> {
    if fields.is_empty() {
        return Ok(None);
    }
    let text = |name: &str| {
        fields
            .get(name)
            .cloned()
            .ok_or_else(|| anyhow!("lock hash missing field {name}"))
    };
    let timestamp = |name: &str| -> Result<DateTime<Utc>> {
        let ms: i64 = text(name)?.parse()?;
        from_millis(ms).ok_or_else(|| anyhow!("timestamp out of range in {name}: {ms}"))
    };
    Ok(Some(LockRecord {
        id: text("id")?,
        job_name: text("job_name")?,
        locked_by: text("locked_by")?,
        locked_at: timestamp("locked_at_ms")?,
        expires_at: timestamp("expires_at_ms")?,
        heartbeat_at: timestamp("heartbeat_at_ms")?,
    }))
}

#[async_trait]
impl LockStore for RedisStorage {
    async fn conditional_upsert(&self, candidate: LockRecord) -> Result<Option<LockRecord>> {
        let mut conn = self.client.clone();
        let written: i64 = self
            .upsert
            .key(self.get_lock_key(&candidate.job_name))
            .key(self.get_lock_id_key(&candidate.id))
            .arg(&candidate.id)
            .arg(&candidate.job_name)
            .arg(&candidate.locked_by)
            .arg(candidate.locked_at.timestamp_millis())
            .arg(candidate.expires_at.timestamp_millis())
            .arg(candidate.heartbeat_at.timestamp_millis())
            .arg(self.id_prefix())
            .invoke_async(&mut conn)
            .await?;

        Ok((written == 1).then_some(candidate))
    }

    async fn delete_expired(&self, _now: DateTime<Utc>) -> Result<u64> {
        // 键在 expires_at 时刻由 Redis 自动过期，无需手动清理
        Ok(0)
    }

    async fn delete_by_id(&self, id: &str) -> Result<bool> {
        let mut conn = self.client.clone();
        let removed: i64 = self
            .delete
            .key(self.get_lock_id_key(id))
            .arg(id)
            .arg(self.lock_prefix())
            .invoke_async(&mut conn)
            .await?;
        Ok(removed == 1)
    }

    async fn find_by_job_name(&self, job_name: &str) -> Result<Option<LockRecord>> {
        let mut conn = self.client.clone();
        let fields: HashMap<String, String> = conn.hgetall(self.get_lock_key(job_name)).await?;
        record_from_hash(fields)
    }

    async fn touch(
        &self,
        id: &str,
        heartbeat_at: DateTime<Utc>,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<bool> {
        let mut conn = self.client.clone();
        let expires_arg = expires_at
            .map(|t| t.timestamp_millis().to_string())
            .unwrap_or_default();
        let updated: i64 = self
            .touch
            .key(self.get_lock_id_key(id))
            .arg(id)
            .arg(self.lock_prefix())
            .arg(heartbeat_at.timestamp_millis())
            .arg(expires_arg)
            .invoke_async(&mut conn)
            .await?;
        Ok(updated == 1)
    }
}
