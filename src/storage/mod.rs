pub mod memory;
pub mod redis;
pub mod sqlite;

use crate::models::LockRecord;
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// 锁存储边界。每个方法都必须对应存储端的一次原子操作。
#[async_trait]
pub trait LockStore: Send + Sync {
    /// 条件写入：无记录则插入；已有记录且 `expires_at < candidate.locked_at` 则整行覆盖；
    /// 否则不写入并返回 None
    async fn conditional_upsert(&self, candidate: LockRecord) -> Result<Option<LockRecord>>;

    /// 删除所有 `expires_at < now` 的记录，返回删除条数
    async fn delete_expired(&self, now: DateTime<Utc>) -> Result<u64>;

    /// 按租约 id 删除，幂等
    async fn delete_by_id(&self, id: &str) -> Result<bool>;

    async fn find_by_job_name(&self, job_name: &str) -> Result<Option<LockRecord>>;

    /// 更新心跳时间；`expires_at` 为 Some 时同时续约
    async fn touch(
        &self,
        id: &str,
        heartbeat_at: DateTime<Utc>,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<bool>;
}
