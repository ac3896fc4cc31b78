use crate::models::LockRecord;
use crate::storage::LockStore;
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::path::PathBuf;
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

/// 单进程内存存储。DashMap 的 entry 持有分片写锁，保证条件写入的原子性。
pub struct MemoryStorage {
    locks: DashMap<String, LockRecord>,  // job_name -> LockRecord
    lock_by_id: DashMap<String, String>, // lock_id -> job_name
    persist_path: Option<PathBuf>,
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self {
            locks: DashMap::new(),
            lock_by_id: DashMap::new(),
            persist_path: None,
        }
    }

    pub fn with_persistence(persist_path: PathBuf) -> Self {
        Self {
            locks: DashMap::new(),
            lock_by_id: DashMap::new(),
            persist_path: Some(persist_path),
        }
    }

    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }

    /// 从磁盘加载数据，只恢复未过期的租约
    pub async fn load_from_disk(&self) -> Result<usize> {
        let path = match &self.persist_path {
            Some(p) => p,
            None => return Ok(0),
        };

        if !path.exists() {
            log::info!("[PERSISTENCE] No snapshot found at {:?}", path);
            return Ok(0);
        }

        let mut file = fs::File::open(path).await?;
        let mut contents = String::new();
        file.read_to_string(&mut contents).await?;

        let records: Vec<LockRecord> = serde_json::from_str(&contents)?;
        let now = crate::models::now();
        let mut loaded_count = 0;

        for record in records {
            if record.is_expired_at(now) {
                continue;
            }
            self.lock_by_id
                .insert(record.id.clone(), record.job_name.clone());
            self.locks.insert(record.job_name.clone(), record);
            loaded_count += 1;
        }

        log::info!(
            "[PERSISTENCE] Loaded {} leases from disk (file: {:?})",
            loaded_count,
            path
        );
        Ok(loaded_count)
    }

    /// 持久化数据到磁盘
    pub async fn persist_to_disk(&self) -> Result<usize> {
        let path = match &self.persist_path {
            Some(p) => p,
            None => return Ok(0),
        };

        let records: Vec<LockRecord> = self
            .locks
            .iter()
            .map(|entry| entry.value().clone())
            .collect();

        let count = records.len();
        let json = serde_json::to_string_pretty(&records)?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }

        // 写入临时文件，然后重命名（原子操作）
        let temp_path = path.with_extension("tmp");
        let mut file = fs::File::create(&temp_path).await?;
        file.write_all(json.as_bytes()).await?;
        file.sync_all().await?;
        fs::rename(temp_path, path).await?;

        log::debug!(
            "[PERSISTENCE] Persisted {} leases to disk (file: {:?})",
            count,
            path
        );
        Ok(count)
    }
}

#[async_trait]
impl LockStore for MemoryStorage {
    async fn conditional_upsert(&self, candidate: LockRecord) -> Result<Option<LockRecord>> {
        let now = candidate.locked_at;

        match self.locks.entry(candidate.job_name.clone()) {
            Entry::Occupied(mut entry) => {
                if !entry.get().is_expired_at(now) {
                    return Ok(None);
                }
                let previous = entry.insert(candidate.clone());
                self.lock_by_id.remove(&previous.id);
                log::info!(
                    "[EXPIRED] Reclaimed lease - job_name: {}, previous_lock_id: {}, previous_holder: {}, expired_at: {}",
                    previous.job_name,
                    previous.id,
                    previous.locked_by,
                    previous.expires_at
                );
            }
            Entry::Vacant(entry) => {
                entry.insert(candidate.clone());
            }
        }

        self.lock_by_id
            .insert(candidate.id.clone(), candidate.job_name.clone());
        Ok(Some(candidate))
    }

    async fn delete_expired(&self, now: DateTime<Utc>) -> Result<u64> {
        // 先收集再删除，删除时重新校验，避免误删刚被重新获取的租约
        let expired: Vec<String> = self
            .locks
            .iter()
            .filter(|entry| entry.value().is_expired_at(now))
            .map(|entry| entry.key().clone())
            .collect();

        let mut removed = 0;
        for job_name in expired {
            if let Some((_, record)) = self
                .locks
                .remove_if(&job_name, |_, record| record.is_expired_at(now))
            {
                self.lock_by_id.remove(&record.id);
                log::info!(
                    "[EXPIRED CLEANUP] Removed expired lease - lock_id: {}, job_name: {}, locked_by: {}, expires_at: {}",
                    record.id,
                    record.job_name,
                    record.locked_by,
                    record.expires_at
                );
                removed += 1;
            }
        }

        Ok(removed)
    }

    async fn delete_by_id(&self, id: &str) -> Result<bool> {
        let job_name = match self.lock_by_id.remove(id) {
            Some((_, job_name)) => job_name,
            None => return Ok(false),
        };

        Ok(self
            .locks
            .remove_if(&job_name, |_, record| record.id == id)
            .is_some())
    }

    async fn find_by_job_name(&self, job_name: &str) -> Result<Option<LockRecord>> {
        Ok(self.locks.get(job_name).map(|entry| entry.value().clone()))
    }

    async fn touch(
        &self,
        id: &str,
        heartbeat_at: DateTime<Utc>,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<bool> {
        let job_name = match self.lock_by_id.get(id) {
            Some(entry) => entry.value().clone(),
            None => return Ok(false),
        };

        if let Some(mut record) = self.locks.get_mut(&job_name) {
            if record.id == id {
                record.heartbeat_at = heartbeat_at;
                if let Some(expires_at) = expires_at {
                    record.expires_at = expires_at;
                }
                return Ok(true);
            }
        }
        Ok(false)
    }
}
