use crate::models::{from_millis, LockRecord};
use crate::storage::LockStore;
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;
use std::sync::Arc;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS job_locks (
  id TEXT PRIMARY KEY,
  job_name TEXT NOT NULL UNIQUE,
  locked_by TEXT NOT NULL,
  locked_at_ms INTEGER NOT NULL,
  expires_at_ms INTEGER NOT NULL,
  heartbeat_at_ms INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_job_locks_expires_at ON job_locks(expires_at_ms);
"#;

const COLUMNS: &str = "id, job_name, locked_by, locked_at_ms, expires_at_ms, heartbeat_at_ms";

/// 关系型存储。条件写入是一条 `INSERT ... ON CONFLICT ... DO UPDATE ... WHERE` 语句。
pub struct SqliteStorage {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStorage {
    /// 打开（或创建）数据库文件并建表
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        conn.execute_batch(
            r#"
            PRAGMA journal_mode=WAL;
            PRAGMA synchronous=NORMAL;
            PRAGMA busy_timeout=5000;
            "#,
        )?;
        Self::from_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// 在阻塞线程池上执行一次数据库调用
    async fn with_conn<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> rusqlite::Result<T> + Send + 'static,
    {
        let conn = self.conn.clone();
        let value = tokio::task::spawn_blocking(move || {
            let conn = conn.lock();
            f(&conn)
        })
        .await??;
        Ok(value)
    }
}

fn read_row(row: &Row<'_>) -> rusqlite::Result<(String, String, String, i64, i64, i64)> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
    ))
}

fn into_record(
    (id, job_name, locked_by, locked_at_ms, expires_at_ms, heartbeat_at_ms): (
        String,
        String,
        String,
        i64,
        i64,
        i64,
    ),
) -> Result<LockRecord> {
    let timestamp =
        |ms: i64| from_millis(ms).ok_or_else(|| anyhow!("timestamp out of range: {ms}"));
    Ok(LockRecord {
        id,
        job_name,
        locked_by,
        locked_at: timestamp(locked_at_ms)?,
        expires_at: timestamp(expires_at_ms)?,
        heartbeat_at: timestamp(heartbeat_at_ms)?,
    })
}

#[async_trait]
impl LockStore for SqliteStorage {
    async fn conditional_upsert(&self, candidate: LockRecord) -> Result<Option<LockRecord>> {
        let sql = format!(
            r#"
            INSERT INTO job_locks({COLUMNS})
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            ON CONFLICT(job_name) DO UPDATE SET
              id = excluded.id,
              locked_by = excluded.locked_by,
              locked_at_ms = excluded.locked_at_ms,
              expires_at_ms = excluded.expires_at_ms,
              heartbeat_at_ms = excluded.heartbeat_at_ms
            WHERE job_locks.expires_at_ms < excluded.locked_at_ms
            RETURNING {COLUMNS}
            "#
        );
        let row = self
            .with_conn(move |conn| {
                conn.query_row(
                    &sql,
                    params![
                        candidate.id,
                        candidate.job_name,
                        candidate.locked_by,
                        candidate.locked_at.timestamp_millis(),
                        candidate.expires_at.timestamp_millis(),
                        candidate.heartbeat_at.timestamp_millis(),
                    ],
                    read_row,
                )
                .optional()
            })
            .await?;
        row.map(into_record).transpose()
    }

    async fn delete_expired(&self, now: DateTime<Utc>) -> Result<u64> {
        let now_ms = now.timestamp_millis();
        let removed = self
            .with_conn(move |conn| {
                conn.execute(
                    "DELETE FROM job_locks WHERE expires_at_ms < ?1",
                    params![now_ms],
                )
            })
            .await?;
        Ok(removed as u64)
    }

    async fn delete_by_id(&self, id: &str) -> Result<bool> {
        let id = id.to_string();
        let removed = self
            .with_conn(move |conn| conn.execute("DELETE FROM job_locks WHERE id = ?1", params![id]))
            .await?;
        Ok(removed > 0)
    }

    async fn find_by_job_name(&self, job_name: &str) -> Result<Option<LockRecord>> {
        let job_name = job_name.to_string();
        let sql = format!("SELECT {COLUMNS} FROM job_locks WHERE job_name = ?1");
        let row = self
            .with_conn(move |conn| conn.query_row(&sql, params![job_name], read_row).optional())
            .await?;
        row.map(into_record).transpose()
    }

    async fn touch(
        &self,
        id: &str,
        heartbeat_at: DateTime<Utc>,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<bool> {
        let id = id.to_string();
        let heartbeat_ms = heartbeat_at.timestamp_millis();
        let expires_ms = expires_at.map(|t| t.timestamp_millis());
        let updated = self
            .with_conn(move |conn| {
                conn.execute(
                    r#"
                    UPDATE job_locks
                    SET heartbeat_at_ms = ?2,
                        expires_at_ms = COALESCE(?3, expires_at_ms)
                    WHERE id = ?1
                    "#,
                    params![id, heartbeat_ms, expires_ms],
                )
            })
            .await?;
        Ok(updated > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::now;
    use chrono::Duration;

    fn lease(job_name: &str, holder: &str, timeout_ms: i64) -> LockRecord {
        LockRecord::candidate(job_name, holder, now(), Duration::milliseconds(timeout_ms))
    }

    #[tokio::test]
    async fn upsert_respects_live_lease_and_reclaims_expired() {
        let store = SqliteStorage::open_in_memory().unwrap();

        let first = lease("nightly-sync", "pod-a", 60_000);
        assert_eq!(
            store.conditional_upsert(first.clone()).await.unwrap(),
            Some(first.clone())
        );
        assert_eq!(
            store
                .conditional_upsert(lease("nightly-sync", "pod-b", 60_000))
                .await
                .unwrap(),
            None
        );

        // 把现有租约改为已过期
        assert!(store
            .touch(&first.id, first.locked_at, Some(first.locked_at - Duration::seconds(1)))
            .await
            .unwrap());

        let reclaim = lease("nightly-sync", "pod-b", 60_000);
        let stored = store.conditional_upsert(reclaim.clone()).await.unwrap();
        assert_eq!(stored, Some(reclaim.clone()));
        assert_eq!(
            store.find_by_job_name("nightly-sync").await.unwrap(),
            Some(reclaim)
        );
        assert!(!store.delete_by_id(&first.id).await.unwrap());
    }

    #[tokio::test]
    async fn delete_expired_counts_removed_rows() {
        let store = SqliteStorage::open_in_memory().unwrap();
        let mut stale = lease("stale", "pod-a", 1_000);
        stale.expires_at = stale.locked_at - Duration::seconds(1);
        store.conditional_upsert(stale).await.unwrap();
        store.conditional_upsert(lease("live", "pod-a", 60_000)).await.unwrap();

        assert_eq!(store.delete_expired(now()).await.unwrap(), 1);
        assert_eq!(store.delete_expired(now()).await.unwrap(), 0);
        assert!(store.find_by_job_name("live").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn touch_without_deadline_keeps_expiry() {
        let store = SqliteStorage::open_in_memory().unwrap();
        let record = lease("job", "pod-a", 5_000);
        store.conditional_upsert(record.clone()).await.unwrap();

        let later = record.locked_at + Duration::milliseconds(250);
        assert!(store.touch(&record.id, later, None).await.unwrap());
        let row = store.find_by_job_name("job").await.unwrap().unwrap();
        assert_eq!(row.heartbeat_at, later);
        assert_eq!(row.expires_at, record.expires_at);

        assert!(store.delete_by_id(&record.id).await.unwrap());
        assert!(!store.touch(&record.id, later, None).await.unwrap());
    }

    #[tokio::test]
    async fn file_backed_store_is_shared_between_handles() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("locks.db");
        let pod_a = SqliteStorage::open(&path).unwrap();
        let pod_b = SqliteStorage::open(&path).unwrap();

        let record = lease("nightly-sync", "pod-a", 60_000);
        assert!(pod_a.conditional_upsert(record.clone()).await.unwrap().is_some());
        assert!(pod_b
            .conditional_upsert(lease("nightly-sync", "pod-b", 60_000))
            .await
            .unwrap()
            .is_none());
        assert_eq!(
            pod_b.find_by_job_name("nightly-sync").await.unwrap(),
            Some(record)
        );
    }
}
