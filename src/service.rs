//! Lease-based job locks on top of a [`LockStore`].
//!
//! One `LockService` is built per process and shared by cloning. Acquisition
//! is decided entirely by the store's conditional upsert; contention is
//! reported as `None`, never as an error.

use crate::error::{LockError, LockResult};
use crate::heartbeat::{HeartbeatRegistry, HeartbeatTask};
use crate::models::{self, AcquireOptions, LockRecord, LockStatus};
use crate::storage::LockStore;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5 * 60);
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// 进程级标识，服务构造时生成一次
pub fn generate_instance_id() -> String {
    let id = Uuid::new_v4().simple().to_string();
    format!("pod-{}", &id[..8])
}

/// 服务默认参数
#[derive(Debug, Clone)]
pub struct LockSettings {
    pub instance_id: String,
    pub default_timeout: Duration,
    pub heartbeat_interval: Duration,
    pub renew_on_heartbeat: bool,
}

impl Default for LockSettings {
    fn default() -> Self {
        Self {
            instance_id: generate_instance_id(),
            default_timeout: DEFAULT_TIMEOUT,
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            renew_on_heartbeat: false,
        }
    }
}

#[derive(Clone)]
pub struct LockService {
    store: Arc<dyn LockStore>,
    heartbeats: Arc<HeartbeatRegistry>,
    settings: Arc<LockSettings>,
}

impl LockService {
    pub fn new(store: Arc<dyn LockStore>, settings: LockSettings) -> Self {
        Self {
            heartbeats: Arc::new(HeartbeatRegistry::new(store.clone())),
            store,
            settings: Arc::new(settings),
        }
    }

    pub fn instance_id(&self) -> &str {
        &self.settings.instance_id
    }

    pub fn settings(&self) -> &LockSettings {
        &self.settings
    }

    pub fn active_heartbeats(&self) -> usize {
        self.heartbeats.len()
    }

    /// 申请锁。竞争失败或无法确认获取成功时返回 None。
    pub async fn acquire_lock(
        &self,
        job_name: &str,
        options: AcquireOptions,
    ) -> Option<AcquiredLock> {
        let instance_id = options
            .instance_id
            .unwrap_or_else(|| self.settings.instance_id.clone());
        let timeout = options.timeout.unwrap_or(self.settings.default_timeout);
        let interval = options
            .heartbeat_interval
            .unwrap_or(self.settings.heartbeat_interval);
        let renew = options
            .renew_on_heartbeat
            .unwrap_or(self.settings.renew_on_heartbeat);

        let lease = match lease_duration(timeout) {
            Ok(lease) => lease,
            Err(e) => {
                log::error!(
                    "[ACQUIRE] Rejected lock request - job_name: {}, instance_id: {}, error: {}",
                    job_name,
                    instance_id,
                    e
                );
                return None;
            }
        };

        self.sweep_expired().await;

        let candidate = LockRecord::candidate(job_name, &instance_id, models::now(), lease);
        let record = match self.store.conditional_upsert(candidate).await {
            Ok(Some(record)) => record,
            Ok(None) => {
                log::debug!(
                    "[CONTENTION] Lock held elsewhere - job_name: {}, instance_id: {}",
                    job_name,
                    instance_id
                );
                return None;
            }
            Err(e) => {
                log::error!(
                    "[ACQUIRE] Store failure, treating as not acquired - job_name: {}, instance_id: {}, error: {}",
                    job_name,
                    instance_id,
                    e
                );
                return None;
            }
        };

        if record.locked_by != instance_id {
            log::warn!(
                "[CONTENTION] Lost race - job_name: {}, instance_id: {}, holder: {}, lock_id: {}",
                job_name,
                instance_id,
                record.locked_by,
                record.id
            );
            return None;
        }

        log::info!(
            "[ACQUIRE SUCCESS] Lock acquired - lock_id: {}, job_name: {}, instance_id: {}, expires_at: {}",
            record.id,
            record.job_name,
            instance_id,
            record.expires_at
        );

        let renew_for = renew.then_some(lease);
        if options.background_heartbeat.unwrap_or(true) {
            self.heartbeats.start(HeartbeatTask {
                lock_id: record.id.clone(),
                job_name: record.job_name.clone(),
                instance_id: instance_id.clone(),
                interval,
                renew_for,
            });
        }

        Some(AcquiredLock {
            record,
            renew_for,
            store: self.store.clone(),
            heartbeats: self.heartbeats.clone(),
            released: AtomicBool::new(false),
        })
    }

    /// 在锁保护下执行 `work`，无论结果如何都会释放锁。
    /// 锁被占用时返回 None；释放失败只记录日志，租约到期后自然回收。
    /// `work` panic 或本 future 被取消时，由 `AcquiredLock` 的 Drop 兜底释放。
    pub async fn with_lock<F, Fut, T>(
        &self,
        job_name: &str,
        options: AcquireOptions,
        work: F,
    ) -> Option<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let lock = self.acquire_lock(job_name, options).await?;
        let output = work().await;
        if let Err(e) = lock.release().await {
            log::error!(
                "[RELEASE] Scoped release failed, lease will expire - lock_id: {}, job_name: {}, error: {}",
                lock.lock_id(),
                job_name,
                e
            );
        }
        Some(output)
    }

    /// 按租约 id 释放，幂等；永远不会按 job_name 删除
    pub async fn release(&self, lock_id: &str) -> LockResult<bool> {
        release_lease(&*self.store, &self.heartbeats, lock_id).await
    }

    /// 只更新 heartbeat_at，不修改 expires_at
    pub async fn update_heartbeat(&self, lock_id: &str) -> LockResult<bool> {
        touch_lease(&*self.store, lock_id, None).await
    }

    /// 更新心跳并把 expires_at 推迟到 now + timeout
    pub async fn renew_lease(&self, lock_id: &str, timeout: Duration) -> LockResult<bool> {
        let lease = lease_duration(timeout)?;
        touch_lease(&*self.store, lock_id, Some(lease)).await
    }

    pub async fn is_locked(&self, job_name: &str) -> LockResult<bool> {
        Ok(self.get_lock_info(job_name).await?.is_locked)
    }

    pub async fn get_lock_info(&self, job_name: &str) -> LockResult<LockStatus> {
        self.sweep_expired().await;
        let record = self
            .store
            .find_by_job_name(job_name)
            .await
            .map_err(|e| LockError::store("find_by_job_name", e))?;

        // Redis 等存储可能在清理前仍能读到刚过期的行
        Ok(match record {
            Some(record) if !record.is_expired() => LockStatus::from_record(record),
            _ => LockStatus::unlocked(job_name),
        })
    }

    /// 清理过期租约，失败只记录日志
    pub async fn sweep_expired(&self) -> u64 {
        match self.store.delete_expired(models::now()).await {
            Ok(removed) => {
                if removed > 0 {
                    log::info!(
                        "[CLEANUP] Removed {} expired leases - instance_id: {}",
                        removed,
                        self.settings.instance_id
                    );
                }
                removed
            }
            Err(e) => {
                log::warn!(
                    "[CLEANUP] Failed to sweep expired leases - instance_id: {}, error: {}",
                    self.settings.instance_id,
                    e
                );
                0
            }
        }
    }

    /// 进程退出钩子：停止所有心跳，不修改已持久化的租约
    pub fn cleanup(&self) -> usize {
        let stopped = self.heartbeats.stop_all();
        log::info!(
            "[CLEANUP] Stopped {} heartbeat timers - instance_id: {}",
            stopped,
            self.settings.instance_id
        );
        stopped
    }
}

/// 成功获取的锁句柄。
///
/// 未释放就被丢弃时（panic、future 取消），停止心跳并在当前 tokio 运行时上
/// 异步按 id 删除租约；没有运行时则留给 expires_at 回收。
/// 远端持有者的租约用 [`AcquiredLock::detach`] 交出。
pub struct AcquiredLock {
    record: LockRecord,
    renew_for: Option<chrono::Duration>,
    store: Arc<dyn LockStore>,
    heartbeats: Arc<HeartbeatRegistry>,
    released: AtomicBool,
}

impl std::fmt::Debug for AcquiredLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AcquiredLock")
            .field("record", &self.record)
            .field("released", &self.released.load(Ordering::Relaxed))
            .finish()
    }
}

impl AcquiredLock {
    pub fn lock_id(&self) -> &str {
        &self.record.id
    }

    pub fn job_name(&self) -> &str {
        &self.record.job_name
    }

    pub fn locked_by(&self) -> &str {
        &self.record.locked_by
    }

    /// 获取时写入的记录
    pub fn record(&self) -> &LockRecord {
        &self.record
    }

    /// 释放锁。同一句柄重复调用返回 Ok(false)；存储失败时可重试。
    pub async fn release(&self) -> LockResult<bool> {
        if self.released.swap(true, Ordering::AcqRel) {
            return Ok(false);
        }
        let result = release_lease(&*self.store, &self.heartbeats, &self.record.id).await;
        if result.is_err() {
            self.released.store(false, Ordering::Release);
        }
        result
    }

    pub async fn update_heartbeat(&self) -> LockResult<bool> {
        touch_lease(&*self.store, &self.record.id, self.renew_for).await
    }

    /// 交出租约：停止本进程心跳，保留存储中的记录，丢弃句柄时不再删除
    pub fn detach(self) -> LockRecord {
        self.released.store(true, Ordering::Release);
        self.heartbeats.stop(&self.record.id);
        self.record.clone()
    }
}

impl Drop for AcquiredLock {
    fn drop(&mut self) {
        if self.released.load(Ordering::Acquire) {
            return;
        }
        self.heartbeats.stop(&self.record.id);

        let runtime = match tokio::runtime::Handle::try_current() {
            Ok(runtime) => runtime,
            Err(_) => {
                log::warn!(
                    "[RELEASE] Handle dropped outside a runtime, lease will expire - lock_id: {}, job_name: {}",
                    self.record.id,
                    self.record.job_name
                );
                return;
            }
        };

        log::warn!(
            "[RELEASE] Handle dropped without release, releasing in background - lock_id: {}, job_name: {}",
            self.record.id,
            self.record.job_name
        );
        let store = self.store.clone();
        let lock_id = self.record.id.clone();
        runtime.spawn(async move {
            if let Err(e) = store.delete_by_id(&lock_id).await {
                log::error!(
                    "[RELEASE] Background release failed, lease will expire - lock_id: {}, error: {}",
                    lock_id,
                    e
                );
            }
        });
    }
}

fn lease_duration(timeout: Duration) -> LockResult<chrono::Duration> {
    chrono::Duration::from_std(timeout)
        .ok()
        .filter(|lease| models::now().checked_add_signed(*lease).is_some())
        .ok_or(LockError::InvalidTimeout(timeout))
}

async fn release_lease(
    store: &dyn LockStore,
    heartbeats: &HeartbeatRegistry,
    lock_id: &str,
) -> LockResult<bool> {
    heartbeats.stop(lock_id);
    match store.delete_by_id(lock_id).await {
        Ok(removed) => {
            if removed {
                log::info!("[RELEASE SUCCESS] Lock released - lock_id: {}", lock_id);
            } else {
                log::debug!("[RELEASE] Nothing to release - lock_id: {}", lock_id);
            }
            Ok(removed)
        }
        Err(e) => {
            log::error!("[RELEASE] Failed to release lock - lock_id: {}, error: {}", lock_id, e);
            Err(LockError::store("delete_by_id", e))
        }
    }
}

async fn touch_lease(
    store: &dyn LockStore,
    lock_id: &str,
    renew_for: Option<chrono::Duration>,
) -> LockResult<bool> {
    let now = models::now();
    store
        .touch(lock_id, now, renew_for.map(|lease| now + lease))
        .await
        .map_err(|e| LockError::store("touch", e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory::MemoryStorage;
    use anyhow::{anyhow, Result};
    use async_trait::async_trait;
    use chrono::{DateTime, Utc};

    fn service_for(store: Arc<dyn LockStore>, instance_id: &str) -> LockService {
        LockService::new(
            store,
            LockSettings {
                instance_id: instance_id.to_string(),
                ..LockSettings::default()
            },
        )
    }

    /// 写入成功却返回其他持有者的存储，模拟可见性竞争
    struct ForeignWinnerStore;

    #[async_trait]
    impl LockStore for ForeignWinnerStore {
        async fn conditional_upsert(&self, candidate: LockRecord) -> Result<Option<LockRecord>> {
            Ok(Some(LockRecord {
                locked_by: "someone-else".to_string(),
                ..candidate
            }))
        }
        async fn delete_expired(&self, _now: DateTime<Utc>) -> Result<u64> {
            Err(anyhow!("sweep unavailable"))
        }
        async fn delete_by_id(&self, _id: &str) -> Result<bool> {
            Ok(false)
        }
        async fn find_by_job_name(&self, _job_name: &str) -> Result<Option<LockRecord>> {
            Ok(None)
        }
        async fn touch(
            &self,
            _id: &str,
            _heartbeat_at: DateTime<Utc>,
            _expires_at: Option<DateTime<Utc>>,
        ) -> Result<bool> {
            Ok(false)
        }
    }

    struct BrokenStore;

    #[async_trait]
    impl LockStore for BrokenStore {
        async fn conditional_upsert(&self, _candidate: LockRecord) -> Result<Option<LockRecord>> {
            Err(anyhow!("connection reset"))
        }
        async fn delete_expired(&self, _now: DateTime<Utc>) -> Result<u64> {
            Err(anyhow!("connection reset"))
        }
        async fn delete_by_id(&self, _id: &str) -> Result<bool> {
            Err(anyhow!("connection reset"))
        }
        async fn find_by_job_name(&self, _job_name: &str) -> Result<Option<LockRecord>> {
            Err(anyhow!("connection reset"))
        }
        async fn touch(
            &self,
            _id: &str,
            _heartbeat_at: DateTime<Utc>,
            _expires_at: Option<DateTime<Utc>>,
        ) -> Result<bool> {
            Err(anyhow!("connection reset"))
        }
    }

    #[tokio::test]
    async fn acquire_starts_heartbeat_and_release_stops_it() {
        let service = service_for(Arc::new(MemoryStorage::new()), "pod-a");
        let lock = service
            .acquire_lock("nightly-sync", AcquireOptions::default())
            .await
            .expect("vacant lock should be acquired");

        assert_eq!(lock.locked_by(), "pod-a");
        assert_eq!(lock.job_name(), "nightly-sync");
        assert_eq!(
            lock.record().expires_at - lock.record().locked_at,
            chrono::Duration::from_std(DEFAULT_TIMEOUT).unwrap()
        );
        assert_eq!(service.active_heartbeats(), 1);

        assert!(lock.release().await.unwrap());
        assert_eq!(service.active_heartbeats(), 0);
        assert!(!lock.release().await.unwrap());
    }

    #[tokio::test]
    async fn remote_holders_get_no_background_heartbeat() {
        let service = service_for(Arc::new(MemoryStorage::new()), "pod-a");
        let lock = service
            .acquire_lock(
                "nightly-sync",
                AcquireOptions::default()
                    .with_instance_id("client-1")
                    .without_background_heartbeat(),
            )
            .await
            .unwrap();

        assert_eq!(lock.locked_by(), "client-1");
        assert_eq!(service.active_heartbeats(), 0);
        assert!(service.update_heartbeat(lock.lock_id()).await.unwrap());
    }

    #[tokio::test]
    async fn lost_race_is_contention() {
        let service = service_for(Arc::new(ForeignWinnerStore), "pod-a");
        assert!(service
            .acquire_lock("nightly-sync", AcquireOptions::default())
            .await
            .is_none());
        assert_eq!(service.active_heartbeats(), 0);
    }

    #[tokio::test]
    async fn store_failure_fails_closed() {
        let service = service_for(Arc::new(BrokenStore), "pod-a");
        assert!(service
            .acquire_lock("nightly-sync", AcquireOptions::default())
            .await
            .is_none());
    }

    #[tokio::test]
    async fn release_failure_is_surfaced() {
        let service = service_for(Arc::new(BrokenStore), "pod-a");
        let err = service.release("lease-1").await.unwrap_err();
        assert!(matches!(err, LockError::Store { operation: "delete_by_id", .. }));
        assert!(service.get_lock_info("nightly-sync").await.is_err());
    }

    #[tokio::test]
    async fn oversized_timeout_is_rejected() {
        let service = service_for(Arc::new(MemoryStorage::new()), "pod-a");
        let options = AcquireOptions::default().with_timeout(Duration::from_secs(u64::MAX));
        assert!(service.acquire_lock("job", options).await.is_none());
    }

    #[tokio::test]
    async fn renew_lease_moves_deadline() {
        let store = Arc::new(MemoryStorage::new());
        let service = service_for(store.clone(), "pod-a");
        let lock = service
            .acquire_lock(
                "job",
                AcquireOptions::default()
                    .with_timeout(Duration::from_secs(1))
                    .without_background_heartbeat(),
            )
            .await
            .unwrap();

        assert!(service
            .renew_lease(lock.lock_id(), Duration::from_secs(60))
            .await
            .unwrap());
        let row = store.find_by_job_name("job").await.unwrap().unwrap();
        assert!(row.expires_at > lock.record().expires_at);
    }

    #[tokio::test]
    async fn with_lock_releases_after_work() {
        let service = service_for(Arc::new(MemoryStorage::new()), "pod-a");

        let output = service
            .with_lock("nightly-sync", AcquireOptions::default(), || async {
                Err::<(), &str>("job failed")
            })
            .await;
        assert_eq!(output, Some(Err("job failed")));
        assert!(!service.is_locked("nightly-sync").await.unwrap());
        assert_eq!(service.active_heartbeats(), 0);
    }

    #[tokio::test]
    async fn with_lock_skips_work_under_contention() {
        let store: Arc<dyn LockStore> = Arc::new(MemoryStorage::new());
        let holder = service_for(store.clone(), "pod-a");
        let other = service_for(store, "pod-b");
        let _held = holder
            .acquire_lock("nightly-sync", AcquireOptions::default())
            .await
            .unwrap();

        let ran = other
            .with_lock("nightly-sync", AcquireOptions::default(), || async { true })
            .await;
        assert_eq!(ran, None);
        holder.cleanup();
    }

    #[tokio::test]
    async fn cleanup_stops_timers_but_keeps_rows() {
        let service = service_for(Arc::new(MemoryStorage::new()), "pod-a");
        let _a = service.acquire_lock("a", AcquireOptions::default()).await.unwrap();
        let _b = service.acquire_lock("b", AcquireOptions::default()).await.unwrap();

        assert_eq!(service.cleanup(), 2);
        assert_eq!(service.active_heartbeats(), 0);
        assert!(service.is_locked("a").await.unwrap());
        assert!(service.is_locked("b").await.unwrap());
    }

    /// 清理失败、其余操作正常的存储
    struct SweepFailingStore {
        inner: MemoryStorage,
    }

    #[async_trait]
    impl LockStore for SweepFailingStore {
        async fn conditional_upsert(&self, candidate: LockRecord) -> Result<Option<LockRecord>> {
            self.inner.conditional_upsert(candidate).await
        }
        async fn delete_expired(&self, _now: DateTime<Utc>) -> Result<u64> {
            Err(anyhow!("sweep timed out"))
        }
        async fn delete_by_id(&self, id: &str) -> Result<bool> {
            self.inner.delete_by_id(id).await
        }
        async fn find_by_job_name(&self, job_name: &str) -> Result<Option<LockRecord>> {
            self.inner.find_by_job_name(job_name).await
        }
        async fn touch(
            &self,
            id: &str,
            heartbeat_at: DateTime<Utc>,
            expires_at: Option<DateTime<Utc>>,
        ) -> Result<bool> {
            self.inner.touch(id, heartbeat_at, expires_at).await
        }
    }

    #[tokio::test]
    async fn sweep_failure_does_not_block_acquire() {
        let store = Arc::new(SweepFailingStore {
            inner: MemoryStorage::new(),
        });
        let service = service_for(store, "pod-a");

        let lock = service
            .acquire_lock("nightly-sync", AcquireOptions::default())
            .await
            .expect("sweep errors are advisory");
        assert_eq!(service.sweep_expired().await, 0);

        let info = service.get_lock_info("nightly-sync").await.unwrap();
        assert!(info.is_locked);
        assert_eq!(info.locked_by.as_deref(), Some("pod-a"));
        assert!(lock.release().await.unwrap());
        assert!(!service.is_locked("nightly-sync").await.unwrap());
    }

    #[tokio::test]
    async fn out_of_range_heartbeat_interval_skips_timer() {
        let service = service_for(Arc::new(MemoryStorage::new()), "pod-a");
        let lock = service
            .acquire_lock(
                "nightly-sync",
                AcquireOptions::default().with_heartbeat_interval(Duration::MAX),
            )
            .await
            .expect("lease is still granted");

        assert_eq!(service.active_heartbeats(), 0);
        assert!(service.is_locked("nightly-sync").await.unwrap());
        assert!(lock.release().await.unwrap());
    }

    fn renewing_short_lease() -> AcquireOptions {
        AcquireOptions::default()
            .with_timeout(Duration::from_millis(200))
            .with_heartbeat_interval(Duration::from_millis(50))
            .with_renew_on_heartbeat(true)
    }

    #[tokio::test]
    async fn cancelled_scope_releases_lease() {
        let store: Arc<dyn LockStore> = Arc::new(MemoryStorage::new());
        let a = service_for(store.clone(), "pod-a");
        let b = service_for(store, "pod-b");

        let scoped = a.with_lock("nightly-sync", renewing_short_lease(), || async {
            tokio::time::sleep(Duration::from_secs(10)).await;
        });
        assert!(tokio::time::timeout(Duration::from_millis(50), scoped)
            .await
            .is_err());

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(a.active_heartbeats(), 0);
        let taken = b
            .acquire_lock("nightly-sync", AcquireOptions::default())
            .await
            .expect("cancelled holder must not keep the lease");
        assert_eq!(taken.locked_by(), "pod-b");
        b.cleanup();
    }

    #[tokio::test]
    async fn panicking_work_releases_lease() {
        let service = service_for(Arc::new(MemoryStorage::new()), "pod-a");

        let runner = service.clone();
        let joined = tokio::spawn(async move {
            let _: Option<()> = runner
                .with_lock("nightly-sync", renewing_short_lease(), || async {
                    panic!("job crashed")
                })
                .await;
        })
        .await;
        assert!(joined.unwrap_err().is_panic());

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(service.active_heartbeats(), 0);
        assert!(!service.is_locked("nightly-sync").await.unwrap());
    }

    #[tokio::test]
    async fn dropped_handle_releases_lease() {
        let service = service_for(Arc::new(MemoryStorage::new()), "pod-a");
        let lock = service
            .acquire_lock("nightly-sync", AcquireOptions::default())
            .await
            .unwrap();
        assert_eq!(service.active_heartbeats(), 1);

        drop(lock);
        assert_eq!(service.active_heartbeats(), 0);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!service.is_locked("nightly-sync").await.unwrap());
    }

    #[tokio::test]
    async fn detached_lease_survives_handle() {
        let service = service_for(Arc::new(MemoryStorage::new()), "pod-a");
        let lock = service
            .acquire_lock("nightly-sync", AcquireOptions::default())
            .await
            .unwrap();

        let record = lock.detach();
        assert_eq!(service.active_heartbeats(), 0);
        tokio::time::sleep(Duration::from_millis(20)).await;
        let info = service.get_lock_info("nightly-sync").await.unwrap();
        assert_eq!(info.locked_by.as_deref(), Some("pod-a"));
        assert!(service.release(&record.id).await.unwrap());
    }
}
