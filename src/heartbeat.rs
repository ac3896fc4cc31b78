//! In-process heartbeat timers, one per held lease.
//!
//! Each timer is a spawned tokio task that periodically calls
//! [`LockStore::touch`](crate::storage::LockStore::touch). A failed beat stops
//! only that lease's timer; the lease itself is left to expire at its deadline.

use crate::models;
use crate::storage::LockStore;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

struct Timer {
    generation: u64,
    handle: JoinHandle<()>,
}

/// 心跳参数
#[derive(Debug, Clone)]
pub struct HeartbeatTask {
    pub lock_id: String,
    pub job_name: String,
    pub instance_id: String,
    pub interval: Duration,
    /// Some 时每次心跳把 expires_at 推迟到 now + 该时长
    pub renew_for: Option<chrono::Duration>,
}

pub struct HeartbeatRegistry {
    store: Arc<dyn LockStore>,
    timers: Arc<DashMap<String, Timer>>,
    next_generation: AtomicU64,
}

impl HeartbeatRegistry {
    pub fn new(store: Arc<dyn LockStore>) -> Self {
        Self {
            store,
            timers: Arc::new(DashMap::new()),
            next_generation: AtomicU64::new(0),
        }
    }

    /// 启动心跳；同一 lock_id 已有定时器时先取消旧的。
    /// 间隔为零或超出时钟范围时不启动，返回 false。
    pub fn start(&self, task: HeartbeatTask) -> bool {
        if !interval_in_range(task.interval) {
            log::warn!(
                "[HEARTBEAT] Unusable interval {:?}, heartbeat disabled - lock_id: {}, job_name: {}",
                task.interval,
                task.lock_id,
                task.job_name
            );
            return false;
        }

        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let lock_id = task.lock_id.clone();
        let handle = tokio::spawn(run_timer(
            self.store.clone(),
            self.timers.clone(),
            generation,
            task,
        ));

        if let Some(previous) = self.timers.insert(lock_id.clone(), Timer { generation, handle }) {
            previous.handle.abort();
            log::debug!("[HEARTBEAT] Replaced existing timer - lock_id: {}", lock_id);
        }
        true
    }

    /// 停止并移除定时器，未知 id 为 no-op
    pub fn stop(&self, lock_id: &str) -> bool {
        match self.timers.remove(lock_id) {
            Some((_, timer)) => {
                timer.handle.abort();
                true
            }
            None => false,
        }
    }

    /// 停止全部定时器，返回停止数量
    pub fn stop_all(&self) -> usize {
        let ids: Vec<String> = self.timers.iter().map(|entry| entry.key().clone()).collect();
        ids.iter().filter(|id| self.stop(id)).count()
    }

    pub fn is_running(&self, lock_id: &str) -> bool {
        self.timers.contains_key(lock_id)
    }

    pub fn len(&self) -> usize {
        self.timers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.timers.is_empty()
    }
}

impl Drop for HeartbeatRegistry {
    fn drop(&mut self) {
        for entry in self.timers.iter() {
            entry.value().handle.abort();
        }
    }
}

/// 定时器的首个和第二个截止时间都必须能用 Instant 表示
fn interval_in_range(interval: Duration) -> bool {
    !interval.is_zero()
        && Instant::now()
            .checked_add(interval)
            .and_then(|first| first.checked_add(interval))
            .is_some()
}

async fn run_timer(
    store: Arc<dyn LockStore>,
    timers: Arc<DashMap<String, Timer>>,
    generation: u64,
    task: HeartbeatTask,
) {
    let mut ticker = tokio::time::interval_at(Instant::now() + task.interval, task.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;

        let now = models::now();
        let expires_at = task.renew_for.map(|lease| now + lease);
        match store.touch(&task.lock_id, now, expires_at).await {
            Ok(true) => {
                log::debug!(
                    "[HEARTBEAT] Beat recorded - lock_id: {}, job_name: {}, instance_id: {}",
                    task.lock_id,
                    task.job_name,
                    task.instance_id
                );
            }
            Ok(false) => {
                log::warn!(
                    "[HEARTBEAT] Lease no longer held, stopping timer - lock_id: {}, job_name: {}, instance_id: {}",
                    task.lock_id,
                    task.job_name,
                    task.instance_id
                );
                break;
            }
            Err(e) => {
                log::error!(
                    "[HEARTBEAT] Failed to update heartbeat, stopping timer - lock_id: {}, job_name: {}, instance_id: {}, error: {}",
                    task.lock_id,
                    task.job_name,
                    task.instance_id,
                    e
                );
                break;
            }
        }
    }

    // 只移除自己这一代的定时器，重启后的新定时器不受影响
    timers.remove_if(&task.lock_id, |_, timer| timer.generation == generation);
}
