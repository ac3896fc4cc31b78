use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use utoipa::ToSchema;
use uuid::Uuid;

/// 锁租约记录，每个 job_name 至多一行
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockRecord {
    pub id: String,
    pub job_name: String,
    pub locked_by: String,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub locked_at: DateTime<Utc>,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub expires_at: DateTime<Utc>,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub heartbeat_at: DateTime<Utc>,
}

impl LockRecord {
    /// 构造候选租约：新 id，locked_at = heartbeat_at = now，expires_at = now + timeout
    pub fn candidate(
        job_name: &str,
        locked_by: &str,
        now: DateTime<Utc>,
        timeout: chrono::Duration,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            job_name: job_name.to_string(),
            locked_by: locked_by.to_string(),
            locked_at: now,
            expires_at: now + timeout,
            heartbeat_at: now,
        }
    }

    /// 租约在 `now` 时刻是否已过期（expires_at 严格早于 now）
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at < now
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(now())
    }
}

/// Current time truncated to milliseconds, the resolution every store persists.
pub fn now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(3)
}

pub fn from_millis(ms: i64) -> Option<DateTime<Utc>> {
    DateTime::<Utc>::from_timestamp_millis(ms)
}

/// 申请锁参数，未设置的字段使用服务默认值
#[derive(Debug, Clone, Default)]
pub struct AcquireOptions {
    pub timeout: Option<Duration>,
    pub heartbeat_interval: Option<Duration>,
    pub instance_id: Option<String>,
    /// 心跳同时把 expires_at 推迟到 now + timeout
    pub renew_on_heartbeat: Option<bool>,
    /// false 时不启动本进程心跳，由远端持有者自行调用 heartbeat
    pub background_heartbeat: Option<bool>,
}

impl AcquireOptions {
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = Some(interval);
        self
    }

    pub fn with_instance_id(mut self, instance_id: impl Into<String>) -> Self {
        self.instance_id = Some(instance_id.into());
        self
    }

    pub fn with_renew_on_heartbeat(mut self, renew: bool) -> Self {
        self.renew_on_heartbeat = Some(renew);
        self
    }

    pub fn without_background_heartbeat(mut self) -> Self {
        self.background_heartbeat = Some(false);
        self
    }
}

/// 锁状态查询结果
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct LockStatus {
    pub job_name: String,
    pub is_locked: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    #[schema(example = "pod-7")]
    pub locked_by: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub locked_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub heartbeat_at: Option<DateTime<Utc>>,
}

impl LockStatus {
    pub fn unlocked(job_name: &str) -> Self {
        Self {
            job_name: job_name.to_string(),
            is_locked: false,
            locked_by: None,
            locked_at: None,
            expires_at: None,
            heartbeat_at: None,
        }
    }

    pub fn from_record(record: LockRecord) -> Self {
        Self {
            job_name: record.job_name,
            is_locked: true,
            locked_by: Some(record.locked_by),
            locked_at: Some(record.locked_at),
            expires_at: Some(record.expires_at),
            heartbeat_at: Some(record.heartbeat_at),
        }
    }
}

/// 申请锁请求
#[derive(Debug, Deserialize, Serialize, ToSchema)]
pub struct AcquireLockRequest {
    #[schema(example = "nightly-sync")]
    pub job_name: String,
    /// 持有者标识，缺省为服务实例 id
    #[schema(example = "pod-7")]
    pub holder: Option<String>,
    /// 租约时长（毫秒）
    #[schema(example = 60000)]
    pub timeout_ms: Option<u64>,
}

/// 申请锁成功响应
#[derive(Debug, Deserialize, Serialize, ToSchema)]
pub struct AcquireLockSuccess {
    #[schema(example = "550e8400-e29b-41d4-a716-446655440000")]
    pub lock_id: String,
    #[schema(example = "nightly-sync")]
    pub job_name: String,
    #[schema(example = "pod-7")]
    pub locked_by: String,
    pub expires_at: DateTime<Utc>,
}

/// 心跳请求
#[derive(Debug, Deserialize, Serialize, ToSchema)]
pub struct HeartbeatRequest {
    #[schema(example = "550e8400-e29b-41d4-a716-446655440000")]
    pub lock_id: String,
    /// 设置时同时续约：expires_at = now + extend_ms
    #[serde(default)]
    #[schema(example = 60000)]
    pub extend_ms: Option<u64>,
}

/// 释放锁请求
#[derive(Debug, Deserialize, Serialize, ToSchema)]
pub struct ReleaseLockRequest {
    #[schema(example = "550e8400-e29b-41d4-a716-446655440000")]
    pub lock_id: String,
}

#[derive(Debug, Deserialize, Serialize, ToSchema)]
pub struct HealthStatus {
    pub instance_id: String,
    pub active_heartbeats: usize,
}

/// 统一响应结构
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct ApiResponse<T> {
    pub code: i32,
    pub message: String,
    pub data: Option<T>,
    pub success: bool,
}

impl<T> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            code: 0,
            message: "success".to_string(),
            data: Some(data),
            success: true,
        }
    }

    pub fn error(code: i32, message: String) -> Self {
        Self {
            code,
            message,
            data: None,
            success: false,
        }
    }
}
