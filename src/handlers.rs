use crate::models::{
    AcquireLockRequest, AcquireLockSuccess, AcquireOptions, ApiResponse, HealthStatus,
    HeartbeatRequest, LockStatus, ReleaseLockRequest,
};
use crate::service::LockService;
use actix_web::{web, HttpResponse};
use log::{error, info};
use std::time::Duration;
use utoipa::OpenApi;

#[derive(OpenApi)]
#[openapi(
    paths(
        acquire_lock,
        heartbeat,
        release_lock,
        lock_info,
        health
    ),
    components(
        schemas(
            AcquireLockRequest,
            AcquireLockSuccess,
            HeartbeatRequest,
            ReleaseLockRequest,
            LockStatus,
            HealthStatus,
            ApiResponse<AcquireLockSuccess>,
            ApiResponse<LockStatus>,
            ApiResponse<HealthStatus>,
            ApiResponse<serde_json::Value>,
        )
    ),
    tags(
        (name = "lock", description = "任务锁接口")
    ),
    info(
        title = "任务锁服务 API",
        version = "0.1.0",
        description = "基于租约的任务互斥锁：申请、心跳、释放与状态查询",
    )
)]
pub struct ApiDoc;

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.route("/api/lock/acquire", web::post().to(acquire_lock))
        .route("/api/lock/heartbeat", web::post().to(heartbeat))
        .route("/api/lock/release", web::post().to(release_lock))
        .route("/api/lock/{job_name}", web::get().to(lock_info))
        .route("/health", web::get().to(health));
}

/// 申请锁接口。远端持有者需自行调用心跳接口。
#[utoipa::path(
    post,
    path = "/api/lock/acquire",
    tag = "lock",
    request_body = AcquireLockRequest,
    responses(
        (status = 200, description = "申请锁成功", body = ApiResponse<AcquireLockSuccess>),
        (status = 200, description = "锁已被占用", body = ApiResponse<AcquireLockSuccess>)
    )
)]
pub async fn acquire_lock(
    service: web::Data<LockService>,
    req: web::Json<AcquireLockRequest>,
) -> HttpResponse {
    let req = req.into_inner();
    let holder = req
        .holder
        .unwrap_or_else(|| service.instance_id().to_string());
    info!(
        "[ACQUIRE] Attempting to acquire lock - job_name: {}, holder: {}, timeout_ms: {:?}",
        req.job_name, holder, req.timeout_ms
    );

    let mut options = AcquireOptions::default()
        .with_instance_id(holder.clone())
        .without_background_heartbeat();
    if let Some(timeout_ms) = req.timeout_ms {
        options = options.with_timeout(Duration::from_millis(timeout_ms));
    }

    match service.acquire_lock(&req.job_name, options).await {
        Some(lock) => {
            // 租约交给远端持有者，由其心跳或释放
            let record = lock.detach();
            HttpResponse::Ok().json(ApiResponse::success(AcquireLockSuccess {
                lock_id: record.id,
                job_name: record.job_name,
                locked_by: record.locked_by,
                expires_at: record.expires_at,
            }))
        }
        None => {
            info!(
                "[ACQUIRE FAILED] Lock not acquired - job_name: {}, requested_by: {}",
                req.job_name, holder
            );
            HttpResponse::Ok().json(ApiResponse::<AcquireLockSuccess>::error(
                1001,
                format!("Lock {} is not available", req.job_name),
            ))
        }
    }
}

/// 心跳接口
#[utoipa::path(
    post,
    path = "/api/lock/heartbeat",
    tag = "lock",
    request_body = HeartbeatRequest,
    responses(
        (status = 200, description = "心跳成功", body = ApiResponse<serde_json::Value>),
        (status = 200, description = "锁不存在或已被回收", body = ApiResponse<serde_json::Value>)
    )
)]
pub async fn heartbeat(
    service: web::Data<LockService>,
    req: web::Json<HeartbeatRequest>,
) -> HttpResponse {
    info!(
        "[HEARTBEAT] Heartbeat request - lock_id: {}, extend_ms: {:?}",
        req.lock_id, req.extend_ms
    );

    let result = match req.extend_ms {
        Some(extend_ms) => {
            service
                .renew_lease(&req.lock_id, Duration::from_millis(extend_ms))
                .await
        }
        None => service.update_heartbeat(&req.lock_id).await,
    };

    match result {
        Ok(true) => HttpResponse::Ok().json(ApiResponse::success(serde_json::json!({
            "updated": true
        }))),
        Ok(false) => {
            info!("[HEARTBEAT] Lease not found - lock_id: {}", req.lock_id);
            HttpResponse::Ok().json(ApiResponse::<serde_json::Value>::error(
                2001,
                "Lock not found or reclaimed".to_string(),
            ))
        }
        Err(e) => {
            error!("Failed to update heartbeat: {}", e);
            HttpResponse::Ok().json(ApiResponse::<serde_json::Value>::error(
                2002,
                format!("Failed to update heartbeat: {}", e),
            ))
        }
    }
}

/// 释放锁接口
#[utoipa::path(
    post,
    path = "/api/lock/release",
    tag = "lock",
    request_body = ReleaseLockRequest,
    responses(
        (status = 200, description = "释放锁成功", body = ApiResponse<serde_json::Value>),
        (status = 200, description = "锁不存在", body = ApiResponse<serde_json::Value>)
    )
)]
pub async fn release_lock(
    service: web::Data<LockService>,
    req: web::Json<ReleaseLockRequest>,
) -> HttpResponse {
    info!("[RELEASE] Attempting to release lock - lock_id: {}", req.lock_id);

    match service.release(&req.lock_id).await {
        Ok(true) => HttpResponse::Ok().json(ApiResponse::success(serde_json::json!({
            "released": true
        }))),
        Ok(false) => HttpResponse::Ok().json(ApiResponse::<serde_json::Value>::error(
            3001,
            "Lock not found".to_string(),
        )),
        Err(e) => {
            error!("Failed to release lock: {}", e);
            HttpResponse::Ok().json(ApiResponse::<serde_json::Value>::error(
                3002,
                format!("Failed to release lock: {}", e),
            ))
        }
    }
}

/// 锁状态查询
#[utoipa::path(
    get,
    path = "/api/lock/{job_name}",
    tag = "lock",
    params(
        ("job_name" = String, Path, description = "任务名")
    ),
    responses(
        (status = 200, description = "锁状态", body = ApiResponse<LockStatus>)
    )
)]
pub async fn lock_info(service: web::Data<LockService>, path: web::Path<String>) -> HttpResponse {
    let job_name = path.into_inner();

    match service.get_lock_info(&job_name).await {
        Ok(status) => HttpResponse::Ok().json(ApiResponse::success(status)),
        Err(e) => {
            error!("Failed to query lock {}: {}", job_name, e);
            HttpResponse::Ok().json(ApiResponse::<LockStatus>::error(
                4001,
                format!("Failed to query lock: {}", e),
            ))
        }
    }
}

#[utoipa::path(
    get,
    path = "/health",
    tag = "lock",
    responses(
        (status = 200, description = "实例状态", body = ApiResponse<HealthStatus>)
    )
)]
pub async fn health(service: web::Data<LockService>) -> HttpResponse {
    HttpResponse::Ok().json(ApiResponse::success(HealthStatus {
        instance_id: service.instance_id().to_string(),
        active_heartbeats: service.active_heartbeats(),
    }))
}
