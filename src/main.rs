use actix_web::{middleware::Logger, web, App, HttpServer};
use job_lock_service::config::{Config, StorageType};
use job_lock_service::handlers;
use job_lock_service::storage::memory::MemoryStorage;
use job_lock_service::storage::redis::RedisStorage;
use job_lock_service::storage::sqlite::SqliteStorage;
use job_lock_service::{LockService, LockStore};
use log::info;
use std::sync::Arc;
use std::time::Duration;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

fn to_io_error(e: anyhow::Error) -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::Other, e.to_string())
}

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    // 初始化日志
    env_logger::init_from_env(env_logger::Env::new().default_filter_or("info"));

    // 加载配置
    let config = Config::from_env();
    info!("Starting job-lock-service with config: {:?}", config);

    // 创建存储
    let mut memory_storage_for_persist: Option<Arc<MemoryStorage>> = None;
    let store: Arc<dyn LockStore> = match config.storage_type {
        StorageType::Memory => {
            info!("Using memory storage");

            let memory_storage = if config.memory_persist_enabled {
                info!("Memory persistence enabled: {}", config.memory_persist_path);
                Arc::new(MemoryStorage::with_persistence(std::path::PathBuf::from(
                    &config.memory_persist_path,
                )))
            } else {
                info!("Memory persistence disabled");
                Arc::new(MemoryStorage::new())
            };

            if config.memory_persist_enabled {
                match memory_storage.load_from_disk().await {
                    Ok(count) if count > 0 => {
                        info!("Successfully restored {} leases from disk", count)
                    }
                    Ok(_) => {}
                    Err(e) => log::warn!("Failed to load from disk: {}", e),
                }
                memory_storage_for_persist = Some(memory_storage.clone());
            }

            memory_storage
        }
        StorageType::Redis => {
            info!("Using Redis storage");
            let redis_url = config
                .redis_url
                .clone()
                .unwrap_or_else(|| "redis://127.0.0.1:6379".to_string());
            let redis_storage = RedisStorage::new(
                &redis_url,
                config.redis_username.clone(),
                config.redis_password.clone(),
                config.redis_db,
                &config.redis_key_prefix,
            )
            .await
            .map_err(to_io_error)?;
            Arc::new(redis_storage)
        }
        StorageType::Sqlite => {
            info!("Using SQLite storage: {}", config.sqlite_path);
            Arc::new(SqliteStorage::open(&config.sqlite_path).map_err(to_io_error)?)
        }
    };

    let service = LockService::new(store, config.lock_settings());
    info!("Lock service instance id: {}", service.instance_id());

    // 定期清理过期租约
    let sweeper = service.clone();
    let cleanup_interval = Duration::from_secs(config.cleanup_interval.max(1));
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(cleanup_interval);
        loop {
            interval.tick().await;
            sweeper.sweep_expired().await;
        }
    });

    // 启动持久化任务
    if let Some(memory_storage) = memory_storage_for_persist.clone() {
        let persist_interval = Duration::from_secs(config.memory_persist_interval.max(1));
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(persist_interval);
            loop {
                interval.tick().await;
                if let Err(e) = memory_storage.persist_to_disk().await {
                    log::error!("[PERSISTENCE] Failed to persist to disk: {}", e);
                }
            }
        });
    }

    let bind_addr = format!("{}:{}", config.server_host, config.server_port);
    info!("Server starting on http://{}", bind_addr);
    info!("Swagger UI available at http://{}/swagger-ui/", bind_addr);

    // 启动 HTTP 服务
    let app_service = service.clone();
    HttpServer::new(move || {
        let openapi = handlers::ApiDoc::openapi();

        App::new()
            .wrap(Logger::default())
            .app_data(web::Data::new(app_service.clone()))
            .service(
                SwaggerUi::new("/swagger-ui/{_:.*}").url("/api-docs/openapi.json", openapi.clone()),
            )
            .configure(handlers::configure)
    })
    .bind(&bind_addr)?
    .run()
    .await?;

    // 进程退出：停止心跳，保存快照
    service.cleanup();
    if let Some(memory_storage) = memory_storage_for_persist {
        if let Err(e) = memory_storage.persist_to_disk().await {
            log::error!("[PERSISTENCE] Failed to persist on shutdown: {}", e);
        }
    }
    info!("job-lock-service stopped");
    Ok(())
}
