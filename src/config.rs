use crate::service::{generate_instance_id, LockSettings};
use serde::Deserialize;
use std::env;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub storage_type: StorageType,
    pub redis_url: Option<String>,
    pub redis_username: Option<String>,
    pub redis_password: Option<String>,
    pub redis_db: Option<i64>,
    pub redis_key_prefix: String,
    pub sqlite_path: String,
    pub server_host: String,
    pub server_port: u16,
    pub memory_persist_enabled: bool,
    pub memory_persist_path: String,
    pub memory_persist_interval: u64, // 秒
    pub instance_id: String,
    pub lock_timeout_ms: u64,
    pub heartbeat_interval_ms: u64,
    pub renew_on_heartbeat: bool,
    pub cleanup_interval: u64, // 秒
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum StorageType {
    Memory,
    Redis,
    Sqlite,
}

impl StorageType {
    fn parse(value: &str) -> Self {
        match value.to_lowercase().as_str() {
            "redis" => StorageType::Redis,
            "sqlite" => StorageType::Sqlite,
            _ => StorageType::Memory,
        }
    }
}

fn env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

impl Config {
    pub fn from_env() -> Self {
        let storage_type = StorageType::parse(&env_or("STORAGE_TYPE", "memory"));

        let redis_url = if storage_type == StorageType::Redis {
            Some(env_or("REDIS_URL", "redis://127.0.0.1:6379"))
        } else {
            None
        };

        // 依次尝试 INSTANCE_ID、POD_NAME、HOSTNAME
        let instance_id = ["INSTANCE_ID", "POD_NAME", "HOSTNAME"]
            .iter()
            .find_map(|key| env::var(key).ok().filter(|v| !v.trim().is_empty()))
            .unwrap_or_else(generate_instance_id);

        Self {
            storage_type,
            redis_url,
            redis_username: env::var("REDIS_USERNAME").ok(),
            redis_password: env::var("REDIS_PASSWORD").ok(),
            redis_db: env::var("REDIS_DB").ok().and_then(|s| s.parse::<i64>().ok()),
            redis_key_prefix: env_or("REDIS_KEY_PREFIX", "job_lock:"),
            sqlite_path: env_or("SQLITE_PATH", "./data/job_locks.db"),
            server_host: env_or("SERVER_HOST", "127.0.0.1"),
            server_port: env_parse("SERVER_PORT", 8080),
            memory_persist_enabled: env_parse("MEMORY_PERSIST_ENABLED", true),
            memory_persist_path: env_or("MEMORY_PERSIST_PATH", "./data/job_locks.json"),
            memory_persist_interval: env_parse("MEMORY_PERSIST_INTERVAL", 30),
            instance_id,
            lock_timeout_ms: env_parse("LOCK_TIMEOUT_MS", 300_000),
            heartbeat_interval_ms: env_parse("LOCK_HEARTBEAT_INTERVAL_MS", 30_000),
            renew_on_heartbeat: env_parse("LOCK_RENEW_ON_HEARTBEAT", false),
            cleanup_interval: env_parse("CLEANUP_INTERVAL", 60),
        }
    }

    pub fn lock_settings(&self) -> LockSettings {
        LockSettings {
            instance_id: self.instance_id.clone(),
            default_timeout: Duration::from_millis(self.lock_timeout_ms),
            heartbeat_interval: Duration::from_millis(self.heartbeat_interval_ms),
            renew_on_heartbeat: self.renew_on_heartbeat,
        }
    }
}
