//! Lease-based distributed locks for recurring jobs.
//!
//! Every instance competing for a job name talks to a shared [`storage::LockStore`];
//! the store's conditional upsert picks exactly one holder per job name. A
//! [`service::LockService`] wraps acquisition, background heartbeats, release, and
//! status queries.

pub mod config;
pub mod error;
pub mod handlers;
pub mod heartbeat;
pub mod models;
pub mod service;
pub mod storage;

pub use error::{LockError, LockResult};
pub use models::{AcquireOptions, LockRecord, LockStatus};
pub use service::{AcquiredLock, LockService, LockSettings};
pub use storage::LockStore;
