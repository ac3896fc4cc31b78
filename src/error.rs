use thiserror::Error;

/// 锁服务错误。锁竞争不是错误，以 `None` 表示。
#[derive(Debug, Error)]
pub enum LockError {
    #[error("lock store {operation} failed: {source}")]
    Store {
        operation: &'static str,
        #[source]
        source: anyhow::Error,
    },

    #[error("lease duration out of range: {0:?}")]
    InvalidTimeout(std::time::Duration),
}

impl LockError {
    pub fn store(operation: &'static str, source: anyhow::Error) -> Self {
        Self::Store { operation, source }
    }
}

pub type LockResult<T> = std::result::Result<T, LockError>;
