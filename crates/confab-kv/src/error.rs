use confab_core::error::{AsErrorInfo, ErrorInfo};
use thiserror::Error;

pub type KvResult<T> = Result<T, KvError>;

#[derive(Debug, Error)]
pub enum KvError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl AsErrorInfo for KvError {
    fn as_info(&self) -> ErrorInfo {
        ErrorInfo::internal(self.to_string())
    }
}
