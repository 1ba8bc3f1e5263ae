use thiserror::Error;

use confab_core::error::{AsErrorInfo, ErrorInfo, ErrorKind};
use confab_core::ThreadUri;
use confab_kv::KvError;

#[derive(Debug, Error)]
pub enum ThreadError {
    #[error("Not Found: no thread '{0}'")]
    NotFound(ThreadUri),

    #[error(transparent)]
    Kv(#[from] KvError),
}

impl AsErrorInfo for ThreadError {
    fn as_info(&self) -> ErrorInfo {
        match self {
            ThreadError::NotFound(_) => ErrorInfo::new(404, self.to_string(), ErrorKind::Normal),
            ThreadError::Kv(err) => err.as_info(),
        }
    }
}
