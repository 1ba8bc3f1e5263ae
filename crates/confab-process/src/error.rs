use thiserror::Error;

use confab_core::error::{AsErrorInfo, ErrorInfo, ErrorKind, StoppedError};
use confab_core::{ProcessName, ProcessUri};
use confab_kv::KvError;

#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("Internal Server Error: duplicate process '{0}'")]
    Duplicate(ProcessUri),

    #[error("Not Found: no process '{0}'")]
    NotFound(ProcessUri),

    #[error("Bad Process: update after result on '{0}'")]
    UpdateAfterResult(ProcessUri),

    #[error("Bad Tool: no tool named '{name}'")]
    ToolNotFound { name: ProcessName },

    #[error("Bad Tool: bad arguments for '{name}': {reason}")]
    BadArguments { name: ProcessName, reason: String },

    #[error("Bad Request: {0}")]
    BadRequest(String),

    #[error("workspace context is gone")]
    ContextGone,

    #[error(transparent)]
    Kv(#[from] KvError),

    #[error(transparent)]
    Stopped(#[from] StoppedError),
}

impl AsErrorInfo for ProcessError {
    fn as_info(&self) -> ErrorInfo {
        match self {
            ProcessError::Duplicate(_) => ErrorInfo::new(500, self.to_string(), ErrorKind::Runtime),
            ProcessError::NotFound(_) => ErrorInfo::new(404, self.to_string(), ErrorKind::Normal),
            ProcessError::UpdateAfterResult(_) => {
                ErrorInfo::new(500, self.to_string(), ErrorKind::Runtime)
            }
            ProcessError::ToolNotFound { .. } => {
                ErrorInfo::new(404, self.to_string(), ErrorKind::Normal)
            }
            ProcessError::BadArguments { .. } => {
                ErrorInfo::new(400, self.to_string(), ErrorKind::Action)
            }
            ProcessError::BadRequest(_) => ErrorInfo::new(400, self.to_string(), ErrorKind::Normal),
            ProcessError::ContextGone => ErrorInfo::internal(self.to_string()),
            ProcessError::Kv(err) => err.as_info(),
            ProcessError::Stopped(err) => err.as_info(),
        }
    }
}
