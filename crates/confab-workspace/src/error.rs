use thiserror::Error;

use confab_core::error::{AsErrorInfo, ErrorInfo, ErrorKind, StoppedError};
use confab_kv::KvError;
use confab_llm::LlmError;
use confab_process::ProcessError;
use confab_threads::ThreadError;

#[derive(Debug, Error)]
pub enum WorkspaceError {
    #[error("Bad Request: {0}")]
    BadRequest(String),

    #[error("Not Found: no registered service '{0}'")]
    ServiceNotFound(String),

    #[error("Not Found: no registered process for secret")]
    ProcessSecretNotFound,

    /// An error sentinel received from the remote side of a channel.
    #[error("{}", .0.message)]
    Stream(ErrorInfo),

    #[error(transparent)]
    Llm(#[from] LlmError),

    #[error(transparent)]
    Process(#[from] ProcessError),

    #[error(transparent)]
    Thread(#[from] ThreadError),

    #[error(transparent)]
    Kv(#[from] KvError),

    #[error(transparent)]
    Stopped(#[from] StoppedError),
}

impl WorkspaceError {
    /// Whether this is a cancellation rather than a failure. Stops raised
    /// inside a streaming callback arrive wrapped in the LLM error.
    pub fn is_stopped(&self) -> bool {
        matches!(
            self,
            WorkspaceError::Stopped(_) | WorkspaceError::Llm(LlmError::Stopped(_))
        )
    }
}

impl AsErrorInfo for WorkspaceError {
    fn as_info(&self) -> ErrorInfo {
        match self {
            WorkspaceError::BadRequest(_) => {
                ErrorInfo::new(400, self.to_string(), ErrorKind::Normal)
            }
            WorkspaceError::ServiceNotFound(_) | WorkspaceError::ProcessSecretNotFound => {
                ErrorInfo::new(404, self.to_string(), ErrorKind::Normal)
            }
            WorkspaceError::Stream(info) => info.clone(),
            WorkspaceError::Llm(err) => err.as_info(),
            WorkspaceError::Process(err) => err.as_info(),
            WorkspaceError::Thread(err) => err.as_info(),
            WorkspaceError::Kv(err) => err.as_info(),
            WorkspaceError::Stopped(err) => err.as_info(),
        }
    }
}
