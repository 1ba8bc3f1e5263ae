use thiserror::Error;

use confab_core::error::{AsErrorInfo, ErrorInfo, ErrorKind, StoppedError};

#[derive(Debug, Error)]
pub enum LlmError {
    #[error("Malformed request: context limit exceeded")]
    ContextLimitExceeded,

    #[error("Malformed request: cannot reuse '{from}' history with '{to}': {reason}")]
    IncompatibleModel {
        from: String,
        to: String,
        reason: String,
    },

    #[error("Malformed request: unknown model '{0}'")]
    UnknownModel(String),

    #[error("Malformed request: {0}")]
    BadRequest(String),

    #[error("Malformed completion: {reason}")]
    BadCompletion {
        reason: String,
        completion: Option<String>,
    },

    #[error("Malformed completion: empty response")]
    EmptyCompletion,

    #[error("Rate limited ({status}): {message}")]
    RateLimited { status: u16, message: String },

    #[error("LLM API error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("Unexpected LLM error: {0}")]
    Network(String),

    #[error(transparent)]
    Stopped(#[from] StoppedError),
}

impl LlmError {
    pub fn bad_completion(reason: impl Into<String>, completion: Option<String>) -> Self {
        LlmError::BadCompletion {
            reason: reason.into(),
            completion,
        }
    }

    pub fn network(err: impl std::fmt::Display) -> Self {
        LlmError::Network(err.to_string())
    }
}

impl From<reqwest::Error> for LlmError {
    fn from(err: reqwest::Error) -> Self {
        LlmError::Network(err.to_string())
    }
}

impl AsErrorInfo for LlmError {
    fn as_info(&self) -> ErrorInfo {
        self.as_info_redacted(true)
    }
}

impl LlmError {
    /// The wire envelope. Raw completions are retained in `extra.completion`
    /// only on non-redacted logs.
    pub fn as_info_redacted(&self, redacted: bool) -> ErrorInfo {
        match self {
            LlmError::ContextLimitExceeded
            | LlmError::IncompatibleModel { .. }
            | LlmError::UnknownModel(_)
            | LlmError::BadRequest(_) => ErrorInfo::new(500, self.to_string(), ErrorKind::Runtime),
            LlmError::BadCompletion { completion, .. } => {
                let info = ErrorInfo::new(500, self.to_string(), ErrorKind::Retryable);
                match completion {
                    Some(completion) if !redacted => {
                        info.with_extra("completion", serde_json::Value::from(completion.clone()))
                    }
                    _ => info,
                }
            }
            LlmError::EmptyCompletion
            | LlmError::RateLimited { .. }
            | LlmError::Api { .. }
            | LlmError::Network(_) => ErrorInfo::new(500, self.to_string(), ErrorKind::Retryable),
            LlmError::Stopped(err) => err.as_info(),
        }
    }
}
