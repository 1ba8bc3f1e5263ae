//! Shared foundations for the Confab backend: validated identifier strings,
//! the cross-service error envelope, the process-wide shutdown signal, and
//! configuration loading.

pub mod config;
pub mod error;
pub mod ids;
pub mod shutdown;
pub mod signal;
pub mod unique_id;

pub use error::{ErrorInfo, ErrorKind, StopReason, StoppedError};
pub use ids::{
    AgentId, BotId, ChannelId, MessageId, ProcessId, ProcessName, ProcessUri, RemoteProcessSecret,
    RemoteServiceSecret, RequestId, Scope, ServiceId, ThreadCursor, ThreadId, ThreadUri, UserId,
    Workspace, WorkspaceSuffix,
};
pub use signal::Flag;
