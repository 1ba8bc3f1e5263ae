//! Durable units of execution.
//!
//! A process is a spawned task with a status record in the KV store: ordered
//! progress entries and at most one terminal result. Listeners observe status
//! transitions; the workspace context owns every process spawned on this
//! replica and delivers SIGTERM on shutdown.

mod context;
mod error;
mod process;
mod schema;
mod status;
mod tool;

pub use context::{ProcessListener, RequestContext, WorkspaceContext};
pub use error::ProcessError;
pub use process::{
    send_progress, send_result, send_update, sigterm_stop, Process, ProcessDefinition,
    KEY_PROCESS_EXECUTOR, KEY_PROCESS_STATUS,
};
pub use schema::validate_arguments;
pub use status::{ProcessResult, ProcessStatus};
pub use tool::{Tool, ToolDefinition, ToolInfo, ToolsProvider};

/// An active process with no status heartbeat for this long is expired.
pub const PROCESS_EXPIRY_SECS: u64 = 600;
