//! The cross-replica request and response envelope.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use confab_core::error::ErrorInfo;
use confab_core::{
    BotId, ChannelId, ProcessId, ProcessName, ProcessUri, RemoteProcessSecret, RequestId,
    ThreadUri, UserId, Workspace,
};
use confab_process::{ProcessResult, ToolDefinition};
use confab_threads::BotMessagePart;

use crate::bot::Persona;

/// The caller identity and correlation id carried by a request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestInfo {
    pub request_id: RequestId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<UserId>,
}

impl RequestInfo {
    pub fn new(user_id: Option<UserId>) -> Self {
        Self {
            request_id: RequestId::generate(),
            user_id,
        }
    }
}

/// An action that is expected to run on the client. When a `secret` is
/// provided, the client pushes progress and a result back through it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientAction {
    pub secret: Option<RemoteProcessSecret>,
    pub name: String,
    pub arguments: Map<String, Value>,
}

/// A request dispatched to a workspace supervisor.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum WorkspaceRequest {
    #[serde(rename = "chatbot/spawn")]
    ChatbotSpawn {
        workspace: Workspace,
        request: RequestInfo,
        bot_id: BotId,
        persona: Option<Persona>,
        threads: Vec<ThreadUri>,
        #[serde(default)]
        tools: Vec<ToolDefinition>,
        /// Override the generated process id (lets callers address the
        /// process before the first response arrives).
        #[serde(default, skip_serializing_if = "Option::is_none")]
        process_id: Option<ProcessId>,
        recv_timeout: u64,
        #[serde(default = "Utc::now")]
        timestamp: DateTime<Utc>,
    },

    #[serde(rename = "process/spawn")]
    ProcessSpawn {
        workspace: Workspace,
        request: RequestInfo,
        process_id: ProcessId,
        name: ProcessName,
        arguments: Value,
        #[serde(default = "Utc::now")]
        timestamp: DateTime<Utc>,
    },

    #[serde(rename = "process/sigkill")]
    ProcessSigkill {
        process_uri: ProcessUri,
        #[serde(default = "Utc::now")]
        timestamp: DateTime<Utc>,
    },

    #[serde(rename = "process/update")]
    ProcessUpdate {
        process_uri: ProcessUri,
        #[serde(default)]
        actions: Vec<ClientAction>,
        #[serde(default)]
        progress: Vec<Value>,
        result: Option<ProcessResult>,
        #[serde(default = "Utc::now")]
        timestamp: DateTime<Utc>,
    },
}

impl WorkspaceRequest {
    pub fn workspace(&self) -> &Workspace {
        match self {
            WorkspaceRequest::ChatbotSpawn { workspace, .. }
            | WorkspaceRequest::ProcessSpawn { workspace, .. } => workspace,
            WorkspaceRequest::ProcessSigkill { process_uri, .. }
            | WorkspaceRequest::ProcessUpdate { process_uri, .. } => &process_uri.workspace,
        }
    }
}

/// A request wrapped with its reply channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WrappedRequest {
    pub channel_id: ChannelId,
    pub request: WorkspaceRequest,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReplyStatus {
    Done,
    Provisional,
}

/// One value on a response stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum WorkspaceResponse {
    /// Chatbot reply snapshot: committed parts plus the provisional tail.
    Reply {
        status: ReplyStatus,
        summary: Option<String>,
        reply: Vec<BotMessagePart>,
        actions: Vec<ClientAction>,
    },
    /// Tool process progress edge.
    Progress {
        process_uri: ProcessUri,
        progress: Vec<Value>,
        result: Option<ProcessResult>,
    },
}

/// The stream envelope: values, then exactly one close or error sentinel.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum WorkspaceStream {
    Value { value: WorkspaceResponse },
    Error { error: ErrorInfo },
    Close,
}
