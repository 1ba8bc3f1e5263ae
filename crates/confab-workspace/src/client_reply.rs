//! The request-local client-reply service.
//!
//! Buffers partial and final replies for the originating client, carries the
//! client-declared tools, and queues actions the client must execute. Client
//! tools spawn a process that delegates execution back to the client through
//! a registered secret.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::Value;
use tracing::warn;

use confab_core::{Flag, ProcessId, ProcessName, ProcessUri, ServiceId};
use confab_process::{
    send_result, Process, ProcessError, ProcessResult, RequestContext, Tool, ToolDefinition,
    ToolInfo, ToolsProvider,
};
use confab_threads::BotMessagePart;

use crate::requests::ClientAction;
use crate::store::WorkspaceStore;

/// Snapshot of the reply so far.
#[derive(Debug, Clone)]
pub struct ProvisionalReply {
    pub summary: Option<String>,
    pub reply: Vec<BotMessagePart>,
    pub actions: Vec<ClientAction>,
}

#[derive(Default)]
struct ReplyState {
    summary: Option<String>,
    provisional: Vec<BotMessagePart>,
    committed: Vec<BotMessagePart>,
    pending_actions: Vec<ClientAction>,
}

/// Per-request reply buffer and client-tool provider.
pub struct ClientReplyService {
    pub service_id: ServiceId,
    tools: Vec<ToolDefinition>,
    state: Mutex<ReplyState>,
    /// Set whenever the visible reply changed; the response poller clears it.
    pub flush: Flag,
    /// Set once the chatbot finished.
    pub done: Flag,
    /// Client-requested cancellation. Observed by the chatbot's reply and
    /// summary pushes (which then raise stopped) and by its tool waits.
    pub stop: Flag,
}

impl ClientReplyService {
    pub fn new(service_id: ServiceId, tools: Vec<ToolDefinition>) -> Arc<Self> {
        Arc::new(Self {
            service_id,
            tools,
            state: Mutex::new(ReplyState::default()),
            flush: Flag::new(),
            done: Flag::new(),
            stop: Flag::new(),
        })
    }

    /// Committed parts plus the provisional tail, draining pending actions.
    pub fn pull(&self) -> ProvisionalReply {
        let mut state = self.state.lock().unwrap();
        let mut reply = state.committed.clone();
        reply.extend(state.provisional.iter().cloned());
        ProvisionalReply {
            summary: state.summary.clone(),
            reply,
            actions: std::mem::take(&mut state.pending_actions),
        }
    }

    pub fn pull_committed(&self) -> Vec<BotMessagePart> {
        self.state.lock().unwrap().committed.clone()
    }

    pub fn pull_actions(&self) -> Vec<ClientAction> {
        std::mem::take(&mut self.state.lock().unwrap().pending_actions)
    }

    pub fn put_summary(&self, summary: impl Into<String>) {
        self.state.lock().unwrap().summary = Some(summary.into());
        self.flush.set();
    }

    /// Replace the provisional tail (one streaming snapshot).
    pub fn put_reply(&self, reply: Vec<BotMessagePart>) {
        self.state.lock().unwrap().provisional = reply;
        self.flush.set();
    }

    /// Append to the committed reply and reset the provisional tail.
    pub fn commit_reply(&self, reply: Vec<BotMessagePart>) {
        let mut state = self.state.lock().unwrap();
        state.committed.extend(reply);
        state.provisional.clear();
        drop(state);
        self.flush.set();
    }

    /// Patch the committed tool part matching `process_id` with its result.
    pub fn put_tool_result(&self, process_id: &ProcessId, result: ProcessResult) {
        let mut state = self.state.lock().unwrap();
        for part in state.committed.iter_mut() {
            if let BotMessagePart::Tool {
                process_id: part_id,
                result: part_result,
                ..
            } = part
            {
                if part_id == process_id {
                    *part_result = Some(result);
                    break;
                }
            }
        }
        drop(state);
        self.flush.set();
    }

    pub fn send_action(&self, action: ClientAction) {
        self.state.lock().unwrap().pending_actions.push(action);
        self.flush.set();
    }

    pub fn send_done(&self) {
        self.done.set();
        self.flush.set();
    }
}

impl ToolsProvider for ClientReplyService {
    fn list_tools(&self) -> Vec<Arc<dyn Tool>> {
        self.tools
            .iter()
            .map(|definition| {
                Arc::new(ClientReplyTool {
                    owner: self.service_id.clone(),
                    definition: definition.clone(),
                }) as Arc<dyn Tool>
            })
            .collect()
    }
}

/// A client-declared tool: executing it means asking the client to run it.
struct ClientReplyTool {
    owner: ServiceId,
    definition: ToolDefinition,
}

#[async_trait]
impl Tool for ClientReplyTool {
    fn info(&self) -> ToolInfo {
        ToolInfo {
            name: self.definition.name.clone(),
            description: self.definition.description.clone(),
            arguments_schema: self.definition.arguments_schema.clone(),
            default_enabled: true,
        }
    }

    async fn spawn(
        &self,
        request: Arc<RequestContext>,
        process_uri: ProcessUri,
        arguments: Value,
    ) -> Result<Arc<dyn Process>, ProcessError> {
        Ok(Arc::new(ClientReplyProcess {
            uri: process_uri,
            request,
            owner: self.owner.clone(),
            definition: self.definition.clone(),
            arguments,
        }))
    }
}

/// A process that delegates execution to the client: it registers a remote
/// secret and forwards a [`ClientAction`]; the client pushes the result back
/// through `process/update`.
pub struct ClientReplyProcess {
    uri: ProcessUri,
    request: Arc<RequestContext>,
    owner: ServiceId,
    definition: ToolDefinition,
    arguments: Value,
}

#[async_trait]
impl Process for ClientReplyProcess {
    fn uri(&self) -> &ProcessUri {
        &self.uri
    }

    fn name(&self) -> ProcessName {
        self.definition.name.clone()
    }

    fn owner(&self) -> ServiceId {
        self.owner.clone()
    }

    fn arguments(&self) -> Value {
        self.arguments.clone()
    }

    fn arguments_schema(&self) -> Option<Value> {
        Some(self.definition.arguments_schema.clone())
    }

    fn request(&self) -> Arc<RequestContext> {
        Arc::clone(&self.request)
    }

    async fn on_spawn(self: Arc<Self>) {
        let result = self.forward_to_client().await;
        if let Err(err) = result {
            warn!(uri = %self.uri, error = %err, "client tool dispatch failed");
            let _ = send_result(
                self.as_ref(),
                ProcessResult::Failure {
                    error: confab_core::error::ErrorInfo::internal(err.to_string()),
                },
            )
            .await;
        }
    }

    async fn on_sigterm(self: Arc<Self>) {
        confab_process::sigterm_stop(self.as_ref()).await;
    }
}

impl ClientReplyProcess {
    async fn forward_to_client(&self) -> Result<(), ProcessError> {
        let workspace = self.request.workspace()?;
        let store = WorkspaceStore::new(workspace.kv.clone(), workspace.workspace.clone());

        let secret = store
            .register_process(
                &self.uri,
                &self.definition.name,
                Some(self.definition.arguments_schema.clone()),
            )
            .await
            .map_err(|err| ProcessError::BadRequest(err.to_string()))?;

        let client = self
            .request
            .service::<ClientReplyService>()
            .ok_or_else(|| ProcessError::BadRequest("no client-reply service".to_string()))?;
        client.send_action(ClientAction {
            secret: Some(secret),
            name: self.definition.name.to_string(),
            arguments: self
                .arguments
                .as_object()
                .cloned()
                .unwrap_or_default(),
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn service() -> Arc<ClientReplyService> {
        ClientReplyService::new("svc-client-reply-test".parse().unwrap(), Vec::new())
    }

    fn text(body: &str) -> BotMessagePart {
        BotMessagePart::Text {
            think: None,
            text: body.to_string(),
        }
    }

    #[test]
    fn pull_combines_committed_and_provisional() {
        let client = service();
        client.commit_reply(vec![text("committed")]);
        client.put_reply(vec![text("streaming...")]);

        let pulled = client.pull();
        assert_eq!(pulled.reply.len(), 2);
        // Committing clears the provisional tail.
        client.commit_reply(vec![text("more")]);
        assert_eq!(client.pull().reply.len(), 2);
    }

    #[test]
    fn actions_drain_once() {
        let client = service();
        client.send_action(ClientAction {
            secret: None,
            name: "attach_notif".to_string(),
            arguments: serde_json::Map::new(),
        });
        assert_eq!(client.pull().actions.len(), 1);
        assert!(client.pull().actions.is_empty());
    }

    #[test]
    fn tool_results_patch_the_committed_part() {
        let client = service();
        let process_id = ProcessId::stub("7");
        client.commit_reply(vec![BotMessagePart::Tool {
            process_id: process_id.clone(),
            name: "generate_image".parse().unwrap(),
            arguments: json!({"prompt": "a greenhouse"}).as_object().unwrap().clone(),
            result: None,
        }]);

        client.put_tool_result(
            &process_id,
            ProcessResult::success(json!({"ok": true}).as_object().unwrap().clone()),
        );
        let committed = client.pull_committed();
        let BotMessagePart::Tool { result, .. } = &committed[0] else {
            panic!("expected tool part");
        };
        assert!(result.is_some());
    }

    #[test]
    fn mutations_fire_the_flush_flag() {
        let client = service();
        assert!(!client.flush.is_set());
        client.put_summary("Thinking...");
        assert!(client.flush.is_set());
        client.flush.clear();
        client.send_done();
        assert!(client.flush.is_set());
        assert!(client.done.is_set());
    }
}
