//! The chatbot orchestration loop.
//!
//! Up to [`MAX_COMPLETIONS`] steps of: build system → call the model with
//! streaming partial replies → extract tool calls → spawn tools as child
//! processes → feed results back into the model history. The model is forced
//! to answer on the last step by withholding tools, so the loop cannot
//! diverge.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use confab_core::error::{AsErrorInfo, StoppedError};
use confab_core::{Flag, ProcessId, ProcessName, ProcessUri, ServiceId, ThreadUri};
use confab_llm::message::system_instructions;
use confab_llm::{LlmCallback, LlmPart, LlmTool};
use confab_process::{
    send_progress, send_result, Process, ProcessListener, ProcessResult, RequestContext, Tool,
};
use confab_threads::{list_messages, BotMessagePart, ThreadService, ThreadSource};

use crate::bot::{bot_acquire, bot_save_update, Persona};
use crate::client_reply::ClientReplyService;
use crate::llm_service::{LlmProxy, LlmService};
use crate::WorkspaceError;

/// Step limit of the reply loop.
pub const MAX_COMPLETIONS: usize = 5;

/// How long `on_sigterm` waits for the loop to notice the stop flag.
const SIGTERM_DRAIN: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatbotArguments {
    pub bot_id: confab_core::BotId,
    pub persona: Option<Persona>,
    pub thread_uris: Vec<ThreadUri>,
}

struct ToolInvocation {
    tool: Arc<dyn Tool>,
    uri: ProcessUri,
    arguments: Value,
    name: ProcessName,
}

pub struct ChatbotProcess {
    uri: ProcessUri,
    request: Arc<RequestContext>,
    owner: ServiceId,
    arguments: ChatbotArguments,
    new_cursors: std::sync::Mutex<Vec<confab_core::ThreadCursor>>,
    done: Flag,
}

impl ChatbotProcess {
    pub fn new(
        uri: ProcessUri,
        request: Arc<RequestContext>,
        owner: ServiceId,
        arguments: ChatbotArguments,
    ) -> Arc<Self> {
        Arc::new(Self {
            uri,
            request,
            owner,
            arguments,
            new_cursors: std::sync::Mutex::new(Vec::new()),
            done: Flag::new(),
        })
    }

    fn client(&self) -> Option<Arc<ClientReplyService>> {
        self.request.service::<ClientReplyService>()
    }

    async fn run(&self) -> Result<Vec<BotMessagePart>, WorkspaceError> {
        let mut proxy = self.acquire_proxy().await?;
        let mut reply: Vec<BotMessagePart> = Vec::new();

        let outcome = self.run_steps(&mut proxy, &mut reply).await;

        // A client stop keeps the completed steps: the session state and
        // cursors still carry into the next turn. Other failures leave the
        // saved state untouched so the thread messages are redelivered.
        let save = match &outcome {
            Ok(()) => true,
            Err(err) => err.is_stopped(),
        };
        if save {
            self.save_state(&proxy).await?;
        }
        outcome?;
        Ok(reply)
    }

    async fn run_steps(
        &self,
        proxy: &mut LlmProxy,
        reply: &mut Vec<BotMessagePart>,
    ) -> Result<(), WorkspaceError> {
        for step in 0..MAX_COMPLETIONS {
            let force_answer = step == MAX_COMPLETIONS - 1;
            let tool_calls = self.run_step_reply(proxy, force_answer, step, reply).await?;
            if tool_calls.is_empty() {
                break;
            }
            self.run_step_tools(proxy, tool_calls).await?;
        }
        Ok(())
    }

    /// Load bot state, bind the model, and insert new thread messages.
    async fn acquire_proxy(&self) -> Result<LlmProxy, WorkspaceError> {
        let workspace = self.request.workspace()?;
        let bot = bot_acquire(&workspace.kv, &workspace.workspace, &self.arguments.bot_id).await?;

        let llm = self
            .request
            .service::<LlmService>()
            .ok_or_else(|| WorkspaceError::BadRequest("no llm service".to_string()))?;
        let mut proxy = llm.acquire(&bot, self.arguments.persona.clone())?;

        let threads = self
            .request
            .service::<ThreadService>()
            .ok_or_else(|| WorkspaceError::BadRequest("no thread service".to_string()))?;
        let sources: Vec<ThreadSource> = self
            .arguments
            .thread_uris
            .iter()
            .map(|uri| match bot.get_cursor(uri) {
                Some(cursor) => ThreadSource::Cursor(cursor.clone()),
                None => ThreadSource::Uri(uri.clone()),
            })
            .collect();
        let (new_cursors, new_messages) = list_messages(&threads, &sources).await?;
        for message in &new_messages {
            proxy.add_thread_message(message);
        }
        *self.new_cursors.lock().unwrap() = new_cursors;

        Ok(proxy)
    }

    /// One completion step. Returns the tool invocations to run, empty when
    /// the model answered without tools.
    async fn run_step_reply(
        &self,
        proxy: &mut LlmProxy,
        force_answer: bool,
        step: usize,
        reply: &mut Vec<BotMessagePart>,
    ) -> Result<Vec<ToolInvocation>, WorkspaceError> {
        if let Some(client) = self.client() {
            client.put_summary("Thinking...");
            if client.stop.is_set() {
                return Err(StoppedError::stopped().into());
            }
        }

        let workspace = self.request.workspace()?;
        let mut selected: Vec<(Arc<dyn Tool>, confab_process::ToolInfo)> = workspace
            .list_tools(&self.request)
            .into_iter()
            .map(|tool| {
                let info = tool.info();
                (tool, info)
            })
            .filter(|(_, info)| proxy.persona.filter_tool(info))
            .collect();
        selected.sort_by(|a, b| a.1.name.cmp(&b.1.name));

        let llm_tools: Vec<LlmTool> = if force_answer {
            Vec::new() // Withholding tools forces a final answer.
        } else {
            selected
                .iter()
                .map(|(_, info)| LlmTool {
                    name: info.name.clone(),
                    description: info.description.clone(),
                    arguments_schema: info.arguments_schema.clone(),
                })
                .collect()
        };

        let mut system = system_instructions(proxy.model.info(), true, true, true, &[]);
        if !proxy.persona.system_message().is_empty() {
            system.push('\n');
            system.push_str(proxy.persona.system_message());
        }

        debug!(step, tools = llm_tools.len(), "chatbot completion step");
        let callback = self.reply_callback();
        let completion = proxy
            .get_completion(callback, Some(system), llm_tools, None)
            .await?;

        // Auto-correct: resolve each called name against the offered tools.
        let mut invocations: Vec<ToolInvocation> = Vec::new();
        for part in &completion {
            let LlmPart::ToolCalls { calls } = part else {
                continue;
            };
            for call in calls {
                let tool = selected
                    .iter()
                    .find(|(_, info)| info.name == call.name)
                    .map(|(tool, _)| Arc::clone(tool))
                    .ok_or_else(|| {
                        confab_process::ProcessError::ToolNotFound {
                            name: call.name.clone(),
                        }
                    })?;
                let process_id = call
                    .process_id
                    .clone()
                    .unwrap_or_else(ProcessId::generate);
                invocations.push(ToolInvocation {
                    tool,
                    uri: self.uri.child(process_id),
                    arguments: Value::Object(call.arguments.clone()),
                    name: call.name.clone(),
                });
            }
        }

        let committed = render_reply(&completion);
        send_progress(
            self,
            json!({
                "step": "completion",
                "committed": &committed,
            }),
        )
        .await?;

        reply.extend(committed.clone());
        if let Some(client) = self.client() {
            client.commit_reply(committed);
            if client.stop.is_set() {
                return Err(StoppedError::stopped().into());
            }
        }

        Ok(invocations)
    }

    /// Spawn the step's tools and feed their results back into the history.
    async fn run_step_tools(
        &self,
        proxy: &mut LlmProxy,
        invocations: Vec<ToolInvocation>,
    ) -> Result<(), WorkspaceError> {
        let workspace = self.request.workspace()?;

        let mut listeners: Vec<ProcessListener> = Vec::new();
        let mut spawned: Vec<(ProcessUri, ProcessName, ServiceId)> = Vec::new();
        for invocation in invocations {
            let process = invocation
                .tool
                .spawn(
                    Arc::clone(&self.request),
                    invocation.uri.clone(),
                    invocation.arguments,
                )
                .await?;
            let owner = process.owner();
            workspace.spawn(process).await?;
            listeners.push(workspace.listener(&invocation.uri)?);
            spawned.push((invocation.uri, invocation.name, owner));
        }

        // Wait for every result. A client stop abandons only the waits that
        // have not completed: whatever already landed is still fed back
        // below, and the next step observes the stop flag. Individual waits
        // only fail on runtime shutdown, which the next step observes too.
        let waits = join_all(listeners.iter().map(|listener| listener.wait_result()));
        match self.client() {
            Some(client) => {
                let stop = client.stop.clone();
                tokio::select! {
                    _ = waits => {}
                    _ = stop.wait() => {
                        info!(uri = %self.uri, "tool wait cancelled by client stop");
                    }
                }
            }
            None => {
                let _ = waits.await;
            }
        }

        for (uri, name, owner) in spawned {
            let Some(status) = workspace.try_get_status(&uri) else {
                continue;
            };
            let Some(result) = status.result else {
                continue;
            };
            if let Some(client) = self.client() {
                client.put_tool_result(&uri.process_id, result.clone());
            }
            proxy.add_tool_result(Some(owner), uri.process_id.clone(), name, result);
        }
        Ok(())
    }

    fn reply_callback(&self) -> Option<LlmCallback> {
        let client = self.client()?;
        Some(Arc::new(move |parts: Vec<LlmPart>| {
            client.put_reply(render_reply(&parts));
            if client.stop.is_set() {
                Err(StoppedError::stopped())
            } else {
                Ok(())
            }
        }))
    }

    async fn save_state(&self, proxy: &LlmProxy) -> Result<(), WorkspaceError> {
        let workspace = self.request.workspace()?;
        let new_cursors = std::mem::take(&mut *self.new_cursors.lock().unwrap());
        bot_save_update(
            &workspace.kv,
            &workspace.workspace,
            &self.arguments.bot_id,
            self.arguments.persona.clone(),
            proxy.state_value(),
            new_cursors,
        )
        .await?;
        Ok(())
    }
}

/// Render completion parts into client-visible message parts. Tool calls
/// render without results; reasoning stays hidden.
fn render_reply(parts: &[LlmPart]) -> Vec<BotMessagePart> {
    let mut rendered: Vec<BotMessagePart> = Vec::new();
    for (index, part) in parts.iter().enumerate() {
        match part {
            LlmPart::Text { content, .. } => {
                if !content.trim().is_empty() {
                    rendered.push(BotMessagePart::Text {
                        think: None,
                        text: content.clone(),
                    });
                }
            }
            LlmPart::ToolCalls { calls } => {
                for call in calls {
                    rendered.push(BotMessagePart::Tool {
                        process_id: call
                            .process_id
                            .clone()
                            .unwrap_or_else(|| ProcessId::stub(&index.to_string())),
                        name: call.name.clone(),
                        arguments: call.arguments.clone(),
                        result: None,
                    });
                }
            }
            _ => {}
        }
    }
    rendered
}

#[async_trait]
impl Process for ChatbotProcess {
    fn uri(&self) -> &ProcessUri {
        &self.uri
    }

    fn name(&self) -> ProcessName {
        "bot_chat".parse().expect("static name")
    }

    fn owner(&self) -> ServiceId {
        self.owner.clone()
    }

    fn arguments(&self) -> Value {
        serde_json::to_value(&self.arguments).unwrap_or_default()
    }

    fn request(&self) -> Arc<RequestContext> {
        Arc::clone(&self.request)
    }

    async fn on_spawn(self: Arc<Self>) {
        let outcome = self.run().await;
        let result = match outcome {
            Ok(reply) => ProcessResult::success(
                json!({"reply": reply})
                    .as_object()
                    .expect("object literal")
                    .clone(),
            ),
            Err(err) => ProcessResult::from_error_info(err.as_info()),
        };
        if let Err(err) = send_result(self.as_ref(), result).await {
            debug!(uri = %self.uri, error = %err, "chatbot result update skipped");
        }

        self.done.set();
        if let Some(client) = self.client() {
            client.send_done();
        }
    }

    async fn on_sigterm(self: Arc<Self>) {
        // Runtime shutdown reuses the client-stop path to wind the loop
        // down; headless runs are covered by the process-wide signal.
        if let Some(client) = self.client() {
            client.stop.set();
        }
        let _ = tokio::time::timeout(SIGTERM_DRAIN, self.done.wait()).await;

        // When the loop did not manage to produce a result, record the stop.
        let has_result = self
            .request
            .workspace()
            .ok()
            .and_then(|workspace| workspace.try_get_status(&self.uri))
            .is_some_and(|status| status.result.is_some());
        if !has_result {
            if let Err(err) = send_result(self.as_ref(), ProcessResult::stopped()).await {
                warn!(uri = %self.uri, error = %err, "chatbot sigterm update failed");
            }
        }
    }
}
