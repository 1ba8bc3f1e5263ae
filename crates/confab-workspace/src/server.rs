//! The per-workspace singleton supervisor.
//!
//! One supervisor per workspace across the whole cluster, enforced by the
//! `workspace:lock:{w}` distributed lock. The holder drains the request list
//! and dispatches each request on a background task; the loop itself never
//! blocks on a dispatch, so multiple requests share the workspace context.

use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use confab_core::config::ConfabConfig;
use confab_core::error::AsErrorInfo;
use confab_core::{shutdown, ProcessId, ProcessUri, ServiceId, Workspace};
use confab_core::unique_id::unique_id_random;
use confab_kv::{KvLock, KvStore};
use confab_process::{
    send_update, ProcessListener, RequestContext, WorkspaceContext,
};
use confab_threads::ThreadService;

use crate::chatbot::{ChatbotArguments, ChatbotProcess};
use crate::client_reply::ClientReplyService;
use crate::llm_service::LlmService;
use crate::requests::{ReplyStatus, WorkspaceRequest, WorkspaceResponse, WorkspaceStream};
use crate::store::WorkspaceStore;
use crate::tools::BackendTools;
use crate::WorkspaceError;

pub const LOCK_TIMEOUT_SECS: u64 = 120;
pub const LOCK_REFRESH_SECS: u64 = 60;
pub const POLL_INTERVAL_SECS: u64 = 10;

fn key_workspace_lock(workspace: &Workspace) -> String {
    format!("workspace:lock:{}", workspace.as_kv_path())
}

/// The replica-local set of running supervisors.
pub struct WorkspaceRegistry {
    running: DashMap<Workspace, Arc<WorkspaceServer>>,
    llm: Arc<LlmService>,
}

impl WorkspaceRegistry {
    pub fn new(config: ConfabConfig) -> Arc<Self> {
        Self::with_llm(LlmService::new(config))
    }

    pub fn with_llm(llm: Arc<LlmService>) -> Arc<Self> {
        Arc::new(Self {
            running: DashMap::new(),
            llm,
        })
    }

    /// Become (or find) the supervisor of a workspace.
    ///
    /// Returns `None` when another replica holds the lock; a later request
    /// simply triggers another attempt.
    pub async fn try_acquire(
        &self,
        kv: &KvStore,
        workspace: &Workspace,
    ) -> Result<Option<Arc<WorkspaceServer>>, WorkspaceError> {
        if let Some(server) = self.running.get(workspace) {
            return Ok(Some(Arc::clone(&server)));
        }

        let lock = kv
            .acquire_lock(&key_workspace_lock(workspace), LOCK_TIMEOUT_SECS)
            .await?;
        let Some(lock) = lock else {
            warn!(workspace = %workspace, "failed to acquire workspace lock");
            return Ok(None);
        };

        info!(workspace = %workspace, "starting workspace server");
        let context = WorkspaceContext::new(workspace.clone(), kv.clone());
        context.add_service(Arc::new(ThreadService::new(workspace.clone(), kv.clone())));
        context.add_service(Arc::clone(&self.llm));
        context.add_tool_provider(Arc::new(BackendTools));

        let server = Arc::new(WorkspaceServer { lock, context });
        self.running.insert(workspace.clone(), Arc::clone(&server));

        let running = Arc::clone(&server);
        tokio::spawn(async move { running.execution_loop().await });
        Ok(Some(server))
    }

    /// The store for issuing requests to a workspace (on any replica).
    pub fn store(&self, kv: &KvStore, workspace: &Workspace) -> WorkspaceStore {
        WorkspaceStore::new(kv.clone(), workspace.clone())
    }
}

pub struct WorkspaceServer {
    lock: KvLock,
    pub context: Arc<WorkspaceContext>,
}

impl WorkspaceServer {
    async fn execution_loop(self: Arc<Self>) {
        let store = WorkspaceStore::new(self.context.kv.clone(), self.context.workspace.clone());
        let mut last_refresh = Instant::now();

        while !shutdown::is_stopping() {
            if last_refresh.elapsed().as_secs() >= LOCK_REFRESH_SECS {
                if let Err(err) = self.lock.refresh().await {
                    error!(workspace = %self.context.workspace, error = %err, "lock refresh failed");
                }
                last_refresh = Instant::now();
            }

            match store.recv_request(&self.context, POLL_INTERVAL_SECS).await {
                Ok(Some((request, response))) => {
                    // Dispatch in the background: the loop keeps draining.
                    let server = Arc::clone(&self);
                    self.context
                        .spawn_task(async move { server.dispatch(request, response).await });
                }
                Ok(None) => continue,
                Err(err) => {
                    error!(workspace = %self.context.workspace, error = %err, "request poll failed");
                    tokio::time::sleep(std::time::Duration::from_secs(1)).await;
                }
            }
        }

        warn!(workspace = %self.context.workspace, "shutting down workspace");
        self.context.send_sigterm().await;
        if let Err(err) = self.lock.release().await {
            error!(workspace = %self.context.workspace, error = %err, "lock release failed");
        }
    }

    async fn dispatch(&self, request: WorkspaceRequest, response: mpsc::Sender<WorkspaceStream>) {
        match request {
            WorkspaceRequest::ChatbotSpawn {
                request,
                bot_id,
                persona,
                threads,
                tools,
                process_id,
                recv_timeout,
                ..
            } => {
                let outcome = self
                    .on_chatbot_spawn(
                        request.request_id,
                        bot_id,
                        persona,
                        threads,
                        tools,
                        process_id,
                        recv_timeout,
                        response.clone(),
                    )
                    .await;
                if let Err(err) = outcome {
                    send_error_close(&response, err).await;
                }
            }
            WorkspaceRequest::ProcessSpawn {
                request,
                process_id,
                name,
                arguments,
                ..
            } => {
                let outcome = self
                    .on_process_spawn(request.request_id, process_id, name, arguments, response.clone())
                    .await;
                if let Err(err) = outcome {
                    send_error_close(&response, err).await;
                }
            }
            WorkspaceRequest::ProcessSigkill { process_uri, .. } => {
                let outcome = self.on_process_sigkill(&process_uri).await;
                match outcome {
                    Ok(()) => send_close(&response).await,
                    Err(err) => send_error_close(&response, err).await,
                }
            }
            WorkspaceRequest::ProcessUpdate {
                process_uri,
                actions,
                progress,
                result,
                ..
            } => {
                let outcome = self
                    .on_process_update(&process_uri, actions, progress, result)
                    .await;
                match outcome {
                    Ok(()) => send_close(&response).await,
                    Err(err) => send_error_close(&response, err).await,
                }
            }
        }
    }

    ///
    /// Handlers
    ///

    #[allow(clippy::too_many_arguments)]
    async fn on_chatbot_spawn(
        &self,
        request_id: confab_core::RequestId,
        bot_id: confab_core::BotId,
        persona: Option<crate::bot::Persona>,
        threads: Vec<confab_core::ThreadUri>,
        tools: Vec<confab_process::ToolDefinition>,
        process_id: Option<ProcessId>,
        recv_timeout: u64,
        response: mpsc::Sender<WorkspaceStream>,
    ) -> Result<(), WorkspaceError> {
        let service_id: ServiceId = format!("svc-client-reply-{}", unique_id_random(8))
            .parse()
            .expect("generated service id");
        let client = ClientReplyService::new(service_id.clone(), tools);

        let request_ctx = RequestContext::create(&self.context, request_id)?;
        request_ctx.add_service(Arc::clone(&client));
        request_ctx.add_tool_provider(Arc::clone(&client) as Arc<dyn confab_process::ToolsProvider>);

        let uri = ProcessUri::root(
            self.context.workspace.clone(),
            process_id.unwrap_or_else(ProcessId::generate),
        );
        let process = ChatbotProcess::new(
            uri.clone(),
            request_ctx,
            service_id,
            ChatbotArguments {
                bot_id,
                persona,
                thread_uris: threads,
            },
        );
        self.context.spawn(process).await?;
        let listener = self.context.listener(&uri)?;

        self.context.spawn_task(poll_spawned_chatbot(
            client,
            listener,
            response,
            recv_timeout,
        ));
        Ok(())
    }

    async fn on_process_spawn(
        &self,
        request_id: confab_core::RequestId,
        process_id: ProcessId,
        name: confab_core::ProcessName,
        arguments: serde_json::Value,
        response: mpsc::Sender<WorkspaceStream>,
    ) -> Result<(), WorkspaceError> {
        let request_ctx = RequestContext::create(&self.context, request_id)?;
        let tool = self
            .context
            .list_tools(&request_ctx)
            .into_iter()
            .find(|tool| tool.info().name == name)
            .ok_or(confab_process::ProcessError::ToolNotFound { name })?;

        let uri = ProcessUri::root(self.context.workspace.clone(), process_id);
        let process = tool
            .spawn(request_ctx, uri.clone(), arguments)
            .await?;
        self.context.spawn(process).await?;
        let listener = self.context.listener(&uri)?;

        let context = Arc::clone(&self.context);
        self.context
            .spawn_task(poll_spawned_process(context, uri, listener, response));
        Ok(())
    }

    async fn on_process_sigkill(&self, process_uri: &ProcessUri) -> Result<(), WorkspaceError> {
        self.context.send_sigkill(process_uri).await?;
        Ok(())
    }

    /// Apply a remote update: append progress, assign the result when given,
    /// and forward client actions to the owning service's queue.
    async fn on_process_update(
        &self,
        process_uri: &ProcessUri,
        actions: Vec<crate::requests::ClientAction>,
        progress: Vec<serde_json::Value>,
        result: Option<confab_process::ProcessResult>,
    ) -> Result<(), WorkspaceError> {
        let process = self
            .context
            .process(process_uri)
            .ok_or_else(|| confab_process::ProcessError::NotFound(process_uri.clone()))?;
        send_update(process.as_ref(), progress, result).await?;

        if !actions.is_empty() {
            let store =
                WorkspaceStore::new(self.context.kv.clone(), self.context.workspace.clone());
            let owner = process.owner();
            for action in &actions {
                store.send_action(&owner, action).await?;
            }
        }
        Ok(())
    }
}

///
/// Response pollers
///

/// Emit provisional replies on every flush edge, then the final reply and
/// the close sentinel once the chatbot's result appears.
async fn poll_spawned_chatbot(
    client: Arc<ClientReplyService>,
    listener: ProcessListener,
    response: mpsc::Sender<WorkspaceStream>,
    recv_timeout: u64,
) {
    let recv_timeout = std::time::Duration::from_secs(recv_timeout.max(1));

    while !listener.has_result() {
        let fired = shutdown::with_timeout_flag(&client.flush, Some(recv_timeout)).await;
        client.flush.clear();
        if listener.has_result() {
            break;
        }
        if !fired && shutdown::is_stopping() {
            break;
        }

        let pulled = client.pull();
        let value = WorkspaceResponse::Reply {
            status: ReplyStatus::Provisional,
            summary: pulled.summary,
            reply: pulled.reply,
            actions: pulled.actions,
        };
        if send_value(&response, value).await.is_err() {
            return;
        }
    }

    let value = WorkspaceResponse::Reply {
        status: ReplyStatus::Done,
        summary: None,
        reply: client.pull_committed(),
        actions: client.pull_actions(),
    };
    let _ = send_value(&response, value).await;
    send_close(&response).await;
}

/// Emit a progress response on every status edge until the result appears.
async fn poll_spawned_process(
    context: Arc<WorkspaceContext>,
    uri: ProcessUri,
    listener: ProcessListener,
    response: mpsc::Sender<WorkspaceStream>,
) {
    loop {
        // The process may have finished before the first wait; the result
        // flag is level-triggered, so nothing is lost.
        if !listener.has_result() {
            match listener.wait_progress(None).await {
                Ok(true) => {}
                Ok(false) => continue,
                Err(err) => {
                    send_error_close(&response, WorkspaceError::from(err)).await;
                    return;
                }
            }
        }

        let Some(status) = context.try_get_status(&uri) else {
            continue;
        };
        let done = status.result.is_some();
        let value = WorkspaceResponse::Progress {
            process_uri: uri.clone(),
            progress: status.progress,
            result: status.result,
        };
        if send_value(&response, value).await.is_err() {
            return;
        }
        if done {
            break;
        }
    }
    send_close(&response).await;
}

async fn send_value(
    response: &mpsc::Sender<WorkspaceStream>,
    value: WorkspaceResponse,
) -> Result<(), ()> {
    response
        .send(WorkspaceStream::Value { value })
        .await
        .map_err(|_| ())
}

async fn send_close(response: &mpsc::Sender<WorkspaceStream>) {
    if response.send(WorkspaceStream::Close).await.is_err() {
        debug!("response channel pump gone before close");
    }
}

async fn send_error_close(response: &mpsc::Sender<WorkspaceStream>, err: WorkspaceError) {
    warn!(error = %err, "workspace request failed");
    let _ = response
        .send(WorkspaceStream::Error {
            error: err.as_info(),
        })
        .await;
    send_close(response).await;
}
