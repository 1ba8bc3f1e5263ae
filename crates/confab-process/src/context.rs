//! In-memory coordination state of one workspace on one replica.
//!
//! `WorkspaceContext` owns processes, statuses and listeners;
//! `RequestContext` is the per-request view holding request-local services.
//! Back-edges from processes to their request use `Weak`, keeping the graph
//! acyclic.

use std::any::Any;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use futures_util::future::join_all;
use tokio::task::JoinHandle;
use tracing::debug;

use confab_core::error::StoppedError;
use confab_core::{shutdown, Flag, ProcessUri, RequestId, Workspace};
use confab_kv::{KvStore, EXP_MONTH};

use crate::process::{Process, KEY_PROCESS_STATUS};
use crate::status::{ProcessResult, ProcessStatus};
use crate::tool::{Tool, ToolsProvider};
use crate::ProcessError;

/// Per-subscription pair of signals for one process.
///
/// `has_progress` is edge-triggered: waiting consumes it. `has_result` is
/// level-triggered: once set it stays set.
#[derive(Debug, Clone)]
pub struct ProcessListener {
    pub uri: ProcessUri,
    has_progress: Flag,
    has_result: Flag,
}

impl ProcessListener {
    fn new(uri: ProcessUri) -> Self {
        Self {
            uri,
            has_progress: Flag::new(),
            has_result: Flag::new(),
        }
    }

    /// Wait for the next progress edge. Returns `true` when progress fired,
    /// `false` on timeout, and errors when the process-wide stopping signal
    /// is set.
    pub async fn wait_progress(&self, timeout: Option<Duration>) -> Result<bool, StoppedError> {
        let _ = shutdown::with_timeout(self.has_progress.wait(), timeout).await;
        if self.has_progress.is_set() {
            self.has_progress.clear();
            Ok(true)
        } else {
            shutdown::assert_is_alive()?;
            Ok(false)
        }
    }

    /// Wait for the terminal result. Only gives up on the stopping signal.
    pub async fn wait_result(&self) -> Result<(), StoppedError> {
        shutdown::with_timeout(self.has_result.wait(), None).await?;
        if self.has_result.is_set() {
            Ok(())
        } else {
            Err(StoppedError::timeout())
        }
    }

    pub fn has_result(&self) -> bool {
        self.has_result.is_set()
    }

    fn notify(&self, has_result: bool) {
        self.has_progress.set();
        if has_result {
            self.has_result.set();
        }
    }
}

/// Replica-local coordination state for one workspace.
pub struct WorkspaceContext {
    pub workspace: Workspace,
    pub kv: KvStore,
    requests: Mutex<HashMap<RequestId, Arc<RequestContext>>>,
    statuses: Mutex<HashMap<ProcessUri, ProcessStatus>>,
    listeners: Mutex<HashMap<ProcessUri, Vec<ProcessListener>>>,
    processes: Mutex<HashMap<ProcessUri, Arc<dyn Process>>>,
    services: Mutex<Vec<Arc<dyn Any + Send + Sync>>>,
    tool_providers: Mutex<Vec<Arc<dyn ToolsProvider>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkspaceContext {
    pub fn new(workspace: Workspace, kv: KvStore) -> Arc<Self> {
        Arc::new(Self {
            workspace,
            kv,
            requests: Mutex::new(HashMap::new()),
            statuses: Mutex::new(HashMap::new()),
            listeners: Mutex::new(HashMap::new()),
            processes: Mutex::new(HashMap::new()),
            services: Mutex::new(Vec::new()),
            tool_providers: Mutex::new(Vec::new()),
            tasks: Mutex::new(Vec::new()),
        })
    }

    ///
    /// Services & tools
    ///

    pub fn add_service<T: Any + Send + Sync>(&self, service: Arc<T>) {
        self.services.lock().unwrap().push(service);
    }

    pub fn service<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        self.services
            .lock()
            .unwrap()
            .iter()
            .find_map(|service| Arc::clone(service).downcast::<T>().ok())
    }

    pub fn add_tool_provider(&self, provider: Arc<dyn ToolsProvider>) {
        self.tool_providers.lock().unwrap().push(provider);
    }

    /// Tools from workspace-wide providers plus the request's own providers.
    pub fn list_tools(&self, request: &RequestContext) -> Vec<Arc<dyn Tool>> {
        let mut tools: Vec<Arc<dyn Tool>> = self
            .tool_providers
            .lock()
            .unwrap()
            .iter()
            .flat_map(|provider| provider.list_tools())
            .collect();
        tools.extend(
            request
                .tool_providers
                .lock()
                .unwrap()
                .iter()
                .flat_map(|provider| provider.list_tools()),
        );
        tools
    }

    /// Spawn and track a background task for this workspace.
    pub fn spawn_task(&self, future: impl std::future::Future<Output = ()> + Send + 'static) {
        let mut tasks = self.tasks.lock().unwrap();
        tasks.retain(|task| !task.is_finished());
        tasks.push(tokio::spawn(future));
    }

    ///
    /// Process status
    ///

    /// Subscribe to status changes of a known process.
    pub fn listener(&self, uri: &ProcessUri) -> Result<ProcessListener, ProcessError> {
        let statuses = self.statuses.lock().unwrap();
        let status = statuses
            .get(uri)
            .ok_or_else(|| ProcessError::NotFound(uri.clone()))?;

        let listener = ProcessListener::new(uri.clone());
        if status.result.is_some() {
            listener.has_result.set();
        }
        self.listeners
            .lock()
            .unwrap()
            .entry(uri.clone())
            .or_default()
            .push(listener.clone());
        Ok(listener)
    }

    pub fn get_status(&self, uri: &ProcessUri) -> Result<ProcessStatus, ProcessError> {
        self.try_get_status(uri)
            .ok_or_else(|| ProcessError::NotFound(uri.clone()))
    }

    /// Snapshot of the cached status; external holders never observe torn
    /// writes.
    pub fn try_get_status(&self, uri: &ProcessUri) -> Option<ProcessStatus> {
        self.statuses.lock().unwrap().get(uri).cloned()
    }

    /// Re-read the status from the KV store (written by any replica).
    pub async fn refresh_status(
        &self,
        uri: &ProcessUri,
    ) -> Result<Option<ProcessStatus>, ProcessError> {
        let key = format!("{}{}", KEY_PROCESS_STATUS, uri.as_kv_path());
        let status: Option<ProcessStatus> = self.kv.get(&key).await?;
        if let Some(status) = &status {
            self.set_status(status.clone());
        }
        Ok(status)
    }

    /// Cache a status and notify listeners — but only when it changed.
    pub fn set_status(&self, status: ProcessStatus) {
        let uri = status.process_uri.clone();
        let has_result = status.result.is_some();
        {
            let mut statuses = self.statuses.lock().unwrap();
            if statuses.get(&uri) == Some(&status) {
                return; // Nothing changed, do not notify listeners.
            }
            statuses.insert(uri.clone(), status);
        }

        if let Some(listeners) = self.listeners.lock().unwrap().get(&uri) {
            for listener in listeners {
                listener.notify(has_result);
            }
        }
    }

    /// Persist a status and propagate it to listeners.
    pub async fn save_status(&self, status: ProcessStatus) -> Result<(), ProcessError> {
        if self.try_get_status(&status.process_uri).as_ref() == Some(&status) {
            return Ok(()); // Nothing changed, skip the write.
        }
        let key = format!("{}{}", KEY_PROCESS_STATUS, status.process_uri.as_kv_path());
        self.kv.set_one(&key, &status, Some(EXP_MONTH)).await?;
        self.set_status(status);
        Ok(())
    }

    pub fn process(&self, uri: &ProcessUri) -> Option<Arc<dyn Process>> {
        self.processes.lock().unwrap().get(uri).cloned()
    }

    pub(crate) fn register_process(&self, process: Arc<dyn Process>) {
        self.processes
            .lock()
            .unwrap()
            .insert(process.uri().clone(), process);
    }

    ///
    /// Signals
    ///

    /// Deliver `Stopped{stopped}` to a process and release its listeners.
    pub async fn send_sigkill(&self, uri: &ProcessUri) -> Result<(), ProcessError> {
        let mut status = self.get_status(uri)?;
        status.update(Vec::new(), Some(ProcessResult::stopped()))?;
        self.save_status(status).await?;
        debug!(uri = %uri, "process sigkilled");
        Ok(())
    }

    /// SIGTERM every active process, gathering results and ignoring
    /// individual failures.
    pub async fn send_sigterm(&self) {
        let processes: Vec<Arc<dyn Process>> =
            self.processes.lock().unwrap().values().cloned().collect();
        let results = join_all(
            processes
                .into_iter()
                .map(|process| async move { process.on_sigterm().await }),
        )
        .await;
        if !results.is_empty() {
            debug!(count = results.len(), workspace = %self.workspace, "processes sigtermed");
        }
    }
}

/// The per-request slice of a workspace: auth/correlation id plus
/// request-local services (e.g. the client-reply buffer).
pub struct RequestContext {
    workspace: Weak<WorkspaceContext>,
    pub request_id: RequestId,
    services: Mutex<Vec<Arc<dyn Any + Send + Sync>>>,
    tool_providers: Mutex<Vec<Arc<dyn ToolsProvider>>>,
}

impl RequestContext {
    pub fn create(
        workspace: &Arc<WorkspaceContext>,
        request_id: RequestId,
    ) -> Result<Arc<Self>, ProcessError> {
        let mut requests = workspace.requests.lock().unwrap();
        if requests.contains_key(&request_id) {
            return Err(ProcessError::BadRequest(format!(
                "request '{request_id}' already exists in workspace"
            )));
        }

        let context = Arc::new(Self {
            workspace: Arc::downgrade(workspace),
            request_id: request_id.clone(),
            services: Mutex::new(Vec::new()),
            tool_providers: Mutex::new(Vec::new()),
        });
        requests.insert(request_id, Arc::clone(&context));
        Ok(context)
    }

    /// Upgrade the weak back-edge; fails once the workspace shut down.
    pub fn workspace(&self) -> Result<Arc<WorkspaceContext>, ProcessError> {
        self.workspace.upgrade().ok_or(ProcessError::ContextGone)
    }

    pub fn add_service<T: Any + Send + Sync>(&self, service: Arc<T>) {
        self.services.lock().unwrap().push(service);
    }

    /// Request-local service, falling back to the workspace registry.
    pub fn service<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        let local = self
            .services
            .lock()
            .unwrap()
            .iter()
            .find_map(|service| Arc::clone(service).downcast::<T>().ok());
        match local {
            Some(service) => Some(service),
            None => self.workspace().ok()?.service::<T>(),
        }
    }

    pub fn add_tool_provider(&self, provider: Arc<dyn ToolsProvider>) {
        self.tool_providers.lock().unwrap().push(provider);
    }

    pub fn drop_from_workspace(&self) {
        if let Some(workspace) = self.workspace.upgrade() {
            workspace.requests.lock().unwrap().remove(&self.request_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn context() -> Arc<WorkspaceContext> {
        WorkspaceContext::new(
            "ndw://internal/default-unit-test".parse().unwrap(),
            KvStore::memory(),
        )
    }

    fn seeded_status(uri: &ProcessUri) -> ProcessStatus {
        ProcessStatus::new(
            RequestId::generate(),
            uri.clone(),
            "echo".parse().unwrap(),
            json!({}),
        )
    }

    #[tokio::test]
    async fn listener_requires_known_process() {
        let ctx = context();
        let uri = ProcessUri::stub("1");
        assert!(matches!(ctx.listener(&uri), Err(ProcessError::NotFound(_))));

        ctx.set_status(seeded_status(&uri));
        assert!(ctx.listener(&uri).is_ok());
    }

    #[tokio::test]
    async fn listener_progress_is_edge_triggered() {
        let ctx = context();
        let uri = ProcessUri::stub("1");
        let mut status = seeded_status(&uri);
        ctx.set_status(status.clone());
        let listener = ctx.listener(&uri).unwrap();

        status.update(vec![json!({"step": 1})], None).unwrap();
        ctx.set_status(status.clone());

        assert!(listener
            .wait_progress(Some(Duration::from_millis(50)))
            .await
            .unwrap());
        // The edge was consumed: a second wait times out.
        assert!(!listener
            .wait_progress(Some(Duration::from_millis(50)))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn listener_result_is_level_triggered() {
        let ctx = context();
        let uri = ProcessUri::stub("1");
        let mut status = seeded_status(&uri);
        ctx.set_status(status.clone());
        let listener = ctx.listener(&uri).unwrap();

        status.update(Vec::new(), Some(ProcessResult::stopped())).unwrap();
        ctx.set_status(status);

        listener.wait_result().await.unwrap();
        listener.wait_result().await.unwrap(); // Still set.
        assert!(listener.has_result());
    }

    #[tokio::test]
    async fn unchanged_status_does_not_notify() {
        let ctx = context();
        let uri = ProcessUri::stub("1");
        let status = seeded_status(&uri);
        ctx.set_status(status.clone());
        let listener = ctx.listener(&uri).unwrap();

        ctx.set_status(status);
        assert!(!listener
            .wait_progress(Some(Duration::from_millis(50)))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn sigkill_sets_stopped_result() {
        let ctx = context();
        let uri = ProcessUri::stub("1");
        ctx.set_status(seeded_status(&uri));
        let listener = ctx.listener(&uri).unwrap();

        ctx.send_sigkill(&uri).await.unwrap();
        listener.wait_result().await.unwrap();
        assert_eq!(
            ctx.get_status(&uri).unwrap().result,
            Some(ProcessResult::stopped())
        );

        // A second sigkill violates result monotonicity.
        assert!(matches!(
            ctx.send_sigkill(&uri).await,
            Err(ProcessError::UpdateAfterResult(_))
        ));
    }

    #[tokio::test]
    async fn duplicate_request_ids_are_rejected() {
        let ctx = context();
        let request_id = RequestId::generate();
        let _first = RequestContext::create(&ctx, request_id.clone()).unwrap();
        assert!(RequestContext::create(&ctx, request_id).is_err());
    }
}
