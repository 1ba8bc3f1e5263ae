//! The `Process` trait and the spawn sequence.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use confab_core::{ProcessName, ProcessUri, ServiceId};
use confab_kv::EXP_WEEK;

use crate::context::{RequestContext, WorkspaceContext};
use crate::schema::validate_arguments;
use crate::status::{ProcessResult, ProcessStatus};
use crate::ProcessError;

pub const KEY_PROCESS_EXECUTOR: &str = "process:executor:";
pub const KEY_PROCESS_STATUS: &str = "process:status:";

/// A durable unit of execution.
///
/// Implementations hold their own arguments and any run state behind interior
/// mutability: the spawn machinery only sees the trait.
#[async_trait]
pub trait Process: Send + Sync {
    fn uri(&self) -> &ProcessUri;
    fn name(&self) -> ProcessName;
    /// The service that owns the process (receives its tool results).
    fn owner(&self) -> ServiceId;
    fn arguments(&self) -> Value;
    fn arguments_schema(&self) -> Option<Value> {
        None
    }
    fn request(&self) -> Arc<RequestContext>;

    /// The body of the process, run as a background task after spawn.
    async fn on_spawn(self: Arc<Self>);

    /// Delivered when the replica restarts. Processes without restart
    /// support stop here (see [`sigterm_stop`]); ones that can resume must
    /// persist enough state to do so.
    async fn on_sigterm(self: Arc<Self>);
}

/// The standard SIGTERM behavior: assign `Stopped{stopped}` and return.
pub async fn sigterm_stop(process: &dyn Process) {
    let result = send_update(process, Vec::new(), Some(ProcessResult::stopped())).await;
    if let Err(err) = result {
        warn!(uri = %process.uri(), error = %err, "sigterm update failed");
    }
}

/// What gets persisted at `process:executor:{uri}` so other replicas can
/// inspect or restart the process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessDefinition {
    pub process_uri: ProcessUri,
    pub name: ProcessName,
    pub owner: ServiceId,
    pub arguments: Value,
    pub created_at: DateTime<Utc>,
}

impl WorkspaceContext {
    /// Spawn a process: atomically (from the caller's point of view) validate
    /// uniqueness and arguments, persist the definition and initial status,
    /// then start the background task.
    pub async fn spawn(self: &Arc<Self>, process: Arc<dyn Process>) -> Result<(), ProcessError> {
        let uri = process.uri().clone();

        if self.refresh_status(&uri).await?.is_some() {
            return Err(ProcessError::Duplicate(uri));
        }

        // Do not store the definition or status on invalid arguments.
        let arguments = process.arguments();
        if let Some(schema) = process.arguments_schema() {
            validate_arguments(&schema, &arguments).map_err(|reason| {
                ProcessError::BadArguments {
                    name: process.name(),
                    reason,
                }
            })?;
        }

        // Store the definition, to allow interacting with the process from
        // other replicas.
        let definition = ProcessDefinition {
            process_uri: uri.clone(),
            name: process.name(),
            owner: process.owner(),
            arguments: arguments.clone(),
            created_at: Utc::now(),
        };
        let key_executor = format!("{}{}", KEY_PROCESS_EXECUTOR, uri.as_kv_path());
        self.kv
            .set_one(&key_executor, &definition, Some(EXP_WEEK))
            .await?;

        let status = ProcessStatus::new(
            process.request().request_id.clone(),
            uri.clone(),
            process.name(),
            arguments,
        );
        self.save_status(status).await?;

        self.register_process(Arc::clone(&process));
        self.spawn_task(async move { process.on_spawn().await });
        Ok(())
    }
}

/// Append progress and/or assign the result of a process, persisting the new
/// status and notifying listeners when it changed.
pub async fn send_update(
    process: &dyn Process,
    progress: Vec<Value>,
    result: Option<ProcessResult>,
) -> Result<ProcessStatus, ProcessError> {
    let context = process.request().workspace()?;
    let mut status = context.get_status(process.uri())?;
    status.update(progress, result)?;
    context.save_status(status.clone()).await?;
    Ok(status)
}

pub async fn send_progress(
    process: &dyn Process,
    progress: Value,
) -> Result<ProcessStatus, ProcessError> {
    send_update(process, vec![progress], None).await
}

pub async fn send_result(
    process: &dyn Process,
    result: ProcessResult,
) -> Result<ProcessStatus, ProcessError> {
    send_update(process, Vec::new(), Some(result)).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use confab_core::RequestId;
    use confab_kv::KvStore;
    use serde_json::json;
    use std::time::Duration;

    struct FakeProcess {
        uri: ProcessUri,
        request: Arc<RequestContext>,
        arguments: Value,
        schema: Option<Value>,
    }

    #[async_trait]
    impl Process for FakeProcess {
        fn uri(&self) -> &ProcessUri {
            &self.uri
        }

        fn name(&self) -> ProcessName {
            "echo".parse().unwrap()
        }

        fn owner(&self) -> ServiceId {
            "svc-backend-tools".parse().unwrap()
        }

        fn arguments(&self) -> Value {
            self.arguments.clone()
        }

        fn arguments_schema(&self) -> Option<Value> {
            self.schema.clone()
        }

        fn request(&self) -> Arc<RequestContext> {
            Arc::clone(&self.request)
        }

        async fn on_spawn(self: Arc<Self>) {
            let _ = send_progress(self.as_ref(), json!({"started": true})).await;
            let _ = send_result(
                self.as_ref(),
                ProcessResult::success(json!({"ok": true}).as_object().unwrap().clone()),
            )
            .await;
        }

        async fn on_sigterm(self: Arc<Self>) {
            sigterm_stop(self.as_ref()).await;
        }
    }

    fn setup() -> (Arc<WorkspaceContext>, Arc<RequestContext>) {
        let context = WorkspaceContext::new(
            "ndw://internal/default-unit-test".parse().unwrap(),
            KvStore::memory(),
        );
        let request = RequestContext::create(&context, RequestId::generate()).unwrap();
        (context, request)
    }

    #[tokio::test]
    async fn spawn_runs_the_process_to_completion() {
        let (context, request) = setup();
        let uri = ProcessUri::stub("1");
        let process = Arc::new(FakeProcess {
            uri: uri.clone(),
            request,
            arguments: json!({"text": "hello"}),
            schema: None,
        });

        context.spawn(process).await.unwrap();
        let listener = context.listener(&uri).unwrap();
        tokio::time::timeout(Duration::from_secs(2), listener.wait_result())
            .await
            .unwrap()
            .unwrap();

        let status = context.get_status(&uri).unwrap();
        assert_eq!(status.progress, vec![json!({"started": true})]);
        assert!(matches!(status.result, Some(ProcessResult::Success { .. })));

        // The definition and status were persisted.
        let key = format!("{}{}", KEY_PROCESS_EXECUTOR, uri.as_kv_path());
        let definition: Option<ProcessDefinition> = context.kv.get(&key).await.unwrap();
        assert!(definition.is_some());
    }

    #[tokio::test]
    async fn spawn_rejects_duplicates() {
        let (context, request) = setup();
        let uri = ProcessUri::stub("1");
        let process = Arc::new(FakeProcess {
            uri: uri.clone(),
            request: Arc::clone(&request),
            arguments: json!({}),
            schema: None,
        });
        context.spawn(process).await.unwrap();

        let duplicate = Arc::new(FakeProcess {
            uri,
            request,
            arguments: json!({}),
            schema: None,
        });
        assert!(matches!(
            context.spawn(duplicate).await,
            Err(ProcessError::Duplicate(_))
        ));
    }

    #[tokio::test]
    async fn spawn_rejects_bad_arguments_without_creating_status() {
        let (context, request) = setup();
        let uri = ProcessUri::stub("1");
        let process = Arc::new(FakeProcess {
            uri: uri.clone(),
            request,
            arguments: json!({"wrong": 1}),
            schema: Some(json!({
                "type": "object",
                "properties": {"text": {"type": "string"}},
                "required": ["text"],
            })),
        });

        assert!(matches!(
            context.spawn(process).await,
            Err(ProcessError::BadArguments { .. })
        ));
        assert!(context.try_get_status(&uri).is_none());
    }
}
