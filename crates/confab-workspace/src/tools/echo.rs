//! Echo: returns the input text as-is, to test the tools system.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::warn;

use confab_core::error::{AsErrorInfo, ErrorInfo, ErrorKind};
use confab_core::{ProcessName, ProcessUri, ServiceId};
use confab_process::{
    send_progress, send_result, Process, ProcessError, ProcessResult, RequestContext, Tool,
    ToolInfo,
};

const OWNER: &str = "svc-backend-tools";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EchoArguments {
    pub text: String,
}

pub struct Echo;

#[async_trait]
impl Tool for Echo {
    fn info(&self) -> ToolInfo {
        ToolInfo {
            name: "echo".parse().expect("static name"),
            description: "Return the input text as-is to test the tools system.".to_string(),
            arguments_schema: json!({
                "type": "object",
                "properties": {"text": {"type": "string"}},
                "required": ["text"],
            }),
            default_enabled: true,
        }
    }

    async fn spawn(
        &self,
        request: Arc<RequestContext>,
        process_uri: ProcessUri,
        arguments: Value,
    ) -> Result<Arc<dyn Process>, ProcessError> {
        Ok(Arc::new(EchoProcess {
            uri: process_uri,
            request,
            arguments,
        }))
    }
}

pub struct EchoProcess {
    uri: ProcessUri,
    request: Arc<RequestContext>,
    arguments: Value,
}

impl EchoProcess {
    async fn run(&self) -> Result<ProcessResult, ProcessError> {
        let arguments: EchoArguments = serde_json::from_value(self.arguments.clone())
            .map_err(|err| ProcessError::BadArguments {
                name: self.name(),
                reason: err.to_string(),
            })?;

        send_progress(self, json!({"received_text": arguments.text})).await?;

        if let Some(message) = arguments.text.strip_prefix("ERROR: ") {
            return Ok(ProcessResult::Failure {
                error: ErrorInfo::new(400, message, ErrorKind::Normal),
            });
        }
        Ok(ProcessResult::success(
            json!({"content": arguments.text})
                .as_object()
                .expect("object literal")
                .clone(),
        ))
    }
}

#[async_trait]
impl Process for EchoProcess {
    fn uri(&self) -> &ProcessUri {
        &self.uri
    }

    fn name(&self) -> ProcessName {
        "echo".parse().expect("static name")
    }

    fn owner(&self) -> ServiceId {
        OWNER.parse().expect("static service id")
    }

    fn arguments(&self) -> Value {
        self.arguments.clone()
    }

    fn arguments_schema(&self) -> Option<Value> {
        Some(Echo.info().arguments_schema)
    }

    fn request(&self) -> Arc<RequestContext> {
        Arc::clone(&self.request)
    }

    async fn on_spawn(self: Arc<Self>) {
        let result = match self.run().await {
            Ok(result) => result,
            Err(err) => ProcessResult::from_error_info(err.as_info()),
        };
        if let Err(err) = send_result(self.as_ref(), result).await {
            warn!(uri = %self.uri, error = %err, "echo result update failed");
        }
    }

    async fn on_sigterm(self: Arc<Self>) {
        confab_process::sigterm_stop(self.as_ref()).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use confab_core::{ProcessId, RequestId, Workspace};
    use confab_kv::KvStore;
    use confab_process::WorkspaceContext;
    use std::time::Duration;

    async fn spawn_echo(text: &str) -> (Arc<WorkspaceContext>, ProcessUri) {
        let workspace: Workspace = "ndw://internal/default-unit-test".parse().unwrap();
        let context = WorkspaceContext::new(workspace.clone(), KvStore::memory());
        let request = RequestContext::create(&context, RequestId::generate()).unwrap();

        let uri = ProcessUri::root(workspace, ProcessId::generate());
        let process = Echo
            .spawn(request, uri.clone(), json!({"text": text}))
            .await
            .unwrap();
        context.spawn(process).await.unwrap();

        let listener = context.listener(&uri).unwrap();
        tokio::time::timeout(Duration::from_secs(2), listener.wait_result())
            .await
            .unwrap()
            .unwrap();
        (context, uri)
    }

    #[tokio::test]
    async fn echo_reports_progress_then_success() {
        let (context, uri) = spawn_echo("Hello, world!").await;
        let status = context.get_status(&uri).unwrap();

        assert_eq!(status.progress, vec![json!({"received_text": "Hello, world!"})]);
        let Some(ProcessResult::Success { value }) = status.result else {
            panic!("expected success, got {:?}", status.result);
        };
        assert_eq!(value.get("content"), Some(&json!("Hello, world!")));
    }

    #[tokio::test]
    async fn echo_error_prefix_fails_with_code_400() {
        let (context, uri) = spawn_echo("ERROR: boom").await;
        let status = context.get_status(&uri).unwrap();

        let Some(ProcessResult::Failure { error }) = status.result else {
            panic!("expected failure, got {:?}", status.result);
        };
        assert_eq!(error.code, 400);
        assert_eq!(error.message, "boom");
    }

    #[tokio::test]
    async fn echo_rejects_bad_arguments_at_spawn() {
        let workspace: Workspace = "ndw://internal/default-unit-test".parse().unwrap();
        let context = WorkspaceContext::new(workspace.clone(), KvStore::memory());
        let request = RequestContext::create(&context, RequestId::generate()).unwrap();

        let uri = ProcessUri::root(workspace, ProcessId::generate());
        let process = Echo
            .spawn(request, uri.clone(), json!({"wrong": 1}))
            .await
            .unwrap();
        assert!(matches!(
            context.spawn(process).await,
            Err(ProcessError::BadArguments { .. })
        ));
    }
}
