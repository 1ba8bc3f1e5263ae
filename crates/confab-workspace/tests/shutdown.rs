//! Global SIGTERM behavior, isolated in its own test binary because the
//! stopping signal is process-wide.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use serde_json::{json, Value};

use confab_core::config::ConfabConfig;
use confab_core::{shutdown, BotId, ProcessId, ProcessUri, UserId, Workspace};
use confab_kv::KvStore;
use confab_llm::{
    CompletionArgs, CompletionDriver, LlmCallback, LlmError, LlmHistory, ModelInfo,
    NativeCompletion, XmlSection,
};
use confab_process::ProcessResult;
use confab_threads::{ThreadMessage, ThreadService};
use confab_workspace::{LlmService, RequestInfo, WorkspaceRegistry, WorkspaceRequest};

/// Hangs until the stopping signal aborts the request.
struct HangingDriver;

#[async_trait]
impl CompletionDriver for HangingDriver {
    fn build_params(
        &self,
        _info: &ModelInfo,
        _args: &CompletionArgs,
        history: &mut LlmHistory,
    ) -> Result<Value, LlmError> {
        let _ = history.render_openai(0)?;
        Ok(json!({}))
    }

    async fn execute(
        &self,
        _info: &ModelInfo,
        _params: &Value,
        _callback: Option<&LlmCallback>,
        _xml_sections: &[XmlSection],
    ) -> Result<NativeCompletion, LlmError> {
        shutdown::with_timeout(tokio::time::sleep(Duration::from_secs(120)), None).await?;
        Ok(NativeCompletion::default())
    }
}

#[tokio::test]
async fn sigterm_stops_processes_and_releases_the_lock() {
    let workspace: Workspace = "ndw://internal/default-unit-test".parse().unwrap();
    let thread_uri = "nkt://internal/default-unit-test/thread-9e7xc0000123456789abcdef"
        .parse()
        .unwrap();
    let kv = KvStore::memory();

    let llm = LlmService::with_driver(ConfabConfig::default(), Arc::new(HangingDriver));
    let registry = WorkspaceRegistry::with_llm(llm);
    let server = registry
        .try_acquire(&kv, &workspace)
        .await
        .unwrap()
        .expect("lock acquired");

    let threads = ThreadService::new(workspace.clone(), kv.clone());
    threads
        .push_message(&thread_uri, ThreadMessage::user(UserId::generate(), "hello"))
        .await
        .unwrap();

    let chatbot_id = ProcessId::generate();
    let chatbot_uri = ProcessUri::root(workspace.clone(), chatbot_id.clone());
    let store = registry.store(&kv, &workspace);

    let stream = store.send_request(
        WorkspaceRequest::ChatbotSpawn {
            workspace: workspace.clone(),
            request: RequestInfo::new(None),
            bot_id: BotId::new("helper").unwrap(),
            persona: None,
            threads: vec![thread_uri],
            tools: Vec::new(),
            process_id: Some(chatbot_id),
            recv_timeout: 1,
            timestamp: chrono::Utc::now(),
        },
        1,
    );
    futures_util::pin_mut!(stream);

    // Poll once so the request lands and the chatbot starts its completion,
    // which then hangs in the driver.
    let first = tokio::time::timeout(Duration::from_secs(10), stream.next()).await;
    assert!(first.is_ok(), "no provisional response before shutdown");

    shutdown::send_sigterm();

    // The supervisor notices within its polling cadence, SIGTERMs every
    // in-flight process, then releases the lock.
    tokio::time::sleep(Duration::from_secs(8)).await;

    let status = server.context.get_status(&chatbot_uri).unwrap();
    assert!(
        matches!(status.result, Some(ProcessResult::Stopped { .. })),
        "expected a stopped result, got {:?}",
        status.result
    );

    let relock = kv
        .acquire_lock("workspace:lock:internal/default-unit-test", 120)
        .await
        .unwrap();
    assert!(relock.is_some(), "lock was not released on shutdown");

    shutdown::reset_sigterm();
}
