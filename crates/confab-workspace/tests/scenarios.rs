//! End-to-end scenarios over the in-memory KV store: a request enters the
//! workspace queue, the supervisor dispatches it, and responses stream back
//! on the channel until the close sentinel.

use std::time::Duration;

use futures_util::{pin_mut, StreamExt};
use serde_json::json;

use confab_core::config::ConfabConfig;
use confab_core::{ProcessId, ProcessUri, Workspace};
use confab_kv::KvStore;
use confab_process::ProcessResult;
use confab_workspace::{
    RequestInfo, WorkspaceRegistry, WorkspaceRequest, WorkspaceResponse, WorkspaceStore,
};

fn workspace() -> Workspace {
    "ndw://internal/default-unit-test".parse().unwrap()
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

async fn start_server(kv: &KvStore) -> (std::sync::Arc<WorkspaceRegistry>, WorkspaceStore) {
    init_tracing();
    let registry = WorkspaceRegistry::new(ConfabConfig::default());
    let server = registry
        .try_acquire(kv, &workspace())
        .await
        .unwrap()
        .expect("lock acquired");
    assert_eq!(server.context.workspace, workspace());
    let store = registry.store(kv, &workspace());
    (registry, store)
}

async fn collect_responses(
    store: &WorkspaceStore,
    request: WorkspaceRequest,
) -> Vec<WorkspaceResponse> {
    let stream = store.send_request(request, 1);
    pin_mut!(stream);

    let mut responses = Vec::new();
    loop {
        let next = tokio::time::timeout(Duration::from_secs(30), stream.next()).await;
        match next.expect("response stream stalled") {
            Some(item) => responses.push(item.expect("stream error")),
            None => break,
        }
    }
    responses
}

#[tokio::test]
async fn s1_echo_reports_progress_then_success() {
    let kv = KvStore::memory();
    let (_registry, store) = start_server(&kv).await;

    let process_id = ProcessId::generate();
    let responses = collect_responses(
        &store,
        WorkspaceRequest::ProcessSpawn {
            workspace: workspace(),
            request: RequestInfo::new(None),
            process_id: process_id.clone(),
            name: "echo".parse().unwrap(),
            arguments: json!({"text": "Hello, world!"}),
            timestamp: chrono::Utc::now(),
        },
    )
    .await;

    assert!(!responses.is_empty());
    let WorkspaceResponse::Progress {
        process_uri,
        progress,
        result,
    } = responses.last().unwrap()
    else {
        panic!("expected progress response");
    };
    assert_eq!(process_uri.process_id, process_id);
    assert!(progress.contains(&json!({"received_text": "Hello, world!"})));

    let Some(ProcessResult::Success { value }) = result else {
        panic!("expected success, got {result:?}");
    };
    assert_eq!(value.get("content"), Some(&json!("Hello, world!")));
}

#[tokio::test]
async fn s2_echo_error_prefix_fails_with_message_and_code() {
    let kv = KvStore::memory();
    let (_registry, store) = start_server(&kv).await;

    let responses = collect_responses(
        &store,
        WorkspaceRequest::ProcessSpawn {
            workspace: workspace(),
            request: RequestInfo::new(None),
            process_id: ProcessId::generate(),
            name: "echo".parse().unwrap(),
            arguments: json!({"text": "ERROR: boom"}),
            timestamp: chrono::Utc::now(),
        },
    )
    .await;

    let WorkspaceResponse::Progress { result, .. } = responses.last().unwrap() else {
        panic!("expected progress response");
    };
    let Some(ProcessResult::Failure { error }) = result else {
        panic!("expected failure, got {result:?}");
    };
    assert_eq!(error.message, "boom");
    assert_eq!(error.code, 400);
}

#[tokio::test]
async fn unknown_tool_spawn_streams_an_error_then_closes() {
    let kv = KvStore::memory();
    let (_registry, store) = start_server(&kv).await;

    let stream = store.send_request(
        WorkspaceRequest::ProcessSpawn {
            workspace: workspace(),
            request: RequestInfo::new(None),
            process_id: ProcessId::generate(),
            name: "does_not_exist".parse().unwrap(),
            arguments: json!({}),
            timestamp: chrono::Utc::now(),
        },
        1,
    );
    pin_mut!(stream);

    let first = tokio::time::timeout(Duration::from_secs(30), stream.next())
        .await
        .expect("stream stalled")
        .expect("one item");
    let err = first.expect_err("expected the error sentinel");
    let info = confab_core::error::AsErrorInfo::as_info(&err);
    assert_eq!(info.code, 404);
}

#[tokio::test]
async fn sigkill_on_finished_process_surfaces_monotonicity_error() {
    let kv = KvStore::memory();
    let (_registry, store) = start_server(&kv).await;

    let process_id = ProcessId::generate();
    // Run echo to completion first.
    collect_responses(
        &store,
        WorkspaceRequest::ProcessSpawn {
            workspace: workspace(),
            request: RequestInfo::new(None),
            process_id: process_id.clone(),
            name: "echo".parse().unwrap(),
            arguments: json!({"text": "done"}),
            timestamp: chrono::Utc::now(),
        },
    )
    .await;

    let process_uri = ProcessUri::root(workspace(), process_id);
    let stream = store.send_request(
        WorkspaceRequest::ProcessSigkill {
            process_uri,
            timestamp: chrono::Utc::now(),
        },
        1,
    );
    pin_mut!(stream);
    let first = tokio::time::timeout(Duration::from_secs(30), stream.next())
        .await
        .expect("stream stalled")
        .expect("one item");
    assert!(first.is_err());
}

#[tokio::test]
async fn workspace_lock_is_a_cluster_singleton() {
    let kv = KvStore::memory();
    let registry_a = WorkspaceRegistry::new(ConfabConfig::default());
    let registry_b = WorkspaceRegistry::new(ConfabConfig::default());

    let held = registry_a.try_acquire(&kv, &workspace()).await.unwrap();
    assert!(held.is_some());

    // A second replica (fresh registry, same store) cannot become supervisor.
    let denied = registry_b.try_acquire(&kv, &workspace()).await.unwrap();
    assert!(denied.is_none());

    // The same replica reuses its running server.
    let reused = registry_a.try_acquire(&kv, &workspace()).await.unwrap();
    assert!(reused.is_some());
}

#[tokio::test]
async fn remote_update_after_result_is_rejected() {
    let kv = KvStore::memory();
    let (registry, store) = start_server(&kv).await;

    let process_id = ProcessId::generate();
    collect_responses(
        &store,
        WorkspaceRequest::ProcessSpawn {
            workspace: workspace(),
            request: RequestInfo::new(None),
            process_id: process_id.clone(),
            name: "echo".parse().unwrap(),
            arguments: json!({"text": "hi"}),
            timestamp: chrono::Utc::now(),
        },
    )
    .await;

    // Updating a process that already finished violates monotonicity and
    // surfaces as a stream error.
    let uri = ProcessUri::root(workspace(), process_id);
    let stream = store.send_request(
        WorkspaceRequest::ProcessUpdate {
            process_uri: uri.clone(),
            actions: Vec::new(),
            progress: vec![json!({"late": true})],
            result: None,
            timestamp: chrono::Utc::now(),
        },
        1,
    );
    pin_mut!(stream);
    let first = tokio::time::timeout(Duration::from_secs(30), stream.next())
        .await
        .expect("stream stalled")
        .expect("one item");
    assert!(first.is_err());

    // The status was left untouched.
    let server = registry
        .try_acquire(&kv, &workspace())
        .await
        .unwrap()
        .unwrap();
    let status = server.context.get_status(&uri).unwrap();
    assert!(!status.progress.contains(&json!({"late": true})));
}
