//! Chatbot orchestration scenarios, driven by the scripted completion
//! driver: committed replies, tool spawning and result injection, session
//! state across turns, and cancellation.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{pin_mut, StreamExt};
use serde_json::{json, Value};

use confab_core::config::ConfabConfig;
use confab_core::{BotId, ProcessId, ProcessUri, RequestId, ThreadUri, UserId, Workspace};
use confab_kv::KvStore;
use confab_llm::scripted::{ScriptedCompletion, ScriptedDriver};
use confab_llm::{
    CompletionArgs, CompletionDriver, LlmCallback, LlmHistory, LlmState, ModelInfo,
    NativeCompletion, XmlSection,
};
use confab_process::{
    send_update, ProcessResult, RequestContext, ToolDefinition, ToolsProvider, WorkspaceContext,
};
use confab_threads::{BotMessagePart, ThreadMessage, ThreadService};
use confab_workspace::{
    bot_acquire, ChatbotArguments, ChatbotProcess, ClientReplyService, LlmService, ReplyStatus,
    RequestInfo, WorkspaceRegistry, WorkspaceRequest, WorkspaceResponse, WorkspaceStore,
};

fn workspace() -> Workspace {
    "ndw://internal/default-unit-test".parse().unwrap()
}

fn thread_uri() -> ThreadUri {
    "nkt://internal/default-unit-test/thread-9e7xc0000123456789abcdef"
        .parse()
        .unwrap()
}

fn bot_id() -> BotId {
    BotId::new("helper").unwrap()
}

fn client_tools() -> Vec<ToolDefinition> {
    ["generate_image", "read_docs", "web_search"]
        .into_iter()
        .map(|name| ToolDefinition {
            name: name.parse().unwrap(),
            description: format!("The {name} tool."),
            arguments_schema: json!({"type": "object"}),
        })
        .collect()
}

async fn seed_user_message(kv: &KvStore, text: &str) {
    let threads = ThreadService::new(workspace(), kv.clone());
    threads
        .push_message(&thread_uri(), ThreadMessage::user(UserId::generate(), text))
        .await
        .unwrap();
}

async fn start_server(
    kv: &KvStore,
    driver: Arc<dyn CompletionDriver>,
) -> (Arc<WorkspaceRegistry>, WorkspaceStore) {
    let llm = LlmService::with_driver(ConfabConfig::default(), driver);
    let registry = WorkspaceRegistry::with_llm(llm);
    registry
        .try_acquire(kv, &workspace())
        .await
        .unwrap()
        .expect("lock acquired");
    (registry.clone(), registry.store(kv, &workspace()))
}

fn chatbot_spawn(process_id: ProcessId) -> WorkspaceRequest {
    WorkspaceRequest::ChatbotSpawn {
        workspace: workspace(),
        request: RequestInfo::new(None),
        bot_id: bot_id(),
        persona: None,
        threads: vec![thread_uri()],
        tools: client_tools(),
        process_id: Some(process_id),
        recv_timeout: 1,
        timestamp: chrono::Utc::now(),
    }
}

/// Drain a chatbot response stream, returning the final committed reply.
async fn drive_to_done(
    store: &WorkspaceStore,
    request: WorkspaceRequest,
) -> Vec<BotMessagePart> {
    let stream = store.send_request(request, 1);
    pin_mut!(stream);

    let mut last_done: Option<Vec<BotMessagePart>> = None;
    loop {
        let next = tokio::time::timeout(Duration::from_secs(30), stream.next()).await;
        match next.expect("response stream stalled") {
            Some(item) => {
                if let WorkspaceResponse::Reply { status, reply, .. } =
                    item.expect("stream error")
                {
                    if status == ReplyStatus::Done {
                        last_done = Some(reply);
                    }
                }
            }
            None => break,
        }
    }
    last_done.expect("no done reply")
}

#[tokio::test]
async fn s3_plain_answer_commits_one_text_and_no_tools() {
    let kv = KvStore::memory();
    let driver = Arc::new(ScriptedDriver::new(vec![ScriptedCompletion::text("boop")]));
    let (_registry, store) = start_server(&kv, driver).await;
    seed_user_message(&kv, "Answer with 'boop' and nothing else.").await;

    let reply = drive_to_done(&store, chatbot_spawn(ProcessId::generate())).await;

    let texts: Vec<&BotMessagePart> = reply
        .iter()
        .filter(|part| matches!(part, BotMessagePart::Text { .. }))
        .collect();
    assert_eq!(texts.len(), 1);
    let BotMessagePart::Text { text, .. } = texts[0] else {
        unreachable!();
    };
    assert!(text.to_lowercase().starts_with("boop"));
    assert!(!reply
        .iter()
        .any(|part| matches!(part, BotMessagePart::Tool { .. })));
}

#[tokio::test]
async fn s4_tool_call_commits_a_tool_part_and_feeds_the_result_back() {
    let kv = KvStore::memory();
    let driver = Arc::new(ScriptedDriver::new(vec![
        ScriptedCompletion::default().with_tool_call(
            "generate_image",
            json!({"prompt": "a greenhouse on a spaceship"}),
        ),
        ScriptedCompletion::text("Here is your image."),
    ]));
    let (_registry, store) = start_server(&kv, Arc::clone(&driver) as _).await;
    seed_user_message(
        &kv,
        "Generate an image with the exact prompt: a greenhouse on a spaceship",
    )
    .await;

    let chatbot_id = ProcessId::generate();
    let chatbot_uri = ProcessUri::root(workspace(), chatbot_id.clone());

    let stream = store.send_request(chatbot_spawn(chatbot_id), 1);
    pin_mut!(stream);

    let mut resolved_tool = false;
    let mut done_reply: Option<Vec<BotMessagePart>> = None;
    loop {
        let next = tokio::time::timeout(Duration::from_secs(30), stream.next()).await;
        let Some(item) = next.expect("response stream stalled") else {
            break;
        };
        let WorkspaceResponse::Reply { status, reply, .. } = item.expect("stream error") else {
            continue;
        };

        // Once the tool call is committed, play the client's part: push the
        // result through process/update.
        if !resolved_tool {
            if let Some(BotMessagePart::Tool { process_id, .. }) = reply
                .iter()
                .find(|part| matches!(part, BotMessagePart::Tool { .. }))
            {
                resolved_tool = true;
                let child_uri = chatbot_uri.child(process_id.clone());
                push_tool_result(&store, child_uri).await;
            }
        }

        if status == ReplyStatus::Done {
            done_reply = Some(reply);
        }
    }

    let reply = done_reply.expect("no done reply");
    let tool = reply
        .iter()
        .find_map(|part| match part {
            BotMessagePart::Tool {
                name, arguments, ..
            } => Some((name.clone(), arguments.clone())),
            _ => None,
        })
        .expect("expected a committed tool part");
    assert_eq!(tool.0.as_str(), "generate_image");
    let prompt = tool.1.get("prompt").and_then(Value::as_str).unwrap();
    assert!(prompt.starts_with("a greenhouse on a spaceship"));

    // The second completion saw the tool result in its rendered request.
    let requests = driver.requests();
    assert_eq!(requests.len(), 2);
    let second = requests[1].params.to_string();
    assert!(second.contains("image generated"));
}

#[tokio::test]
async fn s5_session_state_carries_across_turns_with_signatures() {
    let kv = KvStore::memory();
    let driver = Arc::new(ScriptedDriver::new(vec![
        ScriptedCompletion::text("boop").with_thought("step one", Some("sig-exact-bytes")),
        ScriptedCompletion::text("fizzbuzz"),
    ]));
    let (_registry, store) = start_server(&kv, driver).await;

    seed_user_message(&kv, "Answer with 'boop' and nothing else.").await;
    let first = drive_to_done(&store, chatbot_spawn(ProcessId::generate())).await;
    let BotMessagePart::Text { text, .. } = &first[0] else {
        panic!("expected text");
    };
    assert!(text.starts_with("boop"));

    seed_user_message(&kv, "Answer with 'fizzbuzz' and nothing else.").await;
    let second = drive_to_done(&store, chatbot_spawn(ProcessId::generate())).await;
    let BotMessagePart::Text { text, .. } = &second[0] else {
        panic!("expected text");
    };
    assert!(text.starts_with("fizzbuzz"));

    // The saved session preserved the reasoning signature byte-for-byte.
    let state = bot_acquire(&kv, &workspace(), &bot_id()).await.unwrap();
    let llm_state: LlmState = serde_json::from_value(state.llm_state.unwrap()).unwrap();
    let signatures: Vec<String> = history_signatures(&llm_state.history);
    assert!(signatures.contains(&"sig-exact-bytes".to_string()));

    // Cursors advanced: a third run sees no new messages.
    assert_eq!(state.thread_cursors.len(), 1);
}

/// Push a client tool result via `process/update`, retrying while the child
/// process is still being spawned.
async fn push_tool_result(store: &WorkspaceStore, child_uri: ProcessUri) {
    for _ in 0..20 {
        let update = store.send_request(
            WorkspaceRequest::ProcessUpdate {
                process_uri: child_uri.clone(),
                actions: Vec::new(),
                progress: Vec::new(),
                result: Some(ProcessResult::success(
                    json!({"content": "image generated"})
                        .as_object()
                        .unwrap()
                        .clone(),
                )),
                timestamp: chrono::Utc::now(),
            },
            1,
        );
        pin_mut!(update);

        let mut failed = false;
        while let Ok(Some(item)) =
            tokio::time::timeout(Duration::from_secs(30), update.next()).await
        {
            if item.is_err() {
                failed = true;
            }
        }
        if !failed {
            return;
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
    }
    panic!("tool result update never accepted");
}

fn history_signatures(history: &LlmHistory) -> Vec<String> {
    history
        .history
        .iter()
        .flat_map(|run| run.messages.iter())
        .chain(history.current.iter())
        .filter_map(|message| match message {
            confab_llm::HistoryMessage::Bot { thoughts, .. } => Some(thoughts),
            _ => None,
        })
        .flatten()
        .filter_map(|thought| thought.signature.clone())
        .collect()
}

#[tokio::test]
async fn client_stop_during_tool_wait_keeps_landed_results() {
    let kv = KvStore::memory();
    let driver = Arc::new(ScriptedDriver::new(vec![ScriptedCompletion::default()
        .with_tool_call("generate_image", json!({"prompt": "a greenhouse"}))
        .with_tool_call("web_search", json!({"q": "greenhouses"}))]));

    // Drive the chatbot directly against a workspace context, so the test
    // holds the client-reply service and can fire its stop flag.
    let context = WorkspaceContext::new(workspace(), kv.clone());
    context.add_service(Arc::new(ThreadService::new(workspace(), kv.clone())));
    context.add_service(LlmService::with_driver(ConfabConfig::default(), driver));
    seed_user_message(&kv, "Generate an image and search for greenhouses.").await;

    let request = RequestContext::create(&context, RequestId::generate()).unwrap();
    let client = ClientReplyService::new("svc-client-reply-test".parse().unwrap(), client_tools());
    request.add_service(Arc::clone(&client));
    request.add_tool_provider(Arc::clone(&client) as Arc<dyn ToolsProvider>);

    let uri = ProcessUri::root(workspace(), ProcessId::generate());
    let process = ChatbotProcess::new(
        uri.clone(),
        request,
        client.service_id.clone(),
        ChatbotArguments {
            bot_id: bot_id(),
            persona: None,
            thread_uris: vec![thread_uri()],
        },
    );
    context.spawn(process).await.unwrap();
    let listener = context.listener(&uri).unwrap();

    // Both tool calls get committed; resolve exactly one of them, then stop.
    let resolved_id = wait_for_tool_parts(&client, 2).await;
    resolve_child(&context, &uri.child(resolved_id)).await;
    client.stop.set();

    tokio::time::timeout(Duration::from_secs(10), listener.wait_result())
        .await
        .expect("chatbot did not stop")
        .unwrap();
    let status = context.get_status(&uri).unwrap();
    assert!(
        matches!(status.result, Some(ProcessResult::Stopped { .. })),
        "expected a stopped result, got {:?}",
        status.result
    );

    // The result that landed before the stop was fed back into the committed
    // reply; the genuinely pending call stays unresolved.
    let mut with_result = 0;
    let mut without_result = 0;
    for part in client.pull_committed() {
        if let BotMessagePart::Tool { result, .. } = part {
            match result {
                Some(_) => with_result += 1,
                None => without_result += 1,
            }
        }
    }
    assert_eq!(with_result, 1);
    assert_eq!(without_result, 1);

    // The session survived the stop: state and cursors were saved.
    let bot = bot_acquire(&kv, &workspace(), &bot_id()).await.unwrap();
    assert!(bot.llm_state.is_some());
    assert_eq!(bot.thread_cursors.len(), 1);
}

/// Poll until `count` tool parts are committed; returns the first one's id.
async fn wait_for_tool_parts(client: &ClientReplyService, count: usize) -> ProcessId {
    for _ in 0..100 {
        let ids: Vec<ProcessId> = client
            .pull_committed()
            .iter()
            .filter_map(|part| match part {
                BotMessagePart::Tool { process_id, .. } => Some(process_id.clone()),
                _ => None,
            })
            .collect();
        if ids.len() >= count {
            return ids[0].clone();
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("tool calls were never committed");
}

/// Push a success onto a spawned child tool, retrying while it is spawning.
async fn resolve_child(context: &Arc<WorkspaceContext>, child_uri: &ProcessUri) {
    for _ in 0..100 {
        if let Some(process) = context.process(child_uri) {
            send_update(
                process.as_ref(),
                Vec::new(),
                Some(ProcessResult::success(
                    json!({"content": "image generated"})
                        .as_object()
                        .unwrap()
                        .clone(),
                )),
            )
            .await
            .unwrap();
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("child tool process never spawned");
}

/// A driver that hangs until cancelled, for the sigkill scenario.
struct SlowDriver;

#[async_trait]
impl CompletionDriver for SlowDriver {
    fn build_params(
        &self,
        _info: &ModelInfo,
        _args: &CompletionArgs,
        history: &mut LlmHistory,
    ) -> Result<Value, confab_llm::LlmError> {
        let _ = history.render_openai(0)?;
        Ok(json!({}))
    }

    async fn execute(
        &self,
        _info: &ModelInfo,
        _params: &Value,
        _callback: Option<&LlmCallback>,
        _xml_sections: &[XmlSection],
    ) -> Result<NativeCompletion, confab_llm::LlmError> {
        tokio::time::sleep(Duration::from_secs(60)).await;
        Ok(NativeCompletion::default())
    }
}

#[tokio::test]
async fn s6_sigkill_during_chatbot_yields_done_and_stopped_status() {
    let kv = KvStore::memory();
    let (registry, store) = start_server(&kv, Arc::new(SlowDriver)).await;
    seed_user_message(&kv, "hello").await;

    let chatbot_id = ProcessId::generate();
    let chatbot_uri = ProcessUri::root(workspace(), chatbot_id.clone());

    let stream = store.send_request(chatbot_spawn(chatbot_id), 1);
    pin_mut!(stream);

    // Give the spawn a moment to land, then kill it.
    tokio::time::sleep(Duration::from_millis(1500)).await;
    let kill = store.send_request(
        WorkspaceRequest::ProcessSigkill {
            process_uri: chatbot_uri.clone(),
            timestamp: chrono::Utc::now(),
        },
        1,
    );
    pin_mut!(kill);
    while let Ok(Some(item)) = tokio::time::timeout(Duration::from_secs(30), kill.next()).await {
        item.expect("sigkill stream error");
    }

    // The reply stream ends with one done reply (possibly empty) and closes.
    let mut done_count = 0;
    loop {
        let next = tokio::time::timeout(Duration::from_secs(30), stream.next()).await;
        match next.expect("response stream stalled") {
            Some(item) => {
                if let WorkspaceResponse::Reply { status, .. } = item.expect("stream error") {
                    if status == ReplyStatus::Done {
                        done_count += 1;
                    }
                }
            }
            None => break,
        }
    }
    assert_eq!(done_count, 1);

    let server = registry
        .try_acquire(&kv, &workspace())
        .await
        .unwrap()
        .unwrap();
    let status = server.context.get_status(&chatbot_uri).unwrap();
    assert_eq!(status.result, Some(ProcessResult::stopped()));
}
