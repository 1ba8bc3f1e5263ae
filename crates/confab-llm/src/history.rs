//! Provider-agnostic conversation history.
//!
//! Messages accumulate in `current` until a user prompt seals them into a
//! run with precomputed token totals. Rendering walks runs newest-first,
//! keeping recent runs in full fidelity (`history`) and downgrading older
//! ones to the compact `legacy` form, until the request budget is spent.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use confab_core::{AgentId, ProcessId, ProcessName, ServiceId};
use confab_process::ProcessResult;

use crate::info::{ModelInfo, ThinkMode, ToolsMode};
use crate::message::{LlmPart, MediaBlob, Thought, ToolCall};
use crate::tokens::estimate_tokens;
use crate::LlmError;

/// Flat overhead per native tool call entry.
const TOKENS_BUFFER_TOOL_CALL: u32 = 20;

const SENDER_LLM_TOOLS: &str = "svc-llm-tools";

/// Retention class of a content item.
///
/// `required` always renders; `optional` is dropped from legacy runs; `temp`
/// only survives in the current run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentMode {
    Required,
    Optional,
    Temp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenderMode {
    Current,
    History,
    Legacy,
}

fn should_keep(mode: ContentMode, render: RenderMode) -> bool {
    match mode {
        ContentMode::Required => true,
        ContentMode::Optional => render != RenderMode::Legacy,
        ContentMode::Temp => render == RenderMode::Current,
    }
}

/// One piece of user-visible content: text or an inline media blob.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum UserPart {
    Text(String),
    Blob(MediaBlob),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserContent {
    pub mode: ContentMode,
    pub content: Vec<UserPart>,
}

impl UserContent {
    fn count_tokens(&self, render: RenderMode) -> u32 {
        if !should_keep(self.mode, render) {
            return 0;
        }
        let text: Vec<&str> = self
            .content
            .iter()
            .filter_map(|part| match part {
                UserPart::Text(text) => Some(text.as_str()),
                UserPart::Blob(_) => None,
            })
            .collect();
        let num_blobs = self
            .content
            .iter()
            .filter(|part| matches!(part, UserPart::Blob(_)))
            .count() as u32;
        estimate_tokens(&text.join("\n\n"), num_blobs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BotContent {
    pub mode: ContentMode,
    pub content: String,
}

/// One message in a run, tagged by role.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "role", rename_all = "lowercase")]
pub enum HistoryMessage {
    User {
        sender: AgentId,
        contents: Vec<UserContent>,
    },
    Tool {
        process_id: ProcessId,
        name: ProcessName,
        result: Map<String, Value>,
        is_error: bool,
    },
    Bot {
        thoughts: Vec<Thought>,
        contents: Vec<BotContent>,
        tool_calls: Vec<ToolCall>,
    },
}

impl HistoryMessage {
    pub fn count_tokens(&self, render: RenderMode) -> u32 {
        match self {
            HistoryMessage::User { contents, .. } => contents
                .iter()
                .map(|content| content.count_tokens(render))
                .sum(),
            HistoryMessage::Tool { .. } => {
                let result = self.clean_tool_result(render);
                estimate_tokens(&Value::Object(result).to_string(), 0) + TOKENS_BUFFER_TOOL_CALL
            }
            HistoryMessage::Bot {
                thoughts,
                contents,
                tool_calls,
            } => {
                let thought_tokens: u32 = if render == RenderMode::Legacy {
                    0
                } else {
                    thoughts
                        .iter()
                        .map(|thought| estimate_tokens(&thought.text, 0))
                        .sum()
                };
                let content_tokens: u32 = contents
                    .iter()
                    .map(|content| {
                        if should_keep(content.mode, render) {
                            estimate_tokens(&content.content, 0)
                        } else {
                            0
                        }
                    })
                    .sum();
                let call_tokens: u32 = tool_calls
                    .iter()
                    .map(|call| {
                        estimate_tokens(&serde_json::to_string(call).unwrap_or_default(), 0)
                    })
                    .sum();
                thought_tokens + content_tokens + call_tokens
            }
        }
    }

    /// Kept user parts for the render mode.
    fn clean_user_content(&self, render: RenderMode) -> Vec<&UserPart> {
        match self {
            HistoryMessage::User { contents, .. } => contents
                .iter()
                .filter(|content| should_keep(content.mode, render))
                .flat_map(|content| content.content.iter())
                .collect(),
            _ => Vec::new(),
        }
    }

    /// Kept bot text for the render mode, joined into one block.
    fn clean_bot_content(&self, render: RenderMode) -> String {
        match self {
            HistoryMessage::Bot { contents, .. } => contents
                .iter()
                .filter(|content| should_keep(content.mode, render))
                .map(|content| content.content.as_str())
                .collect::<Vec<_>>()
                .join("\n\n"),
            _ => String::new(),
        }
    }

    /// Tool result for the render mode: old non-error results collapse to an
    /// expiry sentinel to free context.
    fn clean_tool_result(&self, render: RenderMode) -> Map<String, Value> {
        match self {
            HistoryMessage::Tool {
                result, is_error, ..
            } => {
                if render == RenderMode::Legacy && !is_error {
                    let mut expired = Map::new();
                    expired.insert(
                        "expired".to_string(),
                        Value::from("This tool result has expired to free context."),
                    );
                    expired
                } else {
                    result.clone()
                }
            }
            _ => Map::new(),
        }
    }
}

/// A sealed run with precomputed totals for both render fidelities.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryRun {
    pub messages: Vec<HistoryMessage>,
    pub num_tokens: u32,
    pub num_tokens_legacy: u32,
}

/// The complete conversation state sent to a Completions-style API.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LlmHistory {
    pub model_info: ModelInfo,
    pub history: Vec<HistoryRun>,
    pub current: Vec<HistoryMessage>,
    /// Media returned by tools, injected as the next user message.
    pub pending_media: Vec<MediaBlob>,
    /// Tool calls awaiting results; native-tool providers require pairing.
    pub pending_tools: Vec<(ProcessId, ProcessName)>,
}

impl LlmHistory {
    pub fn new(model_info: ModelInfo) -> Self {
        Self {
            model_info,
            history: Vec::new(),
            current: Vec::new(),
            pending_media: Vec::new(),
            pending_tools: Vec::new(),
        }
    }

    /// Clone the history for a different model.
    ///
    /// Fails when the new model is incompatible: proprietary reasoning modes
    /// differ, or native-tool support would be lost while native tool calls
    /// are recorded.
    pub fn reuse(&self, model_info: ModelInfo) -> Result<Self, LlmError> {
        let old_think = self.model_info.supports_think;
        let new_think = model_info.supports_think;
        let proprietary =
            |mode: Option<ThinkMode>| mode.is_some_and(|mode| mode.is_proprietary());
        if (proprietary(old_think) || proprietary(new_think)) && old_think != new_think {
            return Err(LlmError::IncompatibleModel {
                from: self.model_info.name.clone(),
                to: model_info.name,
                reason: "reasoning mismatch".to_string(),
            });
        }

        if model_info.supports_tools.is_none() && self.model_info.supports_tools.is_some() {
            return Err(LlmError::IncompatibleModel {
                from: self.model_info.name.clone(),
                to: model_info.name,
                reason: "native tools mismatch".to_string(),
            });
        }

        let mut cloned = self.clone();
        cloned.model_info = model_info;
        Ok(cloned)
    }

    ///
    /// Append
    ///

    pub fn add_part(&mut self, part: LlmPart) {
        match part {
            LlmPart::Text {
                sender: Some(sender),
                content,
            } => {
                if sender.is_user() {
                    // A user prompt begins a new task.
                    self.flush_task();
                } else {
                    self.flush_pending();
                }
                let mode = if sender.is_service() {
                    ContentMode::Temp
                } else {
                    ContentMode::Required
                };
                if !content.trim().is_empty() {
                    self.add_user_content(sender, mode, vec![UserPart::Text(content)]);
                }
            }
            LlmPart::ToolResult {
                process_id,
                name,
                result,
                ..
            } => {
                self.add_tool_result(process_id, name, result);
            }
            other => {
                self.flush_pending();
                self.add_bot_part(other);
            }
        }
    }

    /// Seal `current` into a run. Invoked automatically when a user message
    /// arrives; long agentic workflows may also call it between tasks to let
    /// old scaffolding expire.
    pub fn flush_task(&mut self) {
        self.flush_pending();
        if self.current.is_empty() {
            return;
        }
        let messages = std::mem::take(&mut self.current);
        let num_tokens = messages
            .iter()
            .map(|message| message.count_tokens(RenderMode::History))
            .sum();
        let num_tokens_legacy = messages
            .iter()
            .map(|message| message.count_tokens(RenderMode::Legacy))
            .sum();
        self.history.push(HistoryRun {
            messages,
            num_tokens,
            num_tokens_legacy,
        });
    }

    /// Resolve anything the next request structurally depends on: synthesize
    /// "still running" results for unresolved tool calls (OpenAI-style
    /// pairing only — Gemini accepts late tool results), then inject pending
    /// media as one optional user message.
    pub fn flush_pending(&mut self) {
        if !self.pending_tools.is_empty()
            && self.model_info.supports_tools == Some(ToolsMode::Openai)
        {
            let pending = std::mem::take(&mut self.pending_tools);
            for (process_id, name) in pending {
                let mut value = Map::new();
                value.insert(
                    "content".to_string(),
                    Value::from("The tool is still running."),
                );
                self.push_tool_message(process_id, name, value, false);
            }
        }

        if !self.pending_media.is_empty() {
            let media = std::mem::take(&mut self.pending_media);
            let mut content: Vec<UserPart> =
                vec![UserPart::Text("<tool-result-embeds>".to_string())];
            content.extend(media.into_iter().map(UserPart::Blob));
            content.push(UserPart::Text("</tool-result-embeds>".to_string()));

            let sender: ServiceId = SENDER_LLM_TOOLS.parse().expect("static service id");
            self.add_user_content(AgentId::Service(sender), ContentMode::Optional, content);
        }
    }

    fn add_user_content(&mut self, sender: AgentId, mode: ContentMode, content: Vec<UserPart>) {
        let wrapped = UserContent { mode, content };
        if let Some(HistoryMessage::User {
            sender: prev_sender,
            contents,
        }) = self.current.last_mut()
        {
            if *prev_sender == sender {
                contents.push(wrapped);
                return;
            }
        }
        self.current.push(HistoryMessage::User {
            sender,
            contents: vec![wrapped],
        });
    }

    fn add_tool_result(
        &mut self,
        process_id: ProcessId,
        name: ProcessName,
        result: ProcessResult,
    ) {
        let expected = self
            .pending_tools
            .iter()
            .any(|(pending_id, _)| *pending_id == process_id);
        if expected {
            self.pending_tools
                .retain(|(pending_id, _)| *pending_id != process_id);
        }

        // Without native tool support (or for an unpaired result), render the
        // result as a user-visible XML block instead.
        if self.model_info.supports_tools.is_none() || !expected {
            let part = LlmPart::ToolResult {
                sender: None,
                process_id,
                name,
                result,
            };
            if let Some(rendered) = part.render_xml() {
                let sender: ServiceId = SENDER_LLM_TOOLS.parse().expect("static service id");
                self.add_user_content(
                    AgentId::Service(sender),
                    ContentMode::Optional,
                    vec![UserPart::Text(rendered)],
                );
            }
            return;
        }

        let (value, is_error) = match &result {
            ProcessResult::Success { .. } => {
                let (mut value, content) = result.as_split();
                // Media travels separately: it becomes the next user message.
                if let Some(Value::Array(items)) = value.remove("media") {
                    for item in items {
                        if let Ok(blob) = serde_json::from_value::<MediaBlob>(item) {
                            self.pending_media.push(blob);
                        }
                    }
                }
                if let Some(content) = content {
                    value.insert("content".to_string(), Value::from(content));
                }
                (value, false)
            }
            _ => (result.as_tool_value().0, true),
        };
        self.push_tool_message(process_id, name, value, is_error);
    }

    fn push_tool_message(
        &mut self,
        process_id: ProcessId,
        name: ProcessName,
        result: Map<String, Value>,
        is_error: bool,
    ) {
        self.current.push(HistoryMessage::Tool {
            process_id,
            name,
            result,
            is_error,
        });
    }

    fn add_bot_part(&mut self, part: LlmPart) {
        let mut thoughts: Vec<Thought> = Vec::new();
        let mut contents: Vec<BotContent> = Vec::new();
        let mut tool_calls: Vec<ToolCall> = Vec::new();

        match part {
            LlmPart::Think { text, signature } => match self.model_info.supports_think {
                Some(ThinkMode::Anthropic) | Some(ThinkMode::Gemini) => {
                    thoughts.push(Thought { text, signature });
                }
                Some(ThinkMode::Deepseek) => contents.push(BotContent {
                    mode: ContentMode::Optional,
                    content: format!("<think>{text}</think>"),
                }),
                Some(ThinkMode::GptOss) => contents.push(BotContent {
                    mode: ContentMode::Optional,
                    content: text,
                }),
                Some(ThinkMode::Hidden) | None => {}
            },
            LlmPart::ToolCalls { calls } => {
                for call in &calls {
                    let Some(process_id) = &call.process_id else {
                        continue; // Only final parses reach the history.
                    };
                    self.pending_tools
                        .push((process_id.clone(), call.name.clone()));
                }
                if self.model_info.supports_tools.is_some() {
                    tool_calls.extend(calls.into_iter().filter(|call| call.process_id.is_some()));
                } else if let Some(rendered) = (LlmPart::ToolCalls { calls }).render_xml() {
                    contents.push(BotContent {
                        mode: ContentMode::Required,
                        content: rendered,
                    });
                }
            }
            other => {
                if let Some(rendered) = other.render_xml() {
                    contents.push(BotContent {
                        mode: ContentMode::Required,
                        content: rendered,
                    });
                }
            }
        }

        if thoughts.is_empty() && contents.is_empty() && tool_calls.is_empty() {
            return;
        }

        if let Some(HistoryMessage::Bot {
            thoughts: prev_thoughts,
            contents: prev_contents,
            tool_calls: prev_calls,
        }) = self.current.last_mut()
        {
            prev_thoughts.extend(thoughts);
            prev_contents.extend(contents);
            prev_calls.extend(tool_calls);
        } else {
            self.current.push(HistoryMessage::Bot {
                thoughts,
                contents,
                tool_calls,
            });
        }
    }

    ///
    /// Rendering
    ///

    /// Select the messages to render, newest first, with their render mode.
    ///
    /// Fails when the current run alone exceeds the request budget.
    fn walk(&self) -> Result<Vec<(&HistoryMessage, RenderMode)>, LlmError> {
        let limit_request = self.model_info.limit_tokens_request();
        let limit_recent = self.model_info.limit_tokens_recent;

        let mut selected: Vec<(&HistoryMessage, RenderMode)> = Vec::new();
        let mut total_tokens: u32 = 0;

        for message in self.current.iter().rev() {
            total_tokens += message.count_tokens(RenderMode::Current);
            if total_tokens > limit_request {
                return Err(LlmError::ContextLimitExceeded);
            }
            selected.push((message, RenderMode::Current));
        }

        let mut mode = RenderMode::History;
        for run in self.history.iter().rev() {
            if total_tokens + run.num_tokens > limit_request {
                break;
            }
            if mode == RenderMode::History {
                if let Some(limit_recent) = limit_recent {
                    if total_tokens + run.num_tokens > limit_recent {
                        mode = RenderMode::Legacy;
                    }
                }
            }
            total_tokens += match mode {
                RenderMode::Legacy => run.num_tokens_legacy,
                _ => run.num_tokens,
            };
            for message in run.messages.iter().rev() {
                selected.push((message, mode));
            }
        }

        Ok(selected)
    }

    /// Render into OpenAI-style chat messages.
    pub fn render_openai(&mut self, limit_media: u32) -> Result<Vec<Value>, LlmError> {
        self.flush_pending();
        let selected = self.walk()?;

        let mut media_budget = limit_media;
        let mut rendered: Vec<Value> = Vec::new();
        for (message, mode) in &selected {
            rendered.push(self.render_openai_message(message, *mode, &mut media_budget));
        }
        rendered.reverse();
        Ok(rendered)
    }

    fn render_openai_message(
        &self,
        message: &HistoryMessage,
        mode: RenderMode,
        media_budget: &mut u32,
    ) -> Value {
        match message {
            HistoryMessage::User { .. } => {
                let (text, parts, used_media) = self.render_user_parts(
                    message,
                    mode,
                    *media_budget,
                    |text| serde_json::json!({"type": "text", "text": text}),
                    |blob| {
                        serde_json::json!({
                            "type": "image_url",
                            "image_url": {"url": blob.download_url()},
                        })
                    },
                );
                *media_budget -= used_media;
                if parts.is_empty() {
                    serde_json::json!({"role": "user", "content": text})
                } else {
                    serde_json::json!({"role": "user", "content": parts})
                }
            }
            HistoryMessage::Tool {
                process_id,
                is_error,
                ..
            } => {
                let result = message.clean_tool_result(mode);
                let content = if *is_error {
                    serde_json::json!({"error": Value::Object(result)}).to_string()
                } else {
                    Value::Object(result).to_string()
                };
                serde_json::json!({
                    "role": "tool",
                    "tool_call_id": process_id.as_native_openai(),
                    "content": content,
                })
            }
            HistoryMessage::Bot {
                thoughts,
                tool_calls,
                ..
            } => {
                let mut converted = serde_json::json!({"role": "assistant"});

                if self.model_info.supports_think == Some(ThinkMode::Anthropic) {
                    if let Some(thought) = thoughts.first() {
                        let mut block = serde_json::json!({"type": "thinking"});
                        if !thought.text.is_empty() {
                            block["thinking"] = Value::from(thought.text.clone());
                        }
                        if let Some(signature) = &thought.signature {
                            block["signature"] = Value::from(signature.clone());
                        }
                        converted["thinking_blocks"] = Value::Array(vec![block]);
                    }
                }

                let content = message.clean_bot_content(mode);
                if !content.is_empty() {
                    converted["content"] = Value::from(content);
                }

                if !tool_calls.is_empty() {
                    let calls: Vec<Value> = tool_calls
                        .iter()
                        .filter_map(|call| {
                            let process_id = call.process_id.as_ref()?;
                            Some(serde_json::json!({
                                "type": "function",
                                "id": process_id.as_native_openai(),
                                "function": {
                                    "name": call.name,
                                    "arguments": Value::Object(call.arguments.clone()).to_string(),
                                },
                            }))
                        })
                        .collect();
                    converted["tool_calls"] = Value::Array(calls);
                }

                converted
            }
        }
    }

    /// Render into Anthropic-style messages (content block arrays).
    pub fn render_anthropic(&mut self, limit_media: u32) -> Result<Vec<Value>, LlmError> {
        self.flush_pending();
        let selected = self.walk()?;

        let mut media_budget = limit_media;
        let mut rendered: Vec<Value> = Vec::new();
        for (message, mode) in &selected {
            rendered.push(self.render_anthropic_message(message, *mode, &mut media_budget));
        }
        rendered.reverse();
        Ok(merge_adjacent_roles(rendered, "content"))
    }

    fn render_anthropic_message(
        &self,
        message: &HistoryMessage,
        mode: RenderMode,
        media_budget: &mut u32,
    ) -> Value {
        match message {
            HistoryMessage::User { .. } => {
                let (text, parts, used_media) = self.render_user_parts(
                    message,
                    mode,
                    *media_budget,
                    |text| serde_json::json!({"type": "text", "text": text}),
                    |blob| match &blob.data {
                        Some(data) => serde_json::json!({
                            "type": "image",
                            "source": {
                                "type": "base64",
                                "media_type": blob.mime_type,
                                "data": data,
                            },
                        }),
                        None => serde_json::json!({
                            "type": "image",
                            "source": {"type": "url", "url": blob.uri},
                        }),
                    },
                );
                *media_budget -= used_media;
                let content = if parts.is_empty() {
                    Value::Array(vec![serde_json::json!({"type": "text", "text": text})])
                } else {
                    Value::Array(parts)
                };
                serde_json::json!({"role": "user", "content": content})
            }
            HistoryMessage::Tool {
                process_id,
                is_error,
                ..
            } => {
                let result = message.clean_tool_result(mode);
                serde_json::json!({
                    "role": "user",
                    "content": [{
                        "type": "tool_result",
                        "tool_use_id": process_id.as_native_anthropic(),
                        "content": Value::Object(result).to_string(),
                        "is_error": is_error,
                    }],
                })
            }
            HistoryMessage::Bot {
                thoughts,
                tool_calls,
                ..
            } => {
                let mut blocks: Vec<Value> = Vec::new();

                if self.model_info.supports_think == Some(ThinkMode::Anthropic) {
                    for thought in thoughts {
                        if thought.text.is_empty() {
                            if let Some(signature) = &thought.signature {
                                blocks.push(serde_json::json!({
                                    "type": "redacted_thinking",
                                    "data": signature,
                                }));
                            }
                        } else {
                            let mut block = serde_json::json!({
                                "type": "thinking",
                                "thinking": thought.text,
                            });
                            if let Some(signature) = &thought.signature {
                                block["signature"] = Value::from(signature.clone());
                            }
                            blocks.push(block);
                        }
                    }
                }

                let content = message.clean_bot_content(mode);
                if !content.is_empty() {
                    blocks.push(serde_json::json!({"type": "text", "text": content}));
                }

                for call in tool_calls {
                    let Some(process_id) = &call.process_id else {
                        continue;
                    };
                    blocks.push(serde_json::json!({
                        "type": "tool_use",
                        "id": process_id.as_native_anthropic(),
                        "name": call.name,
                        "input": Value::Object(call.arguments.clone()),
                    }));
                }

                serde_json::json!({"role": "assistant", "content": blocks})
            }
        }
    }

    /// Render into Gemini-style contents.
    pub fn render_gemini(&mut self, limit_media: u32) -> Result<Vec<Value>, LlmError> {
        self.flush_pending();
        let selected = self.walk()?;

        let mut media_budget = limit_media;
        let mut rendered: Vec<Value> = Vec::new();
        for (message, mode) in &selected {
            rendered.push(self.render_gemini_message(message, *mode, &mut media_budget));
        }
        rendered.reverse();
        Ok(merge_adjacent_roles(rendered, "parts"))
    }

    fn render_gemini_message(
        &self,
        message: &HistoryMessage,
        mode: RenderMode,
        media_budget: &mut u32,
    ) -> Value {
        match message {
            HistoryMessage::User { .. } => {
                let (text, parts, used_media) = self.render_user_parts(
                    message,
                    mode,
                    *media_budget,
                    |text| serde_json::json!({"text": text}),
                    |blob| {
                        serde_json::json!({
                            "inlineData": {
                                "mimeType": blob.mime_type,
                                "data": blob.data.clone().unwrap_or_default(),
                            },
                        })
                    },
                );
                *media_budget -= used_media;
                let parts = if parts.is_empty() {
                    vec![serde_json::json!({"text": text})]
                } else {
                    parts
                };
                serde_json::json!({"role": "user", "parts": parts})
            }
            HistoryMessage::Tool {
                process_id, name, ..
            } => {
                let result = message.clean_tool_result(mode);
                let is_error = matches!(message, HistoryMessage::Tool { is_error: true, .. });
                let response = if is_error {
                    serde_json::json!({"error": Value::Object(result)})
                } else {
                    serde_json::json!({"output": Value::Object(result)})
                };
                serde_json::json!({
                    "role": "user",
                    "parts": [{
                        "functionResponse": {
                            "id": process_id.as_native_gemini(),
                            "name": name,
                            "response": response,
                        },
                    }],
                })
            }
            HistoryMessage::Bot {
                thoughts,
                tool_calls,
                ..
            } => {
                let mut thought_signature: Option<String> = None;
                if self.model_info.supports_think == Some(ThinkMode::Gemini) {
                    for thought in thoughts {
                        if thought.signature.is_some() {
                            thought_signature = thought.signature.clone();
                        }
                    }
                }

                let mut parts: Vec<Value> = Vec::new();
                let content = message.clean_bot_content(mode);
                if !content.is_empty() {
                    let mut part = serde_json::json!({"text": content});
                    if let Some(signature) = thought_signature.take() {
                        part["thoughtSignature"] = Value::from(signature);
                    }
                    parts.push(part);
                }

                for call in tool_calls {
                    let mut part = serde_json::json!({
                        "functionCall": {
                            "name": call.name,
                            "args": Value::Object(call.arguments.clone()),
                        },
                    });
                    if let Some(process_id) = &call.process_id {
                        part["functionCall"]["id"] = Value::from(process_id.as_native_gemini());
                    }
                    if let Some(signature) = thought_signature.take() {
                        part["thoughtSignature"] = Value::from(signature);
                    }
                    parts.push(part);
                }

                serde_json::json!({"role": "model", "parts": parts})
            }
        }
    }

    /// Shared user-content rendering: inline media while the budget and mime
    /// support allow, placeholders otherwise.
    ///
    /// Returns `(flat_text, structured_parts, used_media)`; `structured_parts`
    /// is empty when no media was inlined.
    fn render_user_parts(
        &self,
        message: &HistoryMessage,
        mode: RenderMode,
        media_budget: u32,
        render_text: impl Fn(&str) -> Value,
        render_blob: impl Fn(&MediaBlob) -> Value,
    ) -> (String, Vec<Value>, u32) {
        let mut used_media: u32 = 0;
        let mut partial_text = String::new();
        let mut parts: Vec<Value> = Vec::new();

        for part in message.clean_user_content(mode) {
            match part {
                UserPart::Blob(blob) => {
                    let supported = self
                        .model_info
                        .supports_media
                        .iter()
                        .any(|mime| *mime == blob.mime_type);
                    if supported && used_media < media_budget {
                        // Wrap in <blob>, so the model can reference it in tools.
                        partial_text =
                            format!("{}\n<blob uri=\"{}\">", partial_text.trim_end(), blob.uri);
                        parts.push(render_text(&partial_text));
                        parts.push(render_blob(blob));
                        partial_text = "</blob>\n".to_string();
                        used_media += 1;
                    } else {
                        if !partial_text.is_empty() {
                            partial_text = format!("{}\n\n", partial_text.trim_end());
                        }
                        partial_text.push_str(&format!("{}\n\n", blob.render_placeholder()));
                    }
                }
                UserPart::Text(text) => partial_text.push_str(text),
            }
        }

        if used_media > 0 {
            if !partial_text.is_empty() {
                parts.push(render_text(partial_text.trim_end()));
            }
            (String::new(), parts, used_media)
        } else {
            (partial_text.trim_end().to_string(), Vec::new(), 0)
        }
    }
}

/// Merge adjacent messages with the same role by concatenating the named
/// list field (Anthropic and Gemini reject consecutive same-role turns).
fn merge_adjacent_roles(messages: Vec<Value>, field: &str) -> Vec<Value> {
    let mut merged: Vec<Value> = Vec::new();
    for message in messages {
        if let Some(last) = merged.last_mut() {
            if last["role"] == message["role"]
                && last[field].is_array()
                && message[field].is_array()
            {
                let extra = message[field].as_array().cloned().unwrap_or_default();
                last[field]
                    .as_array_mut()
                    .expect("checked array")
                    .extend(extra);
                continue;
            }
        }
        merged.push(message);
    }
    merged
}
