//! Anthropic messages driver.
//!
//! Reasoning is carried as opaque signed blocks; signatures are preserved
//! byte-exactly so multi-turn requests replay cleanly.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, warn};

use confab_core::shutdown;

use crate::history::LlmHistory;
use crate::info::{ModelInfo, ReasoningEffort, ThinkMode, ToolsMode};
use crate::message::{Thought, XmlSection};
use crate::model::{
    build_system, parse_completion, CompletionArgs, CompletionDriver, LlmCallback,
    NativeCompletion, PartialToolCall, StreamEmitter, ToolChoice, REQUEST_TIMEOUT,
};
use crate::sse::SseLines;
use crate::LlmError;

const API_VERSION: &str = "2023-06-01";

pub struct AnthropicDriver {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
}

impl AnthropicDriver {
    pub fn new(api_key: String, base_url: String) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(REQUEST_TIMEOUT)
                .build()
                .expect("reqwest client"),
            api_key,
            base_url,
        }
    }
}

#[async_trait]
impl CompletionDriver for AnthropicDriver {
    fn build_params(
        &self,
        info: &ModelInfo,
        args: &CompletionArgs,
        history: &mut LlmHistory,
    ) -> Result<Value, LlmError> {
        let messages = history.render_anthropic(info.limit_media)?;

        let mut body = serde_json::json!({
            "model": info.native_name,
            "max_tokens": args.max_tokens.unwrap_or(info.limit_tokens_response),
            "messages": messages,
        });

        if let Some(system) = build_system(info, args) {
            body["system"] = Value::from(system);
        }
        if info.supports_stream && args.callback.is_some() {
            body["stream"] = Value::Bool(true);
        }
        if info.supports_stop && !args.stop.is_empty() {
            body["stop_sequences"] = serde_json::json!(args.stop);
        }

        if info.supports_think == Some(ThinkMode::Anthropic) {
            let budget_tokens = match info.reasoning_effort {
                Some(ReasoningEffort::High) => 48_000,
                Some(ReasoningEffort::Medium) => 24_000,
                _ => 12_000,
            };
            body["thinking"] = serde_json::json!({
                "type": "enabled",
                "budget_tokens": budget_tokens,
            });
        } else if let Some(temperature) = args.temperature {
            body["temperature"] = serde_json::json!(temperature);
        }

        if info.supports_tools == Some(ToolsMode::Openai) && !args.tools.is_empty() {
            let tools: Vec<Value> = args.tools.iter().map(|tool| tool.as_anthropic()).collect();
            body["tools"] = Value::Array(tools);
            body["tool_choice"] = match &args.tool_choice {
                None | Some(ToolChoice::Auto) => serde_json::json!({"type": "auto"}),
                Some(ToolChoice::None) => serde_json::json!({"type": "none"}),
                Some(ToolChoice::Tool(name)) => serde_json::json!({
                    "type": "tool",
                    "name": name,
                    "disable_parallel_tool_use": true,
                }),
            };
        }

        if let Some(schema) = &args.response_schema {
            body["output_config"] = serde_json::json!({
                "format": {"type": "json_schema", "schema": schema},
            });
        }

        Ok(body)
    }

    async fn execute(
        &self,
        info: &ModelInfo,
        params: &Value,
        callback: Option<&LlmCallback>,
        xml_sections: &[XmlSection],
    ) -> Result<NativeCompletion, LlmError> {
        debug!(model = %info.native_name, "sending Anthropic request");

        let request = self
            .client
            .post(format!("{}/v1/messages", self.base_url))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", API_VERSION)
            .json(params)
            .send();
        let response = shutdown::with_timeout(request, None).await??;

        let status = response.status().as_u16();
        if status == 429 {
            let message = response.text().await.unwrap_or_default();
            return Err(LlmError::RateLimited { status, message });
        }
        if !(200..300).contains(&status) {
            let message = response.text().await.unwrap_or_default();
            warn!(status, body = %message, "Anthropic API error");
            if status == 529 || message.to_lowercase().contains("overloaded") {
                return Err(LlmError::RateLimited { status, message });
            }
            return Err(LlmError::Api { status, message });
        }

        if params.get("stream").and_then(Value::as_bool).unwrap_or(false) {
            self.consume_stream(info, response, callback, xml_sections)
                .await
        } else {
            self.consume_batch(info, response, callback, xml_sections)
                .await
        }
    }
}

impl AnthropicDriver {
    async fn consume_batch(
        &self,
        info: &ModelInfo,
        response: reqwest::Response,
        callback: Option<&LlmCallback>,
        xml_sections: &[XmlSection],
    ) -> Result<NativeCompletion, LlmError> {
        let body: BatchResponse = response
            .json()
            .await
            .map_err(|err| LlmError::bad_completion(err.to_string(), None))?;

        let mut answer = String::new();
        let mut thoughts: Vec<Thought> = Vec::new();
        let mut tool_calls: Vec<PartialToolCall> = Vec::new();

        for block in body.content {
            match block {
                ContentBlock::Thinking {
                    thinking,
                    signature,
                } => thoughts.push(Thought {
                    text: thinking,
                    signature,
                }),
                ContentBlock::RedactedThinking { data } => thoughts.push(Thought {
                    text: String::new(),
                    signature: Some(data),
                }),
                ContentBlock::Text { text } => answer.push_str(&text),
                ContentBlock::ToolUse { id, name, input } => tool_calls.push(PartialToolCall {
                    id: Some(id),
                    name,
                    arguments: input.to_string(),
                }),
                ContentBlock::Unknown => {}
            }
        }

        let completion =
            NativeCompletion::parse(&answer, thoughts, &tool_calls, true, info.supports_think);
        if let Some(callback) = callback {
            callback(parse_completion(&completion, xml_sections, info.supports_tools))?;
        }
        Ok(completion)
    }

    async fn consume_stream(
        &self,
        info: &ModelInfo,
        response: reqwest::Response,
        callback: Option<&LlmCallback>,
        xml_sections: &[XmlSection],
    ) -> Result<NativeCompletion, LlmError> {
        let mut emitter = StreamEmitter::new(callback, xml_sections, info);
        let mut lines = SseLines::new(response);

        let mut answer = String::new();
        let mut thinking_text = String::new();
        let mut thinking_signature: Option<String> = None;
        let mut tool_calls: Vec<PartialToolCall> = Vec::new();

        while let Some((event, data)) = lines.next_data().await? {
            shutdown::assert_is_alive()?;
            match event.as_str() {
                "content_block_start" => {
                    let Ok(start) = serde_json::from_str::<BlockStart>(&data) else {
                        continue;
                    };
                    match start.content_block {
                        ContentBlock::Thinking {
                            thinking,
                            signature,
                        } => {
                            thinking_text.push_str(&thinking);
                            if signature.is_some() {
                                thinking_signature = signature;
                            }
                        }
                        ContentBlock::RedactedThinking { data } => {
                            thinking_signature = Some(data);
                        }
                        ContentBlock::Text { text } => {
                            // The thinking block closed: section boundary.
                            let thoughts =
                                stream_thoughts(&thinking_text, thinking_signature.clone());
                            emitter.maybe_emit(true, &answer, &thoughts, &tool_calls)?;
                            answer.push_str(&text);
                            emitter.accumulate(&text);
                        }
                        ContentBlock::ToolUse { id, name, input } => {
                            let arguments = if input.is_null()
                                || input.as_object().is_some_and(|map| map.is_empty())
                            {
                                String::new()
                            } else {
                                input.to_string()
                            };
                            tool_calls.push(PartialToolCall {
                                id: Some(id),
                                name,
                                arguments,
                            });
                            let thoughts =
                                stream_thoughts(&thinking_text, thinking_signature.clone());
                            emitter.maybe_emit(true, &answer, &thoughts, &tool_calls)?;
                        }
                        ContentBlock::Unknown => {}
                    }
                }
                "content_block_delta" => {
                    let Ok(delta) = serde_json::from_str::<BlockDelta>(&data) else {
                        continue;
                    };
                    match delta.delta {
                        Delta::ThinkingDelta { thinking } => {
                            thinking_text.push_str(&thinking);
                            emitter.accumulate(&thinking);
                        }
                        Delta::SignatureDelta { signature } => {
                            thinking_signature = Some(signature);
                        }
                        Delta::TextDelta { text } => {
                            answer.push_str(&text);
                            emitter.accumulate(&text);
                        }
                        Delta::InputJsonDelta { partial_json } => {
                            if let Some(call) = tool_calls.last_mut() {
                                call.arguments.push_str(&partial_json);
                                emitter.accumulate(&partial_json);
                            }
                        }
                        Delta::Unknown => {}
                    }
                    let thoughts = stream_thoughts(&thinking_text, thinking_signature.clone());
                    emitter.maybe_emit(false, &answer, &thoughts, &tool_calls)?;
                }
                "message_stop" => break,
                _ => {}
            }
        }

        let thoughts = stream_thoughts(&thinking_text, thinking_signature);
        let completion =
            NativeCompletion::parse(&answer, thoughts, &tool_calls, true, info.supports_think);
        if let Some(callback) = callback {
            callback(parse_completion(&completion, xml_sections, info.supports_tools))?;
        }
        Ok(completion)
    }
}

fn stream_thoughts(text: &str, signature: Option<String>) -> Vec<Thought> {
    if text.is_empty() && signature.is_none() {
        Vec::new()
    } else {
        vec![Thought {
            text: text.to_string(),
            signature,
        }]
    }
}

///
/// Wire types
///

#[derive(Deserialize)]
struct BatchResponse {
    content: Vec<ContentBlock>,
}

#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ContentBlock {
    Thinking {
        thinking: String,
        #[serde(default)]
        signature: Option<String>,
    },
    RedactedThinking {
        data: String,
    },
    Text {
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        #[serde(default)]
        input: Value,
    },
    #[serde(other)]
    Unknown,
}

#[derive(Deserialize)]
struct BlockStart {
    content_block: ContentBlock,
}

#[derive(Deserialize)]
struct BlockDelta {
    delta: Delta,
}

#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum Delta {
    ThinkingDelta { thinking: String },
    SignatureDelta { signature: String },
    TextDelta { text: String },
    InputJsonDelta { partial_json: String },
    #[serde(other)]
    Unknown,
}
