//! OpenAI-style chat completions driver.
//!
//! Also serves OpenAI-compatible vendors (DeepSeek and similar routers),
//! which deliver reasoning through a `reasoning_content` delta.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, warn};

use confab_core::shutdown;

use crate::history::LlmHistory;
use crate::info::{ModelInfo, ToolsMode};
use crate::message::{Thought, XmlSection};
use crate::model::{
    build_system, CompletionArgs, CompletionDriver, LlmCallback, NativeCompletion,
    PartialToolCall, StreamEmitter, ToolChoice, REQUEST_TIMEOUT,
};
use crate::sse::SseLines;
use crate::LlmError;

/// Models that take system text under the newer `developer` role.
const MODELS_USING_DEVELOPER: &[&str] = &["gpt-", "o1", "o3", "o4"];

pub struct OpenAiDriver {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
}

impl OpenAiDriver {
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
impl CompletionDriver for OpenAiDriver {
    fn build_params(
        &self,
        info: &ModelInfo,
        args: &CompletionArgs,
        history: &mut LlmHistory,
    ) -> Result<Value, LlmError> {
        let mut messages = history.render_openai(info.limit_media)?;

        if let Some(system) = build_system(info, args) {
            let role = if MODELS_USING_DEVELOPER
                .iter()
                .any(|prefix| info.native_name.starts_with(prefix))
            {
                "developer"
            } else {
                "system"
            };
            messages.insert(0, serde_json::json!({"role": role, "content": system}));
        }

        let mut body = serde_json::json!({
            "model": info.native_name,
            "messages": messages,
            "max_tokens": args.max_tokens.unwrap_or(info.limit_tokens_response),
        });

        if info.supports_stream && args.callback.is_some() {
            body["stream"] = Value::Bool(true);
        }
        if let Some(temperature) = args.temperature {
            if info.supports_think.is_none() {
                body["temperature"] = serde_json::json!(temperature);
            }
        }
        if info.supports_stop && !args.stop.is_empty() {
            body["stop"] = serde_json::json!(args.stop);
        }

        if info.supports_tools == Some(ToolsMode::Openai) && !args.tools.is_empty() {
            let tools: Vec<Value> = args.tools.iter().map(|tool| tool.as_openai()).collect();
            body["tools"] = Value::Array(tools);
            body["tool_choice"] = match &args.tool_choice {
                None | Some(ToolChoice::Auto) => Value::from("auto"),
                Some(ToolChoice::None) => Value::from("none"),
                Some(ToolChoice::Tool(name)) => serde_json::json!({
                    "type": "function",
                    "function": {"name": name},
                }),
            };
        }

        if let Some(schema) = &args.response_schema {
            body["response_format"] = serde_json::json!({
                "type": "json_schema",
                "json_schema": {"name": "response", "schema": schema},
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
        debug!(model = %info.native_name, "sending OpenAI-style request");

        let request = self
            .client
            .post(format!("{}/v1/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
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
            warn!(status, body = %message, "OpenAI-style API error");
            if message.to_lowercase().contains("overloaded") {
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

impl OpenAiDriver {
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
        let choice = body
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| LlmError::bad_completion("no choices in completion", None))?;

        let thoughts: Vec<Thought> = choice
            .message
            .reasoning_content
            .filter(|text| !text.is_empty())
            .map(|text| Thought {
                text,
                signature: None,
            })
            .into_iter()
            .collect();

        let tool_calls: Vec<PartialToolCall> = choice
            .message
            .tool_calls
            .unwrap_or_default()
            .into_iter()
            .map(|call| PartialToolCall {
                id: call.id,
                name: call.function.name.unwrap_or_default(),
                arguments: call.function.arguments.unwrap_or_default(),
            })
            .collect();

        let completion = NativeCompletion::parse(
            &choice.message.content.unwrap_or_default(),
            thoughts,
            &tool_calls,
            true,
            info.supports_think,
        );

        if let Some(callback) = callback {
            let parts = crate::model::parse_completion(&completion, xml_sections, info.supports_tools);
            callback(parts)?;
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
        #[derive(PartialEq, Clone, Copy)]
        enum Block {
            None,
            Reasoning,
            Content,
            Tool,
        }

        let mut emitter = StreamEmitter::new(callback, xml_sections, info);
        let mut lines = SseLines::new(response);

        let mut answer = String::new();
        let mut reasoning = String::new();
        let mut tool_calls: Vec<PartialToolCall> = Vec::new();
        let mut prev_block = Block::None;

        while let Some((_event, data)) = lines.next_data().await? {
            shutdown::assert_is_alive()?;
            if data == "[DONE]" {
                break;
            }
            let Ok(chunk) = serde_json::from_str::<StreamChunk>(&data) else {
                continue;
            };
            let Some(choice) = chunk.choices.into_iter().next() else {
                continue;
            };
            let delta = choice.delta;

            if let Some(text) = delta.reasoning_content.filter(|text| !text.is_empty()) {
                let force = prev_block != Block::Reasoning && prev_block != Block::None;
                prev_block = Block::Reasoning;
                reasoning.push_str(&text);
                emitter.accumulate(&text);
                let thoughts = current_thoughts(&reasoning);
                emitter.maybe_emit(force, &answer, &thoughts, &tool_calls)?;
            }

            if let Some(text) = delta.content.filter(|text| !text.is_empty()) {
                // End of the reasoning section forces a partial parse.
                let force = prev_block == Block::Reasoning;
                prev_block = Block::Content;
                answer.push_str(&text);
                emitter.accumulate(&text);
                let thoughts = current_thoughts(&reasoning);
                emitter.maybe_emit(force, &answer, &thoughts, &tool_calls)?;
            }

            for delta_call in delta.tool_calls.unwrap_or_default() {
                let arguments = delta_call
                    .function
                    .as_ref()
                    .and_then(|function| function.arguments.clone())
                    .unwrap_or_default();
                let name = delta_call
                    .function
                    .as_ref()
                    .and_then(|function| function.name.clone());

                let index = delta_call.index.unwrap_or(tool_calls.len());
                if index >= tool_calls.len() {
                    // Sometimes thinking models emit an empty extra chunk with
                    // arguments "{}" and no id; drop it silently.
                    if delta_call.id.is_none() && arguments == "{}" && name.is_none() {
                        continue;
                    }
                    tool_calls.push(PartialToolCall {
                        id: delta_call.id,
                        name: name.unwrap_or_default(),
                        arguments,
                    });
                    // A new tool call is a section boundary.
                    let thoughts = current_thoughts(&reasoning);
                    prev_block = Block::Tool;
                    emitter.maybe_emit(true, &answer, &thoughts, &tool_calls)?;
                } else {
                    let call = &mut tool_calls[index];
                    if let Some(id) = delta_call.id {
                        call.id = Some(id);
                    }
                    if let Some(name) = name {
                        call.name.push_str(&name);
                    }
                    call.arguments.push_str(&arguments);
                    emitter.accumulate(&arguments);
                    let thoughts = current_thoughts(&reasoning);
                    emitter.maybe_emit(false, &answer, &thoughts, &tool_calls)?;
                }
            }
        }

        let completion = NativeCompletion::parse(
            &answer,
            current_thoughts(&reasoning),
            &tool_calls,
            true,
            info.supports_think,
        );
        if let Some(callback) = callback {
            let parts = crate::model::parse_completion(&completion, xml_sections, info.supports_tools);
            callback(parts)?;
        }
        Ok(completion)
    }
}

fn current_thoughts(reasoning: &str) -> Vec<Thought> {
    if reasoning.is_empty() {
        Vec::new()
    } else {
        vec![Thought {
            text: reasoning.to_string(),
            signature: None,
        }]
    }
}

///
/// Wire types
///

#[derive(Deserialize)]
struct BatchResponse {
    choices: Vec<BatchChoice>,
}

#[derive(Deserialize)]
struct BatchChoice {
    message: BatchMessage,
}

#[derive(Deserialize)]
struct BatchMessage {
    content: Option<String>,
    reasoning_content: Option<String>,
    tool_calls: Option<Vec<WireToolCall>>,
}

#[derive(Deserialize)]
struct WireToolCall {
    id: Option<String>,
    function: WireFunction,
}

#[derive(Deserialize, Default)]
struct WireFunction {
    name: Option<String>,
    arguments: Option<String>,
}

#[derive(Deserialize)]
struct StreamChunk {
    choices: Vec<StreamChoice>,
}

#[derive(Deserialize)]
struct StreamChoice {
    delta: StreamDelta,
}

#[derive(Deserialize, Default)]
struct StreamDelta {
    content: Option<String>,
    reasoning_content: Option<String>,
    tool_calls: Option<Vec<StreamToolCall>>,
}

#[derive(Deserialize)]
struct StreamToolCall {
    index: Option<usize>,
    id: Option<String>,
    function: Option<WireFunction>,
}
