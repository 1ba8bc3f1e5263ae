//! Gemini generateContent driver.
//!
//! Reasoning summaries arrive as `thought` parts; the signature travels in
//! `thoughtSignature` and must be replayed byte-exactly on later turns.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, warn};

use confab_core::shutdown;

use crate::history::LlmHistory;
use crate::info::{ModelInfo, ThinkMode, ToolsMode};
use crate::message::{Thought, XmlSection};
use crate::model::{
    build_system, parse_completion, CompletionArgs, CompletionDriver, LlmCallback,
    NativeCompletion, PartialToolCall, StreamEmitter, ToolChoice, REQUEST_TIMEOUT,
};
use crate::sse::SseLines;
use crate::LlmError;

pub struct GeminiDriver {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
}

impl GeminiDriver {
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
impl CompletionDriver for GeminiDriver {
    fn build_params(
        &self,
        info: &ModelInfo,
        args: &CompletionArgs,
        history: &mut LlmHistory,
    ) -> Result<Value, LlmError> {
        let contents = history.render_gemini(info.limit_media)?;

        let mut generation_config = serde_json::json!({
            "maxOutputTokens": args.max_tokens.unwrap_or(info.limit_tokens_response),
        });
        if let Some(temperature) = args.temperature {
            if info.supports_think.is_none() {
                generation_config["temperature"] = serde_json::json!(temperature);
            }
        }
        if info.supports_stop && !args.stop.is_empty() {
            generation_config["stopSequences"] = serde_json::json!(args.stop);
        }
        if info.supports_think == Some(ThinkMode::Gemini) {
            generation_config["thinkingConfig"] = serde_json::json!({
                "includeThoughts": true,
            });
        }
        if let Some(schema) = &args.response_schema {
            generation_config["responseMimeType"] = Value::from("application/json");
            generation_config["responseSchema"] = schema.clone();
        }

        let mut body = serde_json::json!({
            "contents": contents,
            "generationConfig": generation_config,
        });

        if let Some(system) = build_system(info, args) {
            body["systemInstruction"] = serde_json::json!({"parts": [{"text": system}]});
        }
        if info.supports_stream && args.callback.is_some() {
            body["stream"] = Value::Bool(true); // Stripped before sending.
        }

        if info.supports_tools == Some(ToolsMode::Gemini) && !args.tools.is_empty() {
            let declarations: Vec<Value> = args.tools.iter().map(|tool| tool.as_gemini()).collect();
            body["tools"] = serde_json::json!([{"functionDeclarations": declarations}]);
            body["toolConfig"] = match &args.tool_choice {
                None | Some(ToolChoice::Auto) => {
                    serde_json::json!({"functionCallingConfig": {"mode": "AUTO"}})
                }
                Some(ToolChoice::None) => {
                    serde_json::json!({"functionCallingConfig": {"mode": "NONE"}})
                }
                Some(ToolChoice::Tool(name)) => serde_json::json!({
                    "functionCallingConfig": {
                        "mode": "ANY",
                        "allowedFunctionNames": [name],
                    },
                }),
            };
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
        let stream = params
            .get("stream")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        let mut body = params.clone();
        if let Some(map) = body.as_object_mut() {
            map.remove("stream");
        }

        let method = if stream {
            "streamGenerateContent?alt=sse&"
        } else {
            "generateContent?"
        };
        let url = format!(
            "{}/v1beta/models/{}:{}key={}",
            self.base_url, info.native_name, method, self.api_key
        );

        debug!(model = %info.native_name, stream, "sending Gemini request");
        let request = self.client.post(&url).json(&body).send();
        let response = shutdown::with_timeout(request, None).await??;

        let status = response.status().as_u16();
        if status == 429 {
            let message = response.text().await.unwrap_or_default();
            return Err(LlmError::RateLimited { status, message });
        }
        if !(200..300).contains(&status) {
            let message = response.text().await.unwrap_or_default();
            warn!(status, body = %message, "Gemini API error");
            if message.to_lowercase().contains("overloaded") {
                return Err(LlmError::RateLimited { status, message });
            }
            return Err(LlmError::Api { status, message });
        }

        if stream {
            self.consume_stream(info, response, callback, xml_sections)
                .await
        } else {
            self.consume_batch(info, response, callback, xml_sections)
                .await
        }
    }
}

impl GeminiDriver {
    async fn consume_batch(
        &self,
        info: &ModelInfo,
        response: reqwest::Response,
        callback: Option<&LlmCallback>,
        xml_sections: &[XmlSection],
    ) -> Result<NativeCompletion, LlmError> {
        let body: GenerateResponse = response
            .json()
            .await
            .map_err(|err| LlmError::bad_completion(err.to_string(), None))?;

        let mut state = Accumulator::default();
        for part in body.parts() {
            state.push(part);
        }

        let completion = state.finish(info);
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
        let mut state = Accumulator::default();

        while let Some((_event, data)) = lines.next_data().await? {
            shutdown::assert_is_alive()?;
            let Ok(chunk) = serde_json::from_str::<GenerateResponse>(&data) else {
                continue;
            };
            for part in chunk.parts() {
                let force = state.is_boundary(&part);
                let added = state.push(part);
                emitter.accumulate(&added);
                emitter.maybe_emit(force, &state.answer, &state.thoughts, &state.tool_calls)?;
            }
        }

        let completion = state.finish(info);
        if let Some(callback) = callback {
            callback(parse_completion(&completion, xml_sections, info.supports_tools))?;
        }
        Ok(completion)
    }
}

/// Accumulates Gemini parts into completion state shared by batch and stream.
#[derive(Default)]
struct Accumulator {
    answer: String,
    thoughts: Vec<Thought>,
    tool_calls: Vec<PartialToolCall>,
}

impl Accumulator {
    /// Section boundaries: reasoning → answer, and every function call.
    fn is_boundary(&self, part: &WirePart) -> bool {
        if part.function_call.is_some() {
            return true;
        }
        let is_thought = part.thought.unwrap_or(false);
        !is_thought && !self.thoughts.is_empty() && self.answer.is_empty()
    }

    /// Fold one wire part in; returns the text that was added (for stream
    /// accounting).
    fn push(&mut self, part: WirePart) -> String {
        if let Some(call) = part.function_call {
            self.tool_calls.push(PartialToolCall {
                id: call.id,
                name: call.name,
                arguments: call.args.map(|args| args.to_string()).unwrap_or_default(),
            });
            return String::new();
        }

        let signature = part.thought_signature;
        if part.thought.unwrap_or(false) {
            let text = part.text.unwrap_or_default();
            match self.thoughts.last_mut() {
                Some(thought) if thought.signature.is_none() => {
                    thought.text.push_str(&text);
                    thought.signature = signature;
                }
                _ => self.thoughts.push(Thought {
                    text: text.clone(),
                    signature,
                }),
            }
            return text;
        }

        if let Some(signature) = signature {
            // A signature on an answer part still belongs to the reasoning.
            match self.thoughts.last_mut() {
                Some(thought) => thought.signature = Some(signature),
                None => self.thoughts.push(Thought {
                    text: String::new(),
                    signature: Some(signature),
                }),
            }
        }
        if let Some(text) = part.text {
            self.answer.push_str(&text);
            return text;
        }
        String::new()
    }

    fn finish(self, info: &ModelInfo) -> NativeCompletion {
        NativeCompletion::parse(
            &self.answer,
            self.thoughts,
            &self.tool_calls,
            true,
            info.supports_think,
        )
    }
}

///
/// Wire types
///

#[derive(Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

impl GenerateResponse {
    fn parts(self) -> Vec<WirePart> {
        self.candidates
            .into_iter()
            .next()
            .and_then(|candidate| candidate.content)
            .map(|content| content.parts)
            .unwrap_or_default()
    }
}

#[derive(Deserialize)]
struct Candidate {
    content: Option<WireContent>,
}

#[derive(Deserialize)]
struct WireContent {
    #[serde(default)]
    parts: Vec<WirePart>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct WirePart {
    text: Option<String>,
    thought: Option<bool>,
    thought_signature: Option<String>,
    function_call: Option<WireFunctionCall>,
}

#[derive(Deserialize)]
struct WireFunctionCall {
    id: Option<String>,
    name: String,
    args: Option<Value>,
}
