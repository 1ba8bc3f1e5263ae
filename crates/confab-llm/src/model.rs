//! The completion driver: request build, retry, streaming, parsing.
//!
//! `LlmModel` pairs a [`ModelInfo`] with a dialect-specific
//! [`CompletionDriver`]. The driver builds an opaque JSON request body and
//! consumes the vendor response into a [`NativeCompletion`]; everything else
//! (history assembly, retry policy, section parsing, state threading) is
//! shared here.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::warn;

use confab_core::error::StoppedError;
use confab_core::{shutdown, ProcessId, ProcessName};

use crate::history::LlmHistory;
use crate::info::{ModelInfo, ThinkMode, ToolsMode};
use crate::message::{
    strip_keep_indent, system_instructions_tools_xml, LlmPart, LlmTool, Thought, ToolCall,
    XmlSection,
};
use crate::xml::split_xml;
use crate::LlmError;

/// Per-request timeout against the vendor API.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(300);

/// When streaming, partial parses are emitted once at least this many
/// characters accumulated, plus at every section boundary. A UX/latency
/// trade-off.
pub const STREAM_CHAR_THRESHOLD: usize = 40;

/// Streaming callback. Raising `StoppedError` cancels the in-flight
/// completion.
pub type LlmCallback = Arc<dyn Fn(Vec<LlmPart>) -> Result<(), StoppedError> + Send + Sync>;

#[derive(Debug, Clone, PartialEq)]
pub enum ToolChoice {
    Auto,
    None,
    Tool(ProcessName),
}

/// Opaque serialized model state, carried across turns in the bot state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LlmState {
    pub history: LlmHistory,
}

/// Arguments to one completion request.
#[derive(Default)]
pub struct CompletionArgs {
    pub callback: Option<LlmCallback>,
    pub state: Option<LlmState>,
    pub system: Option<String>,
    pub messages: Vec<LlmPart>,
    pub max_tokens: Option<u32>,
    pub stop: Vec<String>,
    pub temperature: Option<f64>,
    pub tools: Vec<LlmTool>,
    pub tool_choice: Option<ToolChoice>,
    pub response_schema: Option<Value>,
    /// Extra XML tag types recognized in free-form answers.
    pub xml_sections: Vec<XmlSection>,
}

///
/// Native completion
///

/// A tool call as accumulated from stream deltas: arguments still raw JSON
/// text.
#[derive(Debug, Clone, PartialEq)]
pub struct PartialToolCall {
    pub id: Option<String>,
    pub name: String,
    pub arguments: String,
}

impl PartialToolCall {
    /// Finalize into tool calls. Only final parses assign process ids.
    ///
    /// The `multi_tool_use.parallel` pseudo-tool some OpenAI models
    /// hallucinate is expanded into one call per sub-invocation.
    fn build(&self, finished: bool) -> Result<Vec<ToolCall>, String> {
        let arguments: Value = serde_json::from_str(&self.arguments)
            .map_err(|err| format!("bad '{}' tool call: invalid JSON: {err}", self.name))?;

        if self.name == "multi_tool_use.parallel" {
            let tool_uses = arguments
                .get("tool_uses")
                .and_then(Value::as_array)
                .ok_or_else(|| "bad parallel tool call: missing tool_uses".to_string())?;
            return tool_uses
                .iter()
                .map(|tool_use| {
                    let recipient = tool_use
                        .get("recipient_name")
                        .and_then(Value::as_str)
                        .ok_or_else(|| "bad parallel tool call: missing recipient".to_string())?;
                    let name = recipient.rsplit('.').next().unwrap_or(recipient);
                    let name: ProcessName = name
                        .parse()
                        .map_err(|_| format!("bad '{name}' tool call: invalid name"))?;
                    let arguments = tool_use
                        .get("parameters")
                        .and_then(Value::as_object)
                        .cloned()
                        .unwrap_or_default();
                    Ok(ToolCall {
                        process_id: finished.then(ProcessId::generate),
                        name,
                        arguments,
                    })
                })
                .collect();
        }

        let arguments: Map<String, Value> = match arguments {
            Value::Object(map) => map,
            _ => return Err(format!("bad '{}' tool call: arguments not an object", self.name)),
        };
        let name: ProcessName = self
            .name
            .parse()
            .map_err(|_| format!("bad '{}' tool call: invalid name", self.name))?;

        let process_id = match &self.id {
            Some(id) => Some(
                ProcessId::from_native(id)
                    .map_err(|_| format!("bad '{}' tool call: invalid id", self.name))?,
            ),
            None if finished => Some(ProcessId::generate()),
            None => None,
        };

        Ok(vec![ToolCall {
            process_id,
            name,
            arguments,
        }])
    }
}

/// A tool call that failed to finalize; surfaced as an `invalid` part.
#[derive(Debug, Clone, PartialEq)]
pub struct InvalidToolCall {
    pub name: String,
    pub arguments: String,
    pub error: String,
}

impl InvalidToolCall {
    fn as_invalid_part(&self) -> LlmPart {
        let call_json = format!(
            r#"{{"name": "{}", "arguments": {}}}"#,
            self.name, self.arguments
        );
        LlmPart::Invalid {
            error: self.error.clone(),
            completion: format!("<tool-calls>\n{call_json}\n</tool-calls>"),
        }
    }
}

/// The raw completion as the vendor returned it, before section parsing.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct NativeCompletion {
    pub answer: String,
    pub thoughts: Vec<Thought>,
    pub tool_calls: Vec<ToolCall>,
    pub tool_errors: Vec<InvalidToolCall>,
}

impl NativeCompletion {
    /// Normalize a vendor completion: recover inline reasoning for the open
    /// think modes and finalize tool calls.
    pub fn parse(
        answer: &str,
        mut thoughts: Vec<Thought>,
        tool_calls: &[PartialToolCall],
        finished: bool,
        supports_think: Option<ThinkMode>,
    ) -> Self {
        let mut answer = answer.to_string();

        // Some gpt-oss servings leak the raw channel framing.
        if supports_think == Some(ThinkMode::GptOss) {
            if let Some(rest) = answer.strip_prefix("<|channel|>analysis<|message|>") {
                if let Some((thinking, tail)) = rest.split_once("<|end|>") {
                    thoughts.push(Thought {
                        text: thinking.to_string(),
                        signature: None,
                    });
                    answer = tail
                        .trim_start_matches("<|start|>assistant<|channel|>final<|message|>")
                        .trim_start_matches("<|start|>")
                        .trim_start_matches("<|call|>")
                        .to_string();
                } else {
                    answer = String::new();
                }
            } else if let Some(rest) = answer.strip_prefix("analysis") {
                if let Some((thinking, tail)) = rest.split_once("assistantfinal") {
                    thoughts.push(Thought {
                        text: thinking.to_string(),
                        signature: None,
                    });
                    answer = tail.to_string();
                }
            }
        }

        // DeepSeek-style models include their thinking inline in the content.
        if supports_think == Some(ThinkMode::Deepseek) && answer.starts_with("<think>") {
            let body = answer.trim_start_matches("<think>");
            let (thinking, tail) = match body.split_once("</think>") {
                Some((thinking, tail)) => (thinking, tail),
                None => (body, ""),
            };
            thoughts.push(Thought {
                text: strip_keep_indent(thinking),
                signature: None,
            });
            answer = tail.trim_start_matches('\n').to_string();
        }

        let mut valid: Vec<ToolCall> = Vec::new();
        let mut invalid: Vec<InvalidToolCall> = Vec::new();
        for call in tool_calls {
            match call.build(finished) {
                Ok(calls) => valid.extend(calls),
                Err(error) => {
                    if finished {
                        invalid.push(InvalidToolCall {
                            name: call.name.clone(),
                            arguments: call.arguments.clone(),
                            error,
                        });
                    }
                }
            }
        }

        NativeCompletion {
            answer,
            thoughts,
            tool_calls: valid,
            tool_errors: invalid,
        }
    }
}

/// Parse a native completion into ordered parts.
pub fn parse_completion(
    completion: &NativeCompletion,
    xml_sections: &[XmlSection],
    supports_tools: Option<ToolsMode>,
) -> Vec<LlmPart> {
    let mut parts: Vec<LlmPart> = Vec::new();

    for thought in &completion.thoughts {
        parts.push(LlmPart::Think {
            text: thought.text.clone(),
            signature: thought.signature.clone(),
        });
    }

    if !completion.answer.is_empty() {
        parts.extend(parse_answer(
            &completion.answer,
            xml_sections,
            supports_tools,
        ));
    }

    if !completion.tool_calls.is_empty() {
        parts.push(LlmPart::ToolCalls {
            calls: completion.tool_calls.clone(),
        });
    }

    parts.extend(
        completion
            .tool_errors
            .iter()
            .map(InvalidToolCall::as_invalid_part),
    );

    parts
}

fn parse_answer(
    answer: &str,
    xml_sections: &[XmlSection],
    supports_tools: Option<ToolsMode>,
) -> Vec<LlmPart> {
    let mut sections: Vec<XmlSection> = xml_sections.to_vec();
    if !sections.contains(&XmlSection::Text) {
        sections.push(XmlSection::Text);
    }
    if supports_tools.is_none() && !sections.contains(&XmlSection::ToolCalls) {
        sections.push(XmlSection::ToolCalls);
    }

    let tagged = if sections.len() > 1 {
        let tags: Vec<&str> = sections.iter().map(XmlSection::tag).collect();
        split_xml(answer, &tags, Some(XmlSection::Text.tag()))
    } else {
        vec![(XmlSection::Text.tag().to_string(), answer.to_string())]
    };

    let mut parts: Vec<LlmPart> = Vec::new();
    for (tag, body) in tagged {
        let section = sections
            .iter()
            .find(|section| section.tag() == tag)
            .copied()
            .unwrap_or(XmlSection::Text);
        match section.parse_body(&body) {
            Ok(LlmPart::Text { content, .. }) if content.trim().is_empty() => {}
            Ok(part) => parts.push(part),
            Err(error) => {
                let completion = if tag == XmlSection::Text.tag() {
                    body
                } else {
                    format!("<{tag}>{body}</{tag}>")
                };
                parts.push(LlmPart::Invalid { error, completion });
            }
        }
    }
    parts
}

///
/// Streaming
///

/// Shared partial-parse batching for the streaming consumers.
pub struct StreamEmitter<'a> {
    callback: Option<&'a LlmCallback>,
    xml_sections: &'a [XmlSection],
    supports_think: Option<ThinkMode>,
    supports_tools: Option<ToolsMode>,
    pending_chars: usize,
}

impl<'a> StreamEmitter<'a> {
    pub fn new(
        callback: Option<&'a LlmCallback>,
        xml_sections: &'a [XmlSection],
        info: &ModelInfo,
    ) -> Self {
        Self {
            callback,
            xml_sections,
            supports_think: info.supports_think,
            supports_tools: info.supports_tools,
            pending_chars: 0,
        }
    }

    pub fn accumulate(&mut self, text: &str) {
        self.pending_chars += text.len();
    }

    /// Emit a partial parse when forced (section boundary) or past the
    /// character threshold. Never assigns process ids to tool calls.
    pub fn maybe_emit(
        &mut self,
        force: bool,
        answer: &str,
        thoughts: &[Thought],
        tool_calls: &[PartialToolCall],
    ) -> Result<(), LlmError> {
        if !force && self.pending_chars < STREAM_CHAR_THRESHOLD {
            return Ok(());
        }
        self.pending_chars = 0;

        let Some(callback) = self.callback else {
            return Ok(());
        };
        let completion = NativeCompletion::parse(
            answer,
            thoughts.to_vec(),
            tool_calls,
            false,
            self.supports_think,
        );
        let parts = parse_completion(&completion, self.xml_sections, self.supports_tools);
        callback(parts)?;
        Ok(())
    }
}

///
/// Driver & model
///

/// One provider dialect: build the request body, execute it, return the
/// native completion. Params are opaque to callers.
#[async_trait]
pub trait CompletionDriver: Send + Sync {
    fn build_params(
        &self,
        info: &ModelInfo,
        args: &CompletionArgs,
        history: &mut LlmHistory,
    ) -> Result<Value, LlmError>;

    async fn execute(
        &self,
        info: &ModelInfo,
        params: &Value,
        callback: Option<&LlmCallback>,
        xml_sections: &[XmlSection],
    ) -> Result<NativeCompletion, LlmError>;
}

/// Combine the caller system text with the XML tool-call protocol when the
/// model lacks native tools.
pub fn build_system(info: &ModelInfo, args: &CompletionArgs) -> Option<String> {
    let mut parts: Vec<String> = Vec::new();
    if let Some(system) = &args.system {
        if !system.is_empty() {
            parts.push(system.clone());
        }
    }
    if info.supports_tools.is_none() && !args.tools.is_empty() {
        parts.push(system_instructions_tools_xml(&args.tools));
    }
    if parts.is_empty() {
        None
    } else {
        Some(parts.join("\n"))
    }
}

/// A model the rest of the system can request completions from.
#[derive(Clone)]
pub struct LlmModel {
    info: ModelInfo,
    driver: Arc<dyn CompletionDriver>,
    retry_delays: Vec<u64>,
}

impl LlmModel {
    pub fn new(info: ModelInfo, driver: Arc<dyn CompletionDriver>, retry_delays: Vec<u64>) -> Self {
        Self {
            info,
            driver,
            retry_delays,
        }
    }

    pub fn info(&self) -> &ModelInfo {
        &self.info
    }

    /// Run one completion and return the parsed parts plus the state to carry
    /// into the next turn.
    pub async fn get_completion(
        &self,
        args: CompletionArgs,
    ) -> Result<(Vec<LlmPart>, LlmState), LlmError> {
        let (completion, mut history) = self.get_completion_raw(&args).await?;
        let parsed = parse_completion(&completion, &args.xml_sections, self.info.supports_tools);
        for part in &parsed {
            history.add_part(part.clone());
        }
        Ok((parsed, LlmState { history }))
    }

    /// Run one completion and parse the final paragraph of the answer as
    /// JSON into `T`.
    pub async fn get_completion_json<T: serde::de::DeserializeOwned>(
        &self,
        mut args: CompletionArgs,
    ) -> Result<(T, LlmState), LlmError> {
        args.callback = None;

        let (completion, mut history) = self.get_completion_raw(&args).await?;
        let mut answer = strip_keep_indent(&completion.answer);
        if answer.is_empty() {
            return Err(LlmError::EmptyCompletion);
        }
        // Some models prepend a human-readable preamble before the object.
        if let Some((_, tail)) = answer.rsplit_once("\n\n") {
            answer = tail.to_string();
        }

        let parsed: T = serde_json::from_str(&answer)
            .map_err(|err| LlmError::bad_completion(format!("invalid JSON: {err}"), Some(answer)))?;

        for part in parse_completion(&completion, &[], self.info.supports_tools) {
            history.add_part(part);
        }
        Ok((parsed, LlmState { history }))
    }

    /// Run one completion and return the plain answer text.
    pub async fn get_completion_text(
        &self,
        args: CompletionArgs,
    ) -> Result<(String, LlmState), LlmError> {
        let (completion, mut history) = self.get_completion_raw(&args).await?;
        let answer = strip_keep_indent(&completion.answer);
        if answer.is_empty() {
            return Err(LlmError::EmptyCompletion);
        }
        for part in parse_completion(&completion, &[], self.info.supports_tools) {
            history.add_part(part);
        }
        Ok((answer, LlmState { history }))
    }

    async fn get_completion_raw(
        &self,
        args: &CompletionArgs,
    ) -> Result<(NativeCompletion, LlmHistory), LlmError> {
        // Build once, before the retry loop: the history materialization is
        // the CPU-heavy part and identical across retries.
        let mut history = match &args.state {
            Some(state) => state.history.reuse(self.info.clone())?,
            None => LlmHistory::new(self.info.clone()),
        };
        for part in &args.messages {
            history.add_part(part.clone());
        }
        let params = self.driver.build_params(&self.info, args, &mut history)?;

        let mut network_errors = 0usize;
        loop {
            let attempt = self
                .driver
                .execute(
                    &self.info,
                    &params,
                    args.callback.as_ref(),
                    &args.xml_sections,
                )
                .await;
            match attempt {
                Ok(completion) => return Ok((completion, history)),
                Err(LlmError::Stopped(err)) => return Err(err.into()),
                Err(LlmError::RateLimited { status, message })
                    if network_errors < self.retry_delays.len() =>
                {
                    let delay = self.retry_delays[network_errors];
                    network_errors += 1;
                    warn!(status, delay_secs = delay, "retrying after LLM rate limit");
                    shutdown::with_timeout(
                        tokio::time::sleep(Duration::from_secs(delay)),
                        None,
                    )
                    .await
                    .map_err(|_| LlmError::Network(message.clone()))?;
                }
                Err(LlmError::RateLimited { message, .. }) => {
                    return Err(LlmError::Network(format!("rate limited: {message}")));
                }
                Err(err) => return Err(err),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parallel_pseudo_tool_expands() {
        let call = PartialToolCall {
            id: None,
            name: "multi_tool_use.parallel".to_string(),
            arguments: json!({
                "tool_uses": [
                    {"recipient_name": "functions.web_search", "parameters": {"q": "a"}},
                    {"recipient_name": "functions.read_docs", "parameters": {"q": "b"}},
                ],
            })
            .to_string(),
        };
        let calls = call.build(true).unwrap();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].name.as_str(), "web_search");
        assert_eq!(calls[1].name.as_str(), "read_docs");
        assert!(calls.iter().all(|call| call.process_id.is_some()));
    }

    #[test]
    fn partial_parses_do_not_assign_ids() {
        let call = PartialToolCall {
            id: None,
            name: "web_search".to_string(),
            arguments: json!({"q": "x"}).to_string(),
        };
        let calls = call.build(false).unwrap();
        assert!(calls[0].process_id.is_none());

        let calls = call.build(true).unwrap();
        assert!(calls[0].process_id.is_some());
    }

    #[test]
    fn invalid_arguments_become_invalid_parts_not_failures() {
        let completion = NativeCompletion::parse(
            "",
            Vec::new(),
            &[PartialToolCall {
                id: Some("call_x".to_string()),
                name: "web_search".to_string(),
                arguments: "{not json".to_string(),
            }],
            true,
            None,
        );
        assert!(completion.tool_calls.is_empty());
        assert_eq!(completion.tool_errors.len(), 1);

        let parts = parse_completion(&completion, &[], Some(ToolsMode::Openai));
        assert!(matches!(parts.last(), Some(LlmPart::Invalid { .. })));
    }

    #[test]
    fn deepseek_inline_thinking_is_extracted() {
        let completion = NativeCompletion::parse(
            "<think>working it out</think>\nThe answer is 4.",
            Vec::new(),
            &[],
            true,
            Some(ThinkMode::Deepseek),
        );
        assert_eq!(completion.thoughts.len(), 1);
        assert_eq!(completion.thoughts[0].text, "working it out");
        assert_eq!(completion.answer, "The answer is 4.");
    }

    #[test]
    fn gpt_oss_channel_framing_is_recovered() {
        let completion = NativeCompletion::parse(
            "<|channel|>analysis<|message|>let me think<|end|><|start|>assistant<|channel|>final<|message|>Done.",
            Vec::new(),
            &[],
            true,
            Some(ThinkMode::GptOss),
        );
        assert_eq!(completion.thoughts[0].text, "let me think");
        assert_eq!(completion.answer, "Done.");
    }

    #[test]
    fn xml_tool_calls_parse_from_answers() {
        let completion = NativeCompletion {
            answer: "I'll search.\n<tool-calls>\n- name: web_search\n  arguments:\n    q: rust\n</tool-calls>"
                .to_string(),
            ..Default::default()
        };
        let parts = parse_completion(&completion, &[], None);
        assert!(matches!(parts[0], LlmPart::Text { .. }));
        let LlmPart::ToolCalls { calls } = &parts[1] else {
            panic!("expected tool calls, got {:?}", parts[1]);
        };
        assert_eq!(calls[0].name.as_str(), "web_search");
    }

    #[test]
    fn malformed_xml_section_becomes_invalid_part() {
        let completion = NativeCompletion {
            answer: "<tool-calls>\n{{{ not yaml [\n</tool-calls>".to_string(),
            ..Default::default()
        };
        let parts = parse_completion(&completion, &[], None);
        assert!(matches!(parts[0], LlmPart::Invalid { .. }));
    }

    #[test]
    fn emitter_batches_below_threshold() {
        let calls = std::sync::Arc::new(std::sync::Mutex::new(0usize));
        let seen = Arc::clone(&calls);
        let callback: LlmCallback = Arc::new(move |_parts| {
            *seen.lock().unwrap() += 1;
            Ok(())
        });
        let info = crate::catalog::stub_model_info();
        let mut emitter = StreamEmitter::new(Some(&callback), &[], &info);

        emitter.accumulate("short");
        emitter.maybe_emit(false, "short", &[], &[]).unwrap();
        assert_eq!(*calls.lock().unwrap(), 0);

        emitter.accumulate(&"x".repeat(60));
        emitter.maybe_emit(false, "short...", &[], &[]).unwrap();
        assert_eq!(*calls.lock().unwrap(), 1);

        // Section boundaries force an emit regardless of size.
        emitter.accumulate("y");
        emitter.maybe_emit(true, "short...", &[], &[]).unwrap();
        assert_eq!(*calls.lock().unwrap(), 2);
    }
}
