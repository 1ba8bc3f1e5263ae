//! Deterministic completion driver for tests.
//!
//! Responses are queued up front; each request pops the next one, optionally
//! re-streamed chunk by chunk so callbacks and partial-parse batching are
//! exercised exactly like a live vendor stream.

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::Value;

use crate::history::LlmHistory;
use crate::info::ModelInfo;
use crate::message::{Thought, XmlSection};
use crate::model::{
    build_system, parse_completion, CompletionArgs, CompletionDriver, LlmCallback,
    NativeCompletion, PartialToolCall, StreamEmitter,
};
use crate::LlmError;

/// One canned model response.
#[derive(Debug, Clone, Default)]
pub struct ScriptedCompletion {
    pub answer: String,
    pub thoughts: Vec<Thought>,
    pub tool_calls: Vec<PartialToolCall>,
}

impl ScriptedCompletion {
    pub fn text(answer: impl Into<String>) -> Self {
        Self {
            answer: answer.into(),
            ..Default::default()
        }
    }

    pub fn with_thought(mut self, text: &str, signature: Option<&str>) -> Self {
        self.thoughts.push(Thought {
            text: text.to_string(),
            signature: signature.map(str::to_string),
        });
        self
    }

    pub fn with_tool_call(mut self, name: &str, arguments: Value) -> Self {
        self.tool_calls.push(PartialToolCall {
            id: None,
            name: name.to_string(),
            arguments: arguments.to_string(),
        });
        self
    }
}

/// A record of one request the driver served.
#[derive(Debug, Clone)]
pub struct ScriptedRequest {
    pub params: Value,
}

#[derive(Default)]
pub struct ScriptedDriver {
    responses: Mutex<VecDeque<ScriptedCompletion>>,
    requests: Mutex<Vec<ScriptedRequest>>,
}

impl ScriptedDriver {
    pub fn new(responses: Vec<ScriptedCompletion>) -> Self {
        Self {
            responses: Mutex::new(responses.into()),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn push(&self, completion: ScriptedCompletion) {
        self.responses.lock().unwrap().push_back(completion);
    }

    /// Every request body the driver has served, oldest first.
    pub fn requests(&self) -> Vec<ScriptedRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl CompletionDriver for ScriptedDriver {
    fn build_params(
        &self,
        info: &ModelInfo,
        args: &CompletionArgs,
        history: &mut LlmHistory,
    ) -> Result<Value, LlmError> {
        // Render for real so the history machinery is exercised in tests.
        let messages = history.render_openai(info.limit_media)?;
        let mut body = serde_json::json!({
            "model": info.native_name,
            "messages": messages,
            "tools": args.tools.iter().map(|tool| tool.as_openai()).collect::<Vec<_>>(),
        });
        if let Some(system) = build_system(info, args) {
            body["system"] = Value::from(system);
        }
        if args.callback.is_some() {
            body["stream"] = Value::Bool(true);
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
        self.requests.lock().unwrap().push(ScriptedRequest {
            params: params.clone(),
        });

        let scripted = self
            .responses
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| LlmError::Network("scripted driver exhausted".to_string()))?;

        if callback.is_some() {
            // Re-stream the answer in small chunks to exercise the partial
            // parse batching.
            let mut emitter = StreamEmitter::new(callback, xml_sections, info);
            let mut partial = String::new();
            for chunk in scripted
                .answer
                .as_bytes()
                .chunks(16)
                .map(|chunk| String::from_utf8_lossy(chunk).to_string())
            {
                partial.push_str(&chunk);
                emitter.accumulate(&chunk);
                emitter.maybe_emit(false, &partial, &scripted.thoughts, &[])?;
            }
            for index in 0..scripted.tool_calls.len() {
                emitter.maybe_emit(
                    true,
                    &partial,
                    &scripted.thoughts,
                    &scripted.tool_calls[..=index],
                )?;
            }
        }

        let completion = NativeCompletion::parse(
            &scripted.answer,
            scripted.thoughts.clone(),
            &scripted.tool_calls,
            true,
            info.supports_think,
        );
        if let Some(callback) = callback {
            callback(parse_completion(&completion, xml_sections, info.supports_tools))?;
        }
        Ok(completion)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::stub_model_info;
    use crate::message::LlmPart;
    use crate::model::LlmModel;
    use confab_core::{AgentId, UserId};
    use std::sync::Arc;

    fn model(responses: Vec<ScriptedCompletion>) -> LlmModel {
        LlmModel::new(
            stub_model_info(),
            Arc::new(ScriptedDriver::new(responses)),
            vec![],
        )
    }

    #[tokio::test]
    async fn scripted_text_round_trip() {
        let model = model(vec![ScriptedCompletion::text("boop")]);
        let args = CompletionArgs {
            system: Some("You are a helpful assistant.".to_string()),
            messages: vec![LlmPart::prompt(
                AgentId::User(UserId::generate()),
                "Answer with 'boop' and nothing else.",
            )],
            ..Default::default()
        };
        let (parts, state) = model.get_completion(args).await.unwrap();

        assert!(matches!(
            &parts[0],
            LlmPart::Text { content, .. } if content == "boop"
        ));
        // The state history recorded both the prompt and the answer.
        assert_eq!(state.history.current.len(), 2);
    }

    #[tokio::test]
    async fn streaming_callback_sees_partials_and_final() {
        let seen = Arc::new(Mutex::new(Vec::<usize>::new()));
        let record = Arc::clone(&seen);
        let callback: LlmCallback = Arc::new(move |parts| {
            record.lock().unwrap().push(parts.len());
            Ok(())
        });

        let long_answer = "word ".repeat(40);
        let model = model(vec![ScriptedCompletion::text(long_answer)]);
        let args = CompletionArgs {
            callback: Some(callback),
            messages: vec![LlmPart::prompt(AgentId::User(UserId::generate()), "go")],
            ..Default::default()
        };
        model.get_completion(args).await.unwrap();

        // At least one partial plus the final parse.
        assert!(seen.lock().unwrap().len() >= 2);
    }

    #[tokio::test]
    async fn callback_stop_cancels_the_completion() {
        let callback: LlmCallback =
            Arc::new(|_parts| Err(confab_core::StoppedError::stopped()));
        let model = model(vec![ScriptedCompletion::text("x".repeat(200))]);
        let args = CompletionArgs {
            callback: Some(callback),
            messages: vec![LlmPart::prompt(AgentId::User(UserId::generate()), "go")],
            ..Default::default()
        };
        let err = model.get_completion(args).await.unwrap_err();
        assert!(matches!(err, LlmError::Stopped(_)));
    }

    #[tokio::test]
    async fn exhausted_script_is_a_network_error() {
        let model = model(vec![]);
        let args = CompletionArgs {
            messages: vec![LlmPart::prompt(AgentId::User(UserId::generate()), "go")],
            ..Default::default()
        };
        assert!(matches!(
            model.get_completion(args).await.unwrap_err(),
            LlmError::Network(_)
        ));
    }
}
