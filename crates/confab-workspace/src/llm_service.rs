//! Model acquisition and the per-conversation proxy.

use std::sync::Arc;

use serde_json::Value;
use tracing::debug;

use confab_core::config::ConfabConfig;
use confab_core::{AgentId, BotId, ProcessId, ProcessName, ServiceId};
use confab_llm::{
    catalog, CompletionArgs, CompletionDriver, LlmCallback, LlmModel, LlmPart, LlmState, LlmTool,
    ToolChoice,
};
use confab_process::ProcessResult;
use confab_threads::{BotMessagePart, ThreadMessage};

use crate::bot::{default_persona, BotState, Persona};
use crate::WorkspaceError;

/// Workspace-wide model access. Tests install a scripted driver override.
pub struct LlmService {
    config: ConfabConfig,
    override_driver: Option<Arc<dyn CompletionDriver>>,
}

impl LlmService {
    pub fn new(config: ConfabConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            override_driver: None,
        })
    }

    /// Route every completion through the given driver instead of the
    /// catalog wiring.
    pub fn with_driver(config: ConfabConfig, driver: Arc<dyn CompletionDriver>) -> Arc<Self> {
        Arc::new(Self {
            config,
            override_driver: Some(driver),
        })
    }

    /// Bind a proxy to the persona's model, restoring the saved model state
    /// when compatible; otherwise the conversation starts fresh.
    pub fn acquire(
        &self,
        bot: &BotState,
        persona: Option<Persona>,
    ) -> Result<LlmProxy, WorkspaceError> {
        let persona = persona
            .or_else(|| bot.persona.clone())
            .unwrap_or_else(default_persona);

        let model = match &self.override_driver {
            Some(driver) => {
                let info = catalog::model_info_by_name(persona.model())
                    .unwrap_or_else(|_| catalog::stub_model_info());
                LlmModel::new(info, Arc::clone(driver), Vec::new())
            }
            None => catalog::model_by_name(persona.model(), &self.config)?,
        };

        let state = bot
            .llm_state
            .clone()
            .and_then(|value| serde_json::from_value::<LlmState>(value).ok())
            .and_then(|state| {
                // Incompatible histories are discarded rather than surfaced:
                // the bot simply starts a fresh conversation.
                match state.history.reuse(model.info().clone()) {
                    Ok(history) => Some(LlmState { history }),
                    Err(err) => {
                        debug!(model = %model.info().name, error = %err, "discarding incompatible llm state");
                        None
                    }
                }
            });

        Ok(LlmProxy {
            model,
            persona,
            bot_id: bot.bot_id.clone(),
            state,
            pending: Vec::new(),
        })
    }
}

/// A conversation-scoped handle on one model: buffered input parts plus the
/// model state carried across completions.
pub struct LlmProxy {
    pub model: LlmModel,
    pub persona: Persona,
    pub bot_id: BotId,
    state: Option<LlmState>,
    pending: Vec<LlmPart>,
}

impl LlmProxy {
    pub fn add_message(&mut self, sender: AgentId, content: impl Into<String>) {
        self.pending.push(LlmPart::Text {
            sender: Some(sender),
            content: content.into(),
        });
    }

    pub fn add_tool_result(
        &mut self,
        sender: Option<ServiceId>,
        process_id: ProcessId,
        name: ProcessName,
        result: ProcessResult,
    ) {
        self.pending.push(LlmPart::ToolResult {
            sender,
            process_id,
            name,
            result,
        });
    }

    /// Insert a thread message as model input. The bot's own messages are
    /// skipped (they are already in the model state).
    pub fn add_thread_message(&mut self, message: &ThreadMessage) {
        match message {
            ThreadMessage::User {
                sender, content, ..
            } => {
                let wrapped = format!(
                    "<user-message>\n<content>\n{content}\n</content>\n</user-message>"
                );
                self.add_message(AgentId::User(sender.clone()), wrapped);
            }
            ThreadMessage::Bot {
                sender, content, ..
            } => {
                if *sender == self.bot_id {
                    return;
                }
                // Other bots contribute their final text only.
                let last_text = content.iter().rev().find_map(|part| match part {
                    BotMessagePart::Text { text, .. } if !text.is_empty() => Some(text.clone()),
                    _ => None,
                });
                if let Some(text) = last_text {
                    self.add_message(AgentId::Bot(sender.clone()), text);
                }
            }
        }
    }

    /// Run one completion over the buffered parts, updating the model state.
    pub async fn get_completion(
        &mut self,
        callback: Option<LlmCallback>,
        system: Option<String>,
        tools: Vec<LlmTool>,
        tool_choice: Option<ToolChoice>,
    ) -> Result<Vec<LlmPart>, WorkspaceError> {
        // Keep the current state and buffered parts until the completion
        // succeeds, so a failed request can be retried by the caller.
        let args = CompletionArgs {
            callback,
            state: self.state.clone(),
            system,
            messages: self.pending.clone(),
            temperature: Some(self.persona.temperature()),
            tools,
            tool_choice,
            ..Default::default()
        };
        let (parts, state) = self.model.get_completion(args).await?;
        self.state = Some(state);
        self.pending.clear();
        Ok(parts)
    }

    /// Serialized model state for the durable bot state.
    pub fn state_value(&self) -> Option<Value> {
        self.state
            .as_ref()
            .and_then(|state| serde_json::to_value(state).ok())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use confab_core::UserId;
    use confab_llm::scripted::{ScriptedCompletion, ScriptedDriver};
    use confab_threads::ThreadMessage as Msg;

    fn proxy_with(responses: Vec<ScriptedCompletion>) -> LlmProxy {
        let service = LlmService::with_driver(
            ConfabConfig::default(),
            Arc::new(ScriptedDriver::new(responses)),
        );
        let bot = BotState::new(
            "ndw://internal/default-unit-test".parse().unwrap(),
            BotId::new("helper").unwrap(),
        );
        service.acquire(&bot, None).unwrap()
    }

    #[tokio::test]
    async fn completions_thread_state_across_turns() {
        let mut proxy = proxy_with(vec![
            ScriptedCompletion::text("boop"),
            ScriptedCompletion::text("fizzbuzz"),
        ]);

        proxy.add_message(
            AgentId::User(UserId::generate()),
            "Answer with 'boop' and nothing else.",
        );
        let parts = proxy.get_completion(None, None, vec![], None).await.unwrap();
        assert!(matches!(&parts[0], LlmPart::Text { content, .. } if content == "boop"));

        proxy.add_message(
            AgentId::User(UserId::generate()),
            "Answer with 'fizzbuzz' and nothing else.",
        );
        let parts = proxy.get_completion(None, None, vec![], None).await.unwrap();
        assert!(matches!(&parts[0], LlmPart::Text { content, .. } if content == "fizzbuzz"));

        // Both turns are recorded in the serialized state.
        let state: LlmState =
            serde_json::from_value(proxy.state_value().unwrap()).unwrap();
        assert_eq!(state.history.history.len(), 1);
        assert!(!state.history.current.is_empty());
    }

    #[tokio::test]
    async fn own_bot_messages_are_skipped() {
        let mut proxy = proxy_with(vec![ScriptedCompletion::text("ok")]);
        let own = Msg::bot(
            proxy.bot_id.clone(),
            vec![BotMessagePart::Text {
                think: None,
                text: "previous answer".to_string(),
            }],
        );
        proxy.add_thread_message(&own);
        assert!(proxy.pending.is_empty());

        let other = Msg::bot(
            BotId::new("other").unwrap(),
            vec![BotMessagePart::Text {
                think: None,
                text: "peer answer".to_string(),
            }],
        );
        proxy.add_thread_message(&other);
        assert_eq!(proxy.pending.len(), 1);
    }
}
