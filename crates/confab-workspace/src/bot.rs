//! Bot personas and durable per-bot state.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use confab_core::{BotId, ProcessName, ThreadCursor, Workspace};
use confab_kv::{KvStore, EXP_WEEK};
use confab_process::ToolInfo;

use crate::WorkspaceError;

const KEY_BOT_STATE: &str = "bot:state:";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToggleAction {
    Disable,
    Enable,
}

/// A persona capability rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Capability {
    /// Toggle a set of tools on or off.
    Tools {
        action: ToggleAction,
        tools: Vec<ProcessName>,
    },
}

/// Bot configuration, selected per `(workspace, bot)` or per request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "agent", rename_all = "lowercase")]
pub enum Persona {
    /// Chatbot persona that runs through the Completions API.
    Chat {
        system_message: String,
        model: String,
        temperature: f64,
        #[serde(default)]
        capabilities: Vec<Capability>,
    },
}

impl Persona {
    pub fn model(&self) -> &str {
        match self {
            Persona::Chat { model, .. } => model,
        }
    }

    pub fn system_message(&self) -> &str {
        match self {
            Persona::Chat { system_message, .. } => system_message,
        }
    }

    pub fn temperature(&self) -> f64 {
        match self {
            Persona::Chat { temperature, .. } => *temperature,
        }
    }

    /// Apply the capability rules: start from the tool's default, then each
    /// matching rule toggles it.
    pub fn filter_tool(&self, tool: &ToolInfo) -> bool {
        let Persona::Chat { capabilities, .. } = self;
        let mut enabled = tool.default_enabled;
        for capability in capabilities {
            let Capability::Tools { action, tools } = capability;
            if tools.contains(&tool.name) {
                enabled = *action == ToggleAction::Enable;
            }
        }
        enabled
    }
}

/// The workspace default when neither the request nor the saved state carry
/// a persona.
pub fn default_persona() -> Persona {
    Persona::Chat {
        system_message: String::new(),
        model: "claude-opus".to_string(),
        temperature: 1.0,
        capabilities: Vec::new(),
    }
}

/// Durable per-bot state: chosen persona, opaque model state, and the last
/// seen message per thread. Expires after a week of inactivity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BotState {
    pub workspace: Workspace,
    pub bot_id: BotId,
    pub persona: Option<Persona>,
    #[serde(default)]
    pub llm_state: Option<Value>,
    #[serde(default)]
    pub thread_cursors: Vec<ThreadCursor>,
}

impl BotState {
    pub fn new(workspace: Workspace, bot_id: BotId) -> Self {
        Self {
            workspace,
            bot_id,
            persona: None,
            llm_state: None,
            thread_cursors: Vec::new(),
        }
    }

    pub fn get_cursor(&self, thread_uri: &confab_core::ThreadUri) -> Option<&ThreadCursor> {
        self.thread_cursors
            .iter()
            .find(|cursor| cursor.thread_uri() == *thread_uri)
    }

    pub fn apply_update(
        &mut self,
        persona: Option<Persona>,
        llm_state: Option<Value>,
        cursors: Vec<ThreadCursor>,
    ) {
        if let Some(llm_state) = llm_state {
            self.llm_state = Some(llm_state);
        }
        if let Some(persona) = persona {
            self.persona = Some(persona);
        }
        for cursor in cursors {
            // One cursor per thread; replace stale entries for the same
            // thread, keep the list sorted by string form.
            self.thread_cursors
                .retain(|existing| existing.thread_uri() != cursor.thread_uri());
            let key = cursor.to_string();
            let index = self
                .thread_cursors
                .binary_search_by(|existing| existing.to_string().cmp(&key))
                .unwrap_or_else(|index| index);
            self.thread_cursors.insert(index, cursor);
        }
    }
}

fn bot_key(workspace: &Workspace, bot_id: &BotId) -> String {
    format!("{}{}:{}", KEY_BOT_STATE, workspace.as_kv_path(), bot_id)
}

/// Load the bot state, creating a default one on first use.
pub async fn bot_acquire(
    kv: &KvStore,
    workspace: &Workspace,
    bot_id: &BotId,
) -> Result<BotState, WorkspaceError> {
    let key = bot_key(workspace, bot_id);
    if let Some(state) = kv.get::<BotState>(&key).await? {
        return Ok(state);
    }
    let state = BotState::new(workspace.clone(), bot_id.clone());
    kv.set_one(&key, &state, Some(EXP_WEEK)).await?;
    Ok(state)
}

/// Merge an update into the saved bot state.
pub async fn bot_save_update(
    kv: &KvStore,
    workspace: &Workspace,
    bot_id: &BotId,
    persona: Option<Persona>,
    llm_state: Option<Value>,
    cursors: Vec<ThreadCursor>,
) -> Result<BotState, WorkspaceError> {
    let key = bot_key(workspace, bot_id);
    let mut state = kv
        .get::<BotState>(&key)
        .await?
        .unwrap_or_else(|| BotState::new(workspace.clone(), bot_id.clone()));
    state.apply_update(persona, llm_state, cursors);
    kv.set_one(&key, &state, Some(EXP_WEEK)).await?;
    Ok(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn tool(name: &str, default_enabled: bool) -> ToolInfo {
        ToolInfo {
            name: name.parse().unwrap(),
            description: String::new(),
            arguments_schema: json!({"type": "object"}),
            default_enabled,
        }
    }

    #[test]
    fn capability_rules_toggle_in_order() {
        let persona = Persona::Chat {
            system_message: String::new(),
            model: "claude-opus".to_string(),
            temperature: 0.7,
            capabilities: vec![
                Capability::Tools {
                    action: ToggleAction::Disable,
                    tools: vec!["web_search".parse().unwrap()],
                },
                Capability::Tools {
                    action: ToggleAction::Enable,
                    tools: vec!["web_search".parse().unwrap()],
                },
            ],
        };

        // The later rule wins.
        assert!(persona.filter_tool(&tool("web_search", false)));
        // Untouched tools keep their default.
        assert!(persona.filter_tool(&tool("echo", true)));
        assert!(!persona.filter_tool(&tool("generate_image", false)));
    }

    #[tokio::test]
    async fn bot_state_round_trips_and_merges() {
        let kv = KvStore::memory();
        let workspace: Workspace = "ndw://internal/default-unit-test".parse().unwrap();
        let bot_id = BotId::new("helper").unwrap();

        let state = bot_acquire(&kv, &workspace, &bot_id).await.unwrap();
        assert!(state.persona.is_none());

        let cursor: ThreadCursor =
            "nkt://internal/default-unit-test/thread-9e7xc0000123456789abcdef/msg-9e7xc00123456789abcdef012345"
                .parse()
                .unwrap();
        bot_save_update(
            &kv,
            &workspace,
            &bot_id,
            Some(default_persona()),
            Some(json!({"history": "opaque"})),
            vec![cursor.clone()],
        )
        .await
        .unwrap();

        let state = bot_acquire(&kv, &workspace, &bot_id).await.unwrap();
        assert!(state.persona.is_some());
        assert_eq!(state.thread_cursors, vec![cursor.clone()]);
        assert_eq!(state.get_cursor(&cursor.thread_uri()), Some(&cursor));
    }

    #[test]
    fn cursor_updates_replace_same_thread() {
        let workspace: Workspace = "ndw://internal/default-unit-test".parse().unwrap();
        let mut state = BotState::new(workspace, BotId::new("helper").unwrap());

        let old: ThreadCursor =
            "nkt://internal/default-unit-test/thread-9e7xc0000123456789abcdef/msg-9e7xc00123456789abcdef012345"
                .parse()
                .unwrap();
        let new: ThreadCursor =
            "nkt://internal/default-unit-test/thread-9e7xc0000123456789abcdef/msg-9e7xd00123456789abcdef012345"
                .parse()
                .unwrap();
        state.apply_update(None, None, vec![old]);
        state.apply_update(None, None, vec![new.clone()]);
        assert_eq!(state.thread_cursors, vec![new]);
    }
}
