//! Static model metadata.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelStatus {
    Experimental,
    Legacy,
    Stable,
}

/// How the model carries reasoning across turns.
///
/// - `anthropic` uses signed `thinking` blocks.
/// - `deepseek` expects `<think>` inline in request text.
/// - `gemini` uses `thinkingConfig` and `thoughtSignature`.
/// - `gpt-oss` prepends plain reasoning text.
/// - `hidden` never returns reasoning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ThinkMode {
    Anthropic,
    Deepseek,
    Gemini,
    GptOss,
    Hidden,
}

impl ThinkMode {
    /// Proprietary modes rely on thought signatures, so histories cannot move
    /// across them.
    pub fn is_proprietary(&self) -> bool {
        matches!(self, ThinkMode::Anthropic | ThinkMode::Gemini)
    }
}

/// How native tool calls and results are rendered in the request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolsMode {
    Gemini,
    Openai,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReasoningEffort {
    Low,
    Medium,
    High,
}

/// Which wire dialect drives the model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Dialect {
    Openai,
    Anthropic,
    Gemini,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelInfo {
    pub name: String,
    pub status: ModelStatus,
    pub description: String,

    /// Wire dialect used to drive the model.
    pub dialect: Dialect,
    /// Vendor-side model identifier.
    pub native_name: String,
    pub knowledge_cutoff: Option<String>,
    /// Mime types the model accepts as inline media.
    #[serde(default)]
    pub supports_media: Vec<String>,
    #[serde(default)]
    pub supports_stop: bool,
    #[serde(default = "default_true")]
    pub supports_stream: bool,
    pub supports_think: Option<ThinkMode>,
    pub supports_tools: Option<ToolsMode>,

    pub limit_tokens_total: u32,
    pub limit_tokens_response: u32,
    /// Window under which history renders in full fidelity; older runs fall
    /// back to the legacy rendering.
    pub limit_tokens_recent: Option<u32>,
    #[serde(default)]
    pub limit_media: u32,

    pub reasoning_effort: Option<ReasoningEffort>,
}

fn default_true() -> bool {
    true
}

impl ModelInfo {
    /// Token budget available to the request history; beyond it, the oldest
    /// runs are dropped or the request fails.
    pub fn limit_tokens_request(&self) -> u32 {
        self.limit_tokens_total - self.limit_tokens_response
    }
}
