//! The model catalog: the models personas can select, and the wiring from a
//! model name to a driver.

use std::sync::Arc;

use confab_core::config::{ConfabConfig, LlmConfig};

use crate::anthropic::AnthropicDriver;
use crate::gemini::GeminiDriver;
use crate::info::{Dialect, ModelInfo, ModelStatus, ReasoningEffort, ThinkMode, ToolsMode};
use crate::model::LlmModel;
use crate::openai::OpenAiDriver;
use crate::LlmError;

const IMAGE_TYPES_CLAUDE: &[&str] = &["image/gif", "image/jpeg", "image/png", "image/webp"];
const IMAGE_TYPES_OPENAI: &[&str] = &["image/gif", "image/jpeg", "image/png", "image/webp"];
const IMAGE_TYPES_GEMINI: &[&str] = &[
    "image/png",
    "image/jpeg",
    "image/webp",
    "image/heic",
    "image/heif",
];

fn mime_list(types: &[&str]) -> Vec<String> {
    types.iter().map(|mime| mime.to_string()).collect()
}

/// The models exposed to personas.
pub fn builtin_models() -> Vec<ModelInfo> {
    vec![
        ModelInfo {
            name: "claude-opus".to_string(),
            status: ModelStatus::Stable,
            description: "Deep reasoning for complex, multi-step tasks.".to_string(),
            dialect: Dialect::Anthropic,
            native_name: "claude-opus-4-1".to_string(),
            knowledge_cutoff: Some("2025-03".to_string()),
            supports_media: mime_list(IMAGE_TYPES_CLAUDE),
            supports_stop: true,
            supports_stream: true,
            supports_think: Some(ThinkMode::Anthropic),
            supports_tools: Some(ToolsMode::Openai),
            limit_tokens_total: 200_000,
            limit_tokens_response: 32_000,
            limit_tokens_recent: Some(100_000),
            limit_media: 8,
            reasoning_effort: Some(ReasoningEffort::Medium),
        },
        ModelInfo {
            name: "claude-sonnet".to_string(),
            status: ModelStatus::Stable,
            description: "Balanced quality and latency for everyday chat.".to_string(),
            dialect: Dialect::Anthropic,
            native_name: "claude-sonnet-4-5".to_string(),
            knowledge_cutoff: Some("2025-01".to_string()),
            supports_media: mime_list(IMAGE_TYPES_CLAUDE),
            supports_stop: true,
            supports_stream: true,
            supports_think: Some(ThinkMode::Anthropic),
            supports_tools: Some(ToolsMode::Openai),
            limit_tokens_total: 200_000,
            limit_tokens_response: 16_000,
            limit_tokens_recent: Some(100_000),
            limit_media: 8,
            reasoning_effort: Some(ReasoningEffort::Low),
        },
        ModelInfo {
            name: "gpt-5".to_string(),
            status: ModelStatus::Stable,
            description: "OpenAI flagship with hidden reasoning.".to_string(),
            dialect: Dialect::Openai,
            native_name: "gpt-5".to_string(),
            knowledge_cutoff: Some("2024-10".to_string()),
            supports_media: mime_list(IMAGE_TYPES_OPENAI),
            supports_stop: false,
            supports_stream: true,
            supports_think: Some(ThinkMode::Hidden),
            supports_tools: Some(ToolsMode::Openai),
            limit_tokens_total: 400_000,
            limit_tokens_response: 64_000,
            limit_tokens_recent: Some(120_000),
            limit_media: 8,
            reasoning_effort: Some(ReasoningEffort::Medium),
        },
        ModelInfo {
            name: "gpt-4o".to_string(),
            status: ModelStatus::Legacy,
            description: "Fast general-purpose model.".to_string(),
            dialect: Dialect::Openai,
            native_name: "gpt-4o".to_string(),
            knowledge_cutoff: Some("2023-10".to_string()),
            supports_media: mime_list(IMAGE_TYPES_OPENAI),
            supports_stop: true,
            supports_stream: true,
            supports_think: None,
            supports_tools: Some(ToolsMode::Openai),
            limit_tokens_total: 128_000,
            limit_tokens_response: 16_384,
            limit_tokens_recent: Some(60_000),
            limit_media: 8,
            reasoning_effort: None,
        },
        ModelInfo {
            name: "gemini-pro".to_string(),
            status: ModelStatus::Stable,
            description: "Google flagship with signed thought summaries.".to_string(),
            dialect: Dialect::Gemini,
            native_name: "gemini-2.5-pro".to_string(),
            knowledge_cutoff: Some("2025-01".to_string()),
            supports_media: mime_list(IMAGE_TYPES_GEMINI),
            supports_stop: true,
            supports_stream: true,
            supports_think: Some(ThinkMode::Gemini),
            supports_tools: Some(ToolsMode::Gemini),
            limit_tokens_total: 1_048_576,
            limit_tokens_response: 65_536,
            limit_tokens_recent: Some(200_000),
            limit_media: 16,
            reasoning_effort: Some(ReasoningEffort::Medium),
        },
        ModelInfo {
            name: "deepseek-chat".to_string(),
            status: ModelStatus::Experimental,
            description: "Open-weights reasoning with inline <think> blocks.".to_string(),
            dialect: Dialect::Openai,
            native_name: "deepseek-chat".to_string(),
            knowledge_cutoff: Some("2024-07".to_string()),
            supports_media: Vec::new(),
            supports_stop: true,
            supports_stream: true,
            supports_think: Some(ThinkMode::Deepseek),
            supports_tools: None,
            limit_tokens_total: 128_000,
            limit_tokens_response: 8_192,
            limit_tokens_recent: Some(60_000),
            limit_media: 0,
            reasoning_effort: None,
        },
    ]
}

pub fn model_info_by_name(name: &str) -> Result<ModelInfo, LlmError> {
    builtin_models()
        .into_iter()
        .find(|model| model.name == name)
        .ok_or_else(|| LlmError::UnknownModel(name.to_string()))
}

/// Retry schedule for rate-limited requests: aggressive in the cluster,
/// a single slow retry in dev.
pub fn retry_delays(config: &ConfabConfig) -> Vec<u64> {
    if config.is_kubernetes() {
        vec![2, 30, 60]
    } else {
        vec![30]
    }
}

/// Resolve a persona's model name into a ready-to-call [`LlmModel`].
pub fn model_by_name(name: &str, config: &ConfabConfig) -> Result<LlmModel, LlmError> {
    let info = model_info_by_name(name)?;
    let driver = driver_for(&info, &config.llm)?;
    Ok(LlmModel::new(info, driver, retry_delays(config)))
}

fn driver_for(
    info: &ModelInfo,
    llm: &LlmConfig,
) -> Result<Arc<dyn crate::model::CompletionDriver>, LlmError> {
    match info.dialect {
        Dialect::Openai => {
            let api_key = llm.openai_api_key.clone().ok_or_else(|| {
                LlmError::BadRequest("openai dialect requires llm.openai_api_key".to_string())
            })?;
            Ok(Arc::new(OpenAiDriver::new(api_key, llm.openai_base_url.clone())))
        }
        Dialect::Anthropic => {
            let api_key = llm.anthropic_api_key.clone().ok_or_else(|| {
                LlmError::BadRequest("anthropic dialect requires llm.anthropic_api_key".to_string())
            })?;
            Ok(Arc::new(AnthropicDriver::new(
                api_key,
                llm.anthropic_base_url.clone(),
            )))
        }
        Dialect::Gemini => {
            let api_key = llm.gemini_api_key.clone().ok_or_else(|| {
                LlmError::BadRequest("gemini dialect requires llm.gemini_api_key".to_string())
            })?;
            Ok(Arc::new(GeminiDriver::new(api_key, llm.gemini_base_url.clone())))
        }
    }
}

/// A minimal model description for tests and scripted drivers.
pub fn stub_model_info() -> ModelInfo {
    ModelInfo {
        name: "stub-model".to_string(),
        status: ModelStatus::Experimental,
        description: "Scripted model for tests.".to_string(),
        dialect: Dialect::Openai,
        native_name: "stub-model-v0".to_string(),
        knowledge_cutoff: None,
        supports_media: mime_list(IMAGE_TYPES_OPENAI),
        supports_stop: false,
        supports_stream: true,
        supports_think: None,
        supports_tools: Some(ToolsMode::Openai),
        limit_tokens_total: 200_000,
        limit_tokens_response: 8_192,
        limit_tokens_recent: None,
        limit_media: 4,
        reasoning_effort: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn catalog_names_are_unique() {
        let models = builtin_models();
        let mut names: Vec<&str> = models.iter().map(|model| model.name.as_str()).collect();
        names.sort_unstable();
        names.dedup();
        assert_eq!(names.len(), models.len());
    }

    #[test]
    fn lookup_by_name() {
        assert!(model_info_by_name("claude-opus").is_ok());
        assert!(matches!(
            model_info_by_name("unknown-model"),
            Err(LlmError::UnknownModel(_))
        ));
    }

    #[test]
    fn response_budget_fits_inside_total() {
        for model in builtin_models() {
            assert!(model.limit_tokens_response < model.limit_tokens_total);
            assert!(model.limit_tokens_request() > 0);
            if let Some(recent) = model.limit_tokens_recent {
                assert!(recent <= model.limit_tokens_request());
            }
        }
    }
}
