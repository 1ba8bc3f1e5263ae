//! Provider-agnostic LLM layer.
//!
//! The conversation [`history`] tracks mode-specific content and renders into
//! three provider dialects; the completion [`model`] drives a dialect adapter
//! through request build, streaming consumption, retry, and parsing. The
//! dialects are [`openai`], [`anthropic`] and [`gemini`]; [`scripted`] is the
//! deterministic driver used by the test suite.

pub mod anthropic;
pub mod catalog;
mod error;
pub mod gemini;
pub mod history;
mod info;
pub mod message;
pub mod model;
pub mod openai;
pub mod scripted;
mod sse;
mod tokens;
mod xml;

pub use error::LlmError;
pub use history::{ContentMode, HistoryMessage, HistoryRun, LlmHistory, RenderMode};
pub use info::{Dialect, ModelInfo, ModelStatus, ReasoningEffort, ThinkMode, ToolsMode};
pub use message::{LlmPart, LlmTool, MediaBlob, Thought, ToolCall, XmlSection};
pub use model::{
    CompletionArgs, CompletionDriver, LlmCallback, LlmModel, LlmState, NativeCompletion,
    PartialToolCall, ToolChoice,
};
pub use tokens::estimate_tokens;
pub use xml::split_xml;
