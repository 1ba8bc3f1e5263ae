//! Tools: spawnable process protocols discovered via providers.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use confab_core::{ProcessName, ProcessUri};

use crate::context::RequestContext;
use crate::process::Process;
use crate::ProcessError;

/// Static description of a tool, used for LLM tool lists and argument
/// validation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolInfo {
    pub name: ProcessName,
    pub description: String,
    pub arguments_schema: Value,
    /// Whether the tool is offered before persona capability rules apply.
    #[serde(default = "default_enabled")]
    pub default_enabled: bool,
}

fn default_enabled() -> bool {
    true
}

/// Wire form of a client-declared tool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: ProcessName,
    pub description: String,
    pub arguments_schema: Value,
}

/// A spawnable process protocol.
#[async_trait]
pub trait Tool: Send + Sync {
    fn info(&self) -> ToolInfo;

    /// Instantiate (but do not start) the process for one invocation.
    async fn spawn(
        &self,
        request: Arc<RequestContext>,
        process_uri: ProcessUri,
        arguments: Value,
    ) -> Result<Arc<dyn Process>, ProcessError>;
}

/// A service contributing tools to the workspace or to a single request.
pub trait ToolsProvider: Send + Sync {
    fn list_tools(&self) -> Vec<Arc<dyn Tool>>;
}
