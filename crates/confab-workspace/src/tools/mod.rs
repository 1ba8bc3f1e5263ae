//! Backend-provided tools.

mod echo;

pub use echo::{Echo, EchoProcess};

use std::sync::Arc;

use confab_process::{Tool, ToolsProvider};

/// The tools every workspace offers regardless of client-declared ones.
pub struct BackendTools;

impl ToolsProvider for BackendTools {
    fn list_tools(&self) -> Vec<Arc<dyn Tool>> {
        vec![Arc::new(Echo)]
    }
}
