//! Process results and the durable status record.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use confab_core::error::{ErrorInfo, StopReason};
use confab_core::{ProcessName, ProcessUri, RequestId};

use crate::ProcessError;

/// The terminal output of a process. Assigned once.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ProcessResult {
    Success { value: Map<String, Value> },
    Stopped { reason: StopReason },
    Failure { error: ErrorInfo },
}

impl ProcessResult {
    pub fn success(value: Map<String, Value>) -> Self {
        ProcessResult::Success { value }
    }

    pub fn stopped() -> Self {
        ProcessResult::Stopped {
            reason: StopReason::Stopped,
        }
    }

    pub fn timeout() -> Self {
        ProcessResult::Stopped {
            reason: StopReason::Timeout,
        }
    }

    /// Stopped errors (418) fold back into their `Stopped` form; everything
    /// else is a failure.
    pub fn from_error_info(error: ErrorInfo) -> Self {
        if error.code == 418 {
            let reason = match error.message.to_lowercase().as_str() {
                "stopped" => Some(StopReason::Stopped),
                "timeout" => Some(StopReason::Timeout),
                _ => None,
            };
            if let Some(reason) = reason {
                return ProcessResult::Stopped { reason };
            }
        }
        ProcessResult::Failure { error }
    }

    pub fn is_error(&self) -> bool {
        !matches!(self, ProcessResult::Success { .. })
    }

    pub fn error_message(&self) -> Option<String> {
        match self {
            ProcessResult::Success { .. } => None,
            ProcessResult::Stopped { reason } => Some(reason.message().to_string()),
            ProcessResult::Failure { error } => {
                let mut message = if error.message.is_empty() {
                    format!("Runtime Error: {}", error.data.stacktrace)
                } else {
                    error.message.clone()
                };
                if !error.data.extra.is_empty() {
                    message.push_str(&format!(
                        "\nDetails: {}",
                        Value::Object(error.data.extra.clone())
                    ));
                }
                Some(message)
            }
        }
    }

    /// Split a success into its structured value and the user-visible
    /// `content` string, when present.
    pub fn as_split(&self) -> (Map<String, Value>, Option<String>) {
        match self {
            ProcessResult::Success { value } => {
                let mut value = value.clone();
                let content = match value.remove("content") {
                    Some(Value::String(text)) => Some(text),
                    Some(other) => {
                        value.insert("content".to_string(), other);
                        None
                    }
                    None => None,
                };
                (value, content)
            }
            _ => (Map::new(), None),
        }
    }

    /// The flat JSON view sent to the LLM as a native tool result.
    pub fn as_tool_value(&self) -> (Map<String, Value>, bool) {
        match self {
            ProcessResult::Success { value } => (value.clone(), false),
            ProcessResult::Stopped { .. } => {
                let mut map = Map::new();
                map.insert("code".to_string(), Value::from(500));
                map.insert(
                    "message".to_string(),
                    Value::from(self.error_message().unwrap_or_default()),
                );
                (map, true)
            }
            ProcessResult::Failure { error } => {
                let mut map = Map::new();
                map.insert("code".to_string(), Value::from(error.code));
                map.insert("message".to_string(), Value::from(error.message.clone()));
                for (key, value) in &error.data.extra {
                    map.entry(key.clone()).or_insert_with(|| value.clone());
                }
                (map, true)
            }
        }
    }

    /// Render as the XML block used when the model has no native tool support.
    pub fn render_xml(&self) -> String {
        match self {
            ProcessResult::Success { .. } => {
                let (value, content) = self.as_split();
                let mut rendered = String::new();
                if !value.is_empty() {
                    let yaml = serde_yaml::to_string(&value).unwrap_or_default();
                    rendered.push_str(&format!("<value>\n{}</value>\n", yaml));
                }
                if let Some(content) = content {
                    rendered.push_str(&format!("<content>\n{content}\n</content>\n"));
                }
                rendered.trim_end().to_string()
            }
            _ => format!(
                "<error>\n{}\n</error>",
                self.error_message().unwrap_or_default()
            ),
        }
    }
}

/// The durable status record of a process.
///
/// Stored at `process:status:{uri}` with a 30-day TTL. Active processes with
/// `updated_at` older than ten minutes are considered expired by the
/// housekeeping job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessStatus {
    /// The request that instantiated the process and carries its permission
    /// witnesses.
    pub request_id: RequestId,
    pub process_uri: ProcessUri,
    pub name: ProcessName,
    pub created_at: DateTime<Utc>,
    /// Last heartbeat, or when the result was assigned.
    pub updated_at: DateTime<Utc>,
    pub arguments: Value,
    /// A view on the internal state of the process for auditing. Appended as
    /// the process runs.
    pub progress: Vec<Value>,
    /// The final output. `None` while pending or running.
    pub result: Option<ProcessResult>,
}

impl ProcessStatus {
    pub fn new(
        request_id: RequestId,
        process_uri: ProcessUri,
        name: ProcessName,
        arguments: Value,
    ) -> Self {
        let now = Utc::now();
        Self {
            request_id,
            process_uri,
            name,
            created_at: now,
            updated_at: now,
            arguments,
            progress: Vec::new(),
            result: None,
        }
    }

    /// Append progress and/or assign the result, bumping `updated_at`.
    ///
    /// The result is monotonic: any update after it is set fails.
    pub fn update(
        &mut self,
        progress: Vec<Value>,
        result: Option<ProcessResult>,
    ) -> Result<(), ProcessError> {
        if self.result.is_some() {
            return Err(ProcessError::UpdateAfterResult(self.process_uri.clone()));
        }
        self.updated_at = Utc::now();
        self.progress.extend(progress);
        self.result = result;
        Ok(())
    }
}
