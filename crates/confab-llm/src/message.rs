//! The pieces a completion is made of, and the protocol instructions that
//! teach models how to produce them.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use confab_core::{AgentId, ProcessId, ProcessName, ServiceId};
use confab_process::ProcessResult;

use crate::info::ModelInfo;

/// A media blob produced by a tool, injected into the next user message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaBlob {
    pub uri: String,
    pub mime_type: String,
    /// Base64 payload when the blob is inlined; otherwise fetch via `uri`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
}

impl MediaBlob {
    /// URL form accepted by image-bearing APIs.
    pub fn download_url(&self) -> String {
        match &self.data {
            Some(data) => format!("data:{};base64,{}", self.mime_type, data),
            None => self.uri.clone(),
        }
    }

    /// Textual stand-in when the model cannot receive the media.
    pub fn render_placeholder(&self) -> String {
        format!(r#"<blob uri="{}" mimetype="{}" />"#, self.uri, self.mime_type)
    }
}

/// Opaque reasoning carried across turns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Thought {
    pub text: String,
    /// Provider signature proving the reasoning was preserved byte-exactly.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
}

/// One tool invocation requested by the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    /// Assigned on final parses only; partial stream parses leave it unset.
    pub process_id: Option<ProcessId>,
    pub name: ProcessName,
    pub arguments: Map<String, Value>,
}

impl ToolCall {
    /// Parse the body of a `<tool-calls>` block: a list (or single map) of
    /// `{name, arguments}` entries, with nothing else.
    pub fn from_value(value: Value) -> Result<Vec<ToolCall>, String> {
        let entries = match value {
            // When the model forgets to wrap a single call in a list, do so.
            Value::Object(map) => vec![Value::Object(map)],
            Value::Array(items) => items,
            _ => return Err("bad tool-calls: expected list of {name, arguments}".to_string()),
        };
        entries.into_iter().map(ToolCall::from_entry).collect()
    }

    fn from_entry(entry: Value) -> Result<ToolCall, String> {
        let Value::Object(map) = entry else {
            return Err("bad tool-calls: expected list of {name, arguments}".to_string());
        };
        let name = map
            .get("name")
            .and_then(Value::as_str)
            .ok_or_else(|| "bad tool-calls: missing name".to_string())?
            .to_string();
        let arguments = match map.get("arguments") {
            Some(Value::Object(arguments)) if !arguments.is_empty() => arguments.clone(),
            _ => return Err(format!("bad '{name}' tool call: missing arguments")),
        };
        let extra_keys: Vec<&str> = map
            .keys()
            .map(String::as_str)
            .filter(|key| !matches!(*key, "name" | "arguments"))
            .collect();
        if !extra_keys.is_empty() {
            return Err(format!(
                "bad '{name}' tool call: extra keys: {}",
                extra_keys.join(", ")
            ));
        }
        let name: ProcessName = name
            .parse()
            .map_err(|_| format!("bad '{name}' tool call: invalid name"))?;
        Ok(ToolCall {
            process_id: None,
            name,
            arguments,
        })
    }
}

/// A tool offered to the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LlmTool {
    pub name: ProcessName,
    pub description: String,
    pub arguments_schema: Value,
}

impl LlmTool {
    pub fn as_openai(&self) -> Value {
        serde_json::json!({
            "type": "function",
            "function": {
                "name": self.name,
                "description": self.description,
                "parameters": self.arguments_schema,
            },
        })
    }

    pub fn as_anthropic(&self) -> Value {
        serde_json::json!({
            "name": self.name,
            "description": self.description,
            "input_schema": self.arguments_schema,
        })
    }

    pub fn as_gemini(&self) -> Value {
        serde_json::json!({
            "name": self.name,
            "description": self.description,
            "parameters": self.arguments_schema,
        })
    }
}

/// A parsed piece of model input or output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum LlmPart {
    /// A section that failed to parse; retained so nothing is lost.
    Invalid { error: String, completion: String },
    /// Prose. `sender` is set on input messages, unset on model output.
    Text {
        sender: Option<AgentId>,
        content: String,
    },
    Think {
        text: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        signature: Option<String>,
    },
    ToolCalls { calls: Vec<ToolCall> },
    ToolResult {
        sender: Option<ServiceId>,
        process_id: ProcessId,
        name: ProcessName,
        result: ProcessResult,
    },
}

impl LlmPart {
    pub fn prompt(sender: impl Into<AgentId>, content: impl Into<String>) -> Self {
        LlmPart::Text {
            sender: Some(sender.into()),
            content: content.into(),
        }
    }

    /// The XML rendering used when a part cannot travel natively.
    /// `None` for parts that are hidden from non-native providers.
    pub fn render_xml(&self) -> Option<String> {
        match self {
            LlmPart::Invalid { completion, .. } => Some(completion.clone()),
            LlmPart::Text { content, .. } => {
                (!content.trim().is_empty()).then(|| content.clone())
            }
            LlmPart::Think { .. } => None, // Hidden unless supported natively.
            LlmPart::ToolCalls { calls } => {
                let entries: Vec<Value> = calls
                    .iter()
                    .map(|call| {
                        serde_json::json!({
                            "name": call.name,
                            "arguments": call.arguments,
                        })
                    })
                    .collect();
                let yaml = serde_yaml::to_string(&entries).unwrap_or_default();
                Some(format!("<tool-calls>\n{}</tool-calls>", yaml))
            }
            LlmPart::ToolResult { name, result, .. } => Some(format!(
                "<tool-result>\n<name>{}</name>\n{}\n</tool-result>",
                name,
                result.render_xml()
            )),
        }
    }
}

/// The XML sections recognized in free-form answers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum XmlSection {
    Text,
    Think,
    ToolCalls,
}

impl XmlSection {
    pub fn tag(&self) -> &'static str {
        match self {
            XmlSection::Text => "text",
            XmlSection::Think => "think",
            XmlSection::ToolCalls => "tool-calls",
        }
    }

    pub fn parse_body(&self, body: &str) -> Result<LlmPart, String> {
        match self {
            XmlSection::Text => Ok(LlmPart::Text {
                sender: None,
                content: body.to_string(),
            }),
            XmlSection::Think => Ok(LlmPart::Think {
                text: strip_keep_indent(body),
                signature: None,
            }),
            XmlSection::ToolCalls => {
                let parsed: Value = serde_yaml::from_str(&strip_keep_indent(body))
                    .map_err(|_| "bad tool-calls: malformed YAML".to_string())?;
                Ok(LlmPart::ToolCalls {
                    calls: ToolCall::from_value(parsed)?,
                })
            }
        }
    }
}

/// Trim surrounding blank lines while preserving inner indentation.
pub fn strip_keep_indent(text: &str) -> String {
    text.trim_matches(['\n', '\r']).trim_end().to_string()
}

///
/// System instructions
///

/// The static protocol instructions prepended to every chatbot system
/// message.
pub fn system_instructions(
    info: &ModelInfo,
    mermaid: bool,
    tips: bool,
    tools: bool,
    extra_tags: &[&str],
) -> String {
    let mut tags: Vec<&str> = extra_tags
        .iter()
        .copied()
        .filter(|tag| !matches!(*tag, "text" | "invalid" | "think" | "tool-calls"))
        .collect();
    if info.supports_think == Some(crate::info::ThinkMode::Deepseek) {
        tags.push("think");
    }
    if tools && info.supports_tools.is_none() {
        tags.push("tool-calls");
    }
    tags.sort_unstable();

    let mut system: Vec<String> = Vec::new();
    system.push(system_instructions_response(&tags, info.knowledge_cutoff.as_deref()));
    if mermaid {
        system.push(system_instructions_mermaid());
    }
    if tips {
        system.push(
            "<tips>\n\
             When necessary, Confab should call tools before sending its final answer. \
             The user sees neither tool calls nor tool results. \
             Confab's final answer should therefore be self-contained and give the user \
             the necessary context and citations.\n\
             </tips>"
                .to_string(),
        );
    }
    system.join("\n")
}

fn system_instructions_response(tags: &[&str], knowledge_cutoff: Option<&str>) -> String {
    let mut instructions = String::from(
        "<response_info>\n\
         Confab responds to the user in beautiful Markdown, using the minimum formatting \
         appropriate to make the response clear and readable. It avoids over-formatting, \
         e.g., with elements like bold emphasis, headers, lists, and bullet points.\n\
         It provides thorough responses to more complex and open-ended questions, but \
         concise responses to simpler questions and tasks.\n\
         Confab wraps code in code blocks using triple-backticks and does not explain \
         or break down the code unless the user requests it.\n\
         Everything is interpreted as literal in `code expressions` and code blocks.",
    );

    let literal_escapes: Vec<String> = tags
        .iter()
        .flat_map(|tag| [format!("`<{tag}>`"), format!("`</{tag}>`")])
        .collect();
    if !literal_escapes.is_empty() {
        instructions.push_str(&format!(
            "\n\nThe following strings MUST be escaped when meant literally: {}",
            literal_escapes.join(", ")
        ));
    }

    if let Some(cutoff) = knowledge_cutoff {
        instructions.push_str(&format!(
            "\n\nConfab's knowledge base was last updated on {cutoff}. When a response \
             depends on facts beyond its knowledge cutoff, Confab finds the required \
             information proactively using the available tools instead of making \
             assumptions."
        ));
    }

    instructions.push_str("\n</response_info>");
    instructions
}

fn system_instructions_mermaid() -> String {
    "<mermaid_info>\n\
     Confab can draw Mermaid diagrams by using the syntax:\n\n\
     ```mermaid\n\
     $DIAGRAM_CODE\n\
     ```\n\n\
     The following diagram types are supported in $DIAGRAM_CODE: \
     flowchart, sequenceDiagram, classDiagram, stateDiagram-v2, erDiagram, journey, \
     gantt, pie, quadrantChart, requirementDiagram, gitGraph, xychart, block, packet, \
     kanban.\n\
     </mermaid_info>"
        .to_string()
}

/// The XML tool-call protocol taught to models without native tool support.
pub fn system_instructions_tools_xml(tools: &[LlmTool]) -> String {
    if tools.is_empty() {
        return String::new();
    }

    let tool_names: Vec<String> = tools.iter().map(|tool| tool.name.to_string()).collect();
    let tool_definitions: Vec<String> = tools
        .iter()
        .map(|tool| {
            format!(
                "<tool>\n<name>{}</name>\n<description>{}</description>\n\
                 <arguments-jsonschema>{}</arguments-jsonschema>\n</tool>",
                tool.name, tool.description, tool.arguments_schema
            )
        })
        .collect();

    format!(
        "<tools_info>\n\
         Confab can use tools by ending its response with a `<tool-calls>` block that \
         contains one or more tool calls:\n\n\
         <tool-calls>\n\
         - name: $TOOL_NAME\n  arguments:\n    $TOOL_ARGS\n\
         ...\n\
         </tool-calls>\n\n\
         Valid $TOOL_NAME values: {}\n\
         $TOOL_ARGS is the tool arguments as YAML, respecting `<arguments-jsonschema>`.\n\n\
         Tool results are provided in the next user message as a sequence of \
         `<tool-result>` blocks:\n\n\
         <tool-result>\n\
         <name>$TOOL_NAME</name>\n\
         $RESULT\n\
         </tool-result>\n\
         </tools_info>\n\
         <available_tools>\n{}\n</available_tools>",
        tool_names.join(", "),
        tool_definitions.join("\n")
    )
}
