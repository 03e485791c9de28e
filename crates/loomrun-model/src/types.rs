use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A wire-format tool schema handed to the model adapter with a completion
/// request. Distinct from `loomrun_tools::Tool` so this crate stays
/// independent of the tool-execution crate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSchema {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

/// How strongly the adapter should be steered toward calling a tool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum ToolChoice {
    Auto,
    None,
    Required,
    Named { name: String },
}

/// One rendered turn sent to the model. Mirrors the event kinds that can
/// appear in a `RenderContext` (user/assistant/system/thought/tool_call/
/// tool_result) but is adapter-facing rather than log-facing: the Context
/// Renderer projects `Event`s into these.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "role", rename_all = "snake_case")]
pub enum RenderedMessage {
    System { text: String },
    User { text: String },
    Assistant { text: String },
    Thought { text: String, opaque: Option<Value> },
    ToolCall {
        call_id: String,
        name: String,
        args: Value,
    },
    ToolResult {
        call_id: String,
        content: String,
        is_error: bool,
    },
}

/// The request an adapter receives.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionRequest {
    pub messages: Vec<RenderedMessage>,
    pub tools: Vec<ToolSchema>,
    pub tool_choice: ToolChoice,
    pub output_schema: Option<Value>,
    pub stream: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    Stop,
    Length,
    ToolCalls,
    ContentFilter,
    Error,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub cached_tokens: Option<u32>,
    pub reasoning_tokens: Option<u32>,
}

/// A streamed chunk. Deltas are a convenience view only — never canonical.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum StreamEvent {
    TextDelta(String),
    ThoughtDelta(String),
    /// One tool call is complete and ready to be classified/executed.
    ToolCall {
        call_id: String,
        name: String,
        args: Value,
    },
    Usage(Usage),
    Done,
}

/// The canonical result of one model step. `stepEvents` are the
/// loomrun-types `EventKind`s the caller should append — this crate stays
/// independent of `loomrun-types` so it is constructed by the caller from
/// the simpler fields here instead.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelStepResult {
    pub text: String,
    pub thought: Option<String>,
    pub tool_calls: Vec<ToolCallOut>,
    pub terminal: bool,
    pub usage: Usage,
    pub finish_reason: FinishReason,
    pub model_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallOut {
    pub call_id: String,
    pub name: String,
    pub args: Value,
}

impl ModelStepResult {
    pub fn had_tool_calls(&self) -> bool {
        !self.tool_calls.is_empty()
    }
}
