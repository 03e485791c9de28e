use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ids::{CallId, EventId, InvocationId};

/// The kind of Runnable an invocation executes. Mirrors the five-way
/// variant set of the Runnable model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunnableKind {
    Agent,
    Step,
    Sequence,
    Parallel,
    Loop,
}

/// Why an invocation ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndReason {
    Completed,
    MaxIterations,
    Error,
    Transferred,
    Cancelled,
}

/// The four handoff edges in the invocation graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HandoffKind {
    Call,
    Spawn,
    Dispatch,
    Transfer,
}

/// Recorded on a child invocation's `invocation_start` to say how it came
/// to exist — a direct nested `Runnable` call, or one of the three dynamic
/// edges.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HandoffOrigin {
    pub kind: HandoffKind,
    pub call_id: Option<CallId>,
    pub invocation_id: InvocationId,
}

/// Recorded on the source invocation's `invocation_end` when it transfers
/// control away.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HandoffTarget {
    pub agent_name: String,
    pub kind: RunnableKind,
}

/// One entry in a `state_change` event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateChangeEntry {
    pub key: String,
    pub old_value: Option<Value>,
    pub new_value: Option<Value>,
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

/// Token accounting reported by a model call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub cached_tokens: Option<u32>,
    pub reasoning_tokens: Option<u32>,
}

/// Snapshot of what was sent to the model, recorded on `model_start` so the
/// log is a faithful trace of every completed request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelStartPayload {
    pub message_count: usize,
    pub tool_names: Vec<String>,
    pub output_schema: Option<Value>,
    pub step_index: u32,
    pub model_name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelEndPayload {
    pub duration_ms: u64,
    pub usage: Usage,
    pub finish_reason: FinishReason,
    pub error: Option<String>,
    pub model_name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallPayload {
    pub call_id: CallId,
    pub name: String,
    pub args: Value,
    pub yields: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResultPayload {
    pub call_id: CallId,
    pub name: String,
    pub result: Option<Value>,
    pub error: Option<String>,
    pub duration_ms: u64,
    pub retry_count: Option<u32>,
    pub timed_out: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolYieldPayload {
    pub call_id: CallId,
    pub name: String,
    pub prepared_args: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolInputPayload {
    pub call_id: CallId,
    pub input: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvocationStartPayload {
    pub agent_name: String,
    pub kind: RunnableKind,
    pub parent_invocation_id: Option<InvocationId>,
    /// Only set on the root invocation.
    pub fingerprint: Option<String>,
    pub session_version: Option<String>,
    pub handoff_origin: Option<HandoffOrigin>,
    pub loop_iteration: Option<u32>,
    pub loop_max: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvocationEndPayload {
    pub reason: EndReason,
    pub handoff_target: Option<HandoffTarget>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvocationYieldPayload {
    pub pending_call_ids: Vec<CallId>,
    pub yield_index: u32,
}

/// The payload-specific part of an `Event`. Text-bearing kinds (`user`,
/// `assistant`, `system`, `thought`) carry plain text; `thought` may carry
/// an opaque provider blob instead, with `text` left empty.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
    User { text: String },
    Assistant { text: String },
    System { text: String },
    Thought { text: String, opaque: Option<Value> },
    AssistantDelta { text: String },
    ThoughtDelta { text: String },
    ToolCall(ToolCallPayload),
    ToolResult(ToolResultPayload),
    ToolYield(ToolYieldPayload),
    ToolInput(ToolInputPayload),
    StateChange {
        scope: String,
        source: String,
        changes: Vec<StateChangeEntry>,
    },
    ModelStart(ModelStartPayload),
    ModelEnd(ModelEndPayload),
    InvocationStart(InvocationStartPayload),
    InvocationEnd(InvocationEndPayload),
    InvocationYield(InvocationYieldPayload),
    InvocationResume,
}

impl EventKind {
    /// Events that precede the first invocation (`user`/`system` seed
    /// turns) are the only ones allowed to have `invocation_id = None`.
    pub fn allows_no_invocation(&self) -> bool {
        matches!(self, EventKind::User { .. } | EventKind::System { .. })
    }

    pub fn label(&self) -> &'static str {
        match self {
            EventKind::User { .. } => "user",
            EventKind::Assistant { .. } => "assistant",
            EventKind::System { .. } => "system",
            EventKind::Thought { .. } => "thought",
            EventKind::AssistantDelta { .. } => "assistant_delta",
            EventKind::ThoughtDelta { .. } => "thought_delta",
            EventKind::ToolCall(_) => "tool_call",
            EventKind::ToolResult(_) => "tool_result",
            EventKind::ToolYield(_) => "tool_yield",
            EventKind::ToolInput(_) => "tool_input",
            EventKind::StateChange { .. } => "state_change",
            EventKind::ModelStart(_) => "model_start",
            EventKind::ModelEnd(_) => "model_end",
            EventKind::InvocationStart(_) => "invocation_start",
            EventKind::InvocationEnd(_) => "invocation_end",
            EventKind::InvocationYield(_) => "invocation_yield",
            EventKind::InvocationResume => "invocation_resume",
        }
    }
}

/// An immutable record in the append-only event log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: EventId,
    pub created_at: DateTime<Utc>,
    pub invocation_id: Option<InvocationId>,
    pub kind: EventKind,
}

impl Event {
    pub fn label(&self) -> &'static str {
        self.kind.label()
    }
}
