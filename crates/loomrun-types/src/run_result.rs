use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ids::{CallId, InvocationId};

/// A yielding tool call still waiting on external input, as surfaced on the
/// wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingCall {
    pub call_id: CallId,
    pub name: String,
}

/// The outcome of one `run()` call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RunOutcome {
    Completed { output: Option<Value> },
    Yielded {
        pending_calls: Vec<PendingCall>,
        awaiting_input: bool,
        yielded_invocation_id: InvocationId,
    },
    Error {
        error: String,
        partial_events: usize,
        iterations: u32,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunResult {
    pub session_id: String,
    pub outcome: RunOutcome,
}

impl RunResult {
    pub fn is_completed(&self) -> bool {
        matches!(self.outcome, RunOutcome::Completed { .. })
    }

    pub fn is_yielded(&self) -> bool {
        matches!(self.outcome, RunOutcome::Yielded { .. })
    }

    pub fn is_error(&self) -> bool {
        matches!(self.outcome, RunOutcome::Error { .. })
    }
}
