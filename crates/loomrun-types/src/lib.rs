//! Core data model shared by every crate in the loomrun workspace: the
//! append-only event log's vocabulary, stable IDs, the error taxonomy, and
//! the wire-level `RunResult`.

mod error;
mod event;
mod ids;
mod run_result;

pub use error::EngineError;
pub use event::{
    EndReason, Event, EventKind, FinishReason, HandoffKind, HandoffOrigin, HandoffTarget,
    InvocationEndPayload, InvocationStartPayload, InvocationYieldPayload, ModelEndPayload,
    ModelStartPayload, RunnableKind, StateChangeEntry, ToolCallPayload, ToolInputPayload,
    ToolResultPayload, ToolYieldPayload, Usage,
};
pub use ids::{CallId, EventId, IdSequence, InvocationId};
pub use run_result::{PendingCall, RunOutcome, RunResult};
