use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::ids::{CallId, InvocationId};

/// The engine's error taxonomy. Every engine error carries its kind, a
/// message, and — when applicable — the invocation/call it happened in.
#[derive(Debug, Clone, Error, Serialize, Deserialize)]
pub enum EngineError {
    #[error("model error (transient): {message}")]
    ModelTransient {
        message: String,
        invocation_id: Option<InvocationId>,
    },

    #[error("model error (fatal): {message}")]
    ModelFatal {
        message: String,
        invocation_id: Option<InvocationId>,
    },

    #[error("tool error (transient) in {call_id}: {message}")]
    ToolTransient {
        message: String,
        invocation_id: Option<InvocationId>,
        call_id: CallId,
    },

    #[error("tool error (fatal) in {call_id}: {message}")]
    ToolFatal {
        message: String,
        invocation_id: Option<InvocationId>,
        call_id: CallId,
    },

    #[error("failed to parse structured output: {message}")]
    OutputParse {
        message: String,
        invocation_id: Option<InvocationId>,
    },

    #[error(
        "pipeline structure changed since session {session_id} was paused: \
         stored fingerprint {stored_fingerprint} != current fingerprint {current_fingerprint}"
    )]
    PipelineStructureChanged {
        session_id: String,
        stored_fingerprint: String,
        current_fingerprint: String,
    },

    #[error("unknown pending call: {call_id}")]
    UnknownPendingCall { call_id: CallId },

    #[error("orphan tool result: no matching tool_call for {call_id}")]
    OrphanResult { call_id: CallId },

    #[error("state validation failed for {scope}.{key}: {message}")]
    StateValidationError {
        scope: String,
        key: String,
        message: String,
    },

    #[error("invocation {invocation_id} cancelled")]
    Cancelled { invocation_id: InvocationId },
}

impl EngineError {
    pub fn kind_name(&self) -> &'static str {
        match self {
            EngineError::ModelTransient { .. } => "ModelTransient",
            EngineError::ModelFatal { .. } => "ModelFatal",
            EngineError::ToolTransient { .. } => "ToolTransient",
            EngineError::ToolFatal { .. } => "ToolFatal",
            EngineError::OutputParse { .. } => "OutputParse",
            EngineError::PipelineStructureChanged { .. } => "PipelineStructureChanged",
            EngineError::UnknownPendingCall { .. } => "UnknownPendingCall",
            EngineError::OrphanResult { .. } => "OrphanResult",
            EngineError::StateValidationError { .. } => "StateValidationError",
            EngineError::Cancelled { .. } => "Cancelled",
        }
    }

    /// Whether the default policy for this kind is to retry locally before
    /// bubbling up: `ModelTransient`/`ToolTransient` retry with backoff.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            EngineError::ModelTransient { .. } | EngineError::ToolTransient { .. }
        )
    }
}
