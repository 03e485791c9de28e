use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use loomrun_types::EngineError;

/// One tool invocation requested by the model.
#[derive(Debug, Clone)]
pub struct ToolCall {
    /// Opaque identifier returned by the model, forwarded verbatim.
    pub id: String,
    pub name: String,
    /// Parsed JSON arguments, already validated against the tool's schema.
    pub args: Value,
}

/// Default timeout applied to a tool call when the tool doesn't declare its
/// own.
pub const DEFAULT_TOOL_TIMEOUT: Duration = Duration::from_secs(60);

/// What a non-yielding [`Tool::execute`] produced: an ordinary result, or a
/// request to hand off the rest of the run to a named transfer target. This
/// crate has no notion of `Runnable` (it sits below `loomrun-core` in the
/// dependency graph), so a transfer names its target; the supervisor
/// resolves the name against its own registry of transfer targets.
#[derive(Debug, Clone)]
pub enum ToolOutcome {
    Value(Value),
    Transfer(String),
}

impl ToolOutcome {
    pub fn value(v: impl Into<Value>) -> Self {
        ToolOutcome::Value(v.into())
    }
}

/// Trait every built-in and user-defined tool implements.
///
/// A tool is **non-yielding** when [`Tool::yield_schema`] returns `None`: the
/// supervisor calls [`Tool::execute`] directly. A tool is **yielding** when it
/// returns `Some`: the supervisor calls [`Tool::prepare`] to compute the
/// `preparedArgs` carried on `tool_yield`, suspends the invocation, and later
/// calls [`Tool::finalize`] with the validated external input once a matching
/// `tool_input` event is appended.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    /// JSON Schema for `args`.
    fn parameters_schema(&self) -> Value;

    /// JSON Schema the resumed `tool_input.input` must satisfy. `Some` marks
    /// this tool as yielding.
    fn yield_schema(&self) -> Option<Value> {
        None
    }

    fn is_yielding(&self) -> bool {
        self.yield_schema().is_some()
    }

    /// Per-tool override of the default execution timeout.
    fn timeout(&self) -> Duration {
        DEFAULT_TOOL_TIMEOUT
    }

    /// Run a non-yielding tool to completion. Never called on a yielding
    /// tool — the default implementation reflects that with a fatal error.
    async fn execute(&self, call: &ToolCall) -> Result<ToolOutcome, EngineError> {
        Err(EngineError::ToolFatal {
            message: format!("{} is a yielding tool; execute() is not used", self.name()),
            invocation_id: None,
            call_id: call.id.clone(),
        })
    }

    /// Compute `preparedArgs` for a yielding tool, run before the invocation
    /// suspends. Never called on a non-yielding tool.
    async fn prepare(&self, call: &ToolCall) -> Result<Value, EngineError> {
        Err(EngineError::ToolFatal {
            message: format!("{} is not a yielding tool; prepare() is not used", self.name()),
            invocation_id: None,
            call_id: call.id.clone(),
        })
    }

    /// Complete a yielding tool once external input has arrived. `input` is
    /// the `tool_input.input` value, already validated against
    /// `yield_schema`.
    async fn finalize(&self, call: &ToolCall, _input: Value) -> Result<Value, EngineError> {
        Err(EngineError::ToolFatal {
            message: format!("{} is not a yielding tool; finalize() is not used", self.name()),
            invocation_id: None,
            call_id: call.id.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NonYielding;

    #[async_trait]
    impl Tool for NonYielding {
        fn name(&self) -> &str {
            "non_yielding"
        }
        fn description(&self) -> &str {
            "a plain tool"
        }
        fn parameters_schema(&self) -> Value {
            serde_json::json!({ "type": "object" })
        }
        async fn execute(&self, call: &ToolCall) -> Result<ToolOutcome, EngineError> {
            Ok(ToolOutcome::Value(serde_json::json!({ "echo": call.args })))
        }
    }

    struct Transferring;

    #[async_trait]
    impl Tool for Transferring {
        fn name(&self) -> &str {
            "transferring"
        }
        fn description(&self) -> &str {
            "a tool that hands off to another agent"
        }
        fn parameters_schema(&self) -> Value {
            serde_json::json!({ "type": "object" })
        }
        async fn execute(&self, _call: &ToolCall) -> Result<ToolOutcome, EngineError> {
            Ok(ToolOutcome::Transfer("specialist".into()))
        }
    }

    struct Yielding;

    #[async_trait]
    impl Tool for Yielding {
        fn name(&self) -> &str {
            "yielding"
        }
        fn description(&self) -> &str {
            "a tool that suspends for external input"
        }
        fn parameters_schema(&self) -> Value {
            serde_json::json!({ "type": "object" })
        }
        fn yield_schema(&self) -> Option<Value> {
            Some(serde_json::json!({ "type": "object" }))
        }
        async fn prepare(&self, call: &ToolCall) -> Result<Value, EngineError> {
            Ok(call.args.clone())
        }
        async fn finalize(&self, _call: &ToolCall, input: Value) -> Result<Value, EngineError> {
            Ok(input)
        }
    }

    #[test]
    fn default_is_non_yielding() {
        assert!(!NonYielding.is_yielding());
    }

    #[test]
    fn yield_schema_marks_tool_as_yielding() {
        assert!(Yielding.is_yielding());
    }

    #[tokio::test]
    async fn execute_default_errors_on_yielding_tool() {
        let call = ToolCall {
            id: "c1".into(),
            name: "yielding".into(),
            args: serde_json::json!({}),
        };
        let err = Yielding.execute(&call).await.unwrap_err();
        assert!(matches!(err, EngineError::ToolFatal { .. }));
    }

    #[tokio::test]
    async fn execute_can_return_a_transfer_target() {
        let call = ToolCall {
            id: "c1".into(),
            name: "transferring".into(),
            args: serde_json::json!({}),
        };
        let outcome = Transferring.execute(&call).await.unwrap();
        assert!(matches!(outcome, ToolOutcome::Transfer(name) if name == "specialist"));
    }

    #[tokio::test]
    async fn prepare_default_errors_on_non_yielding_tool() {
        let call = ToolCall {
            id: "c1".into(),
            name: "non_yielding".into(),
            args: serde_json::json!({}),
        };
        let err = NonYielding.prepare(&call).await.unwrap_err();
        assert!(matches!(err, EngineError::ToolFatal { .. }));
    }

    #[tokio::test]
    async fn default_timeout_is_sixty_seconds() {
        assert_eq!(NonYielding.timeout(), Duration::from_secs(60));
    }
}
