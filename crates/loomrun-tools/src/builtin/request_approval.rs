use async_trait::async_trait;
use serde_json::Value;

use loomrun_types::EngineError;

use crate::tool::{Tool, ToolCall};

/// A yielding tool: `prepare` packages the request for display, the
/// invocation suspends, and `finalize` runs once a human (or calling system)
/// supplies `{approved: bool}` via `addToolInput`.
pub struct RequestApprovalTool;

#[async_trait]
impl Tool for RequestApprovalTool {
    fn name(&self) -> &str {
        "request_approval"
    }

    fn description(&self) -> &str {
        "Ask an external approver to allow or deny an action."
    }

    fn parameters_schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "summary": { "type": "string" }
            },
            "required": ["summary"]
        })
    }

    fn yield_schema(&self) -> Option<Value> {
        Some(serde_json::json!({
            "type": "object",
            "properties": {
                "approved": { "type": "boolean" }
            },
            "required": ["approved"]
        }))
    }

    async fn prepare(&self, call: &ToolCall) -> Result<Value, EngineError> {
        let summary = call
            .args
            .get("summary")
            .and_then(Value::as_str)
            .unwrap_or("(no summary provided)");
        Ok(serde_json::json!({ "summary": summary }))
    }

    async fn finalize(&self, call: &ToolCall, input: Value) -> Result<Value, EngineError> {
        let approved = input
            .get("approved")
            .and_then(Value::as_bool)
            .ok_or_else(|| EngineError::ToolFatal {
                message: "tool_input missing required field `approved`".into(),
                invocation_id: None,
                call_id: call.id.clone(),
            })?;
        Ok(serde_json::json!({ "approved": approved }))
    }
}
