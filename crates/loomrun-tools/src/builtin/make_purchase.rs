use async_trait::async_trait;
use serde_json::Value;

use loomrun_types::EngineError;

use crate::tool::{Tool, ToolCall, ToolOutcome};

/// A non-yielding tool run after `request_approval` succeeds. Fails fatally
/// if invoked without a prior approval in its own args — the agent is
/// responsible for only calling it once approved.
pub struct MakePurchaseTool;

#[async_trait]
impl Tool for MakePurchaseTool {
    fn name(&self) -> &str {
        "make_purchase"
    }

    fn description(&self) -> &str {
        "Place a purchase once approval has been granted."
    }

    fn parameters_schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "item": { "type": "string" },
                "approved": { "type": "boolean" }
            },
            "required": ["item", "approved"]
        })
    }

    async fn execute(&self, call: &ToolCall) -> Result<ToolOutcome, EngineError> {
        let approved = call
            .args
            .get("approved")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        if !approved {
            return Err(EngineError::ToolFatal {
                message: "make_purchase called without approval".into(),
                invocation_id: None,
                call_id: call.id.clone(),
            });
        }
        let item = call
            .args
            .get("item")
            .and_then(Value::as_str)
            .unwrap_or("item");
        Ok(ToolOutcome::Value(serde_json::json!({ "status": "completed", "item": item })))
    }
}
