//! Tool engine: the `Tool` trait, the registry tools are looked up
//! through, and the builtin tool set. Retry/timeout/concurrency wrapping
//! around tool execution lives in `loomrun-core::supervisor`, which treats
//! this crate as the source of tool definitions only.

pub mod builtin;
pub mod registry;
pub mod tool;

pub use builtin::calculate::CalculateTool;
pub use builtin::make_purchase::MakePurchaseTool;
pub use builtin::request_approval::RequestApprovalTool;
pub use registry::{ToolRegistry, ToolSchema};
pub use tool::{Tool, ToolCall, ToolOutcome, DEFAULT_TOOL_TIMEOUT};
