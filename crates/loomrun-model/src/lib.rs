//! Model adapter interface: the uniform streaming contract every
//! provider implements, plus a deterministic mock used by tests and by the
//! CLI when no real provider is configured.

mod mock;
mod provider;
mod types;
mod yaml_mock;

pub use mock::{finish_reason_for, MockProvider, MockStep};
pub use provider::{CancelSignal, ModelAdapter, ModelEventStream};
pub use types::{
    CompletionRequest, FinishReason, ModelStepResult, RenderedMessage, StreamEvent, ToolCallOut,
    ToolChoice, ToolSchema, Usage,
};
pub use yaml_mock::{load_steps, parse_steps};
