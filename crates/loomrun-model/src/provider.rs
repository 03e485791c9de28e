use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;

use crate::types::{CompletionRequest, StreamEvent};

/// A cooperative cancellation signal threaded through a model call. The
/// adapter should stop producing stream items (and return cleanly, not with
/// an error) once this resolves.
pub type CancelSignal = tokio::sync::oneshot::Receiver<()>;

pub type ModelEventStream = Pin<Box<dyn Stream<Item = anyhow::Result<StreamEvent>> + Send>>;

/// The uniform streaming contract every agent step is built on. The
/// engine never inspects provider-specific wire shapes — only this trait.
#[async_trait]
pub trait ModelAdapter: Send + Sync {
    /// Human-readable provider name, for status display and logging.
    fn provider_name(&self) -> &str;

    /// Model identifier as reported to callers.
    fn model_name(&self) -> &str;

    /// Send one completion request and return its event stream.
    ///
    /// Implementations serialise `CompletionRequest` to their wire format,
    /// parse the provider's reply incrementally, and surface structured
    /// tool calls — never partial/malformed JSON. Errors are classified by
    /// the caller into the `ModelTransient`/`ModelFatal` split.
    async fn step(&self, req: CompletionRequest) -> anyhow::Result<ModelEventStream>;
}
