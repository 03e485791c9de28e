use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream;
use serde_json::Value;
use tokio::sync::Mutex;

use crate::provider::{ModelAdapter, ModelEventStream};
use crate::types::{CompletionRequest, FinishReason, StreamEvent, Usage};

/// One scripted model step.
#[derive(Debug, Clone)]
pub enum MockStep {
    /// A plain text (terminal) response.
    Text(String),
    /// One or more tool calls (non-terminal).
    ToolCalls(Vec<(String, String, Value)>), // (call_id, name, args)
}

/// Deterministic, network-free `ModelAdapter` used throughout the test
/// suite and by the CLI when no real provider is configured.
///
/// Steps are consumed in order across successive `step()` calls. If the
/// script is exhausted, the mock keeps returning its last step so long
/// pipelines (loops) don't error out in tests that only care about the
/// first few turns.
pub struct MockProvider {
    model_name: String,
    steps: Arc<Mutex<Vec<MockStep>>>,
    cursor: AtomicUsize,
}

impl MockProvider {
    pub fn new(model_name: impl Into<String>, steps: Vec<MockStep>) -> Self {
        Self {
            model_name: model_name.into(),
            steps: Arc::new(Mutex::new(steps)),
            cursor: AtomicUsize::new(0),
        }
    }

    /// Convenience constructor for a single-turn text responder.
    pub fn text(model_name: impl Into<String>, text: impl Into<String>) -> Self {
        Self::new(model_name, vec![MockStep::Text(text.into())])
    }
}

#[async_trait]
impl ModelAdapter for MockProvider {
    fn provider_name(&self) -> &str {
        "mock"
    }

    fn model_name(&self) -> &str {
        &self.model_name
    }

    async fn step(&self, _req: CompletionRequest) -> anyhow::Result<ModelEventStream> {
        let steps = self.steps.lock().await;
        let idx = self.cursor.fetch_add(1, Ordering::SeqCst);
        let step = steps
            .get(idx)
            .or_else(|| steps.last())
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("mock provider has no scripted steps"))?;
        drop(steps);

        let mut events = Vec::new();
        match step {
            MockStep::Text(text) => {
                for word in text.split_inclusive(' ') {
                    events.push(Ok(StreamEvent::TextDelta(word.to_string())));
                }
                events.push(Ok(StreamEvent::Usage(Usage {
                    input_tokens: 10,
                    output_tokens: text.len() as u32 / 4,
                    cached_tokens: None,
                    reasoning_tokens: None,
                })));
                events.push(Ok(StreamEvent::Done));
            }
            MockStep::ToolCalls(calls) => {
                for (call_id, name, args) in calls {
                    events.push(Ok(StreamEvent::ToolCall { call_id, name, args }));
                }
                events.push(Ok(StreamEvent::Usage(Usage {
                    input_tokens: 10,
                    output_tokens: 5,
                    cached_tokens: None,
                    reasoning_tokens: None,
                })));
                events.push(Ok(StreamEvent::Done));
            }
        }

        Ok(Box::pin(stream::iter(events)))
    }
}

/// Derive the finish reason a caller should record for a scripted step,
/// used by tests that assert on `ModelEndPayload::finish_reason` without
/// re-deriving it from the raw stream.
pub fn finish_reason_for(step: &MockStep) -> FinishReason {
    match step {
        MockStep::Text(_) => FinishReason::Stop,
        MockStep::ToolCalls(_) => FinishReason::ToolCalls,
    }
}
