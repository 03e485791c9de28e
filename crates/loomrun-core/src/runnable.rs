use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde_json::Value;

use loomrun_model::ModelAdapter;
use loomrun_types::EngineError;

use crate::context::ContextPipeline;
use crate::supervisor::HandoffCtx;

/// The five-variant composition model. A tagged enum rather than a trait
/// object: dispatch is a visitor over a fixed case set, and child lists
/// are owned by their parent variant.
#[derive(Clone)]
pub enum Runnable {
    Agent(Arc<AgentSpec>),
    Step(Arc<StepSpec>),
    Sequence(Arc<SequenceSpec>),
    Parallel(Arc<ParallelSpec>),
    Loop(Arc<LoopSpec>),
}

impl Runnable {
    pub fn name(&self) -> &str {
        match self {
            Runnable::Agent(a) => &a.name,
            Runnable::Step(s) => &s.name,
            Runnable::Sequence(s) => &s.name,
            Runnable::Parallel(p) => &p.name,
            Runnable::Loop(l) => &l.name,
        }
    }

    pub fn kind(&self) -> loomrun_types::RunnableKind {
        match self {
            Runnable::Agent(_) => loomrun_types::RunnableKind::Agent,
            Runnable::Step(_) => loomrun_types::RunnableKind::Step,
            Runnable::Sequence(_) => loomrun_types::RunnableKind::Sequence,
            Runnable::Parallel(_) => loomrun_types::RunnableKind::Parallel,
            Runnable::Loop(_) => loomrun_types::RunnableKind::Loop,
        }
    }
}

impl std::fmt::Debug for Runnable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}({})", self.kind(), self.name())
    }
}

/// A single model-driven agent. `max_iterations` defaults to 20 model-step
/// rounds.
pub struct AgentSpec {
    pub name: String,
    pub model: Arc<dyn ModelAdapter>,
    pub context: ContextPipeline,
    /// Names of tools (resolved against the shared `ToolRegistry` at run
    /// time) this agent is allowed to call.
    pub tools: Vec<String>,
    pub tool_choice: Option<loomrun_model::ToolChoice>,
    pub output_schema: Option<Value>,
    pub max_iterations: u32,
}

pub const DEFAULT_AGENT_MAX_ITERATIONS: u32 = 20;
pub const DEFAULT_LOOP_MAX_ITERATIONS: u32 = 100;

impl AgentSpec {
    pub fn new(name: impl Into<String>, model: Arc<dyn ModelAdapter>, context: ContextPipeline) -> Self {
        Self {
            name: name.into(),
            model,
            context,
            tools: Vec::new(),
            tool_choice: None,
            output_schema: None,
            max_iterations: DEFAULT_AGENT_MAX_ITERATIONS,
        }
    }

    pub fn with_tools(mut self, tools: Vec<String>) -> Self {
        self.tools = tools;
        self
    }
}

/// The result of a `Step`'s callback: `void` (no control change), one of
/// the four signals, or a routed `Runnable`.
pub enum StepOutcome {
    Void,
    Skip,
    Respond(String),
    Fail(String),
    Complete(Value),
    Route(Runnable),
}

type StepFuture = Pin<Box<dyn Future<Output = Result<StepOutcome, EngineError>> + Send>>;

pub struct StepSpec {
    pub name: String,
    pub exec: Box<dyn Fn(HandoffCtx) -> StepFuture + Send + Sync>,
}

impl StepSpec {
    pub fn new<F, Fut>(name: impl Into<String>, exec: F) -> Self
    where
        F: Fn(HandoffCtx) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<StepOutcome, EngineError>> + Send + 'static,
    {
        Self {
            name: name.into(),
            exec: Box::new(move |ctx| Box::pin(exec(ctx))),
        }
    }
}

pub struct SequenceSpec {
    pub name: String,
    pub children: Vec<Runnable>,
}

type MergeFn = Arc<dyn Fn(&[Value]) -> Vec<(String, Option<Value>)> + Send + Sync>;

pub struct ParallelSpec {
    pub name: String,
    pub children: Vec<Runnable>,
    pub merge: Option<MergeFn>,
}

pub struct LoopSpec {
    pub name: String,
    pub inner: Runnable,
    pub while_fn: Arc<dyn Fn(&[String]) -> bool + Send + Sync>,
    pub max_iterations: u32,
    /// If true, a yield from `inner` is forwarded to the loop's caller
    /// instead of being treated as a failure.
    pub yields: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use loomrun_model::MockProvider;

    #[test]
    fn agent_default_max_iterations_is_twenty() {
        let model = Arc::new(MockProvider::text("m", "hi"));
        let agent = AgentSpec::new("a", model, ContextPipeline::new());
        assert_eq!(agent.max_iterations, 20);
    }

    #[test]
    fn runnable_name_and_kind_for_sequence() {
        let seq = Runnable::Sequence(Arc::new(SequenceSpec {
            name: "seq".into(),
            children: vec![],
        }));
        assert_eq!(seq.name(), "seq");
        assert_eq!(seq.kind(), loomrun_types::RunnableKind::Sequence);
    }
}
