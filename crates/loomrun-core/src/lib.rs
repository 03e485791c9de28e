mod cancel;
mod context;
mod fingerprint;
mod retry;
mod runnable;
mod session;
mod state;
mod supervisor;
mod transfer;
mod tree;

pub use cancel::CancelToken;
pub use context::{ContextPipeline, ContextStage, HistoryScope, RenderContext};
pub use fingerprint::fingerprint;
pub use retry::RetryPolicy;
pub use runnable::{
    AgentSpec, LoopSpec, ParallelSpec, Runnable, SequenceSpec, StepOutcome, StepSpec,
    DEFAULT_AGENT_MAX_ITERATIONS, DEFAULT_LOOP_MAX_ITERATIONS,
};
pub use session::{JsonlSessionService, Session, SessionService, SessionStatus};
pub use state::{StateSchema, StateStore, DEFAULT_SCOPE};
pub use supervisor::{resume, run, HandoffCtx, InvocationOutcome};
pub use transfer::TransferRegistry;
pub use tree::{build_tree, roots, InvocationNode, InvocationStatus};
