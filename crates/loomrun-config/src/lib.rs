mod loader;
mod pipeline;
mod schema;

pub use loader::load;
pub use pipeline::{
    build_runnable, load_pipeline, ConfigModelResolver, ContextStageSpec, HistoryScopeSpec,
    ModelResolver, PipelineNode,
};
pub use schema::*;
