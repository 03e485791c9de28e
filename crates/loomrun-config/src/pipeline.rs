//! Declarative pipeline loading: a YAML description of a Runnable tree,
//! resolved against a tool registry and a named model provider.
//!
//! Only data-carrying nodes are YAML-expressible. `Step` takes a Rust
//! closure and the `WrapUserMessages`/`EnrichUserMessages`/`LimitTools`
//! context stages take one too — none of these have a serde form, so
//! a pipeline file can only describe Agent/Sequence/Parallel/Loop nodes and
//! the data-only context stages. Anything that needs a closure is built
//! programmatically against `loomrun_core` directly; this loader exists for
//! the common case of a fully declarative pipeline.

use std::path::Path;
use std::sync::Arc;

use anyhow::{bail, Context};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use loomrun_core::{
    AgentSpec, ContextPipeline, ContextStage, HistoryScope, LoopSpec, ParallelSpec, Runnable,
    SequenceSpec,
};
use loomrun_model::{MockProvider, ModelAdapter, ToolChoice};
use loomrun_tools::ToolRegistry;

use crate::schema::ModelConfig;

/// One stage in a pipeline file's `context:` list. Mirrors the data-only
/// variants of `loomrun_core::ContextStage`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "stage", rename_all = "snake_case")]
pub enum ContextStageSpec {
    InjectSystemMessage { text: String },
    InjectUserMessage { text: String },
    IncludeHistory { scope: HistoryScopeSpec },
    PruneReasoning,
    PruneUserMessages,
    ExcludeChildInvocationInstructions,
    ExcludeChildInvocationEvents,
    SetToolChoice { choice: ToolChoice },
    RenderSchema { schema: Value },
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HistoryScopeSpec {
    All,
    Session,
    Invocation,
}

impl From<HistoryScopeSpec> for HistoryScope {
    fn from(s: HistoryScopeSpec) -> Self {
        match s {
            HistoryScopeSpec::All => HistoryScope::All,
            HistoryScopeSpec::Session => HistoryScope::Session,
            HistoryScopeSpec::Invocation => HistoryScope::Invocation,
        }
    }
}

impl ContextStageSpec {
    fn into_stage(self) -> ContextStage {
        match self {
            ContextStageSpec::InjectSystemMessage { text } => ContextStage::InjectSystemMessage(text),
            ContextStageSpec::InjectUserMessage { text } => ContextStage::InjectUserMessage(text),
            ContextStageSpec::IncludeHistory { scope } => ContextStage::IncludeHistory(scope.into()),
            ContextStageSpec::PruneReasoning => ContextStage::PruneReasoning,
            ContextStageSpec::PruneUserMessages => ContextStage::PruneUserMessages,
            ContextStageSpec::ExcludeChildInvocationInstructions => {
                ContextStage::ExcludeChildInvocationInstructions
            }
            ContextStageSpec::ExcludeChildInvocationEvents => {
                ContextStage::ExcludeChildInvocationEvents
            }
            ContextStageSpec::SetToolChoice { choice } => ContextStage::SetToolChoice(choice),
            ContextStageSpec::RenderSchema { schema } => ContextStage::RenderSchema(schema),
        }
    }
}

/// One node of a declarative pipeline tree. Deserialized with an internal
/// `kind` tag so a YAML file reads like `kind: agent`, `kind: sequence`, ...
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PipelineNode {
    Agent {
        name: String,
        /// Key into the resolved `providers` map (or `"default"` for the
        /// top-level `model:` config).
        model: String,
        #[serde(default)]
        tools: Vec<String>,
        #[serde(default)]
        tool_choice: Option<ToolChoice>,
        #[serde(default)]
        output_schema: Option<Value>,
        #[serde(default)]
        max_iterations: Option<u32>,
        #[serde(default)]
        context: Vec<ContextStageSpec>,
    },
    Sequence {
        name: String,
        children: Vec<PipelineNode>,
    },
    Parallel {
        name: String,
        children: Vec<PipelineNode>,
    },
    Loop {
        name: String,
        inner: Box<PipelineNode>,
        #[serde(default)]
        max_iterations: Option<u32>,
        /// Phrase that, when it appears in the inner runnable's rendered
        /// output, stops the loop — a declarative form of `LoopSpec::while_fn`.
        exit_phrase: String,
        #[serde(default)]
        yields: bool,
    },
}

/// Resolves a pipeline file's `model:` keys to live adapters. The only
/// implementation shipped here builds `MockProvider`s from `ModelConfig`
/// entries — a real provider is plugged in by implementing this trait
/// against an HTTP-backed `ModelAdapter` and passing it to `build_runnable`
/// instead.
pub trait ModelResolver {
    fn resolve(&self, key: &str) -> anyhow::Result<Arc<dyn ModelAdapter>>;
}

/// Resolves every `model:` key against the `providers` map (and `"default"`
/// against the top-level `model:` config), building a `MockProvider` for
/// each `provider: mock` entry.
pub struct ConfigModelResolver<'a> {
    pub default: &'a ModelConfig,
    pub providers: &'a std::collections::HashMap<String, ModelConfig>,
}

impl<'a> ModelResolver for ConfigModelResolver<'a> {
    fn resolve(&self, key: &str) -> anyhow::Result<Arc<dyn ModelAdapter>> {
        let cfg = if key == "default" {
            self.default
        } else {
            self.providers
                .get(key)
                .with_context(|| format!("no provider named '{key}' in config"))?
        };
        build_mock_adapter(cfg).with_context(|| format!("building model adapter for '{key}'"))
    }
}

fn build_mock_adapter(cfg: &ModelConfig) -> anyhow::Result<Arc<dyn ModelAdapter>> {
    if cfg.provider != "mock" {
        bail!(
            "provider '{}' has no built-in adapter; only 'mock' is wired in",
            cfg.provider
        );
    }
    let steps = match &cfg.mock_responses_file {
        Some(path) => loomrun_model::load_steps(Path::new(path))
            .with_context(|| format!("loading mock responses from {path}"))?,
        None => vec![loomrun_model::MockStep::Text("ok".into())],
    };
    Ok(Arc::new(MockProvider::new(cfg.name.clone(), steps)))
}

/// Build a live `Runnable` tree from a parsed pipeline node, resolving tool
/// names against `registry` (existence-checked up front so a typo in a
/// pipeline file fails at load time, not mid-run) and model keys against
/// `resolver`.
pub fn build_runnable(
    node: &PipelineNode,
    registry: &ToolRegistry,
    resolver: &dyn ModelResolver,
) -> anyhow::Result<Runnable> {
    match node {
        PipelineNode::Agent {
            name,
            model,
            tools,
            tool_choice,
            output_schema,
            max_iterations,
            context,
        } => {
            for tool_name in tools {
                if registry.get(tool_name).is_none() {
                    bail!("agent '{name}' references unknown tool '{tool_name}'");
                }
            }
            let adapter = resolver.resolve(model)?;
            let mut pipeline = ContextPipeline::new();
            for stage in context.clone() {
                pipeline = pipeline.with_stage(stage.into_stage());
            }
            let mut spec = AgentSpec::new(name.clone(), adapter, pipeline).with_tools(tools.clone());
            spec.tool_choice = tool_choice.clone();
            spec.output_schema = output_schema.clone();
            if let Some(max_iter) = max_iterations {
                spec.max_iterations = *max_iter;
            }
            Ok(Runnable::Agent(Arc::new(spec)))
        }
        PipelineNode::Sequence { name, children } => {
            let children = children
                .iter()
                .map(|c| build_runnable(c, registry, resolver))
                .collect::<anyhow::Result<Vec<_>>>()?;
            Ok(Runnable::Sequence(Arc::new(SequenceSpec {
                name: name.clone(),
                children,
            })))
        }
        PipelineNode::Parallel { name, children } => {
            let children = children
                .iter()
                .map(|c| build_runnable(c, registry, resolver))
                .collect::<anyhow::Result<Vec<_>>>()?;
            Ok(Runnable::Parallel(Arc::new(ParallelSpec {
                name: name.clone(),
                children,
                merge: None,
            })))
        }
        PipelineNode::Loop {
            name,
            inner,
            max_iterations,
            exit_phrase,
            yields,
        } => {
            let inner = build_runnable(inner, registry, resolver)?;
            let exit_phrase = exit_phrase.clone();
            Ok(Runnable::Loop(Arc::new(LoopSpec {
                name: name.clone(),
                inner,
                while_fn: Arc::new(move |outputs: &[String]| {
                    !outputs
                        .last()
                        .map(|last| last.contains(&exit_phrase))
                        .unwrap_or(false)
                }),
                max_iterations: max_iterations.unwrap_or(loomrun_core::DEFAULT_LOOP_MAX_ITERATIONS),
                yields: *yields,
            })))
        }
    }
}

/// Load and parse a pipeline YAML file (does not resolve tools/models).
pub fn load_pipeline(path: &Path) -> anyhow::Result<PipelineNode> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading pipeline file {}", path.display()))?;
    serde_yaml::from_str(&text).with_context(|| format!("parsing pipeline file {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry_with_calculate() -> ToolRegistry {
        let mut reg = ToolRegistry::new();
        reg.register(loomrun_tools::CalculateTool);
        reg
    }

    #[test]
    fn parses_simple_agent_node() {
        let yaml_str = r#"
kind: agent
name: answer
model: default
tools: [calculate]
context:
  - stage: include_history
    scope: all
"#;
        let node: PipelineNode = serde_yaml::from_str(yaml_str).unwrap();
        match node {
            PipelineNode::Agent { name, tools, .. } => {
                assert_eq!(name, "answer");
                assert_eq!(tools, vec!["calculate".to_string()]);
            }
            _ => panic!("expected agent node"),
        }
    }

    #[test]
    fn build_runnable_rejects_unknown_tool() {
        let node: PipelineNode = serde_yaml::from_str(
            "kind: agent\nname: a\nmodel: default\ntools: [nonexistent]\n",
        )
        .unwrap();
        let registry = registry_with_calculate();
        let default_cfg = ModelConfig::default();
        let providers = std::collections::HashMap::new();
        let resolver = ConfigModelResolver {
            default: &default_cfg,
            providers: &providers,
        };
        let err = build_runnable(&node, &registry, &resolver).unwrap_err();
        assert!(err.to_string().contains("nonexistent"));
    }

    #[test]
    fn build_runnable_resolves_agent_with_mock_model() {
        let node: PipelineNode = serde_yaml::from_str(
            "kind: agent\nname: a\nmodel: default\n",
        )
        .unwrap();
        let registry = ToolRegistry::new();
        let default_cfg = ModelConfig::default();
        let providers = std::collections::HashMap::new();
        let resolver = ConfigModelResolver {
            default: &default_cfg,
            providers: &providers,
        };
        let runnable = build_runnable(&node, &registry, &resolver).unwrap();
        assert_eq!(runnable.name(), "a");
    }

    #[test]
    fn parses_nested_sequence_of_agents() {
        let yaml_str = r#"
kind: sequence
name: top
children:
  - kind: agent
    name: first
    model: default
  - kind: agent
    name: second
    model: default
"#;
        let node: PipelineNode = serde_yaml::from_str(yaml_str).unwrap();
        match node {
            PipelineNode::Sequence { children, .. } => assert_eq!(children.len(), 2),
            _ => panic!("expected sequence node"),
        }
    }
}
