use std::collections::HashSet;
use std::sync::Arc;

use serde_json::Value;

use loomrun_model::{CompletionRequest, RenderedMessage, ToolChoice, ToolSchema};
use loomrun_types::{Event, EventKind, InvocationId, InvocationStartPayload};

/// Which events `includeHistory` admits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HistoryScope {
    /// Every event in the session, including nested invocations.
    All,
    /// Only events at the top level of the conversation (pre-invocation
    /// seed turns plus root-invocation events) — nested child-invocation
    /// events are hidden.
    Session,
    /// Only events belonging to the current invocation or one of its
    /// descendants.
    Invocation,
}

type TextFn = Arc<dyn Fn(&str) -> String + Send + Sync>;
type ToolFilterFn = Arc<dyn Fn(&str) -> bool + Send + Sync>;

/// One stage in a Context pipeline. Modeled as a tagged variant rather than
/// an opaque closure wherever the stage's identity matters for the
/// fingerprint — the two stages that carry a closure
/// (`WrapUserMessages`/`LimitTools`) are fingerprinted by name only, never
/// by body.
#[derive(Clone)]
pub enum ContextStage {
    InjectSystemMessage(String),
    InjectUserMessage(String),
    IncludeHistory(HistoryScope),
    WrapUserMessages(TextFn),
    EnrichUserMessages(TextFn),
    PruneReasoning,
    PruneUserMessages,
    ExcludeChildInvocationInstructions,
    ExcludeChildInvocationEvents,
    LimitTools(ToolFilterFn),
    SetToolChoice(ToolChoice),
    RenderSchema(Value),
}

impl ContextStage {
    pub fn name(&self) -> &'static str {
        match self {
            ContextStage::InjectSystemMessage(_) => "inject_system_message",
            ContextStage::InjectUserMessage(_) => "inject_user_message",
            ContextStage::IncludeHistory(_) => "include_history",
            ContextStage::WrapUserMessages(_) => "wrap_user_messages",
            ContextStage::EnrichUserMessages(_) => "enrich_user_messages",
            ContextStage::PruneReasoning => "prune_reasoning",
            ContextStage::PruneUserMessages => "prune_user_messages",
            ContextStage::ExcludeChildInvocationInstructions => {
                "exclude_child_invocation_instructions"
            }
            ContextStage::ExcludeChildInvocationEvents => "exclude_child_invocation_events",
            ContextStage::LimitTools(_) => "limit_tools",
            ContextStage::SetToolChoice(_) => "set_tool_choice",
            ContextStage::RenderSchema(_) => "render_schema",
        }
    }
}

impl std::fmt::Debug for ContextStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ContextStage::{}", self.name())
    }
}

/// An ordered list of stages — part of an Agent's definition, and an input
/// to the pipeline fingerprint via `sortedContextStageNames`.
#[derive(Debug, Clone, Default)]
pub struct ContextPipeline {
    pub stages: Vec<ContextStage>,
}

impl ContextPipeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_stage(mut self, stage: ContextStage) -> Self {
        self.stages.push(stage);
        self
    }

    /// Sorted stage names, for the fingerprint.
    pub fn sorted_stage_names(&self) -> Vec<&'static str> {
        let mut names: Vec<&'static str> = self.stages.iter().map(|s| s.name()).collect();
        names.sort_unstable();
        names
    }
}

/// The draft produced by running a Context pipeline.
#[derive(Debug, Clone)]
pub struct RenderContext {
    pub invocation_id: InvocationId,
    pub agent_name: String,
    pub events: Vec<Event>,
    pub tools: Vec<ToolSchema>,
    pub allowed_tools: Option<HashSet<String>>,
    pub tool_choice: ToolChoice,
    pub output_schema: Option<Value>,
}

impl RenderContext {
    /// Project the selected events into the wire-level completion request
    /// the model adapter consumes.
    pub fn to_completion_request(&self) -> CompletionRequest {
        let tools = match &self.allowed_tools {
            Some(allowed) => self
                .tools
                .iter()
                .filter(|t| allowed.contains(&t.name))
                .cloned()
                .collect(),
            None => self.tools.clone(),
        };
        CompletionRequest {
            messages: self.events.iter().filter_map(project_event).collect(),
            tools,
            tool_choice: self.tool_choice.clone(),
            output_schema: self.output_schema.clone(),
            stream: true,
        }
    }
}

fn project_event(event: &Event) -> Option<RenderedMessage> {
    match &event.kind {
        EventKind::System { text } => Some(RenderedMessage::System { text: text.clone() }),
        EventKind::User { text } => Some(RenderedMessage::User { text: text.clone() }),
        EventKind::Assistant { text } => Some(RenderedMessage::Assistant { text: text.clone() }),
        EventKind::Thought { text, opaque } => Some(RenderedMessage::Thought {
            text: text.clone(),
            opaque: opaque.clone(),
        }),
        EventKind::ToolCall(p) => Some(RenderedMessage::ToolCall {
            call_id: p.call_id.clone(),
            name: p.name.clone(),
            args: p.args.clone(),
        }),
        EventKind::ToolResult(p) => Some(RenderedMessage::ToolResult {
            call_id: p.call_id.clone(),
            content: p
                .result
                .as_ref()
                .map(|v| v.to_string())
                .or_else(|| p.error.clone())
                .unwrap_or_default(),
            is_error: p.error.is_some(),
        }),
        _ => None,
    }
}

/// `ancestors`/`descendants` helpers used by `IncludeHistory` and the
/// `ExcludeChildInvocation*` stages, derived purely from `invocation_start`
/// events. `tree::build_tree` is the authoritative tree-builder; this is
/// the narrow slice the renderer needs.
fn parent_of(events: &[Event], id: &InvocationId) -> Option<InvocationId> {
    events.iter().find_map(|e| {
        if e.invocation_id.as_ref() == Some(id) {
            if let EventKind::InvocationStart(InvocationStartPayload {
                parent_invocation_id,
                ..
            }) = &e.kind
            {
                return parent_invocation_id.clone();
            }
        }
        None
    })
}

fn descendants_of(events: &[Event], root: &InvocationId) -> HashSet<InvocationId> {
    let mut frontier = vec![root.clone()];
    let mut result = HashSet::new();
    while let Some(current) = frontier.pop() {
        for e in events {
            if let EventKind::InvocationStart(InvocationStartPayload {
                parent_invocation_id: Some(parent),
                ..
            }) = &e.kind
            {
                if parent == &current {
                    if let Some(child_id) = &e.invocation_id {
                        if result.insert(child_id.clone()) {
                            frontier.push(child_id.clone());
                        }
                    }
                }
            }
        }
    }
    result
}

fn root_invocations(events: &[Event]) -> HashSet<InvocationId> {
    events
        .iter()
        .filter_map(|e| match &e.kind {
            EventKind::InvocationStart(InvocationStartPayload {
                parent_invocation_id: None,
                ..
            }) => e.invocation_id.clone(),
            _ => None,
        })
        .collect()
}

impl ContextPipeline {
    /// Run every stage in declaration order, building a `RenderContext` for
    /// one agent step.
    pub fn render(
        &self,
        all_events: &[Event],
        invocation_id: &InvocationId,
        agent_name: &str,
        base_tools: Vec<ToolSchema>,
    ) -> RenderContext {
        let mut ctx = RenderContext {
            invocation_id: invocation_id.clone(),
            agent_name: agent_name.to_string(),
            events: Vec::new(),
            tools: base_tools,
            allowed_tools: None,
            tool_choice: ToolChoice::Auto,
            output_schema: None,
        };

        let descendants = descendants_of(all_events, invocation_id);
        let roots = root_invocations(all_events);
        let ancestor_root = {
            let mut cur = invocation_id.clone();
            loop {
                match parent_of(all_events, &cur) {
                    Some(parent) => cur = parent,
                    None => break cur,
                }
            }
        };

        for stage in &self.stages {
            match stage {
                ContextStage::InjectSystemMessage(text) => {
                    ctx.events.insert(
                        0,
                        Event {
                            id: loomrun_types::EventId::zero(),
                            created_at: chrono::Utc::now(),
                            invocation_id: None,
                            kind: EventKind::System { text: text.clone() },
                        },
                    );
                }
                ContextStage::InjectUserMessage(text) => {
                    ctx.events.push(Event {
                        id: loomrun_types::EventId::zero(),
                        created_at: chrono::Utc::now(),
                        invocation_id: None,
                        kind: EventKind::User { text: text.clone() },
                    });
                }
                ContextStage::IncludeHistory(scope) => {
                    let selected: Vec<Event> = all_events
                        .iter()
                        .filter(|e| match scope {
                            HistoryScope::All => true,
                            HistoryScope::Session => {
                                e.invocation_id.is_none() || roots.contains(
                                    e.invocation_id.as_ref().unwrap_or(&ancestor_root),
                                )
                            }
                            HistoryScope::Invocation => {
                                e.invocation_id.as_ref() == Some(invocation_id)
                                    || e
                                        .invocation_id
                                        .as_ref()
                                        .map(|id| descendants.contains(id))
                                        .unwrap_or(false)
                            }
                        })
                        .cloned()
                        .collect();
                    ctx.events.extend(selected);
                }
                ContextStage::WrapUserMessages(f) | ContextStage::EnrichUserMessages(f) => {
                    for e in &mut ctx.events {
                        if let EventKind::User { text } = &mut e.kind {
                            *text = f(text);
                        }
                    }
                }
                ContextStage::PruneReasoning => {
                    ctx.events
                        .retain(|e| !matches!(e.kind, EventKind::Thought { .. } | EventKind::ThoughtDelta { .. }));
                }
                ContextStage::PruneUserMessages => {
                    ctx.events.retain(|e| !matches!(e.kind, EventKind::User { .. }));
                }
                ContextStage::ExcludeChildInvocationInstructions => {
                    ctx.events.retain(|e| {
                        let is_instruction = matches!(e.kind, EventKind::System { .. } | EventKind::User { .. });
                        let is_child = e
                            .invocation_id
                            .as_ref()
                            .map(|id| descendants.contains(id) && id != invocation_id)
                            .unwrap_or(false);
                        !(is_instruction && is_child)
                    });
                }
                ContextStage::ExcludeChildInvocationEvents => {
                    ctx.events.retain(|e| {
                        !e.invocation_id
                            .as_ref()
                            .map(|id| descendants.contains(id) && id != invocation_id)
                            .unwrap_or(false)
                    });
                }
                ContextStage::LimitTools(predicate) => {
                    ctx.tools.retain(|t| predicate(&t.name));
                }
                ContextStage::SetToolChoice(choice) => {
                    ctx.tool_choice = choice.clone();
                }
                ContextStage::RenderSchema(schema) => {
                    ctx.output_schema = Some(schema.clone());
                }
            }
        }

        ctx
    }
}

/// Stable, order-insensitive hash input for a pipeline's context section of
/// the fingerprint — exposed so `fingerprint.rs` doesn't need to know this
/// module's internals.
pub fn fingerprint_parts(pipeline: &ContextPipeline) -> Vec<&'static str> {
    pipeline.sorted_stage_names()
}
