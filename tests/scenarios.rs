//! End-to-end scenario tests exercising `loomrun_core::{run, resume}` the
//! way the CLI does: a `Session` wrapped in `Arc<Mutex<_>>`, a concrete
//! `Runnable` tree, and a `ToolRegistry` of builtin tools.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;
use tokio::sync::Mutex;

use loomrun_core::{
    fingerprint, resume, run, AgentSpec, ContextPipeline, ContextStage, HistoryScope, LoopSpec,
    ParallelSpec, Runnable, Session, StepOutcome, StepSpec, TransferRegistry,
};
use loomrun_model::{MockProvider, MockStep};
use loomrun_tools::{CalculateTool, MakePurchaseTool, RequestApprovalTool, Tool, ToolCall, ToolOutcome, ToolRegistry};
use loomrun_types::{EndReason, EngineError, Event, EventKind};

fn no_transfers() -> Arc<TransferRegistry> {
    Arc::new(TransferRegistry::new())
}

fn history_pipeline() -> ContextPipeline {
    ContextPipeline::new().with_stage(ContextStage::IncludeHistory(HistoryScope::All))
}

fn shared(session: Session) -> Arc<Mutex<Session>> {
    Arc::new(Mutex::new(session))
}

fn find_invocation_id_for_call(events: &[Event], call_id: &str) -> loomrun_types::InvocationId {
    events
        .iter()
        .rev()
        .find_map(|e| match &e.kind {
            EventKind::ToolYield(p) if p.call_id == call_id => e.invocation_id.clone(),
            _ => None,
        })
        .expect("tool_yield event for pending call")
}

// A single agent completes after one non-yielding tool call.
#[tokio::test]
async fn scenario_simple_completion() {
    let mut session = Session::new("s-simple", "test");
    session.add_message("What is 134/4?").unwrap();
    let session = shared(session);

    let mut registry = ToolRegistry::new();
    registry.register(CalculateTool);
    let registry = Arc::new(registry);

    let model = Arc::new(MockProvider::new(
        "mock-1",
        vec![
            MockStep::ToolCalls(vec![(
                "c1".into(),
                "calculate".into(),
                json!({"expression": "134/4"}),
            )]),
            MockStep::Text("33.5".into()),
        ],
    ));
    let agent = AgentSpec::new("answerer", model, history_pipeline()).with_tools(vec!["calculate".into()]);
    let runnable = Runnable::Agent(Arc::new(agent));

    let result = run(session.clone(), registry, no_transfers(), runnable).await.unwrap();
    assert!(result.is_completed());
    match result.outcome {
        loomrun_types::RunOutcome::Completed { output } => {
            assert_eq!(output, Some(json!("33.5")));
        }
        other => panic!("expected Completed, got {other:?}"),
    }

    let guard = session.lock().await;
    assert!(guard
        .events()
        .iter()
        .any(|e| matches!(&e.kind, EventKind::ToolResult(p) if p.name == "calculate" && p.error.is_none())));
}

// The agent yields on `request_approval`, then resumes through
// `make_purchase` once external input answers the pending call.
#[tokio::test]
async fn scenario_yield_then_resume() {
    let mut session = Session::new("s-yield", "test");
    session.add_message("buy the widget").unwrap();
    let session = shared(session);

    let mut registry = ToolRegistry::new();
    registry.register(RequestApprovalTool);
    registry.register(MakePurchaseTool);
    let registry = Arc::new(registry);

    let model = Arc::new(MockProvider::new(
        "mock-1",
        vec![
            MockStep::ToolCalls(vec![(
                "c1".into(),
                "request_approval".into(),
                json!({"summary": "buy widget"}),
            )]),
            MockStep::ToolCalls(vec![(
                "c2".into(),
                "make_purchase".into(),
                json!({"item": "widget", "approved": true}),
            )]),
            MockStep::Text("purchase complete".into()),
        ],
    ));
    let agent = AgentSpec::new("shopper", model, history_pipeline())
        .with_tools(vec!["request_approval".into(), "make_purchase".into()]);
    let runnable = Runnable::Agent(Arc::new(agent));

    let first = run(session.clone(), registry.clone(), no_transfers(), runnable.clone())
        .await
        .unwrap();
    assert!(first.is_yielded());
    let (call_id, yielded_invocation_id) = match first.outcome {
        loomrun_types::RunOutcome::Yielded {
            pending_calls,
            yielded_invocation_id,
            ..
        } => {
            assert_eq!(pending_calls.len(), 1);
            assert_eq!(pending_calls[0].name, "request_approval");
            (pending_calls[0].call_id.clone(), yielded_invocation_id)
        }
        other => panic!("expected Yielded, got {other:?}"),
    };

    {
        let mut guard = session.lock().await;
        assert_eq!(
            find_invocation_id_for_call(guard.events(), &call_id),
            yielded_invocation_id
        );
        guard
            .add_tool_input(yielded_invocation_id, call_id, json!({"approved": true}))
            .unwrap();
    }

    let second = resume(session.clone(), registry, no_transfers(), runnable).await.unwrap();
    assert!(second.is_completed());

    let guard = session.lock().await;
    assert!(guard
        .events()
        .iter()
        .any(|e| matches!(&e.kind, EventKind::ToolResult(p) if p.name == "make_purchase" && p.error.is_none())));
}

// Resuming with a structurally different pipeline is rejected
// before any new events are appended.
#[tokio::test]
async fn scenario_structural_change_rejects_resume() {
    let mut session = Session::new("s-structural", "test");
    session.add_message("buy the widget").unwrap();
    let session = shared(session);

    let mut registry = ToolRegistry::new();
    registry.register(RequestApprovalTool);
    let registry = Arc::new(registry);

    let model = Arc::new(MockProvider::new(
        "mock-1",
        vec![MockStep::ToolCalls(vec![(
            "c1".into(),
            "request_approval".into(),
            json!({"summary": "buy widget"}),
        )])],
    ));
    let agent = AgentSpec::new("shopper", model, history_pipeline())
        .with_tools(vec!["request_approval".into()]);
    let original = Runnable::Agent(Arc::new(agent));

    let first = run(session.clone(), registry.clone(), no_transfers(), original.clone())
        .await
        .unwrap();
    assert!(first.is_yielded());

    let events_before = session.lock().await.events().len();

    let model2 = Arc::new(MockProvider::text("mock-1", "n/a"));
    let mutated = AgentSpec::new("shopper_v2", model2, history_pipeline())
        .with_tools(vec!["request_approval".into()]);
    let mutated = Runnable::Agent(Arc::new(mutated));

    assert_ne!(fingerprint(&original), fingerprint(&mutated));

    let err = resume(session.clone(), registry, no_transfers(), mutated)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::PipelineStructureChanged { .. }));

    assert_eq!(session.lock().await.events().len(), events_before);
}

// A parallel's two children each complete with a value, and the
// merge function folds both into session state in one batched write.
#[tokio::test]
async fn scenario_parallel_merge() {
    let session = Session::new("s-parallel", "test");
    let session = shared(session);

    let registry = Arc::new(ToolRegistry::new());

    let child_a = Runnable::Step(Arc::new(StepSpec::new("write-x", |_ctx| async move {
        Ok(StepOutcome::Complete(json!(1)))
    })));
    let child_b = Runnable::Step(Arc::new(StepSpec::new("write-y", |_ctx| async move {
        Ok(StepOutcome::Complete(json!(2)))
    })));

    let parallel = ParallelSpec {
        name: "fan_out".into(),
        children: vec![child_a, child_b],
        merge: Some(Arc::new(|values: &[serde_json::Value]| {
            vec![
                ("x".to_string(), values.first().cloned()),
                ("y".to_string(), values.get(1).cloned()),
            ]
        })),
    };
    let runnable = Runnable::Parallel(Arc::new(parallel));

    let result = run(session.clone(), registry, no_transfers(), runnable).await.unwrap();
    assert!(result.is_completed());

    let guard = session.lock().await;
    assert_eq!(guard.read_state(loomrun_core::DEFAULT_SCOPE, "x"), Some(&json!(1)));
    assert_eq!(guard.read_state(loomrun_core::DEFAULT_SCOPE, "y"), Some(&json!(2)));

    let merge_events: Vec<_> = guard
        .events()
        .iter()
        .filter(|e| matches!(&e.kind, EventKind::StateChange { source, .. } if source == "parallel_merge"))
        .collect();
    assert_eq!(merge_events.len(), 1);
    if let EventKind::StateChange { changes, .. } = &merge_events[0].kind {
        assert_eq!(changes.len(), 2);
    }
}

// A loop runs its body until an exit phrase appears in the
// accumulated history, then stops.
#[tokio::test]
async fn scenario_loop_with_exit_phrase() {
    let session = Session::new("s-loop", "test");
    let session = shared(session);

    let registry = Arc::new(ToolRegistry::new());

    let model = Arc::new(MockProvider::new("mock-1", vec![MockStep::Text("hi".into()), MockStep::Text("goodbye".into())]));
    let inner = Runnable::Agent(Arc::new(AgentSpec::new("greeter", model, history_pipeline())));

    let lp = LoopSpec {
        name: "greeting_loop".into(),
        inner,
        while_fn: Arc::new(|history: &[String]| {
            !history
                .last()
                .map(|last| last.contains("goodbye"))
                .unwrap_or(false)
        }),
        max_iterations: 10,
        yields: false,
    };
    let runnable = Runnable::Loop(Arc::new(lp));

    let result = run(session.clone(), registry, no_transfers(), runnable).await.unwrap();
    assert!(result.is_completed());

    let guard = session.lock().await;
    let child_starts = guard
        .events()
        .iter()
        .filter(|e| matches!(&e.kind, EventKind::InvocationStart(p) if p.agent_name == "greeter"))
        .count();
    assert_eq!(child_starts, 2);

    let ends_completed = guard
        .events()
        .iter()
        .filter(|e| matches!(&e.kind, EventKind::InvocationEnd(p) if p.reason == EndReason::Completed))
        .count();
    assert!(ends_completed >= 3); // two child invocations + the loop itself
}

// A step transfers control to a fresh agent via `StepOutcome::Route`; the
// source invocation ends `transferred` and a new root invocation follows it.
#[tokio::test]
async fn scenario_step_route_hands_off_to_new_agent() {
    let session = Session::new("s-transfer-route", "test");
    let session = shared(session);

    let registry = Arc::new(ToolRegistry::new());

    let model = Arc::new(MockProvider::text("mock-1", "handled by specialist"));
    let specialist = Runnable::Agent(Arc::new(AgentSpec::new("specialist", model, history_pipeline())));
    let specialist_for_step = specialist.clone();

    let router = Runnable::Step(Arc::new(StepSpec::new("router", move |_ctx| {
        let next = specialist_for_step.clone();
        async move { Ok(StepOutcome::Route(next)) }
    })));

    let result = run(session.clone(), registry, no_transfers(), router).await.unwrap();
    assert!(result.is_completed());

    let guard = session.lock().await;
    let agent_names: Vec<&str> = guard
        .events()
        .iter()
        .filter_map(|e| match &e.kind {
            EventKind::InvocationStart(p) => Some(p.agent_name.as_str()),
            _ => None,
        })
        .collect();
    assert_eq!(agent_names, vec!["router", "specialist"]);

    let router_end = guard
        .events()
        .iter()
        .find_map(|e| match &e.kind {
            EventKind::InvocationEnd(p) if p.reason == EndReason::Transferred => Some(p),
            _ => None,
        })
        .expect("router's invocation_end with reason=transferred");
    assert_eq!(router_end.handoff_target.as_ref().unwrap().agent_name, "specialist");
}

// A non-yielding tool can itself end its invocation by returning a named
// transfer target, resolved against the supervisor's `TransferRegistry`;
// the carrying invocation ends `transferred` the same way a `Step::Route`
// does, and the next invocation records a `HandoffOrigin` pointing back at it.
struct HandoffTool;

#[async_trait]
impl Tool for HandoffTool {
    fn name(&self) -> &str {
        "handoff"
    }
    fn description(&self) -> &str {
        "hands control off to a named specialist agent"
    }
    fn parameters_schema(&self) -> serde_json::Value {
        json!({ "type": "object" })
    }
    async fn execute(&self, _call: &ToolCall) -> Result<ToolOutcome, EngineError> {
        Ok(ToolOutcome::Transfer("specialist".into()))
    }
}

#[tokio::test]
async fn scenario_tool_transfer_hands_off_to_new_agent() {
    let mut session = Session::new("s-transfer-tool", "test");
    session.add_message("route me to a specialist").unwrap();
    let session = shared(session);

    let mut registry = ToolRegistry::new();
    registry.register(HandoffTool);
    let registry = Arc::new(registry);

    let model = Arc::new(MockProvider::new(
        "mock-1",
        vec![MockStep::ToolCalls(vec![("c1".into(), "handoff".into(), json!({}))])],
    ));
    let router = Runnable::Agent(Arc::new(
        AgentSpec::new("router", model, history_pipeline()).with_tools(vec!["handoff".into()]),
    ));

    let specialist_model = Arc::new(MockProvider::text("mock-2", "handled by specialist"));
    let specialist = Runnable::Agent(Arc::new(AgentSpec::new(
        "specialist",
        specialist_model,
        history_pipeline(),
    )));

    let mut transfers = TransferRegistry::new();
    transfers.register("specialist", specialist);
    let transfers = Arc::new(transfers);

    let result = run(session.clone(), registry, transfers, router).await.unwrap();
    assert!(result.is_completed());

    let guard = session.lock().await;
    let agent_names: Vec<&str> = guard
        .events()
        .iter()
        .filter_map(|e| match &e.kind {
            EventKind::InvocationStart(p) => Some(p.agent_name.as_str()),
            _ => None,
        })
        .collect();
    assert_eq!(agent_names, vec!["router", "specialist"]);

    let router_end = guard
        .events()
        .iter()
        .find_map(|e| match &e.kind {
            EventKind::InvocationEnd(p) if p.reason == EndReason::Transferred => Some(p),
            _ => None,
        })
        .expect("router's invocation_end with reason=transferred");
    assert_eq!(router_end.handoff_target.as_ref().unwrap().agent_name, "specialist");

    let specialist_origin = guard
        .events()
        .iter()
        .find_map(|e| match &e.kind {
            EventKind::InvocationStart(p) if p.agent_name == "specialist" => p.handoff_origin.clone(),
            _ => None,
        })
        .expect("specialist's invocation_start carries a handoff_origin")
        .expect("handoff_origin is Some");
    assert_eq!(specialist_origin.kind, loomrun_types::HandoffKind::Transfer);
}
