use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use futures::StreamExt;
use serde_json::Value;
use tokio::sync::Mutex;

use loomrun_model::{CompletionRequest, StreamEvent, ToolChoice};
use loomrun_tools::{Tool, ToolCall as EngineToolCall, ToolOutcome, ToolRegistry};
use loomrun_types::{
    EndReason, EngineError, EventKind, HandoffKind, HandoffOrigin, HandoffTarget,
    InvocationEndPayload, InvocationId, InvocationStartPayload, InvocationYieldPayload,
    ModelEndPayload, ModelStartPayload, RunOutcome, RunResult, RunnableKind, ToolCallPayload,
    ToolInputPayload, ToolResultPayload, ToolYieldPayload, Usage as EventUsage,
};

use crate::cancel::CancelToken;
use crate::fingerprint::fingerprint;
use crate::retry::RetryPolicy;
use crate::runnable::{AgentSpec, Runnable, StepOutcome};
use crate::session::Session;
use crate::transfer::TransferRegistry;
use crate::tree::{self, InvocationNode, InvocationStatus};

type SharedSession = Arc<Mutex<Session>>;

/// What running one `Runnable` node produced.
pub enum InvocationOutcome {
    Completed(Option<Value>),
    Yielded,
    Transferred(Runnable),
}

/// Handed to a `Step`'s closure. `call`/`spawn`/`dispatch` are the
/// three dynamic handoff edges; `transfer` is expressed by the closure
/// returning `StepOutcome::Route` instead, since it ends the current
/// invocation rather than opening a new one under it.
pub struct HandoffCtx {
    session: SharedSession,
    registry: Arc<ToolRegistry>,
    transfers: Arc<TransferRegistry>,
    invocation_id: InvocationId,
    cancel: CancelToken,
}

impl HandoffCtx {
    /// Run `child` to completion, blocking this step until it finishes or
    /// yields. Cancellation is linked: cancelling the
    /// parent cancels the child.
    pub async fn call(&self, child: Runnable) -> Result<InvocationOutcome, EngineError> {
        let origin = HandoffOrigin {
            kind: HandoffKind::Call,
            call_id: None,
            invocation_id: self.invocation_id.clone(),
        };
        execute_runnable(
            self.session.clone(),
            self.registry.clone(),
            self.transfers.clone(),
            child,
            Some(self.invocation_id.clone()),
            None,
            Some(origin),
            None,
            self.cancel.linked_child(),
            None,
        )
        .await
    }

    /// Start `child` without waiting. Returns the new
    /// invocation's id immediately; the child keeps running in the
    /// background and is cancelled if the parent is.
    pub async fn spawn(&self, child: Runnable) -> InvocationId {
        let session = self.session.clone();
        let registry = self.registry.clone();
        let transfers = self.transfers.clone();
        let invocation_id = session.lock().await.next_invocation_id();
        let origin = HandoffOrigin {
            kind: HandoffKind::Spawn,
            call_id: None,
            invocation_id: self.invocation_id.clone(),
        };
        let cancel = self.cancel.linked_child();
        let parent = Some(self.invocation_id.clone());
        let id_for_task = invocation_id.clone();
        tracing::debug!(invocation_id = %id_for_task, parent = %self.invocation_id, "spawned child invocation");
        tokio::spawn(async move {
            let _ = execute_runnable_with_id(
                session, registry, transfers, child, parent, None, Some(origin), None, cancel,
                None, id_for_task,
            )
            .await;
        });
        invocation_id
    }

    /// Start `child` without waiting and without linking its lifetime to
    /// this invocation: it keeps running even after the
    /// parent completes.
    pub async fn dispatch(&self, child: Runnable) -> InvocationId {
        let session = self.session.clone();
        let registry = self.registry.clone();
        let transfers = self.transfers.clone();
        let invocation_id = session.lock().await.next_invocation_id();
        let origin = HandoffOrigin {
            kind: HandoffKind::Dispatch,
            call_id: None,
            invocation_id: self.invocation_id.clone(),
        };
        let parent = Some(self.invocation_id.clone());
        let id_for_task = invocation_id.clone();
        tracing::debug!(invocation_id = %id_for_task, parent = %self.invocation_id, "dispatched child invocation");
        tokio::spawn(async move {
            let _ = execute_runnable_with_id(
                session,
                registry,
                transfers,
                child,
                parent,
                None,
                Some(origin),
                None,
                CancelToken::new(),
                None,
                id_for_task,
            )
            .await;
        });
        invocation_id
    }
}

async fn open_invocation(
    session: &SharedSession,
    parent: Option<InvocationId>,
    kind: RunnableKind,
    agent_name: &str,
    root_fingerprint: Option<String>,
    handoff_origin: Option<HandoffOrigin>,
    loop_info: Option<(u32, u32)>,
) -> Result<InvocationId, EngineError> {
    let mut guard = session.lock().await;
    let invocation_id = guard.next_invocation_id();
    tracing::trace!(invocation_id = %invocation_id, agent = %agent_name, ?kind, "opening invocation");
    guard.append_event(
        Some(invocation_id.clone()),
        EventKind::InvocationStart(InvocationStartPayload {
            agent_name: agent_name.to_string(),
            kind,
            parent_invocation_id: parent,
            fingerprint: root_fingerprint,
            session_version: guard.version.clone(),
            handoff_origin,
            loop_iteration: loop_info.map(|(i, _)| i),
            loop_max: loop_info.map(|(_, m)| m),
        }),
    )?;
    Ok(invocation_id)
}

async fn close_invocation(
    session: &SharedSession,
    invocation_id: &InvocationId,
    reason: EndReason,
    handoff_target: Option<HandoffTarget>,
) -> Result<(), EngineError> {
    tracing::trace!(invocation_id = %invocation_id, ?reason, "closing invocation");
    session
        .lock()
        .await
        .append_event(
            Some(invocation_id.clone()),
            EventKind::InvocationEnd(InvocationEndPayload {
                reason,
                handoff_target,
            }),
        )
        .map(|_| ())
}

/// Run a pre-opened invocation for `runnable`, dispatching on its kind.
/// Recursive; boxed because async fns can't call themselves directly.
#[allow(clippy::too_many_arguments)]
fn execute_runnable(
    session: SharedSession,
    registry: Arc<ToolRegistry>,
    transfers: Arc<TransferRegistry>,
    runnable: Runnable,
    parent: Option<InvocationId>,
    root_fingerprint: Option<String>,
    handoff_origin: Option<HandoffOrigin>,
    loop_info: Option<(u32, u32)>,
    cancel: CancelToken,
    resume: Option<ResumeCursor>,
) -> Pin<Box<dyn Future<Output = Result<InvocationOutcome, EngineError>> + Send>> {
    Box::pin(async move {
        if let Some(cursor) = &resume {
            if let Some(existing) = cursor.matching_child(parent.as_ref()) {
                match existing.status {
                    InvocationStatus::Ended(EndReason::Completed)
                    | InvocationStatus::Ended(EndReason::Transferred)
                    | InvocationStatus::Ended(EndReason::MaxIterations) => {
                        return Ok(InvocationOutcome::Completed(None));
                    }
                    InvocationStatus::Yielded => {
                        let id = existing.id.clone();
                        session
                            .lock()
                            .await
                            .append_event(Some(id.clone()), EventKind::InvocationResume)?;
                        return resume_invocation(
                            session,
                            registry,
                            transfers,
                            runnable,
                            id.clone(),
                            cursor.descend(&id),
                            cancel,
                        )
                        .await;
                    }
                    InvocationStatus::Running
                        if matches!(runnable, Runnable::Sequence(_) | Runnable::Loop(_)) =>
                    {
                        let id = existing.id.clone();
                        tracing::debug!(invocation_id = %id, "resuming container invocation in place");
                        let outcome = resume_running_container(
                            session.clone(),
                            registry,
                            transfers,
                            runnable,
                            id.clone(),
                            cursor,
                            cancel,
                        )
                        .await;
                        return finish_invocation(&session, &id, outcome).await;
                    }
                    InvocationStatus::Ended(EndReason::Error)
                    | InvocationStatus::Ended(EndReason::Cancelled)
                    | InvocationStatus::Running => {
                        // Crashed or failed mid-run: fall through and re-execute
                        // fresh, same as a node that never started.
                    }
                }
            }
        }

        let invocation_id = open_invocation(
            &session,
            parent.clone(),
            runnable.kind(),
            runnable.name(),
            root_fingerprint,
            handoff_origin,
            loop_info,
        )
        .await?;

        let outcome = match &runnable {
            Runnable::Agent(spec) => {
                run_agent(&session, &registry, &transfers, &invocation_id, spec, &cancel, 0).await
            }
            Runnable::Step(step) => {
                let ctx = HandoffCtx {
                    session: session.clone(),
                    registry: registry.clone(),
                    transfers: transfers.clone(),
                    invocation_id: invocation_id.clone(),
                    cancel: cancel.clone(),
                };
                match (step.exec)(ctx).await {
                    Ok(StepOutcome::Void) | Ok(StepOutcome::Skip) => Ok(InvocationOutcome::Completed(None)),
                    Ok(StepOutcome::Respond(text)) => {
                        session
                            .lock()
                            .await
                            .append_event(
                                Some(invocation_id.clone()),
                                EventKind::Assistant { text: text.clone() },
                            )?;
                        Ok(InvocationOutcome::Completed(Some(Value::String(text))))
                    }
                    Ok(StepOutcome::Complete(value)) => Ok(InvocationOutcome::Completed(Some(value))),
                    Ok(StepOutcome::Route(next)) => Ok(InvocationOutcome::Transferred(next)),
                    Ok(StepOutcome::Fail(message)) => Err(EngineError::ToolFatal {
                        message,
                        invocation_id: Some(invocation_id.clone()),
                        call_id: String::new(),
                    }),
                    Err(err) => Err(err),
                }
            }
            Runnable::Sequence(seq) => {
                run_sequence(&session, &registry, &transfers, &invocation_id, seq, &cancel, resume.as_ref()).await
            }
            Runnable::Parallel(par) => {
                run_parallel(&session, &registry, &transfers, &invocation_id, par, &cancel).await
            }
            Runnable::Loop(lp) => {
                run_loop(&session, &registry, &transfers, &invocation_id, lp, &cancel, resume.as_ref()).await
            }
        };

        finish_invocation(&session, &invocation_id, outcome).await
    })
}

/// Resume a container invocation that never reached `InvocationEnd` before
/// the session yielded: only an `Agent` ever appends its own
/// `invocation_yield`, so a `Sequence`/`Loop` that was running when a
/// descendant yielded is still `Running` in the tree. Re-entering it through
/// the normal fresh-execution path would open a second invocation and
/// re-run every already-completed child; this reuses the existing id and
/// descends the cursor into its children instead.
#[allow(clippy::too_many_arguments)]
async fn resume_running_container(
    session: SharedSession,
    registry: Arc<ToolRegistry>,
    transfers: Arc<TransferRegistry>,
    runnable: Runnable,
    invocation_id: InvocationId,
    cursor: &ResumeCursor,
    cancel: CancelToken,
) -> Result<InvocationOutcome, EngineError> {
    let child_cursor = cursor.descend(&invocation_id);
    match &runnable {
        Runnable::Sequence(seq) => {
            run_sequence(&session, &registry, &transfers, &invocation_id, seq, &cancel, child_cursor.as_ref()).await
        }
        Runnable::Loop(lp) => {
            run_loop(&session, &registry, &transfers, &invocation_id, lp, &cancel, child_cursor.as_ref()).await
        }
        _ => unreachable!("resume_running_container is only called for Sequence/Loop"),
    }
}

/// Same as `execute_runnable` but for a node whose invocation id was
/// already allocated (`spawn`/`dispatch`, which must hand back the id
/// before the child actually starts).
#[allow(clippy::too_many_arguments)]
fn execute_runnable_with_id(
    session: SharedSession,
    registry: Arc<ToolRegistry>,
    transfers: Arc<TransferRegistry>,
    runnable: Runnable,
    parent: Option<InvocationId>,
    root_fingerprint: Option<String>,
    handoff_origin: Option<HandoffOrigin>,
    loop_info: Option<(u32, u32)>,
    cancel: CancelToken,
    resume: Option<ResumeCursor>,
    invocation_id: InvocationId,
) -> Pin<Box<dyn Future<Output = Result<InvocationOutcome, EngineError>> + Send>> {
    Box::pin(async move {
        session
            .lock()
            .await
            .append_event(
                Some(invocation_id.clone()),
                EventKind::InvocationStart(InvocationStartPayload {
                    agent_name: runnable.name().to_string(),
                    kind: runnable.kind(),
                    parent_invocation_id: parent,
                    fingerprint: root_fingerprint,
                    session_version: None,
                    handoff_origin,
                    loop_iteration: loop_info.map(|(i, _)| i),
                    loop_max: loop_info.map(|(_, m)| m),
                }),
            )?;

        let outcome = match &runnable {
            Runnable::Agent(spec) => {
                run_agent(&session, &registry, &transfers, &invocation_id, spec, &cancel, 0).await
            }
            Runnable::Step(step) => {
                let ctx = HandoffCtx {
                    session: session.clone(),
                    registry: registry.clone(),
                    transfers: transfers.clone(),
                    invocation_id: invocation_id.clone(),
                    cancel: cancel.clone(),
                };
                match (step.exec)(ctx).await {
                    Ok(outcome) => step_outcome_to_invocation(&session, &invocation_id, outcome).await,
                    Err(err) => Err(err),
                }
            }
            Runnable::Sequence(seq) => {
                run_sequence(&session, &registry, &transfers, &invocation_id, seq, &cancel, resume.as_ref()).await
            }
            Runnable::Parallel(par) => {
                run_parallel(&session, &registry, &transfers, &invocation_id, par, &cancel).await
            }
            Runnable::Loop(lp) => {
                run_loop(&session, &registry, &transfers, &invocation_id, lp, &cancel, resume.as_ref()).await
            }
        };

        finish_invocation(&session, &invocation_id, outcome).await
    })
}

async fn step_outcome_to_invocation(
    session: &SharedSession,
    invocation_id: &InvocationId,
    outcome: StepOutcome,
) -> Result<InvocationOutcome, EngineError> {
    match outcome {
        StepOutcome::Void | StepOutcome::Skip => Ok(InvocationOutcome::Completed(None)),
        StepOutcome::Respond(text) => {
            session
                .lock()
                .await
                .append_event(Some(invocation_id.clone()), EventKind::Assistant { text: text.clone() })?;
            Ok(InvocationOutcome::Completed(Some(Value::String(text))))
        }
        StepOutcome::Complete(value) => Ok(InvocationOutcome::Completed(Some(value))),
        StepOutcome::Route(next) => Ok(InvocationOutcome::Transferred(next)),
        StepOutcome::Fail(message) => Err(EngineError::ToolFatal {
            message,
            invocation_id: Some(invocation_id.clone()),
            call_id: String::new(),
        }),
    }
}

/// Build the wire-level pending-call list for a yielded outcome, looking up
/// each call's tool name from its `tool_yield` event.
fn pending_calls_with_names(session: &Session) -> Vec<loomrun_types::PendingCall> {
    session
        .pending_yielding_calls()
        .iter()
        .map(|call_id| {
            let name = session
                .events()
                .iter()
                .rev()
                .find_map(|e| match &e.kind {
                    EventKind::ToolYield(ToolYieldPayload { call_id: id, name, .. }) if id == call_id => {
                        Some(name.clone())
                    }
                    _ => None,
                })
                .unwrap_or_default();
            loomrun_types::PendingCall {
                call_id: call_id.clone(),
                name,
            }
        })
        .collect()
}

async fn finish_invocation(
    session: &SharedSession,
    invocation_id: &InvocationId,
    outcome: Result<InvocationOutcome, EngineError>,
) -> Result<InvocationOutcome, EngineError> {
    match outcome {
        Ok(InvocationOutcome::Completed(value)) => {
            close_invocation(session, invocation_id, EndReason::Completed, None).await?;
            Ok(InvocationOutcome::Completed(value))
        }
        Ok(InvocationOutcome::Yielded) => Ok(InvocationOutcome::Yielded),
        Ok(InvocationOutcome::Transferred(next)) => {
            let target = HandoffTarget {
                agent_name: next.name().to_string(),
                kind: next.kind(),
            };
            close_invocation(session, invocation_id, EndReason::Transferred, Some(target)).await?;
            Ok(InvocationOutcome::Transferred(next))
        }
        Err(err) => {
            tracing::warn!(invocation_id = %invocation_id, error = %err, "invocation ended in error");
            let _ = close_invocation(session, invocation_id, EndReason::Error, None).await;
            Err(err)
        }
    }
}

/// The agent step loop: render context, call the model, classify
/// and run tool calls, repeat until a terminal step or `max_iterations`.
/// `start_step` is 0 on a fresh invocation and one past the last
/// `model_start.step_index` the session recorded when continuing a
/// resumed agent, so `max_iterations` bounds the invocation's total step
/// budget rather than resetting it on every resume.
#[allow(clippy::too_many_arguments)]
async fn run_agent(
    session: &SharedSession,
    registry: &Arc<ToolRegistry>,
    transfers: &Arc<TransferRegistry>,
    invocation_id: &InvocationId,
    spec: &AgentSpec,
    cancel: &CancelToken,
    start_step: u32,
) -> Result<InvocationOutcome, EngineError> {
    let base_tools: Vec<loomrun_model::ToolSchema> = registry
        .schemas()
        .into_iter()
        .filter(|s| spec.tools.is_empty() || spec.tools.contains(&s.name))
        .map(|s| loomrun_model::ToolSchema {
            name: s.name,
            description: s.description,
            parameters: s.parameters,
        })
        .collect();

    for step_index in start_step..spec.max_iterations {
        if cancel.is_cancelled() {
            return Err(EngineError::Cancelled {
                invocation_id: invocation_id.clone(),
            });
        }

        tracing::debug!(invocation_id = %invocation_id, agent = %spec.name, step_index, "starting model step");
        let all_events = session.lock().await.events().to_vec();
        let mut render_ctx = spec
            .context
            .render(&all_events, invocation_id, &spec.name, base_tools.clone());
        if let Some(choice) = spec.tool_choice.clone() {
            render_ctx.tool_choice = choice;
        } else {
            render_ctx.tool_choice = ToolChoice::Auto;
        }
        render_ctx.output_schema = spec.output_schema.clone();
        let request: CompletionRequest = render_ctx.to_completion_request();

        session.lock().await.append_event(
            Some(invocation_id.clone()),
            EventKind::ModelStart(ModelStartPayload {
                message_count: request.messages.len(),
                tool_names: request.tools.iter().map(|t| t.name.clone()).collect(),
                output_schema: request.output_schema.clone(),
                step_index,
                model_name: spec.model.model_name().to_string(),
            }),
        )?;

        let started = std::time::Instant::now();
        let step_result = run_model_step(spec, request).await;
        let (text, thought, tool_calls, usage, finish_reason) = match step_result {
            Ok(result) => result,
            Err(err) => {
                tracing::warn!(invocation_id = %invocation_id, error = %err, "model step failed");
                session
                    .lock()
                    .await
                    .append_event(
                        Some(invocation_id.clone()),
                        EventKind::ModelEnd(ModelEndPayload {
                            duration_ms: started.elapsed().as_millis() as u64,
                            usage: EventUsage::default(),
                            finish_reason: loomrun_types::FinishReason::Error,
                            error: Some(err.to_string()),
                            model_name: spec.model.model_name().to_string(),
                        }),
                    )?;
                return Err(err);
            }
        };

        session.lock().await.append_event(
            Some(invocation_id.clone()),
            EventKind::ModelEnd(ModelEndPayload {
                duration_ms: started.elapsed().as_millis() as u64,
                usage: to_event_usage(usage),
                finish_reason: to_types_finish_reason(finish_reason),
                error: None,
                model_name: spec.model.model_name().to_string(),
            }),
        )?;

        if let Some(thought) = thought {
            session
                .lock()
                .await
                .append_event(Some(invocation_id.clone()), EventKind::Thought { text: thought, opaque: None })?;
        }

        if tool_calls.is_empty() {
            if !text.is_empty() {
                session
                    .lock()
                    .await
                    .append_event(Some(invocation_id.clone()), EventKind::Assistant { text: text.clone() })?;
            }
            let output = render_output(&spec.output_schema, &text, invocation_id)?;
            return Ok(InvocationOutcome::Completed(output));
        }

        if !text.is_empty() {
            session
                .lock()
                .await
                .append_event(Some(invocation_id.clone()), EventKind::Assistant { text: text.clone() })?;
        }

        match run_tool_calls(session, registry, transfers, invocation_id, &tool_calls).await? {
            ToolCallsOutcome::Continue => {}
            ToolCallsOutcome::Yielded => return Ok(InvocationOutcome::Yielded),
            ToolCallsOutcome::Transfer(next) => return Ok(InvocationOutcome::Transferred(next)),
        }
    }

    Err(EngineError::ModelFatal {
        message: format!("agent {} reached max_iterations ({})", spec.name, spec.max_iterations),
        invocation_id: Some(invocation_id.clone()),
    })
}

fn render_output(
    output_schema: &Option<Value>,
    text: &str,
    invocation_id: &InvocationId,
) -> Result<Option<Value>, EngineError> {
    match output_schema {
        None => Ok(if text.is_empty() {
            None
        } else {
            Some(Value::String(text.to_string()))
        }),
        Some(_) => serde_json::from_str::<Value>(text)
            .map(Some)
            .map_err(|e| EngineError::OutputParse {
                message: e.to_string(),
                invocation_id: Some(invocation_id.clone()),
            }),
    }
}

fn to_types_finish_reason(reason: loomrun_model::FinishReason) -> loomrun_types::FinishReason {
    match reason {
        loomrun_model::FinishReason::Stop => loomrun_types::FinishReason::Stop,
        loomrun_model::FinishReason::Length => loomrun_types::FinishReason::Length,
        loomrun_model::FinishReason::ToolCalls => loomrun_types::FinishReason::ToolCalls,
        loomrun_model::FinishReason::ContentFilter => loomrun_types::FinishReason::ContentFilter,
        loomrun_model::FinishReason::Error => loomrun_types::FinishReason::Error,
    }
}

type StepAccumulated = (
    String,
    Option<String>,
    Vec<loomrun_model::ToolCallOut>,
    loomrun_model::Usage,
    loomrun_model::FinishReason,
);

fn to_event_usage(usage: loomrun_model::Usage) -> EventUsage {
    EventUsage {
        input_tokens: usage.input_tokens,
        output_tokens: usage.output_tokens,
        cached_tokens: usage.cached_tokens,
        reasoning_tokens: usage.reasoning_tokens,
    }
}

async fn run_model_step(spec: &AgentSpec, request: CompletionRequest) -> Result<StepAccumulated, EngineError> {
    let mut stream = spec.model.step(request).await.map_err(|e| EngineError::ModelTransient {
        message: e.to_string(),
        invocation_id: None,
    })?;

    let mut text = String::new();
    let mut thought = String::new();
    let mut tool_calls = Vec::new();
    let mut usage = loomrun_model::Usage::default();
    let mut finish_reason = loomrun_model::FinishReason::Stop;

    while let Some(event) = stream.next().await {
        match event.map_err(|e| EngineError::ModelTransient {
            message: e.to_string(),
            invocation_id: None,
        })? {
            StreamEvent::TextDelta(delta) => text.push_str(&delta),
            StreamEvent::ThoughtDelta(delta) => thought.push_str(&delta),
            StreamEvent::ToolCall { call_id, name, args } => {
                finish_reason = loomrun_model::FinishReason::ToolCalls;
                tool_calls.push(loomrun_model::ToolCallOut { call_id, name, args });
            }
            StreamEvent::Usage(u) => usage = u,
            StreamEvent::Done => break,
        }
    }

    Ok((
        text,
        if thought.is_empty() { None } else { Some(thought) },
        tool_calls,
        usage,
        finish_reason,
    ))
}

/// What running one model step's tool calls produced.
enum ToolCallsOutcome {
    Continue,
    Yielded,
    Transfer(Runnable),
}

/// Classify and run every tool call from one model step. Non-yielding
/// calls execute concurrently with retry/timeout; yielding calls are
/// prepared and suspend the invocation. A non-yielding tool can also end
/// the invocation by returning [`ToolOutcome::Transfer`], resolved against
/// `transfers`; this takes priority over any yielding calls from the same
/// step, since a transfer ends the invocation outright.
async fn run_tool_calls(
    session: &SharedSession,
    registry: &Arc<ToolRegistry>,
    transfers: &Arc<TransferRegistry>,
    invocation_id: &InvocationId,
    calls: &[loomrun_model::ToolCallOut],
) -> Result<ToolCallsOutcome, EngineError> {
    let mut non_yielding: Vec<(EngineToolCall, Arc<dyn Tool>)> = Vec::new();
    let mut yielding: Vec<(EngineToolCall, Arc<dyn Tool>)> = Vec::new();

    for call in calls {
        let tool = registry.get(&call.name).ok_or_else(|| EngineError::ToolFatal {
            message: format!("no tool registered named {}", call.name),
            invocation_id: Some(invocation_id.clone()),
            call_id: call.call_id.clone(),
        })?;
        let engine_call = EngineToolCall {
            id: call.call_id.clone(),
            name: call.name.clone(),
            args: call.args.clone(),
        };
        session.lock().await.append_event(
            Some(invocation_id.clone()),
            EventKind::ToolCall(ToolCallPayload {
                call_id: engine_call.id.clone(),
                name: engine_call.name.clone(),
                args: engine_call.args.clone(),
                yields: tool.is_yielding(),
            }),
        )?;
        if tool.is_yielding() {
            yielding.push((engine_call, tool));
        } else {
            non_yielding.push((engine_call, tool));
        }
    }

    let policy = RetryPolicy::default();
    let results = futures::future::join_all(non_yielding.into_iter().map(|(call, tool)| {
        let policy = policy;
        async move {
            let started = std::time::Instant::now();
            let timeout = tool.timeout();
            let (result, retries) = policy
                .run(|| async {
                    match tokio::time::timeout(timeout, tool.execute(&call)).await {
                        Ok(inner) => inner,
                        Err(_) => Err(EngineError::ToolTransient {
                            message: "tool call timed out".into(),
                            invocation_id: None,
                            call_id: call.id.clone(),
                        }),
                    }
                })
                .await;
            (call, result, retries, started.elapsed().as_millis() as u64)
        }
    }))
    .await;

    let mut transfer_target: Option<String> = None;
    for (call, result, retries, duration_ms) in results {
        let (value, error) = match result {
            Ok(ToolOutcome::Value(v)) => (Some(v), None),
            Ok(ToolOutcome::Transfer(name)) => {
                tracing::debug!(invocation_id = %invocation_id, tool = %call.name, target = %name, "tool requested transfer");
                let logged = serde_json::json!({ "transfer": name });
                if transfer_target.is_none() {
                    transfer_target = Some(name);
                }
                (Some(logged), None)
            }
            Err(err) => {
                tracing::warn!(invocation_id = %invocation_id, tool = %call.name, error = %err, "tool call failed");
                (None, Some(err.to_string()))
            }
        };
        session.lock().await.append_event(
            Some(invocation_id.clone()),
            EventKind::ToolResult(ToolResultPayload {
                call_id: call.id.clone(),
                name: call.name.clone(),
                result: value,
                error,
                duration_ms,
                retry_count: Some(retries),
                timed_out: None,
            }),
        )?;
    }

    if let Some(name) = transfer_target {
        let target = transfers.get(&name).ok_or_else(|| EngineError::ToolFatal {
            message: format!("no transfer target registered named {name}"),
            invocation_id: Some(invocation_id.clone()),
            call_id: String::new(),
        })?;
        return Ok(ToolCallsOutcome::Transfer(target));
    }

    if yielding.is_empty() {
        return Ok(ToolCallsOutcome::Continue);
    }

    let mut pending_ids = Vec::new();
    for (call, tool) in yielding {
        let prepared = tool.prepare(&call).await?;
        session.lock().await.append_event(
            Some(invocation_id.clone()),
            EventKind::ToolYield(ToolYieldPayload {
                call_id: call.id.clone(),
                name: call.name.clone(),
                prepared_args: prepared,
            }),
        )?;
        pending_ids.push(call.id.clone());
    }

    session.lock().await.append_event(
        Some(invocation_id.clone()),
        EventKind::InvocationYield(InvocationYieldPayload {
            pending_call_ids: pending_ids,
            yield_index: 0,
        }),
    )?;
    Ok(ToolCallsOutcome::Yielded)
}

async fn run_sequence(
    session: &SharedSession,
    registry: &Arc<ToolRegistry>,
    transfers: &Arc<TransferRegistry>,
    invocation_id: &InvocationId,
    seq: &crate::runnable::SequenceSpec,
    cancel: &CancelToken,
    resume: Option<&ResumeCursor>,
) -> Result<InvocationOutcome, EngineError> {
    for child in &seq.children {
        let outcome = execute_runnable(
            session.clone(),
            registry.clone(),
            transfers.clone(),
            child.clone(),
            Some(invocation_id.clone()),
            None,
            None,
            None,
            cancel.linked_child(),
            resume.cloned(),
        )
        .await?;
        match outcome {
            InvocationOutcome::Completed(_) => continue,
            InvocationOutcome::Yielded => return Ok(InvocationOutcome::Yielded),
            InvocationOutcome::Transferred(next) => return Ok(InvocationOutcome::Transferred(next)),
        }
    }
    Ok(InvocationOutcome::Completed(None))
}

async fn run_parallel(
    session: &SharedSession,
    registry: &Arc<ToolRegistry>,
    transfers: &Arc<TransferRegistry>,
    invocation_id: &InvocationId,
    par: &crate::runnable::ParallelSpec,
    cancel: &CancelToken,
) -> Result<InvocationOutcome, EngineError> {
    let futures = par.children.iter().map(|child| {
        execute_runnable(
            session.clone(),
            registry.clone(),
            transfers.clone(),
            child.clone(),
            Some(invocation_id.clone()),
            None,
            None,
            None,
            cancel.linked_child(),
            None,
        )
    });
    let results = futures::future::join_all(futures).await;

    let mut completed_values = Vec::new();
    for result in results {
        match result? {
            InvocationOutcome::Completed(value) => completed_values.push(value.unwrap_or(Value::Null)),
            InvocationOutcome::Yielded => return Ok(InvocationOutcome::Yielded),
            InvocationOutcome::Transferred(next) => return Ok(InvocationOutcome::Transferred(next)),
        }
    }

    if let Some(merge) = &par.merge {
        let changes = merge(&completed_values);
        session
            .lock()
            .await
            .update_state(Some(invocation_id.clone()), crate::state::DEFAULT_SCOPE, changes, "parallel_merge")?;
    }

    Ok(InvocationOutcome::Completed(None))
}

async fn run_loop(
    session: &SharedSession,
    registry: &Arc<ToolRegistry>,
    transfers: &Arc<TransferRegistry>,
    invocation_id: &InvocationId,
    lp: &crate::runnable::LoopSpec,
    cancel: &CancelToken,
    resume: Option<&ResumeCursor>,
) -> Result<InvocationOutcome, EngineError> {
    let mut history: Vec<String> = Vec::new();

    for iteration in 0..lp.max_iterations {
        if !(lp.while_fn)(&history) {
            break;
        }
        let outcome = execute_runnable(
            session.clone(),
            registry.clone(),
            transfers.clone(),
            lp.inner.clone(),
            Some(invocation_id.clone()),
            None,
            None,
            Some((iteration, lp.max_iterations)),
            cancel.linked_child(),
            resume.cloned(),
        )
        .await?;
        match outcome {
            InvocationOutcome::Completed(value) => {
                history.push(value.map(|v| v.to_string()).unwrap_or_default());
            }
            InvocationOutcome::Yielded => {
                if lp.yields {
                    return Ok(InvocationOutcome::Yielded);
                }
                return Err(EngineError::ModelFatal {
                    message: format!("loop {} does not permit its body to yield", lp.name),
                    invocation_id: Some(invocation_id.clone()),
                });
            }
            InvocationOutcome::Transferred(next) => return Ok(InvocationOutcome::Transferred(next)),
        }
    }

    Ok(InvocationOutcome::Completed(None))
}

/// A read-only view over the pre-existing invocation tree used while
/// resuming, positioned at one parent's child list so each container can
/// match its Nth child against the Nth `invocation_start` the original run
/// recorded there.
#[derive(Clone)]
pub struct ResumeCursor {
    tree: Arc<std::collections::BTreeMap<InvocationId, InvocationNode>>,
    parent: Option<InvocationId>,
    siblings: Vec<InvocationId>,
    next_index: Arc<std::sync::atomic::AtomicUsize>,
}

impl ResumeCursor {
    pub fn new(
        tree: std::collections::BTreeMap<InvocationId, InvocationNode>,
        root_parent: Option<InvocationId>,
    ) -> Self {
        let tree = Arc::new(tree);
        let siblings = match &root_parent {
            Some(parent_id) => tree
                .get(parent_id)
                .map(|n| n.children.clone())
                .unwrap_or_default(),
            None => tree::roots(&tree),
        };
        Self {
            tree,
            parent: root_parent,
            siblings,
            next_index: Arc::new(std::sync::atomic::AtomicUsize::new(0)),
        }
    }

    fn for_children(
        tree: Arc<std::collections::BTreeMap<InvocationId, InvocationNode>>,
        parent_id: &InvocationId,
    ) -> Option<ResumeCursor> {
        let siblings = tree.get(parent_id)?.children.clone();
        Some(Self {
            tree,
            parent: Some(parent_id.clone()),
            siblings,
            next_index: Arc::new(std::sync::atomic::AtomicUsize::new(0)),
        })
    }

    fn matching_child(&self, expected_parent: Option<&InvocationId>) -> Option<InvocationNode> {
        if expected_parent != self.parent.as_ref() {
            return None;
        }
        let index = self
            .next_index
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        self.siblings
            .get(index)
            .and_then(|id| self.tree.get(id))
            .cloned()
    }

    /// A cursor scoped to the children of `matched`, for containers that
    /// need to keep resuming below themselves once their own invocation
    /// has been located in the prior run's tree.
    fn descend(&self, matched: &InvocationId) -> Option<ResumeCursor> {
        Self::for_children(self.tree.clone(), matched)
    }
}

/// Re-enter a yielded invocation: it must be an `Agent` (the only kind that
/// ever yields directly — containers only forward a child's yield), so
/// finalize its pending yielding tool calls against the now-present
/// `tool_input` events and continue the step loop.
async fn resume_invocation(
    session: SharedSession,
    registry: Arc<ToolRegistry>,
    transfers: Arc<TransferRegistry>,
    runnable: Runnable,
    invocation_id: InvocationId,
    _child_resume: Option<ResumeCursor>,
    cancel: CancelToken,
) -> Result<InvocationOutcome, EngineError> {
    let spec = match &runnable {
        Runnable::Agent(spec) => spec.clone(),
        _ => {
            return Err(EngineError::StateValidationError {
                scope: "resume".into(),
                key: invocation_id.to_string(),
                message: "only an agent invocation can be resumed directly".into(),
            })
        }
    };

    let pending: Vec<_> = session
        .lock()
        .await
        .pending_yielding_calls()
        .iter()
        .cloned()
        .collect();

    for call_id in pending {
        let input = {
            let guard = session.lock().await;
            guard
                .events()
                .iter()
                .rev()
                .find_map(|e| match &e.kind {
                    EventKind::ToolInput(ToolInputPayload { call_id: id, input }) if id == &call_id => {
                        Some(input.clone())
                    }
                    _ => None,
                })
        };
        let Some(input) = input else {
            continue;
        };
        let call_name = {
            let guard = session.lock().await;
            guard.events().iter().rev().find_map(|e| match &e.kind {
                EventKind::ToolYield(ToolYieldPayload { call_id: id, name, .. }) if id == &call_id => {
                    Some(name.clone())
                }
                _ => None,
            })
        };
        let Some(name) = call_name else { continue };
        let tool = registry.get(&name).ok_or_else(|| EngineError::ToolFatal {
            message: format!("no tool registered named {name}"),
            invocation_id: Some(invocation_id.clone()),
            call_id: call_id.clone(),
        })?;
        let engine_call = EngineToolCall {
            id: call_id.clone(),
            name: name.clone(),
            args: Value::Null,
        };
        let started = std::time::Instant::now();
        let result = tool.finalize(&engine_call, input).await;
        let (value, error) = match result {
            Ok(value) => (Some(value), None),
            Err(err) => (None, Some(err.to_string())),
        };
        session.lock().await.append_event(
            Some(invocation_id.clone()),
            EventKind::ToolResult(ToolResultPayload {
                call_id,
                name,
                result: value,
                error,
                duration_ms: started.elapsed().as_millis() as u64,
                retry_count: Some(0),
                timed_out: None,
            }),
        )?;
    }

    let start_step = {
        let guard = session.lock().await;
        last_model_step_index(guard.events(), &invocation_id)
            .map(|i| i + 1)
            .unwrap_or(0)
    };

    run_agent(&session, &registry, &transfers, &invocation_id, &spec, &cancel, start_step).await
}

/// The step index one past the last `model_start` this invocation recorded,
/// so a resumed agent continues its step budget instead of restarting it.
fn last_model_step_index(
    events: &[loomrun_types::Event],
    invocation_id: &InvocationId,
) -> Option<u32> {
    events.iter().rev().find_map(|e| match (&e.invocation_id, &e.kind) {
        (Some(id), EventKind::ModelStart(ModelStartPayload { step_index, .. })) if id == invocation_id => {
            Some(*step_index)
        }
        _ => None,
    })
}

/// Entry point: run `runnable` from scratch in `session`. The caller
/// always supplies the in-memory definition; the engine never tries to
/// reconstruct closures or model instances from the log.
pub async fn run(
    session: SharedSession,
    registry: Arc<ToolRegistry>,
    transfers: Arc<TransferRegistry>,
    runnable: Runnable,
) -> Result<RunResult, EngineError> {
    run_with_origin(session, registry, transfers, runnable, None).await
}

/// Shared body of `run()` and the `resume()` transfer-continuation path:
/// `initial_origin` carries the `HandoffOrigin` of the transfer that led
/// here, if any, so the freshly opened root invocation records where it
/// came from instead of looking like a fresh top-level run.
async fn run_with_origin(
    session: SharedSession,
    registry: Arc<ToolRegistry>,
    transfers: Arc<TransferRegistry>,
    mut runnable: Runnable,
    mut pending_origin: Option<HandoffOrigin>,
) -> Result<RunResult, EngineError> {
    let root_fingerprint = fingerprint(&runnable);
    let cancel = CancelToken::new();
    let session_id = session.lock().await.id.clone();

    loop {
        let invocation_id = open_invocation(
            &session,
            None,
            runnable.kind(),
            runnable.name(),
            Some(root_fingerprint.clone()),
            pending_origin.take(),
            None,
        )
        .await?;

        let outcome = match &runnable {
            Runnable::Agent(spec) => {
                run_agent(&session, &registry, &transfers, &invocation_id, spec, &cancel, 0).await
            }
            Runnable::Step(step) => {
                let ctx = HandoffCtx {
                    session: session.clone(),
                    registry: registry.clone(),
                    transfers: transfers.clone(),
                    invocation_id: invocation_id.clone(),
                    cancel: cancel.clone(),
                };
                match (step.exec)(ctx).await {
                    Ok(outcome) => step_outcome_to_invocation(&session, &invocation_id, outcome).await,
                    Err(err) => Err(err),
                }
            }
            Runnable::Sequence(seq) => {
                run_sequence(&session, &registry, &transfers, &invocation_id, seq, &cancel, None).await
            }
            Runnable::Parallel(par) => {
                run_parallel(&session, &registry, &transfers, &invocation_id, par, &cancel).await
            }
            Runnable::Loop(lp) => {
                run_loop(&session, &registry, &transfers, &invocation_id, lp, &cancel, None).await
            }
        };

        let outcome = finish_invocation(&session, &invocation_id, outcome).await;

        match outcome {
            Ok(InvocationOutcome::Completed(output)) => {
                return Ok(RunResult {
                    session_id,
                    outcome: RunOutcome::Completed { output },
                })
            }
            Ok(InvocationOutcome::Yielded) => {
                let guard = session.lock().await;
                let pending_calls = pending_calls_with_names(&guard);
                let yielded_invocation_id = guard
                    .events()
                    .iter()
                    .rev()
                    .find_map(|e| match &e.kind {
                        EventKind::InvocationYield(_) => e.invocation_id.clone(),
                        _ => None,
                    })
                    .unwrap_or(invocation_id);
                return Ok(RunResult {
                    session_id,
                    outcome: RunOutcome::Yielded {
                        pending_calls,
                        awaiting_input: true,
                        yielded_invocation_id,
                    },
                });
            }
            Ok(InvocationOutcome::Transferred(next)) => {
                pending_origin = Some(HandoffOrigin {
                    kind: HandoffKind::Transfer,
                    call_id: None,
                    invocation_id: invocation_id.clone(),
                });
                runnable = next;
                continue;
            }
            Err(err) => {
                let iterations = session.lock().await.events().len() as u32;
                return Ok(RunResult {
                    session_id,
                    outcome: RunOutcome::Error {
                        error: err.to_string(),
                        partial_events: iterations as usize,
                        iterations,
                    },
                });
            }
        }
    }
}

/// Resume a previously yielded session. `runnable` must be
/// structurally identical to what `run()` was originally called with, or
/// `PipelineStructureChanged` is returned.
pub async fn resume(
    session: SharedSession,
    registry: Arc<ToolRegistry>,
    transfers: Arc<TransferRegistry>,
    runnable: Runnable,
) -> Result<RunResult, EngineError> {
    let current_fingerprint = fingerprint(&runnable);
    let (events, session_id) = {
        let guard = session.lock().await;
        (guard.events().to_vec(), guard.id.clone())
    };

    let stored_fingerprint = events.iter().find_map(|e| match &e.kind {
        EventKind::InvocationStart(InvocationStartPayload {
            fingerprint: Some(fp),
            parent_invocation_id: None,
            ..
        }) => Some(fp.clone()),
        _ => None,
    });

    if let Some(stored) = stored_fingerprint {
        if stored != current_fingerprint {
            return Err(EngineError::PipelineStructureChanged {
                session_id,
                stored_fingerprint: stored,
                current_fingerprint,
            });
        }
    }

    let built = tree::build_tree(&events);
    let cancel = CancelToken::new();
    let cursor = ResumeCursor::new(built, None);

    let outcome = execute_runnable(
        session.clone(),
        registry.clone(),
        transfers.clone(),
        runnable,
        None,
        None,
        None,
        None,
        cancel,
        Some(cursor),
    )
    .await;

    match outcome {
        Ok(InvocationOutcome::Completed(output)) => Ok(RunResult {
            session_id,
            outcome: RunOutcome::Completed { output },
        }),
        Ok(InvocationOutcome::Yielded) => {
            let guard = session.lock().await;
            let pending_calls = pending_calls_with_names(&guard);
            let yielded_invocation_id = guard
                .events()
                .iter()
                .rev()
                .find_map(|e| match &e.kind {
                    EventKind::InvocationYield(_) => e.invocation_id.clone(),
                    _ => None,
                })
                .unwrap_or_else(|| InvocationId::from_seq(0));
            Ok(RunResult {
                session_id,
                outcome: RunOutcome::Yielded {
                    pending_calls,
                    awaiting_input: true,
                    yielded_invocation_id,
                },
            })
        }
        Ok(InvocationOutcome::Transferred(next)) => {
            let origin = {
                let guard = session.lock().await;
                last_transferred_invocation_id(guard.events())
            }
            .map(|id| HandoffOrigin {
                kind: HandoffKind::Transfer,
                call_id: None,
                invocation_id: id,
            });
            run_with_origin(session, registry, transfers, next, origin).await
        }
        Err(err) => {
            let iterations = session.lock().await.events().len() as u32;
            Ok(RunResult {
                session_id,
                outcome: RunOutcome::Error {
                    error: err.to_string(),
                    partial_events: iterations as usize,
                    iterations,
                },
            })
        }
    }
}

/// The invocation id of the most recent transfer, for carrying a
/// `HandoffOrigin` across the root-level continuation `resume()` performs
/// when a transfer ends the resumed invocation outright.
fn last_transferred_invocation_id(events: &[loomrun_types::Event]) -> Option<InvocationId> {
    events.iter().rev().find_map(|e| match &e.kind {
        EventKind::InvocationEnd(InvocationEndPayload {
            reason: EndReason::Transferred,
            ..
        }) => e.invocation_id.clone(),
        _ => None,
    })
}
