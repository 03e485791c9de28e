use std::collections::HashSet;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::AsyncWriteExt;

use loomrun_types::{
    CallId, EngineError, Event, EventId, EventKind, IdSequence, InvocationId, StateChangeEntry,
    ToolInputPayload,
};

use crate::state::{self, StateSchema, StateStore, DEFAULT_SCOPE};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Idle,
    Running,
    AwaitingInput,
    Completed,
    Error,
}

/// The unit of isolation for one run. Owns the append-only event
/// log, the derived state store, and the `pendingYieldingCalls` index.
/// `loomrun-core::supervisor` is the only code that appends events; this
/// struct enforces the append-only and pending-call invariants regardless
/// of who calls it.
#[derive(Debug)]
pub struct Session {
    pub id: String,
    pub app_name: String,
    pub version: Option<String>,
    events: Vec<Event>,
    ids: IdSequence,
    invocation_seq: u64,
    state: StateStore,
    schema: StateSchema,
    pub status: SessionStatus,
    pending_yielding_calls: HashSet<CallId>,
}

impl Session {
    pub fn new(id: impl Into<String>, app_name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            app_name: app_name.into(),
            version: None,
            events: Vec::new(),
            ids: IdSequence::new(),
            invocation_seq: 0,
            state: StateStore::new(),
            schema: StateSchema::new(),
            status: SessionStatus::Idle,
            pending_yielding_calls: HashSet::new(),
        }
    }

    /// Attach a schema validating future `write_state`/`update_state` calls.
    /// Keys with no registered validator are left unvalidated, so this is
    /// safe to call with a schema that only covers a subset of state keys.
    pub fn with_schema(mut self, schema: StateSchema) -> Self {
        self.schema = schema;
        self
    }

    pub fn set_schema(&mut self, schema: StateSchema) {
        self.schema = schema;
    }

    /// Allocate the next invocation id. Separate counter from the event
    /// log's `IdSequence`: an invocation spans many events that all share
    /// one id.
    pub fn next_invocation_id(&mut self) -> InvocationId {
        let seq = self.invocation_seq;
        self.invocation_seq += 1;
        InvocationId::from_seq(seq)
    }

    /// Rebuild a session in memory from a persisted event log (used by
    /// `SessionService::load_session`). Recomputes the ID sequence's
    /// high-water mark, the state store, and `pendingYieldingCalls`.
    pub fn rehydrate(id: impl Into<String>, app_name: impl Into<String>, events: Vec<Event>) -> Self {
        let mut session = Self::new(id, app_name);
        let high_seq = events.len() as u64;
        session.state = state::replay_state(&events);
        session.pending_yielding_calls = pending_calls_from(&events);
        session.status = if session.pending_yielding_calls.is_empty() {
            SessionStatus::Idle
        } else {
            SessionStatus::AwaitingInput
        };
        session.invocation_seq = events
            .iter()
            .filter_map(|e| e.invocation_id.as_ref())
            .filter_map(|id| id.as_str().strip_prefix("inv-"))
            .filter_map(|digits| digits.parse::<u64>().ok())
            .map(|seq| seq + 1)
            .max()
            .unwrap_or(0);
        session.events = events;
        session.ids = IdSequence::resume_after(high_seq.saturating_sub(1));
        session
    }

    pub fn events(&self) -> &[Event] {
        &self.events
    }

    pub fn state(&self) -> &StateStore {
        &self.state
    }

    pub fn pending_yielding_calls(&self) -> &HashSet<CallId> {
        &self.pending_yielding_calls
    }

    /// Assigns `id`/`created_at` and validates the invocation-zone rule
    /// before pushing onto the log.
    pub fn append_event(
        &mut self,
        invocation_id: Option<InvocationId>,
        kind: EventKind,
    ) -> Result<&Event, EngineError> {
        if invocation_id.is_none() && !kind.allows_no_invocation() {
            return Err(EngineError::StateValidationError {
                scope: "event_log".into(),
                key: kind.label().into(),
                message: "only user/system events may omit invocation_id".into(),
            });
        }
        if let EventKind::ToolResult(ref payload) = kind {
            let has_call = self.events.iter().any(|e| {
                matches!(&e.kind, EventKind::ToolCall(c) if c.call_id == payload.call_id)
            });
            if !has_call {
                return Err(EngineError::OrphanResult {
                    call_id: payload.call_id.clone(),
                });
            }
        }

        match &kind {
            EventKind::ToolYield(payload) => {
                self.pending_yielding_calls.insert(payload.call_id.clone());
            }
            EventKind::ToolInput(payload) => {
                self.pending_yielding_calls.remove(&payload.call_id);
            }
            EventKind::StateChange { scope, changes, .. } => {
                self.state.apply(scope, changes);
            }
            _ => {}
        }

        let event = Event {
            id: self.ids.next_event_id(),
            created_at: Utc::now(),
            invocation_id,
            kind,
        };
        self.events.push(event);
        Ok(self.events.last().expect("just pushed"))
    }

    /// Convenience wrapper over `append_event` for seed user turns.
    pub fn add_message(&mut self, text: impl Into<String>) -> Result<&Event, EngineError> {
        self.append_event(None, EventKind::User { text: text.into() })
    }

    /// Answers a pending yielding call with external input. Fails
    /// `UnknownPendingCall` if `call_id` isn't pending.
    pub fn add_tool_input(
        &mut self,
        invocation_id: InvocationId,
        call_id: CallId,
        input: Value,
    ) -> Result<&Event, EngineError> {
        if !self.pending_yielding_calls.contains(&call_id) {
            return Err(EngineError::UnknownPendingCall { call_id });
        }
        self.append_event(
            Some(invocation_id),
            EventKind::ToolInput(ToolInputPayload { call_id, input }),
        )
    }

    /// Writes one state key. No-ops (no event, `Ok(())`) if the value is
    /// unchanged.
    pub fn write_state(
        &mut self,
        invocation_id: Option<InvocationId>,
        scope: &str,
        key: &str,
        value: Option<Value>,
        source: &str,
    ) -> Result<(), EngineError> {
        if let Some(v) = &value {
            self.schema
                .validate(scope, key, v)
                .map_err(|message| EngineError::StateValidationError {
                    scope: scope.to_string(),
                    key: key.to_string(),
                    message,
                })?;
        }
        let Some(change) = self.state.stage_write(scope, key, value) else {
            return Ok(());
        };
        self.append_event(
            invocation_id,
            EventKind::StateChange {
                scope: scope.to_string(),
                source: source.to_string(),
                changes: vec![change],
            },
        )?;
        Ok(())
    }

    /// Atomic batch write: either every change commits as one
    /// `state_change` event, or (if nothing actually changed) no event at
    /// all.
    pub fn update_state(
        &mut self,
        invocation_id: Option<InvocationId>,
        scope: &str,
        writes: Vec<(String, Option<Value>)>,
        source: &str,
    ) -> Result<(), EngineError> {
        for (key, value) in &writes {
            if let Some(v) = value {
                self.schema
                    .validate(scope, key, v)
                    .map_err(|message| EngineError::StateValidationError {
                        scope: scope.to_string(),
                        key: key.clone(),
                        message,
                    })?;
            }
        }
        let changes: Vec<StateChangeEntry> = writes
            .into_iter()
            .filter_map(|(key, value)| self.state.stage_write(scope, &key, value))
            .collect();
        if changes.is_empty() {
            return Ok(());
        }
        self.append_event(
            invocation_id,
            EventKind::StateChange {
                scope: scope.to_string(),
                source: source.to_string(),
                changes,
            },
        )?;
        Ok(())
    }

    pub fn delete_state(
        &mut self,
        invocation_id: Option<InvocationId>,
        scope: &str,
        key: &str,
        source: &str,
    ) -> Result<(), EngineError> {
        self.write_state(invocation_id, scope, key, None, source)
    }

    pub fn read_state(&self, scope: &str, key: &str) -> Option<&Value> {
        self.state.get(scope, key)
    }
}

fn pending_calls_from(events: &[Event]) -> HashSet<CallId> {
    let mut pending = HashSet::new();
    for event in events {
        match &event.kind {
            EventKind::ToolYield(p) => {
                pending.insert(p.call_id.clone());
            }
            EventKind::ToolInput(p) => {
                pending.remove(&p.call_id);
            }
            _ => {}
        }
    }
    pending
}

/// Persisted snapshot of everything needed to rehydrate a `Session`.
#[derive(Debug, Serialize, Deserialize)]
struct PersistedSession {
    id: String,
    app_name: String,
}

/// Abstract session-service contract. Backed concretely by
/// `JsonlSessionService`.
#[async_trait]
pub trait SessionService: Send + Sync {
    async fn create_session(&self, app_name: &str) -> Result<Session, EngineError>;
    async fn load_session(&self, session_id: &str) -> Result<Session, EngineError>;
    async fn save_session(&self, session: &Session) -> Result<(), EngineError>;
    async fn list_sessions(&self, app_name: &str) -> Result<Vec<String>, EngineError>;
}

/// `events.jsonl` (append-only log, one `Event` per line) + `state.json`
/// (the app/session metadata needed to rehydrate) per session directory.
pub struct JsonlSessionService {
    root: PathBuf,
}

impl JsonlSessionService {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn session_dir(&self, session_id: &str) -> PathBuf {
        self.root.join(session_id)
    }

    fn events_path(&self, session_id: &str) -> PathBuf {
        self.session_dir(session_id).join("events.jsonl")
    }

    fn meta_path(&self, session_id: &str) -> PathBuf {
        self.session_dir(session_id).join("session.json")
    }

    fn io_error(context: &str, err: std::io::Error) -> EngineError {
        EngineError::StateValidationError {
            scope: "session_service".into(),
            key: context.into(),
            message: err.to_string(),
        }
    }

    async fn read_events(path: &Path) -> Result<Vec<Event>, EngineError> {
        if !path.exists() {
            return Ok(Vec::new());
        }
        let text = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| Self::io_error("read events.jsonl", e))?;
        text.lines()
            .filter(|l| !l.trim().is_empty())
            .map(|line| {
                serde_json::from_str::<Event>(line).map_err(|e| EngineError::StateValidationError {
                    scope: "session_service".into(),
                    key: "events.jsonl".into(),
                    message: e.to_string(),
                })
            })
            .collect()
    }
}

#[async_trait]
impl SessionService for JsonlSessionService {
    async fn create_session(&self, app_name: &str) -> Result<Session, EngineError> {
        let id = uuid::Uuid::new_v4().to_string();
        tokio::fs::create_dir_all(self.session_dir(&id))
            .await
            .map_err(|e| Self::io_error("create session dir", e))?;
        Ok(Session::new(id, app_name))
    }

    async fn load_session(&self, session_id: &str) -> Result<Session, EngineError> {
        let meta_text = tokio::fs::read_to_string(self.meta_path(session_id))
            .await
            .map_err(|e| Self::io_error("read session.json", e))?;
        let meta: PersistedSession =
            serde_json::from_str(&meta_text).map_err(|e| EngineError::StateValidationError {
                scope: "session_service".into(),
                key: "session.json".into(),
                message: e.to_string(),
            })?;
        let events = Self::read_events(&self.events_path(session_id)).await?;
        Ok(Session::rehydrate(meta.id, meta.app_name, events))
    }

    async fn save_session(&self, session: &Session) -> Result<(), EngineError> {
        tokio::fs::create_dir_all(self.session_dir(&session.id))
            .await
            .map_err(|e| Self::io_error("create session dir", e))?;

        let meta = PersistedSession {
            id: session.id.clone(),
            app_name: session.app_name.clone(),
        };
        let meta_json = serde_json::to_string_pretty(&meta).expect("meta always serializes");
        tokio::fs::write(self.meta_path(&session.id), meta_json)
            .await
            .map_err(|e| Self::io_error("write session.json", e))?;

        let mut file = tokio::fs::File::create(self.events_path(&session.id))
            .await
            .map_err(|e| Self::io_error("create events.jsonl", e))?;
        for event in &session.events {
            let line = serde_json::to_string(event).expect("event always serializes");
            file.write_all(line.as_bytes())
                .await
                .map_err(|e| Self::io_error("write events.jsonl", e))?;
            file.write_all(b"\n")
                .await
                .map_err(|e| Self::io_error("write events.jsonl", e))?;
        }
        Ok(())
    }

    async fn list_sessions(&self, _app_name: &str) -> Result<Vec<String>, EngineError> {
        let mut ids = Vec::new();
        let mut entries = match tokio::fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(ids),
            Err(e) => return Err(Self::io_error("list sessions", e)),
        };
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| Self::io_error("list sessions", e))?
        {
            if entry.path().join("session.json").exists() {
                if let Some(name) = entry.file_name().to_str() {
                    ids.push(name.to_string());
                }
            }
        }
        ids.sort();
        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn add_message_allows_missing_invocation() {
        let mut session = Session::new("s1", "test");
        let event = session.add_message("hello").unwrap();
        assert_eq!(event.invocation_id, None);
    }

    #[test]
    fn tool_call_requires_invocation() {
        let mut session = Session::new("s1", "test");
        let err = session
            .append_event(
                None,
                EventKind::ToolCall(loomrun_types::ToolCallPayload {
                    call_id: "c1".into(),
                    name: "calculate".into(),
                    args: Value::Null,
                    yields: false,
                }),
            )
            .unwrap_err();
        assert!(matches!(err, EngineError::StateValidationError { .. }));
    }

    #[test]
    fn add_tool_input_fails_for_unknown_call() {
        let mut session = Session::new("s1", "test");
        let err = session
            .add_tool_input(InvocationId::from_seq(0), "nope".into(), Value::Null)
            .unwrap_err();
        assert!(matches!(err, EngineError::UnknownPendingCall { .. }));
    }

    #[test]
    fn tool_yield_then_input_clears_pending() {
        let mut session = Session::new("s1", "test");
        let inv = InvocationId::from_seq(0);
        session
            .append_event(
                Some(inv.clone()),
                EventKind::ToolYield(loomrun_types::ToolYieldPayload {
                    call_id: "c1".into(),
                    name: "request_approval".into(),
                    prepared_args: Value::Null,
                }),
            )
            .unwrap();
        assert!(session.pending_yielding_calls().contains("c1"));
        session
            .add_tool_input(inv, "c1".into(), serde_json::json!({"approved": true}))
            .unwrap();
        assert!(!session.pending_yielding_calls().contains("c1"));
    }

    #[test]
    fn orphan_tool_result_is_rejected() {
        let mut session = Session::new("s1", "test");
        let inv = InvocationId::from_seq(0);
        let err = session
            .append_event(
                Some(inv),
                EventKind::ToolResult(loomrun_types::ToolResultPayload {
                    call_id: "c1".into(),
                    name: "calculate".into(),
                    result: None,
                    error: None,
                    duration_ms: 0,
                    retry_count: None,
                    timed_out: None,
                }),
            )
            .unwrap_err();
        assert!(matches!(err, EngineError::OrphanResult { .. }));
    }

    #[test]
    fn write_state_rejects_value_failing_schema() {
        let mut schema = StateSchema::new();
        schema.register(
            DEFAULT_SCOPE,
            "x",
            Arc::new(|v| if v.is_number() { Ok(()) } else { Err("x must be a number".into()) }),
        );
        let mut session = Session::new("s1", "test").with_schema(schema);
        let err = session
            .write_state(None, DEFAULT_SCOPE, "x", Some(Value::from("nope")), "system")
            .unwrap_err();
        assert!(matches!(err, EngineError::StateValidationError { .. }));
        assert_eq!(session.read_state(DEFAULT_SCOPE, "x"), None);
    }

    #[test]
    fn update_state_rejects_whole_batch_if_any_value_fails_schema() {
        let mut schema = StateSchema::new();
        schema.register(
            DEFAULT_SCOPE,
            "y",
            Arc::new(|v| if v.is_number() { Ok(()) } else { Err("y must be a number".into()) }),
        );
        let mut session = Session::new("s1", "test").with_schema(schema);
        let err = session
            .update_state(
                None,
                DEFAULT_SCOPE,
                vec![("x".into(), Some(Value::from(1))), ("y".into(), Some(Value::from("nope")))],
                "system",
            )
            .unwrap_err();
        assert!(matches!(err, EngineError::StateValidationError { .. }));
        assert_eq!(session.read_state(DEFAULT_SCOPE, "x"), None);
    }

    #[test]
    fn write_state_is_a_noop_for_identical_value() {
        let mut session = Session::new("s1", "test");
        let before = session.events().len();
        session
            .write_state(None, DEFAULT_SCOPE, "x", None, "system")
            .unwrap();
        assert_eq!(session.events().len(), before);
    }

    #[test]
    fn update_state_commits_one_event_for_multiple_changes() {
        let mut session = Session::new("s1", "test");
        session
            .update_state(
                None,
                DEFAULT_SCOPE,
                vec![
                    ("x".into(), Some(Value::from(1))),
                    ("y".into(), Some(Value::from(2))),
                ],
                "system",
            )
            .unwrap();
        assert_eq!(session.events().len(), 1);
        assert_eq!(session.read_state(DEFAULT_SCOPE, "x"), Some(&Value::from(1)));
        assert_eq!(session.read_state(DEFAULT_SCOPE, "y"), Some(&Value::from(2)));
    }

    #[test]
    fn rehydrate_rebuilds_pending_calls_and_state() {
        let mut session = Session::new("s1", "test");
        let inv = InvocationId::from_seq(0);
        session
            .append_event(
                Some(inv.clone()),
                EventKind::ToolYield(loomrun_types::ToolYieldPayload {
                    call_id: "c1".into(),
                    name: "request_approval".into(),
                    prepared_args: Value::Null,
                }),
            )
            .unwrap();
        session
            .update_state(Some(inv), DEFAULT_SCOPE, vec![("x".into(), Some(Value::from(1)))], "system")
            .unwrap();

        let rebuilt = Session::rehydrate("s1", "test", session.events().to_vec());
        assert!(rebuilt.pending_yielding_calls().contains("c1"));
        assert_eq!(rebuilt.read_state(DEFAULT_SCOPE, "x"), Some(&Value::from(1)));
        assert_eq!(rebuilt.status, SessionStatus::AwaitingInput);
    }
}
