use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde_json::Value;

use loomrun_types::{Event, EventKind, StateChangeEntry};

/// The scope every write lands in unless a caller names another.
pub const DEFAULT_SCOPE: &str = "session";

/// Scoped key/value state. Pure data — the Session is the only thing
/// that mutates it, always in lockstep with appending the matching
/// `state_change` event.
#[derive(Debug, Default, Clone)]
pub struct StateStore {
    scopes: BTreeMap<String, BTreeMap<String, Value>>,
}

impl StateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, scope: &str, key: &str) -> Option<&Value> {
        self.scopes.get(scope).and_then(|m| m.get(key))
    }

    /// A read-only view of every key in a scope, for tests and debugging.
    pub fn snapshot(&self, scope: &str) -> BTreeMap<String, Value> {
        self.scopes.get(scope).cloned().unwrap_or_default()
    }

    /// Compute the change entry a write would produce, or `None` if the new
    /// value is structurally equal to the old one — no event is emitted in
    /// that case.
    pub fn stage_write(
        &self,
        scope: &str,
        key: &str,
        new_value: Option<Value>,
    ) -> Option<StateChangeEntry> {
        let old_value = self.get(scope, key).cloned();
        if old_value == new_value {
            return None;
        }
        Some(StateChangeEntry {
            key: key.to_string(),
            old_value,
            new_value,
        })
    }

    /// Apply changes already committed to the log.
    pub fn apply(&mut self, scope: &str, changes: &[StateChangeEntry]) {
        let map = self.scopes.entry(scope.to_string()).or_default();
        for change in changes {
            match &change.new_value {
                Some(v) => {
                    map.insert(change.key.clone(), v.clone());
                }
                None => {
                    map.remove(&change.key);
                }
            }
        }
    }
}

/// Rebuild state by folding every `state_change` event from an empty store.
pub fn replay_state(events: &[Event]) -> StateStore {
    let mut store = StateStore::new();
    for event in events {
        if let EventKind::StateChange { scope, changes, .. } = &event.kind {
            store.apply(scope, changes);
        }
    }
    store
}

/// Rebuild state up to and including the event at `upto` (inclusive), used
/// by resume to reproduce the state a yielded invocation last saw.
pub fn replay_state_upto(events: &[Event], upto: usize) -> StateStore {
    replay_state(&events[..=upto.min(events.len().saturating_sub(1))])
}

type Validator = Arc<dyn Fn(&Value) -> Result<(), String> + Send + Sync>;

/// Optional typed guard on state writes. A write whose validator returns
/// `Err` commits nothing
/// and emits no event.
#[derive(Default, Clone)]
pub struct StateSchema {
    validators: BTreeMap<(String, String), Validator>,
}

impl fmt::Debug for StateSchema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StateSchema")
            .field("keys", &self.validators.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl StateSchema {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        scope: impl Into<String>,
        key: impl Into<String>,
        validator: Validator,
    ) {
        self.validators.insert((scope.into(), key.into()), validator);
    }

    pub fn validate(&self, scope: &str, key: &str, value: &Value) -> Result<(), String> {
        match self.validators.get(&(scope.to_string(), key.to_string())) {
            Some(v) => v(value),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use loomrun_types::{EventId, InvocationId};

    fn evt(scope: &str, changes: Vec<StateChangeEntry>) -> Event {
        Event {
            id: EventId::zero(),
            created_at: chrono::Utc::now(),
            invocation_id: Some(InvocationId::from_seq(0)),
            kind: EventKind::StateChange {
                scope: scope.to_string(),
                source: "test".into(),
                changes,
            },
        }
    }

    #[test]
    fn write_of_identical_value_produces_no_change() {
        let mut store = StateStore::new();
        store.apply(
            DEFAULT_SCOPE,
            &[StateChangeEntry {
                key: "x".into(),
                old_value: None,
                new_value: Some(Value::from(1)),
            }],
        );
        assert!(store
            .stage_write(DEFAULT_SCOPE, "x", Some(Value::from(1)))
            .is_none());
    }

    #[test]
    fn write_of_new_value_stages_old_and_new() {
        let store = StateStore::new();
        let change = store
            .stage_write(DEFAULT_SCOPE, "x", Some(Value::from(1)))
            .unwrap();
        assert_eq!(change.old_value, None);
        assert_eq!(change.new_value, Some(Value::from(1)));
    }

    #[test]
    fn delete_stages_new_value_none() {
        let mut store = StateStore::new();
        store.apply(
            DEFAULT_SCOPE,
            &[StateChangeEntry {
                key: "x".into(),
                old_value: None,
                new_value: Some(Value::from(1)),
            }],
        );
        let change = store.stage_write(DEFAULT_SCOPE, "x", None).unwrap();
        assert_eq!(change.new_value, None);
    }

    #[test]
    fn replay_reproduces_final_state() {
        let events = vec![
            evt(
                DEFAULT_SCOPE,
                vec![StateChangeEntry {
                    key: "x".into(),
                    old_value: None,
                    new_value: Some(Value::from(1)),
                }],
            ),
            evt(
                DEFAULT_SCOPE,
                vec![StateChangeEntry {
                    key: "x".into(),
                    old_value: Some(Value::from(1)),
                    new_value: Some(Value::from(2)),
                }],
            ),
        ];
        let store = replay_state(&events);
        assert_eq!(store.get(DEFAULT_SCOPE, "x"), Some(&Value::from(2)));
    }

    #[test]
    fn schema_validation_rejects_bad_value() {
        let mut schema = StateSchema::new();
        schema.register(
            DEFAULT_SCOPE,
            "x",
            Arc::new(|v| {
                if v.is_number() {
                    Ok(())
                } else {
                    Err("x must be a number".into())
                }
            }),
        );
        assert!(schema.validate(DEFAULT_SCOPE, "x", &Value::from("nope")).is_err());
        assert!(schema.validate(DEFAULT_SCOPE, "x", &Value::from(1)).is_ok());
    }

    #[test]
    fn unvalidated_keys_always_pass() {
        let schema = StateSchema::new();
        assert!(schema.validate(DEFAULT_SCOPE, "anything", &Value::Null).is_ok());
    }
}
