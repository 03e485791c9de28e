use std::fmt;

use serde::{Deserialize, Serialize};

/// Opaque, strictly-ordered identifier.
///
/// Events within one session are assigned IDs from a single monotonic
/// counter, so `a.id > b.id` iff `a` was appended after `b`. The counter is
/// rendered as a fixed-width decimal string rather than exposed as a raw
/// integer so callers never rely on arithmetic over IDs — only ordering and
/// equality, matching the "opaque ordered token" contract of the event log.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventId(String);

impl EventId {
    pub(crate) fn from_seq(seq: u64) -> Self {
        Self(format!("evt-{seq:020}"))
    }

    /// For a freshly constructed session with no prior events.
    pub fn zero() -> Self {
        Self::from_seq(0)
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Monotonic ID generator, one per `Session`. Never reset; resuming a
/// session restores it to `max(existing ids) + 1`.
#[derive(Debug, Default)]
pub struct IdSequence {
    next: u64,
}

impl IdSequence {
    pub fn new() -> Self {
        Self { next: 0 }
    }

    /// Rebuild a sequence positioned after the highest ID seen so far, used
    /// when resuming a session from its persisted event log.
    pub fn resume_after(seq: u64) -> Self {
        Self { next: seq + 1 }
    }

    pub fn next_event_id(&mut self) -> EventId {
        let seq = self.next;
        self.next += 1;
        EventId::from_seq(seq)
    }

    pub fn next_seq(&self) -> u64 {
        self.next
    }
}

/// Identifies one live or historical invocation (one Runnable execution).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InvocationId(String);

impl InvocationId {
    pub fn from_seq(seq: u64) -> Self {
        Self(format!("inv-{seq:020}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for InvocationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A yielding tool call's identifier, as reported by the model/provider (or
/// synthesized when the provider omits one — see `loomrun-model`).
pub type CallId = String;
