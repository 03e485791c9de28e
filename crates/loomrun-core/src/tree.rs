use std::collections::BTreeMap;

use loomrun_types::{
    CallId, EndReason, Event, EventKind, HandoffOrigin, HandoffTarget, InvocationId, RunnableKind,
};

/// Where an invocation currently stands, derived from the last terminal
/// event seen for it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvocationStatus {
    Running,
    Yielded,
    Ended(EndReason),
}

/// One node of the invocation tree rebuilt from the log. Pure projection:
/// no behavior lives here, only the facts `build_tree` derives.
#[derive(Debug, Clone)]
pub struct InvocationNode {
    pub id: InvocationId,
    pub agent_name: String,
    pub kind: RunnableKind,
    pub parent_invocation_id: Option<InvocationId>,
    pub handoff_origin: Option<HandoffOrigin>,
    pub handoff_target: Option<HandoffTarget>,
    pub fingerprint: Option<String>,
    pub status: InvocationStatus,
    pub pending_call_ids: Vec<CallId>,
    pub loop_iteration: Option<u32>,
    pub children: Vec<InvocationId>,
}

/// Rebuild the invocation tree from the full event log. Invocations are
/// keyed by `invocation_id`; ordering within `children` follows the order
/// their `invocation_start` events appear in the log.
pub fn build_tree(events: &[Event]) -> BTreeMap<InvocationId, InvocationNode> {
    let mut nodes: BTreeMap<InvocationId, InvocationNode> = BTreeMap::new();
    let mut order: Vec<InvocationId> = Vec::new();

    for event in events {
        match &event.kind {
            EventKind::InvocationStart(payload) => {
                let id = event
                    .invocation_id
                    .clone()
                    .expect("invocation_start always carries an invocation_id");
                nodes.insert(
                    id.clone(),
                    InvocationNode {
                        id: id.clone(),
                        agent_name: payload.agent_name.clone(),
                        kind: payload.kind,
                        parent_invocation_id: payload.parent_invocation_id.clone(),
                        handoff_origin: payload.handoff_origin.clone(),
                        handoff_target: None,
                        fingerprint: payload.fingerprint.clone(),
                        status: InvocationStatus::Running,
                        pending_call_ids: Vec::new(),
                        loop_iteration: payload.loop_iteration,
                        children: Vec::new(),
                    },
                );
                order.push(id);
            }
            EventKind::InvocationEnd(payload) => {
                if let Some(id) = &event.invocation_id {
                    if let Some(node) = nodes.get_mut(id) {
                        node.status = InvocationStatus::Ended(payload.reason);
                        node.handoff_target = payload.handoff_target.clone();
                        node.pending_call_ids.clear();
                    }
                }
            }
            EventKind::InvocationYield(payload) => {
                if let Some(id) = &event.invocation_id {
                    if let Some(node) = nodes.get_mut(id) {
                        node.status = InvocationStatus::Yielded;
                        node.pending_call_ids = payload.pending_call_ids.clone();
                    }
                }
            }
            EventKind::InvocationResume => {
                if let Some(id) = &event.invocation_id {
                    if let Some(node) = nodes.get_mut(id) {
                        node.status = InvocationStatus::Running;
                    }
                }
            }
            _ => {}
        }
    }

    for id in &order {
        let parent = nodes.get(id).and_then(|n| n.parent_invocation_id.clone());
        if let Some(parent_id) = parent {
            if let Some(parent_node) = nodes.get_mut(&parent_id) {
                parent_node.children.push(id.clone());
            }
        }
    }

    nodes
}

/// Root invocations (no parent), in log order.
pub fn roots(tree: &BTreeMap<InvocationId, InvocationNode>) -> Vec<InvocationId> {
    tree.values()
        .filter(|n| n.parent_invocation_id.is_none())
        .map(|n| n.id.clone())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use loomrun_types::{EventId, InvocationEndPayload, InvocationStartPayload, InvocationYieldPayload};

    fn start(id: u64, parent: Option<u64>, name: &str) -> Event {
        Event {
            id: EventId::from_seq(id),
            created_at: Utc::now(),
            invocation_id: Some(InvocationId::from_seq(id)),
            kind: EventKind::InvocationStart(InvocationStartPayload {
                agent_name: name.into(),
                kind: RunnableKind::Agent,
                parent_invocation_id: parent.map(InvocationId::from_seq),
                fingerprint: if parent.is_none() {
                    Some("fp".into())
                } else {
                    None
                },
                session_version: None,
                handoff_origin: None,
                loop_iteration: None,
                loop_max: None,
            }),
        }
    }

    fn end(id: u64, reason: EndReason) -> Event {
        Event {
            id: EventId::from_seq(id + 100),
            created_at: Utc::now(),
            invocation_id: Some(InvocationId::from_seq(id)),
            kind: EventKind::InvocationEnd(InvocationEndPayload {
                reason,
                handoff_target: None,
            }),
        }
    }

    #[test]
    fn builds_flat_single_invocation() {
        let events = vec![start(0, None, "root"), end(0, EndReason::Completed)];
        let tree = build_tree(&events);
        assert_eq!(tree.len(), 1);
        let node = &tree[&InvocationId::from_seq(0)];
        assert_eq!(node.status, InvocationStatus::Ended(EndReason::Completed));
        assert!(node.children.is_empty());
    }

    #[test]
    fn links_children_to_parent() {
        let events = vec![
            start(0, None, "root"),
            start(1, Some(0), "child"),
            end(1, EndReason::Completed),
            end(0, EndReason::Completed),
        ];
        let tree = build_tree(&events);
        let parent = &tree[&InvocationId::from_seq(0)];
        assert_eq!(parent.children, vec![InvocationId::from_seq(1)]);
        assert_eq!(roots(&tree), vec![InvocationId::from_seq(0)]);
    }

    #[test]
    fn yield_then_resume_cycle_updates_status() {
        let mut events = vec![start(0, None, "root")];
        events.push(Event {
            id: EventId::from_seq(1),
            created_at: Utc::now(),
            invocation_id: Some(InvocationId::from_seq(0)),
            kind: EventKind::InvocationYield(InvocationYieldPayload {
                pending_call_ids: vec!["c1".into()],
                yield_index: 0,
            }),
        });
        let tree = build_tree(&events);
        let node = &tree[&InvocationId::from_seq(0)];
        assert_eq!(node.status, InvocationStatus::Yielded);
        assert_eq!(node.pending_call_ids, vec!["c1".to_string()]);

        events.push(Event {
            id: EventId::from_seq(2),
            created_at: Utc::now(),
            invocation_id: Some(InvocationId::from_seq(0)),
            kind: EventKind::InvocationResume,
        });
        let tree = build_tree(&events);
        let node = &tree[&InvocationId::from_seq(0)];
        assert_eq!(node.status, InvocationStatus::Running);
    }
}
