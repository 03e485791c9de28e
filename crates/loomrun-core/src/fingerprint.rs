use sha2::{Digest, Sha256};

use loomrun_model::ModelAdapter;

use crate::context::fingerprint_parts;
use crate::runnable::Runnable;

/// A deterministic digest of a `Runnable` tree's structure. Resume
/// validates the persisted fingerprint of each invocation against a fresh
/// fingerprint of the definition passed to `resume()`; a mismatch is a
/// `PipelineStructureChanged` error rather than silent misbehavior.
///
/// Structural facts participate: names, ordering, tool sets, context
/// stage names, output schema shape, and an agent's model provider/name
/// (swapping the model underneath a resumed agent is a structural change,
/// not an opaque implementation detail). The model instance itself — its
/// closures, credentials, connection state — contributes nothing, since it
/// can't be compared across a process restart anyway.
pub fn fingerprint(runnable: &Runnable) -> String {
    let mut hasher = Sha256::new();
    hash_runnable(&mut hasher, runnable);
    hex::encode(hasher.finalize())
}

fn hash_runnable(hasher: &mut Sha256, runnable: &Runnable) {
    match runnable {
        Runnable::Agent(agent) => {
            hasher.update(b"agent\0");
            hasher.update(agent.name.as_bytes());
            hasher.update(b"\0");
            hasher.update(agent.model.provider_name().as_bytes());
            hasher.update(b"\0");
            hasher.update(agent.model.model_name().as_bytes());
            hasher.update(b"\0");
            let mut tools = agent.tools.clone();
            tools.sort();
            for tool in &tools {
                hasher.update(tool.as_bytes());
                hasher.update(b",");
            }
            hasher.update(b"\0");
            for stage in fingerprint_parts(&agent.context) {
                hasher.update(stage.as_bytes());
                hasher.update(b",");
            }
            hasher.update(b"\0");
            match &agent.output_schema {
                Some(schema) => {
                    let canon = serde_json::to_string(schema).unwrap_or_default();
                    hasher.update(canon.as_bytes());
                }
                None => hasher.update(b"none"),
            }
        }
        Runnable::Step(step) => {
            hasher.update(b"step\0");
            hasher.update(step.name.as_bytes());
        }
        Runnable::Sequence(seq) => {
            hasher.update(b"sequence\0");
            hasher.update(seq.name.as_bytes());
            hasher.update(b"\0");
            for child in &seq.children {
                hash_runnable(hasher, child);
                hasher.update(b"|");
            }
        }
        Runnable::Parallel(par) => {
            hasher.update(b"parallel\0");
            hasher.update(par.name.as_bytes());
            hasher.update(b"\0");
            for child in &par.children {
                hash_runnable(hasher, child);
                hasher.update(b"|");
            }
        }
        Runnable::Loop(lp) => {
            hasher.update(b"loop\0");
            hasher.update(lp.name.as_bytes());
            hasher.update(if lp.yields { b"\x01" } else { b"\x00" });
            hash_runnable(hasher, &lp.inner);
        }
    }
}
