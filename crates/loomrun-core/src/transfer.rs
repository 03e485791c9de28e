use std::collections::HashMap;

use crate::runnable::Runnable;

/// Named transfer targets a tool's [`loomrun_tools::ToolOutcome::Transfer`]
/// resolves against. Tools live in a crate that knows nothing about
/// `Runnable` (it sits below `loomrun-core` in the dependency graph), so a
/// tool can only name its transfer target; this registry is where the
/// supervisor looks the name up.
#[derive(Default, Clone)]
pub struct TransferRegistry {
    targets: HashMap<String, Runnable>,
}

impl TransferRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: impl Into<String>, target: Runnable) {
        self.targets.insert(name.into(), target);
    }

    pub fn get(&self, name: &str) -> Option<Runnable> {
        self.targets.get(name).cloned()
    }
}
