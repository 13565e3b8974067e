//! Subscriber-side stale event filter

use std::collections::HashMap;

use super::NodeEvent;

/// Tracks the highest generation applied per node and rejects anything not
/// strictly newer. One gate per subscriber; the gate is the subscriber's own
/// bookkeeping, not shared state.
#[derive(Debug, Default)]
pub struct GenerationGate {
    seen: HashMap<String, u64>,
}

impl GenerationGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true when the event should be applied, and records it.
    pub fn admit(&mut self, event: &NodeEvent) -> bool {
        self.admit_generation(event.node_id(), event.generation())
    }

    /// Same check for snapshots or any other generation-stamped payload.
    pub fn admit_generation(&mut self, node_id: &str, generation: u64) -> bool {
        let seen = self.seen.entry(node_id.to_string()).or_insert(0);
        if generation <= *seen {
            return false;
        }
        *seen = generation;
        true
    }

    /// Highest generation applied for a node (0 if none).
    pub fn applied(&self, node_id: &str) -> u64 {
        self.seen.get(node_id).copied().unwrap_or(0)
    }

    pub fn forget(&mut self, node_id: &str) {
        self.seen.remove(node_id);
    }
}
