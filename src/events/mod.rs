//! State machine events: generation sequencing, typed bus, subscriber gate
//!
//! Every state-changing event carries a per-node monotonic generation. A
//! subscriber must discard any event whose generation is not strictly greater
//! than the highest it has already applied for that node; this makes delivery
//! order irrelevant (a stale reconnect resolving after a newer one can never
//! win). Snapshots share the same sequence, so stream and snapshot reconcile
//! by generation regardless of which arrives first.

mod bus;
mod gate;
mod sequencer;

pub use bus::{NodeEvent, NodeEventBus, TerminalEndpoint};
pub use gate::GenerationGate;
pub use sequencer::GenerationSequencer;

use serde::Serialize;

use crate::node::{NodeId, NodeReadiness};

/// Point-in-time node state stamped with the node's current generation.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeSnapshot {
    pub node_id: NodeId,
    pub readiness: NodeReadiness,
    pub error: Option<String>,
    pub sftp_ready: bool,
    pub generation: u64,
}
