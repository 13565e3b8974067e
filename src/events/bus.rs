//! Typed publish/subscribe bus for node state events

use serde::Serialize;
use tokio::sync::broadcast;
use tracing::trace;

use crate::node::{NodeId, NodeReadiness};

use super::GenerationSequencer;

const BUS_CAPACITY: usize = 256;

/// Where a terminal consumer should attach after (re)connect.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TerminalEndpoint {
    pub ws_port: u16,
    pub ws_token: String,
}

/// Generation-stamped node state event.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum NodeEvent {
    #[serde(rename_all = "camelCase")]
    ConnectionStateChanged {
        node_id: NodeId,
        generation: u64,
        state: NodeReadiness,
        reason: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    SftpReady {
        node_id: NodeId,
        generation: u64,
        ready: bool,
        cwd: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    TerminalEndpointChanged {
        node_id: NodeId,
        generation: u64,
        endpoint: TerminalEndpoint,
    },
}

impl NodeEvent {
    pub fn node_id(&self) -> &str {
        match self {
            NodeEvent::ConnectionStateChanged { node_id, .. }
            | NodeEvent::SftpReady { node_id, .. }
            | NodeEvent::TerminalEndpointChanged { node_id, .. } => node_id,
        }
    }

    pub fn generation(&self) -> u64 {
        match self {
            NodeEvent::ConnectionStateChanged { generation, .. }
            | NodeEvent::SftpReady { generation, .. }
            | NodeEvent::TerminalEndpointChanged { generation, .. } => *generation,
        }
    }
}

/// Fan-out bus for node events.
///
/// Owns the generation sequencer so producers cannot publish an event without
/// a generation from the shared sequence. Lagging subscribers lose the oldest
/// events (tokio broadcast semantics); the snapshot + generation contract
/// makes that recoverable.
pub struct NodeEventBus {
    sequencer: GenerationSequencer,
    tx: broadcast::Sender<NodeEvent>,
}

impl Default for NodeEventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl NodeEventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(BUS_CAPACITY);
        Self {
            sequencer: GenerationSequencer::new(),
            tx,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<NodeEvent> {
        self.tx.subscribe()
    }

    pub fn sequencer(&self) -> &GenerationSequencer {
        &self.sequencer
    }

    pub fn next_generation(&self, node_id: &str) -> u64 {
        self.sequencer.next(node_id)
    }

    pub fn current_generation(&self, node_id: &str) -> u64 {
        self.sequencer.current(node_id)
    }

    /// Publish an already-stamped event. A send error only means there is no
    /// subscriber right now, which is fine: state lives in the registry and
    /// late subscribers start from a snapshot.
    pub fn publish(&self, event: NodeEvent) {
        trace!(node_id = %event.node_id(), generation = event.generation(), "Publishing node event");
        let _ = self.tx.send(event);
    }

    /// Drop a removed node's generation counter.
    pub fn forget_node(&self, node_id: &str) {
        self.sequencer.remove(node_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_reaches_all_subscribers() {
        let bus = NodeEventBus::new();
        let mut rx1 = bus.subscribe();
        let mut rx2 = bus.subscribe();

        let generation = bus.next_generation("n1");
        bus.publish(NodeEvent::ConnectionStateChanged {
            node_id: "n1".into(),
            generation,
            state: NodeReadiness::Connecting,
            reason: None,
        });

        for rx in [&mut rx1, &mut rx2] {
            let ev = rx.recv().await.unwrap();
            assert_eq!(ev.node_id(), "n1");
            assert_eq!(ev.generation(), 1);
        }
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_is_silent() {
        let bus = NodeEventBus::new();
        bus.publish(NodeEvent::SftpReady {
            node_id: "n1".into(),
            generation: bus.next_generation("n1"),
            ready: true,
            cwd: None,
        });
        // no panic, generation still advanced
        assert_eq!(bus.current_generation("n1"), 1);
    }

    #[test]
    fn test_event_serializes_with_camel_case_tag() {
        let ev = NodeEvent::ConnectionStateChanged {
            node_id: "n1".into(),
            generation: 7,
            state: NodeReadiness::LinkDown,
            reason: Some("probe failed".into()),
        };
        let json = serde_json::to_string(&ev).unwrap();
        assert!(json.contains("\"type\":\"connectionStateChanged\""));
        assert!(json.contains("\"nodeId\":\"n1\""));
        assert!(json.contains("\"state\":\"link_down\""));
    }
}
