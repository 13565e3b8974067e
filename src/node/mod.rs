//! Node types and the registry tree
//!
//! A node is one logical SSH-reachable endpoint. Nodes form a tree: a child's
//! transport is tunneled through its parent's live session (jump host chain).

mod registry;

pub use registry::NodeRegistry;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Opaque stable node identifier. Stable across reconnect attempts.
pub type NodeId = String;

/// Declared authentication method. Credential material itself is resolved
/// externally per connect attempt and never stored here.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AuthSpec {
    /// Secret is interactive-only: never persisted, so auto-flows
    /// (auto-route, auto-reconnect) must fall back to a prompt.
    Password,
    Key {
        key_path: String,
    },
    Agent,
    Certificate {
        key_path: String,
        cert_path: String,
    },
}

impl AuthSpec {
    /// True when the method needs a secret only the user can supply.
    pub fn requires_interactive_secret(&self) -> bool {
        matches!(self, AuthSpec::Password)
    }
}

/// Declared connection parameters of a node.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct EndpointSpec {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub auth: AuthSpec,
    #[serde(default)]
    pub label: Option<String>,
}

impl EndpointSpec {
    /// Identity for hop reuse: two hops are the same endpoint when host,
    /// port and username all match.
    pub fn same_endpoint(&self, other: &EndpointSpec) -> bool {
        self.host == other.host && self.port == other.port && self.username == other.username
    }

    pub fn display_name(&self) -> String {
        self.label
            .clone()
            .unwrap_or_else(|| format!("{}@{}", self.username, self.host))
    }
}

/// Per-node readiness.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum NodeReadiness {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    /// Transport confirmed dead by a probe; reconnect may follow.
    LinkDown,
    Error,
}

impl NodeReadiness {
    pub fn is_connected(&self) -> bool {
        matches!(self, NodeReadiness::Connected)
    }

    /// A node in one of these states holds (or is acquiring) live transport
    /// resources and blocks structural operations on its ancestors.
    pub fn is_live(&self) -> bool {
        matches!(
            self,
            NodeReadiness::Connecting | NodeReadiness::Connected | NodeReadiness::LinkDown
        )
    }

    /// Legal state machine edges. Explicit teardown to `disconnected` is
    /// allowed from anywhere; `error -> error` re-entry is allowed so a
    /// later failure can update the surfaced reason.
    pub fn can_transition_to(&self, next: NodeReadiness) -> bool {
        use NodeReadiness::*;
        match (self, next) {
            (_, Disconnected) => true,
            (Disconnected, Connecting) => true,
            (Connecting, Connected) => true,
            (Connecting, Error) => true,
            (Connected, Error) => true,
            (Connected, LinkDown) => true,
            (Error, Connecting) => true,
            (Error, Error) => true,
            (LinkDown, Connecting) => true,
            _ => false,
        }
    }
}

/// Runtime state carried by every node, mutated only through the registry.
#[derive(Debug, Clone, Serialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct NodeRuntime {
    pub readiness: NodeReadiness,
    /// Highest generation assigned to this node so far (0 = no event yet).
    pub generation: u64,
    pub error: Option<String>,
    pub sftp_ready: bool,
    pub terminal_ids: Vec<String>,
    pub sftp_ids: Vec<String>,
    pub forward_ids: Vec<String>,
    pub ref_count: u32,
}

/// One logical endpoint in the session tree.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Node {
    pub id: NodeId,
    pub parent_id: Option<NodeId>,
    pub endpoint: EndpointSpec,
    /// 0 for roots, parent.depth + 1 otherwise.
    pub depth: u32,
    pub display_name: String,
    pub created_at: DateTime<Utc>,
    pub runtime: NodeRuntime,
}

impl Node {
    pub fn is_root(&self) -> bool {
        self.parent_id.is_none()
    }
}

/// Pre-order flattened view for UI consumption.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FlatNode {
    pub id: NodeId,
    pub parent_id: Option<NodeId>,
    pub depth: u32,
    pub display_name: String,
    pub host: String,
    pub readiness: NodeReadiness,
    pub has_children: bool,
    pub is_last_child: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_readiness_transitions() {
        use NodeReadiness::*;
        assert!(Disconnected.can_transition_to(Connecting));
        assert!(Connecting.can_transition_to(Connected));
        assert!(Connected.can_transition_to(LinkDown));
        assert!(LinkDown.can_transition_to(Connecting));
        assert!(Error.can_transition_to(Connecting));
        // teardown is always legal
        assert!(Connected.can_transition_to(Disconnected));
        assert!(LinkDown.can_transition_to(Disconnected));
        // but skipping connecting is not
        assert!(!Disconnected.can_transition_to(Connected));
        assert!(!LinkDown.can_transition_to(Connected));
    }

    #[test]
    fn test_endpoint_identity_ignores_auth_and_label() {
        let a = EndpointSpec {
            host: "jump.example.com".into(),
            port: 22,
            username: "ops".into(),
            auth: AuthSpec::Agent,
            label: Some("Jump".into()),
        };
        let b = EndpointSpec {
            host: "jump.example.com".into(),
            port: 22,
            username: "ops".into(),
            auth: AuthSpec::Password,
            label: None,
        };
        assert!(a.same_endpoint(&b));
    }

    #[test]
    fn test_auth_spec_serde_tag() {
        let json = serde_json::to_string(&AuthSpec::Key {
            key_path: "/home/u/.ssh/id_ed25519".into(),
        })
        .unwrap();
        assert!(json.contains("\"type\":\"key\""));
    }
}
