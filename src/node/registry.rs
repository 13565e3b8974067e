//! Node registry: single source of truth for tree shape and runtime state
//!
//! Arena of nodes keyed by id with parent back-references plus a separate
//! children index. No embedded child pointers, so there is nothing cyclic to
//! own. All mutation goes through registry operations; the pool and the
//! supervisor never touch node state directly.

use std::collections::HashMap;

use chrono::Utc;
use parking_lot::RwLock;
use tracing::debug;
use uuid::Uuid;

use crate::error::{CoreError, Result};
use crate::events::{GenerationSequencer, NodeSnapshot};
use crate::transport::ChannelKind;

use super::{EndpointSpec, FlatNode, Node, NodeId, NodeReadiness, NodeRuntime};

#[derive(Default)]
struct TreeInner {
    nodes: HashMap<NodeId, Node>,
    /// Children ids per parent, in stable insertion order.
    children: HashMap<NodeId, Vec<NodeId>>,
    /// Roots in stable insertion order.
    root_ids: Vec<NodeId>,
}

impl TreeInner {
    fn collect_subtree(&self, id: &str, out: &mut Vec<NodeId>) {
        out.push(id.to_string());
        if let Some(child_ids) = self.children.get(id) {
            for child_id in child_ids {
                self.collect_subtree(child_id, out);
            }
        }
    }
}

pub struct NodeRegistry {
    inner: RwLock<TreeInner>,
}

impl Default for NodeRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl NodeRegistry {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(TreeInner::default()),
        }
    }

    fn validate_spec(spec: &EndpointSpec) -> Result<()> {
        if spec.host.trim().is_empty() {
            return Err(CoreError::Validation("host must not be empty".into()));
        }
        if spec.port == 0 {
            return Err(CoreError::Validation("port must not be 0".into()));
        }
        if spec.username.trim().is_empty() {
            return Err(CoreError::Validation("username must not be empty".into()));
        }
        Ok(())
    }

    fn insert_node(inner: &mut TreeInner, parent_id: Option<NodeId>, spec: EndpointSpec) -> NodeId {
        let id = Uuid::new_v4().to_string();
        let depth = parent_id
            .as_deref()
            .and_then(|pid| inner.nodes.get(pid))
            .map(|p| p.depth + 1)
            .unwrap_or(0);
        let node = Node {
            id: id.clone(),
            parent_id: parent_id.clone(),
            display_name: spec.display_name(),
            endpoint: spec,
            depth,
            created_at: Utc::now(),
            runtime: NodeRuntime::default(),
        };
        match &parent_id {
            Some(pid) => inner.children.entry(pid.clone()).or_default().push(id.clone()),
            None => inner.root_ids.push(id.clone()),
        }
        inner.children.entry(id.clone()).or_default();
        inner.nodes.insert(id.clone(), node);
        id
    }

    /// Insert a root node (`parentId = null`, depth 0, `disconnected`).
    pub fn add_root_node(&self, spec: EndpointSpec) -> Result<NodeId> {
        Self::validate_spec(&spec)?;
        let mut inner = self.inner.write();
        let id = Self::insert_node(&mut inner, None, spec);
        debug!(node_id = %id, "Root node added");
        Ok(id)
    }

    /// Insert a child under an existing parent (`depth = parent.depth + 1`).
    pub fn add_child_node(&self, parent_id: &str, spec: EndpointSpec) -> Result<NodeId> {
        Self::validate_spec(&spec)?;
        let mut inner = self.inner.write();
        if !inner.nodes.contains_key(parent_id) {
            return Err(CoreError::NotFound(format!("parent node {}", parent_id)));
        }
        let id = Self::insert_node(&mut inner, Some(parent_id.to_string()), spec);
        debug!(node_id = %id, parent_id = %parent_id, "Child node added");
        Ok(id)
    }

    pub fn get_node(&self, id: &str) -> Result<Node> {
        self.inner
            .read()
            .nodes
            .get(id)
            .cloned()
            .ok_or_else(|| CoreError::NotFound(format!("node {}", id)))
    }

    pub fn contains(&self, id: &str) -> bool {
        self.inner.read().nodes.contains_key(id)
    }

    pub fn readiness(&self, id: &str) -> Result<NodeReadiness> {
        self.inner
            .read()
            .nodes
            .get(id)
            .map(|n| n.runtime.readiness)
            .ok_or_else(|| CoreError::NotFound(format!("node {}", id)))
    }

    pub fn root_ids(&self) -> Vec<NodeId> {
        self.inner.read().root_ids.clone()
    }

    pub fn ids_with_readiness(&self, readiness: NodeReadiness) -> Vec<NodeId> {
        self.inner
            .read()
            .nodes
            .values()
            .filter(|n| n.runtime.readiness == readiness)
            .map(|n| n.id.clone())
            .collect()
    }

    /// Ancestors from the immediate parent up to the root.
    pub fn get_ancestors(&self, id: &str) -> Result<Vec<Node>> {
        let inner = self.inner.read();
        if !inner.nodes.contains_key(id) {
            return Err(CoreError::NotFound(format!("node {}", id)));
        }
        let mut out = Vec::new();
        let mut current = inner.nodes.get(id).and_then(|n| n.parent_id.clone());
        while let Some(pid) = current {
            match inner.nodes.get(&pid) {
                Some(parent) => {
                    current = parent.parent_id.clone();
                    out.push(parent.clone());
                }
                None => break,
            }
        }
        Ok(out)
    }

    /// Descendants in pre-order, excluding the node itself.
    pub fn get_descendants(&self, id: &str) -> Result<Vec<Node>> {
        let inner = self.inner.read();
        if !inner.nodes.contains_key(id) {
            return Err(CoreError::NotFound(format!("node {}", id)));
        }
        let mut ids = Vec::new();
        inner.collect_subtree(id, &mut ids);
        Ok(ids
            .into_iter()
            .skip(1) // drop self
            .filter_map(|i| inner.nodes.get(&i).cloned())
            .collect())
    }

    /// Node ids from the root down to (and including) the target. Connect
    /// order follows this path; disconnect order is its reverse.
    pub fn get_path(&self, id: &str) -> Result<Vec<NodeId>> {
        let inner = self.inner.read();
        if !inner.nodes.contains_key(id) {
            return Err(CoreError::NotFound(format!("node {}", id)));
        }
        let mut path = vec![id.to_string()];
        let mut current = inner.nodes.get(id).and_then(|n| n.parent_id.clone());
        while let Some(pid) = current {
            path.push(pid.clone());
            current = inner.nodes.get(&pid).and_then(|n| n.parent_id.clone());
        }
        path.reverse();
        Ok(path)
    }

    /// Find a sibling under `parent_id` (roots when `None`) matching the
    /// endpoint identity, for hop reuse during chain expansion.
    pub fn find_child_by_endpoint(
        &self,
        parent_id: Option<&str>,
        spec: &EndpointSpec,
    ) -> Option<NodeId> {
        let inner = self.inner.read();
        let sibling_ids = match parent_id {
            Some(pid) => inner.children.get(pid)?,
            None => &inner.root_ids,
        };
        sibling_ids
            .iter()
            .find(|id| {
                inner
                    .nodes
                    .get(*id)
                    .is_some_and(|n| n.endpoint.same_endpoint(spec))
            })
            .cloned()
    }

    /// Remove a node and its whole subtree. Returns removed ids in pre-order.
    /// Callers are responsible for tearing down live connections first.
    pub fn remove_subtree(&self, id: &str) -> Result<Vec<NodeId>> {
        let mut inner = self.inner.write();
        if !inner.nodes.contains_key(id) {
            return Err(CoreError::NotFound(format!("node {}", id)));
        }
        let mut removed = Vec::new();
        inner.collect_subtree(id, &mut removed);

        let parent_id = inner.nodes.get(id).and_then(|n| n.parent_id.clone());
        match parent_id {
            Some(pid) => {
                if let Some(siblings) = inner.children.get_mut(&pid) {
                    siblings.retain(|c| c != id);
                }
            }
            None => inner.root_ids.retain(|r| r != id),
        }
        for rid in &removed {
            inner.nodes.remove(rid);
            inner.children.remove(rid);
        }
        debug!(node_id = %id, count = removed.len(), "Subtree removed");
        Ok(removed)
    }

    /// Deterministic pre-order flatten with stable sibling insertion order.
    pub fn flatten(&self) -> Vec<FlatNode> {
        let inner = self.inner.read();
        let mut out = Vec::with_capacity(inner.nodes.len());
        let roots = inner.root_ids.clone();
        for (idx, root_id) in roots.iter().enumerate() {
            Self::flatten_into(&inner, root_id, idx == roots.len() - 1, &mut out);
        }
        out
    }

    fn flatten_into(inner: &TreeInner, id: &str, is_last: bool, out: &mut Vec<FlatNode>) {
        let Some(node) = inner.nodes.get(id) else {
            return;
        };
        let child_ids = inner.children.get(id).cloned().unwrap_or_default();
        out.push(FlatNode {
            id: node.id.clone(),
            parent_id: node.parent_id.clone(),
            depth: node.depth,
            display_name: node.display_name.clone(),
            host: node.endpoint.host.clone(),
            readiness: node.runtime.readiness,
            has_children: !child_ids.is_empty(),
            is_last_child: is_last,
        });
        for (idx, child_id) in child_ids.iter().enumerate() {
            Self::flatten_into(inner, child_id, idx == child_ids.len() - 1, out);
        }
    }

    /// Apply a readiness transition with its pre-assigned generation.
    /// Rejects edges the state machine does not allow.
    pub fn apply_state(
        &self,
        id: &str,
        next: NodeReadiness,
        generation: u64,
        error: Option<String>,
    ) -> Result<()> {
        let mut inner = self.inner.write();
        let node = inner
            .nodes
            .get_mut(id)
            .ok_or_else(|| CoreError::NotFound(format!("node {}", id)))?;
        let current = node.runtime.readiness;
        if !current.can_transition_to(next) {
            return Err(CoreError::Conflict(format!(
                "illegal transition {:?} -> {:?} for node {}",
                current, next, id
            )));
        }
        node.runtime.readiness = next;
        node.runtime.generation = generation;
        node.runtime.error = error;
        if next == NodeReadiness::Disconnected {
            node.runtime.sftp_ready = false;
            node.runtime.terminal_ids.clear();
            node.runtime.sftp_ids.clear();
            node.runtime.forward_ids.clear();
            node.runtime.ref_count = 0;
        }
        Ok(())
    }

    /// One-pass link-down cascade: the node and every `connected` descendant
    /// flip to `link_down` under a single write lock, so no observer can see
    /// a partially cascaded tree. Returns `(id, generation)` per affected
    /// node for event publishing.
    pub fn mark_subtree_link_down(
        &self,
        id: &str,
        seq: &GenerationSequencer,
        reason: &str,
    ) -> Result<Vec<(NodeId, u64)>> {
        let mut inner = self.inner.write();
        if !inner.nodes.contains_key(id) {
            return Err(CoreError::NotFound(format!("node {}", id)));
        }
        let mut subtree = Vec::new();
        inner.collect_subtree(id, &mut subtree);

        let mut affected = Vec::new();
        for nid in subtree {
            let Some(node) = inner.nodes.get_mut(&nid) else {
                continue;
            };
            if node.runtime.readiness != NodeReadiness::Connected {
                continue;
            }
            let generation = seq.next(&nid);
            node.runtime.readiness = NodeReadiness::LinkDown;
            node.runtime.generation = generation;
            node.runtime.error = Some(reason.to_string());
            affected.push((nid, generation));
        }
        Ok(affected)
    }

    pub fn set_ref_count(&self, id: &str, ref_count: u32) {
        if let Some(node) = self.inner.write().nodes.get_mut(id) {
            node.runtime.ref_count = ref_count;
        }
    }

    pub fn set_sftp_ready(&self, id: &str, ready: bool) {
        if let Some(node) = self.inner.write().nodes.get_mut(id) {
            node.runtime.sftp_ready = ready;
        }
    }

    pub fn record_channel(&self, id: &str, kind: &ChannelKind, channel_id: &str) {
        if let Some(node) = self.inner.write().nodes.get_mut(id) {
            let list = match kind {
                ChannelKind::Terminal => &mut node.runtime.terminal_ids,
                ChannelKind::Sftp => &mut node.runtime.sftp_ids,
                ChannelKind::Forward { .. } => &mut node.runtime.forward_ids,
            };
            list.push(channel_id.to_string());
        }
    }

    pub fn remove_channel(&self, id: &str, kind: &ChannelKind, channel_id: &str) {
        if let Some(node) = self.inner.write().nodes.get_mut(id) {
            let list = match kind {
                ChannelKind::Terminal => &mut node.runtime.terminal_ids,
                ChannelKind::Sftp => &mut node.runtime.sftp_ids,
                ChannelKind::Forward { .. } => &mut node.runtime.forward_ids,
            };
            list.retain(|c| c != channel_id);
        }
    }

    /// Drop all channel bookkeeping for a node (used when a reconnect
    /// replaces the transport: old channel ids are dead by definition).
    pub fn clear_channels(&self, id: &str) {
        if let Some(node) = self.inner.write().nodes.get_mut(id) {
            node.runtime.terminal_ids.clear();
            node.runtime.sftp_ids.clear();
            node.runtime.forward_ids.clear();
            node.runtime.ref_count = 0;
            node.runtime.sftp_ready = false;
        }
    }

    /// Point-in-time state sharing the generation sequence with the live
    /// event stream (reconcile by generation, not arrival order).
    pub fn snapshot(&self, id: &str) -> Result<NodeSnapshot> {
        let inner = self.inner.read();
        let node = inner
            .nodes
            .get(id)
            .ok_or_else(|| CoreError::NotFound(format!("node {}", id)))?;
        Ok(NodeSnapshot {
            node_id: node.id.clone(),
            readiness: node.runtime.readiness,
            error: node.runtime.error.clone(),
            sftp_ready: node.runtime.sftp_ready,
            generation: node.runtime.generation,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::AuthSpec;

    fn spec(host: &str) -> EndpointSpec {
        EndpointSpec {
            host: host.to_string(),
            port: 22,
            username: "admin".to_string(),
            auth: AuthSpec::Agent,
            label: None,
        }
    }

    #[test]
    fn test_add_root_validates_spec() {
        let registry = NodeRegistry::new();
        let err = registry
            .add_root_node(EndpointSpec {
                host: "  ".into(),
                port: 22,
                username: "admin".into(),
                auth: AuthSpec::Agent,
                label: None,
            })
            .unwrap_err();
        assert!(matches!(err, CoreError::Validation(_)));

        let err = registry
            .add_root_node(EndpointSpec {
                port: 0,
                ..spec("a.example.com")
            })
            .unwrap_err();
        assert!(matches!(err, CoreError::Validation(_)));
    }

    #[test]
    fn test_depth_follows_parent() {
        let registry = NodeRegistry::new();
        let root = registry.add_root_node(spec("root")).unwrap();
        let mid = registry.add_child_node(&root, spec("mid")).unwrap();
        let leaf = registry.add_child_node(&mid, spec("leaf")).unwrap();

        assert_eq!(registry.get_node(&root).unwrap().depth, 0);
        assert_eq!(registry.get_node(&mid).unwrap().depth, 1);
        assert_eq!(registry.get_node(&leaf).unwrap().depth, 2);
    }

    #[test]
    fn test_child_requires_existing_parent() {
        let registry = NodeRegistry::new();
        let err = registry.add_child_node("missing", spec("x")).unwrap_err();
        assert!(matches!(err, CoreError::NotFound(_)));
    }

    #[test]
    fn test_ancestors_and_path() {
        let registry = NodeRegistry::new();
        let root = registry.add_root_node(spec("root")).unwrap();
        let mid = registry.add_child_node(&root, spec("mid")).unwrap();
        let leaf = registry.add_child_node(&mid, spec("leaf")).unwrap();

        let ancestors = registry.get_ancestors(&leaf).unwrap();
        assert_eq!(
            ancestors.iter().map(|n| n.id.clone()).collect::<Vec<_>>(),
            vec![mid.clone(), root.clone()]
        );

        let path = registry.get_path(&leaf).unwrap();
        assert_eq!(path, vec![root, mid, leaf]);
    }

    #[test]
    fn test_flatten_preserves_sibling_insertion_order() {
        let registry = NodeRegistry::new();
        let root = registry.add_root_node(spec("root")).unwrap();
        let a = registry.add_child_node(&root, spec("a")).unwrap();
        let b = registry.add_child_node(&root, spec("b")).unwrap();
        let a1 = registry.add_child_node(&a, spec("a1")).unwrap();

        let flat = registry.flatten();
        let ids: Vec<_> = flat.iter().map(|f| f.id.clone()).collect();
        assert_eq!(ids, vec![root, a, a1, b.clone()]);

        let last = flat.iter().find(|f| f.id == b).unwrap();
        assert!(last.is_last_child);
        assert!(!last.has_children);
    }

    #[test]
    fn test_remove_subtree_returns_all_ids() {
        let registry = NodeRegistry::new();
        let root = registry.add_root_node(spec("root")).unwrap();
        let mid = registry.add_child_node(&root, spec("mid")).unwrap();
        let leaf = registry.add_child_node(&mid, spec("leaf")).unwrap();

        let removed = registry.remove_subtree(&mid).unwrap();
        assert_eq!(removed, vec![mid, leaf]);
        assert!(registry.contains(&root));
        assert_eq!(registry.flatten().len(), 1);
    }

    #[test]
    fn test_find_child_by_endpoint_scopes_to_siblings() {
        let registry = NodeRegistry::new();
        let root = registry.add_root_node(spec("jump")).unwrap();
        let inner = registry.add_child_node(&root, spec("inner")).unwrap();

        assert_eq!(
            registry.find_child_by_endpoint(None, &spec("jump")),
            Some(root.clone())
        );
        assert_eq!(
            registry.find_child_by_endpoint(Some(&root), &spec("inner")),
            Some(inner)
        );
        // same endpoint under a different parent is not a match
        assert_eq!(registry.find_child_by_endpoint(None, &spec("inner")), None);
    }

    #[test]
    fn test_apply_state_rejects_illegal_edge() {
        let registry = NodeRegistry::new();
        let root = registry.add_root_node(spec("root")).unwrap();
        let err = registry
            .apply_state(&root, NodeReadiness::Connected, 1, None)
            .unwrap_err();
        assert!(matches!(err, CoreError::Conflict(_)));
    }

    #[test]
    fn test_link_down_cascade_single_pass() {
        let registry = NodeRegistry::new();
        let seq = GenerationSequencer::new();
        let root = registry.add_root_node(spec("root")).unwrap();
        let mid = registry.add_child_node(&root, spec("mid")).unwrap();
        let leaf = registry.add_child_node(&mid, spec("leaf")).unwrap();
        let sibling = registry.add_child_node(&root, spec("sib")).unwrap();

        for id in [&root, &mid, &leaf] {
            registry
                .apply_state(id, NodeReadiness::Connecting, seq.next(id), None)
                .unwrap();
            registry
                .apply_state(id, NodeReadiness::Connected, seq.next(id), None)
                .unwrap();
        }
        // sibling stays disconnected

        let affected = registry
            .mark_subtree_link_down(&root, &seq, "probe failed")
            .unwrap();
        let affected_ids: Vec<_> = affected.iter().map(|(id, _)| id.clone()).collect();
        assert_eq!(affected_ids, vec![root.clone(), mid.clone(), leaf.clone()]);

        for id in [&root, &mid, &leaf] {
            assert_eq!(registry.readiness(id).unwrap(), NodeReadiness::LinkDown);
        }
        assert_eq!(
            registry.readiness(&sibling).unwrap(),
            NodeReadiness::Disconnected
        );
        // generations advanced past the two connect transitions
        for (id, generation) in &affected {
            assert_eq!(registry.get_node(id).unwrap().runtime.generation, *generation);
            assert_eq!(*generation, 3);
        }
    }
}
