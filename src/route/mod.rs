//! Chain resolution: desired target to concrete node path
//!
//! Translates "reach this endpoint through these hops" (manual preset) or
//! "reach saved endpoint X" (auto-route) into registry nodes, and drives the
//! ancestors-first connect along the resulting chain. Expansion itself never
//! connects anything.

mod topology;

pub use topology::{InMemoryEndpointStore, SavedEndpoint, SavedEndpointStore, TopologyGraph};

use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::Serialize;
use tracing::{debug, info};

use crate::error::{CoreError, Result};
use crate::node::{EndpointSpec, NodeId, NodeReadiness, NodeRegistry};
use crate::pool::ConnectionPool;

/// Result of expanding a preset or auto-route into the registry.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChainExpansion {
    pub target_node_id: NodeId,
    /// Node ids along the chain, root first, target last.
    pub node_ids: Vec<NodeId>,
    /// How many of those nodes were newly inserted (the rest were reused).
    pub created: usize,
}

impl ChainExpansion {
    pub fn chain_depth(&self) -> usize {
        self.node_ids.len()
    }
}

pub struct ChainResolver {
    registry: Arc<NodeRegistry>,
    pool: Arc<ConnectionPool>,
    store: Arc<dyn SavedEndpointStore>,
    /// One chain connect per target at a time.
    chain_locks: DashMap<NodeId, ()>,
}

impl ChainResolver {
    pub fn new(
        registry: Arc<NodeRegistry>,
        pool: Arc<ConnectionPool>,
        store: Arc<dyn SavedEndpointStore>,
    ) -> Self {
        Self {
            registry,
            pool,
            store,
            chain_locks: DashMap::new(),
        }
    }

    /// Materialize an explicit ordered hop list, root first, target last.
    /// Existing nodes matching a hop's host/port/username at the same tree
    /// position are reused instead of duplicated.
    pub fn expand_manual_preset(&self, hops: &[EndpointSpec]) -> Result<ChainExpansion> {
        if hops.is_empty() {
            return Err(CoreError::Validation("hop list is empty".to_string()));
        }

        let mut node_ids = Vec::with_capacity(hops.len());
        let mut created = 0;
        let mut parent: Option<NodeId> = None;

        for spec in hops {
            let existing = self
                .registry
                .find_child_by_endpoint(parent.as_deref(), spec);
            let node_id = match existing {
                Some(id) => id,
                None => {
                    created += 1;
                    match &parent {
                        Some(parent_id) => {
                            self.registry.add_child_node(parent_id, spec.clone())?
                        }
                        None => self.registry.add_root_node(spec.clone())?,
                    }
                }
            };
            node_ids.push(node_id.clone());
            parent = Some(node_id);
        }

        let target_node_id = node_ids
            .last()
            .cloned()
            .ok_or_else(|| CoreError::Validation("hop list is empty".to_string()))?;
        info!(target = %target_node_id, depth = node_ids.len(), created, "Expanded manual preset");
        Ok(ChainExpansion {
            target_node_id,
            node_ids,
            created,
        })
    }

    /// Compute the shortest saved-endpoint route to the target and
    /// materialize it like a manual preset.
    ///
    /// Refused with `ManualCredentialsRequired` when any hop is
    /// password-only: the store never holds plaintext passwords, so a
    /// silent auto-connect along that route cannot succeed.
    pub fn expand_auto_route(&self, target_saved_id: &str) -> Result<ChainExpansion> {
        let endpoints = self.store.list();
        let graph = TopologyGraph::build(&endpoints);
        let path = graph.compute_route(target_saved_id)?;

        let mut hops = Vec::with_capacity(path.len());
        for saved_id in &path {
            let saved = graph
                .endpoint(saved_id)
                .ok_or_else(|| CoreError::NotFound(format!("saved endpoint {}", saved_id)))?;
            if saved.endpoint.auth.requires_interactive_secret() {
                return Err(CoreError::ManualCredentialsRequired(format!(
                    "hop {} ({}) is password-only",
                    saved_id,
                    saved.endpoint.display_name()
                )));
            }
            hops.push(saved.endpoint.clone());
        }

        debug!(target = %target_saved_id, hops = path.len(), "Auto-route computed");
        self.expand_manual_preset(&hops)
    }

    /// Connect root-to-target along the node's ancestor chain, skipping hops
    /// that are already connected. A failing hop aborts the walk and the
    /// error names that hop; deeper nodes are left untouched.
    pub async fn connect_node_with_ancestors(&self, node_id: &str) -> Result<()> {
        match self.chain_locks.entry(node_id.to_string()) {
            Entry::Occupied(_) => {
                return Err(CoreError::ChainLockBusy(format!(
                    "chain connect already in flight for {}",
                    node_id
                )));
            }
            Entry::Vacant(vacant) => {
                vacant.insert(());
            }
        }

        let result = self.connect_chain(node_id).await;
        self.chain_locks.remove(node_id);
        result
    }

    async fn connect_chain(&self, node_id: &str) -> Result<()> {
        let path = self.registry.get_path(node_id)?;
        for hop_id in &path {
            if self.registry.readiness(hop_id)? == NodeReadiness::Connected
                && self.pool.has_slot(hop_id)
            {
                continue;
            }
            if let Err(e) = self.pool.connect(hop_id).await {
                let hop_name = self
                    .registry
                    .get_node(hop_id)
                    .map(|n| n.endpoint.display_name())
                    .unwrap_or_else(|_| hop_id.clone());
                return Err(CoreError::HandshakeFailed(format!(
                    "chain connect failed at hop {}: {}",
                    hop_name, e
                )));
            }
        }
        info!(node_id = %node_id, depth = path.len(), "Chain connected");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PoolConfig;
    use crate::events::NodeEventBus;
    use crate::node::AuthSpec;
    use crate::transport::mock::MockTransportFactory;
    use crate::transport::NoCredentials;
    use std::time::Duration;

    fn spec(host: &str) -> EndpointSpec {
        EndpointSpec {
            host: host.to_string(),
            port: 22,
            username: "u".to_string(),
            auth: AuthSpec::Agent,
            label: None,
        }
    }

    fn saved(id: &str, auth: AuthSpec, chain: &[&str]) -> SavedEndpoint {
        SavedEndpoint {
            id: id.to_string(),
            endpoint: EndpointSpec {
                host: format!("{}.example.com", id),
                port: 22,
                username: "u".to_string(),
                auth,
                label: None,
            },
            proxy_chain: chain.iter().map(|s| s.to_string()).collect(),
        }
    }

    struct Harness {
        registry: Arc<NodeRegistry>,
        factory: Arc<MockTransportFactory>,
        resolver: ChainResolver,
    }

    fn harness(endpoints: Vec<SavedEndpoint>) -> Harness {
        let registry = Arc::new(NodeRegistry::new());
        let bus = Arc::new(NodeEventBus::new());
        let factory = MockTransportFactory::new();
        let pool = ConnectionPool::new(
            registry.clone(),
            bus,
            factory.clone(),
            Arc::new(NoCredentials),
            PoolConfig::default(),
        );
        let store = Arc::new(InMemoryEndpointStore::new(endpoints));
        let resolver = ChainResolver::new(registry.clone(), pool, store);
        Harness {
            registry,
            factory,
            resolver,
        }
    }

    #[test]
    fn test_manual_preset_creates_chain() {
        let h = harness(vec![]);
        let hops = [spec("jump.example.com"), spec("deep.example.com")];
        let expansion = h.resolver.expand_manual_preset(&hops).unwrap();

        assert_eq!(expansion.chain_depth(), 2);
        assert_eq!(expansion.created, 2);
        let target = h.registry.get_node(&expansion.target_node_id).unwrap();
        assert_eq!(target.endpoint.host, "deep.example.com");
        assert_eq!(target.depth, 1);
        assert_eq!(target.parent_id.as_deref(), Some(expansion.node_ids[0].as_str()));
    }

    #[test]
    fn test_manual_preset_reuses_matching_hops() {
        let h = harness(vec![]);
        let first = h
            .resolver
            .expand_manual_preset(&[spec("jump.example.com"), spec("a.example.com")])
            .unwrap();
        let second = h
            .resolver
            .expand_manual_preset(&[spec("jump.example.com"), spec("b.example.com")])
            .unwrap();

        // the shared jump host is reused, only the new leaf is inserted
        assert_eq!(second.created, 1);
        assert_eq!(first.node_ids[0], second.node_ids[0]);
        assert_eq!(h.registry.root_ids().len(), 1);
    }

    #[test]
    fn test_manual_preset_rejects_empty_hops() {
        let h = harness(vec![]);
        assert!(matches!(
            h.resolver.expand_manual_preset(&[]),
            Err(CoreError::Validation(_))
        ));
    }

    #[test]
    fn test_auto_route_materializes_shortest_path() {
        let h = harness(vec![
            saved("a", AuthSpec::Agent, &[]),
            saved("b", AuthSpec::Agent, &["a"]),
            saved("c", AuthSpec::Agent, &["a", "b"]),
        ]);
        let expansion = h.resolver.expand_auto_route("c").unwrap();
        assert_eq!(expansion.chain_depth(), 3);

        let hosts: Vec<String> = expansion
            .node_ids
            .iter()
            .map(|id| h.registry.get_node(id).unwrap().endpoint.host)
            .collect();
        assert_eq!(
            hosts,
            vec!["a.example.com", "b.example.com", "c.example.com"]
        );
    }

    #[test]
    fn test_auto_route_unreachable_target() {
        let h = harness(vec![
            saved("a", AuthSpec::Agent, &[]),
            saved("d", AuthSpec::Agent, &["ghost"]),
        ]);
        assert!(matches!(
            h.resolver.expand_auto_route("d"),
            Err(CoreError::NoRouteFound(_))
        ));
    }

    #[test]
    fn test_auto_route_blocks_password_only_hop() {
        let h = harness(vec![
            saved("a", AuthSpec::Password, &[]),
            saved("b", AuthSpec::Agent, &["a"]),
        ]);
        let err = h.resolver.expand_auto_route("b").unwrap_err();
        assert!(matches!(err, CoreError::ManualCredentialsRequired(_)));
        // nothing was materialized
        assert!(h.registry.root_ids().is_empty());
    }

    #[tokio::test]
    async fn test_connect_with_ancestors_skips_connected_hops() {
        let h = harness(vec![]);
        let expansion = h
            .resolver
            .expand_manual_preset(&[spec("jump.example.com"), spec("deep.example.com")])
            .unwrap();

        h.resolver
            .connect_node_with_ancestors(&expansion.node_ids[0])
            .await
            .unwrap();
        assert_eq!(h.factory.connect_count("jump.example.com"), 1);

        h.resolver
            .connect_node_with_ancestors(&expansion.target_node_id)
            .await
            .unwrap();
        // the jump host was already connected, only the leaf dialed
        assert_eq!(h.factory.connect_count("jump.example.com"), 1);
        assert_eq!(h.factory.connect_count("deep.example.com"), 1);
    }

    #[tokio::test]
    async fn test_connect_with_ancestors_names_failing_hop() {
        let h = harness(vec![]);
        let expansion = h
            .resolver
            .expand_manual_preset(&[spec("jump.example.com"), spec("deep.example.com")])
            .unwrap();
        h.factory.fail_host("jump.example.com");

        let err = h
            .resolver
            .connect_node_with_ancestors(&expansion.target_node_id)
            .await
            .unwrap_err();
        match err {
            CoreError::HandshakeFailed(msg) => assert!(msg.contains("jump.example.com")),
            other => panic!("unexpected error: {other}"),
        }
        // the leaf never started connecting
        assert_eq!(
            h.registry
                .readiness(&expansion.target_node_id)
                .unwrap(),
            NodeReadiness::Disconnected
        );
    }

    #[tokio::test]
    async fn test_second_chain_connect_is_busy() {
        let h = harness(vec![]);
        let expansion = h
            .resolver
            .expand_manual_preset(&[spec("jump.example.com")])
            .unwrap();
        h.factory.set_connect_delay(Duration::from_millis(50));

        let resolver = Arc::new(h.resolver);
        let r2 = resolver.clone();
        let target = expansion.target_node_id.clone();
        let target2 = target.clone();

        let first = tokio::spawn(async move { r2.connect_node_with_ancestors(&target2).await });
        tokio::time::sleep(Duration::from_millis(10)).await;

        let err = resolver
            .connect_node_with_ancestors(&target)
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::ChainLockBusy(_)));
        first.await.unwrap().unwrap();
    }
}
