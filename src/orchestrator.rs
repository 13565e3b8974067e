//! Orchestration context
//!
//! One explicit handle wiring the registry, pool, resolver and supervisor
//! together. Constructed once at startup and passed to every operation and
//! background task; nothing here is a process-wide singleton, so embedders
//! and tests can run several independent contexts side by side.

use std::sync::Arc;

use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::config::{PoolConfig, SupervisorConfig};
use crate::error::{CoreError, Result};
use crate::events::{NodeEvent, NodeEventBus, NodeSnapshot};
use crate::node::{EndpointSpec, FlatNode, Node, NodeId, NodeRegistry};
use crate::pool::{ConnectionPool, PoolStats};
use crate::route::{ChainExpansion, ChainResolver, SavedEndpointStore};
use crate::supervisor::{ReconnectPending, ReconnectionSupervisor, SweepTrigger};
use crate::transport::{ChannelKind, CredentialProvider, ProbeOutcome, Secret, TransportFactory};

pub struct Orchestrator {
    registry: Arc<NodeRegistry>,
    bus: Arc<NodeEventBus>,
    pool: Arc<ConnectionPool>,
    resolver: ChainResolver,
    supervisor: Arc<ReconnectionSupervisor>,
}

impl Orchestrator {
    pub fn new(
        factory: Arc<dyn TransportFactory>,
        credentials: Arc<dyn CredentialProvider>,
        store: Arc<dyn SavedEndpointStore>,
        pool_config: PoolConfig,
        supervisor_config: SupervisorConfig,
    ) -> Arc<Self> {
        let registry = Arc::new(NodeRegistry::new());
        let bus = Arc::new(NodeEventBus::new());
        let pool = ConnectionPool::new(
            registry.clone(),
            bus.clone(),
            factory,
            credentials,
            pool_config,
        );
        let resolver = ChainResolver::new(registry.clone(), pool.clone(), store);
        let supervisor =
            ReconnectionSupervisor::new(pool.clone(), registry.clone(), supervisor_config);

        Arc::new(Self {
            registry,
            bus,
            pool,
            resolver,
            supervisor,
        })
    }

    /// Start background supervision (heartbeat + dead-connection listener).
    pub fn start(self: &Arc<Self>) {
        self.supervisor.start();
        info!("Orchestrator started");
    }

    /// Stop supervision and tear down every live connection, roots last.
    pub async fn shutdown(self: &Arc<Self>) {
        self.supervisor.shutdown();
        for root_id in self.registry.root_ids() {
            if let Err(e) = self.pool.disconnect(&root_id, true).await {
                warn!(node_id = %root_id, error = %e, "Teardown during shutdown failed");
            }
        }
        info!("Orchestrator stopped");
    }

    // ---- registry ----

    pub fn add_root_node(&self, spec: EndpointSpec) -> Result<NodeId> {
        self.registry.add_root_node(spec)
    }

    pub fn add_child_node(&self, parent_id: &str, spec: EndpointSpec) -> Result<NodeId> {
        self.registry.add_child_node(parent_id, spec)
    }

    pub fn get_node(&self, node_id: &str) -> Result<Node> {
        self.registry.get_node(node_id)
    }

    pub fn get_ancestors(&self, node_id: &str) -> Result<Vec<Node>> {
        self.registry.get_ancestors(node_id)
    }

    pub fn get_descendants(&self, node_id: &str) -> Result<Vec<Node>> {
        self.registry.get_descendants(node_id)
    }

    pub fn flatten(&self) -> Vec<FlatNode> {
        self.registry.flatten()
    }

    /// Remove a node and its subtree. Live connections anywhere in the
    /// subtree require `cascade`, which tears them down leaf-to-root first.
    /// Returns the removed ids in pre-order.
    pub async fn remove_node(&self, node_id: &str, cascade: bool) -> Result<Vec<NodeId>> {
        let node = self.registry.get_node(node_id)?;
        let descendants = self.registry.get_descendants(node_id)?;
        let any_live = node.runtime.readiness.is_live()
            || self.pool.has_slot(node_id)
            || descendants.iter().any(|d| d.runtime.readiness.is_live());

        if any_live {
            if !cascade {
                return Err(CoreError::Conflict(format!(
                    "node {} or its descendants have live connections; remove with cascade",
                    node_id
                )));
            }
            self.pool.disconnect(node_id, true).await?;
        }

        let removed = self.registry.remove_subtree(node_id)?;
        for id in &removed {
            self.bus.forget_node(id);
        }
        Ok(removed)
    }

    // ---- pool ----

    pub async fn connect(&self, node_id: &str) -> Result<()> {
        self.pool.connect(node_id).await
    }

    pub async fn open_channel(&self, node_id: &str, kind: ChannelKind) -> Result<String> {
        self.pool.open_channel(node_id, kind).await
    }

    pub async fn close_channel(&self, node_id: &str, channel_id: &str) -> Result<()> {
        self.pool.close_channel(node_id, channel_id).await
    }

    pub async fn disconnect(&self, node_id: &str, cascade: bool) -> Result<()> {
        self.pool.disconnect(node_id, cascade).await
    }

    pub async fn probe(&self, node_id: &str) -> Result<ProbeOutcome> {
        self.pool.probe(node_id).await
    }

    pub fn get_stats(&self) -> PoolStats {
        self.pool.get_stats()
    }

    // ---- resolution ----

    pub fn expand_manual_preset(&self, hops: &[EndpointSpec]) -> Result<ChainExpansion> {
        self.resolver.expand_manual_preset(hops)
    }

    pub fn expand_auto_route(&self, target_saved_id: &str) -> Result<ChainExpansion> {
        self.resolver.expand_auto_route(target_saved_id)
    }

    pub async fn connect_node_with_ancestors(&self, node_id: &str) -> Result<()> {
        self.resolver.connect_node_with_ancestors(node_id).await
    }

    // ---- supervision ----

    pub fn trigger_sweep(self: &Arc<Self>, trigger: SweepTrigger) {
        self.supervisor.trigger(trigger);
    }

    pub async fn reconnect_with_password(&self, node_id: &str, password: Secret) -> Result<()> {
        self.supervisor
            .reconnect_with_password(node_id, password)
            .await
    }

    pub fn subscribe_reconnect_pending(&self) -> broadcast::Receiver<ReconnectPending> {
        self.supervisor.subscribe_pending()
    }

    // ---- events ----

    pub fn subscribe_events(&self) -> broadcast::Receiver<NodeEvent> {
        self.bus.subscribe()
    }

    /// Snapshot sharing the live stream's generation sequence; subscribers
    /// reconcile it against events by generation regardless of arrival order.
    pub fn get_state(&self, node_id: &str) -> Result<NodeSnapshot> {
        self.registry.snapshot(node_id)
    }

    // component handles for embedders building their own surfaces

    pub fn registry(&self) -> &Arc<NodeRegistry> {
        &self.registry
    }

    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }

    pub fn bus(&self) -> &Arc<NodeEventBus> {
        &self.bus
    }

    pub fn supervisor(&self) -> &Arc<ReconnectionSupervisor> {
        &self.supervisor
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::{AuthSpec, NodeReadiness};
    use crate::route::InMemoryEndpointStore;
    use crate::transport::mock::MockTransportFactory;
    use crate::transport::NoCredentials;

    fn spec(host: &str) -> EndpointSpec {
        EndpointSpec {
            host: host.to_string(),
            port: 22,
            username: "u".to_string(),
            auth: AuthSpec::Agent,
            label: None,
        }
    }

    fn orchestrator() -> (Arc<Orchestrator>, Arc<MockTransportFactory>) {
        let factory = MockTransportFactory::new();
        let orch = Orchestrator::new(
            factory.clone(),
            Arc::new(NoCredentials),
            Arc::new(InMemoryEndpointStore::new(vec![])),
            PoolConfig::default(),
            SupervisorConfig::default(),
        );
        (orch, factory)
    }

    #[tokio::test]
    async fn test_end_to_end_chain_lifecycle() {
        let (orch, factory) = orchestrator();
        let mut events = orch.subscribe_events();

        let expansion = orch
            .expand_manual_preset(&[spec("jump.example.com"), spec("deep.example.com")])
            .unwrap();
        orch.connect_node_with_ancestors(&expansion.target_node_id)
            .await
            .unwrap();

        assert_eq!(
            factory.connect_order(),
            vec!["jump.example.com", "deep.example.com"]
        );
        let snap = orch.get_state(&expansion.target_node_id).unwrap();
        assert_eq!(snap.readiness, NodeReadiness::Connected);

        // every published generation is reflected in the snapshot sequence
        let mut last_gen_per_node = std::collections::HashMap::new();
        while let Ok(ev) = events.try_recv() {
            let prev = last_gen_per_node
                .insert(ev.node_id().to_string(), ev.generation())
                .unwrap_or(0);
            assert!(ev.generation() > prev);
        }
        assert_eq!(
            last_gen_per_node[&expansion.target_node_id],
            snap.generation
        );

        orch.shutdown().await;
        let snap = orch.get_state(&expansion.target_node_id).unwrap();
        assert_eq!(snap.readiness, NodeReadiness::Disconnected);
    }

    #[tokio::test]
    async fn test_remove_node_conflict_and_cascade() {
        let (orch, factory) = orchestrator();
        let root = orch.add_root_node(spec("root.example.com")).unwrap();
        let child = orch
            .add_child_node(&root, spec("child.example.com"))
            .unwrap();
        orch.connect(&child).await.unwrap();

        let err = orch.remove_node(&root, false).await.unwrap_err();
        assert!(matches!(err, CoreError::Conflict(_)));
        assert!(orch.get_node(&child).is_ok());

        let removed = orch.remove_node(&root, true).await.unwrap();
        assert_eq!(removed.len(), 2);
        assert!(orch.get_node(&root).is_err());
        assert!(orch.get_node(&child).is_err());
        // teardown ran child-first before removal
        assert_eq!(
            factory.close_order(),
            vec!["child.example.com", "root.example.com"]
        );
    }

    #[tokio::test]
    async fn test_remove_disconnected_node_needs_no_cascade() {
        let (orch, _) = orchestrator();
        let root = orch.add_root_node(spec("root.example.com")).unwrap();
        let removed = orch.remove_node(&root, false).await.unwrap();
        assert_eq!(removed, vec![root]);
    }

    #[tokio::test]
    async fn test_get_state_for_missing_node() {
        let (orch, _) = orchestrator();
        assert!(matches!(
            orch.get_state("nope"),
            Err(CoreError::NotFound(_))
        ));
    }
}
