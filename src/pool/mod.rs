//! Connection pool: one transport per connected node, multiplexed channels
//!
//! Owns every live transport, keyed by node id. Connect attempts are
//! single-flight per node: concurrent callers join the in-flight attempt and
//! observe the same outcome, so a node never sees two racing handshakes.
//! Channel refcounts are the sole authority over slot lifetime; nothing
//! outside the pool destroys a slot directly.

mod slot;

pub use slot::{ChannelRecord, ConnectionSlot};

use std::collections::HashSet;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::{broadcast, watch, Mutex as AsyncMutex};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::PoolConfig;
use crate::error::{CoreError, Result};
use crate::events::{NodeEvent, NodeEventBus};
use crate::node::{Node, NodeId, NodeReadiness, NodeRegistry};
use crate::transport::{
    ChannelKind, CredentialProvider, Credentials, ProbeOutcome, Secret, TransportFactory,
};

type ConnectOutcome = Option<std::result::Result<(), CoreError>>;

const DEAD_SIGNAL_CAPACITY: usize = 32;

/// Read-only pool snapshot for UI consumption.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolStats {
    /// Connected nodes with at least one channel reference.
    pub active: usize,
    /// Connected nodes with zero channel references.
    pub idle: usize,
    /// Nodes with a connect attempt in flight (initial or reconnect).
    pub reconnecting: usize,
    pub link_down: usize,
    pub terminal_channels: usize,
    pub sftp_channels: usize,
    pub forward_channels: usize,
    pub total_ref_count: u32,
    /// 0 = unbounded.
    pub capacity: usize,
    pub idle_timeout_secs: u64,
}

pub struct ConnectionPool {
    registry: Arc<NodeRegistry>,
    bus: Arc<NodeEventBus>,
    factory: Arc<dyn TransportFactory>,
    credentials: Arc<dyn CredentialProvider>,
    config: PoolConfig,
    slots: DashMap<NodeId, Arc<ConnectionSlot>>,
    /// Single-flight join points: joiners await the receiver, the leader
    /// publishes the shared outcome through the paired sender.
    in_flight: DashMap<NodeId, watch::Receiver<ConnectOutcome>>,
    /// Dead-connection signal consumed by the reconnection supervisor.
    dead_tx: broadcast::Sender<NodeId>,
}

impl ConnectionPool {
    pub fn new(
        registry: Arc<NodeRegistry>,
        bus: Arc<NodeEventBus>,
        factory: Arc<dyn TransportFactory>,
        credentials: Arc<dyn CredentialProvider>,
        config: PoolConfig,
    ) -> Arc<Self> {
        let (dead_tx, _) = broadcast::channel(DEAD_SIGNAL_CAPACITY);
        Arc::new(Self {
            registry,
            bus,
            factory,
            credentials,
            config,
            slots: DashMap::new(),
            in_flight: DashMap::new(),
            dead_tx,
        })
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Node ids whose connection was just declared dead.
    pub fn subscribe_dead(&self) -> broadcast::Receiver<NodeId> {
        self.dead_tx.subscribe()
    }

    /// Apply a readiness transition and publish the stamped event. The
    /// generation is allocated and the registry updated before publishing,
    /// so a snapshot taken at any point is never behind its own generation.
    fn transition(
        &self,
        node_id: &str,
        next: NodeReadiness,
        reason: Option<String>,
    ) -> Result<u64> {
        let generation = self.bus.next_generation(node_id);
        self.registry
            .apply_state(node_id, next, generation, reason.clone())?;
        self.bus.publish(NodeEvent::ConnectionStateChanged {
            node_id: node_id.to_string(),
            generation,
            state: next,
            reason,
        });
        Ok(generation)
    }

    /// Connect a node, credentials resolved through the provider.
    /// Idempotent: a healthy connected node returns immediately.
    pub async fn connect(self: &Arc<Self>, node_id: &str) -> Result<()> {
        self.connect_with_credentials(node_id, None).await
    }

    /// Connect with an explicit one-shot password (manual reconnect path).
    /// The override is consumed by this attempt and never stored.
    pub async fn connect_with_credentials(
        self: &Arc<Self>,
        node_id: &str,
        password_override: Option<Secret>,
    ) -> Result<()> {
        let node = self.registry.get_node(node_id)?;

        if node.runtime.readiness == NodeReadiness::Connected {
            if let Some(slot) = self.slots.get(node_id) {
                if slot.transport.is_open() {
                    return Ok(());
                }
            }
        }

        let tx = match self.in_flight.entry(node_id.to_string()) {
            Entry::Occupied(entry) => {
                let mut rx = entry.get().clone();
                drop(entry);
                debug!(node_id = %node_id, "Joining in-flight connect attempt");
                loop {
                    let settled = rx.borrow().clone();
                    if let Some(result) = settled {
                        return result;
                    }
                    if rx.changed().await.is_err() {
                        let settled = rx.borrow().clone();
                        return settled.unwrap_or_else(|| {
                            Err(CoreError::Conflict(format!(
                                "connect attempt for {} aborted",
                                node_id
                            )))
                        });
                    }
                }
            }
            Entry::Vacant(vacant) => {
                let (tx, rx) = watch::channel::<ConnectOutcome>(None);
                vacant.insert(rx);
                tx
            }
        };

        let result = self.do_connect(&node, password_override).await;
        // remove before publishing so a caller arriving after the outcome
        // starts a fresh attempt instead of joining a settled one
        self.in_flight.remove(node_id);
        let _ = tx.send(Some(result.clone()));
        result
    }

    async fn do_connect(
        self: &Arc<Self>,
        node: &Node,
        password_override: Option<Secret>,
    ) -> Result<()> {
        let node_id = node.id.as_str();

        // Ancestors first. The child has not entered `connecting` yet, so a
        // failing parent regresses only itself; this node stays untouched.
        if let Some(parent_id) = &node.parent_id {
            if self.registry.readiness(parent_id)? != NodeReadiness::Connected {
                Box::pin(self.connect(parent_id)).await?;
            }
        }

        // A reconnect replaces a dead transport: drop the stale slot and the
        // pin it held on the parent before it can count against capacity.
        if let Some((_, stale)) = self.slots.remove(node_id) {
            stale.cancel_idle_timer();
            stale.transport.close().await;
            self.release_parent_pin(node);
        }

        // Synchronous reject, no state mutation.
        self.ensure_capacity(node_id).await?;

        self.transition(node_id, NodeReadiness::Connecting, None)?;

        match self.establish(node, password_override).await {
            Ok(transport) => {
                let slot = Arc::new(ConnectionSlot::new(node.id.clone(), transport));
                if node.parent_id.is_none() && self.config.exempt_roots_from_idle {
                    slot.keep_alive.store(true, Ordering::SeqCst);
                }
                // a tunneled child pins its parent against idle eviction
                if let Some(parent_id) = &node.parent_id {
                    if let Some(parent_slot) = self.slots.get(parent_id) {
                        parent_slot.cancel_idle_timer();
                        let refs = parent_slot.add_ref();
                        self.registry.set_ref_count(parent_id, refs);
                    }
                }
                self.slots.insert(node.id.clone(), slot);
                self.transition(node_id, NodeReadiness::Connected, None)?;
                info!(node_id = %node_id, host = %node.endpoint.host, "Node connected");
                Ok(())
            }
            Err(e) => {
                let err = match e {
                    CoreError::HandshakeFailed(_) => e,
                    other => CoreError::HandshakeFailed(other.to_string()),
                };
                warn!(node_id = %node_id, host = %node.endpoint.host, error = %err, "Connect failed");
                let _ = self.transition(node_id, NodeReadiness::Error, Some(err.to_string()));
                Err(err)
            }
        }
    }

    async fn establish(
        &self,
        node: &Node,
        password_override: Option<Secret>,
    ) -> Result<Box<dyn crate::transport::Transport>> {
        let credentials = match password_override {
            Some(password) => Credentials::with_password(password),
            None => self.credentials.resolve(&node.endpoint).await?,
        };

        let connect_fut = async {
            if let Some(parent_id) = &node.parent_id {
                let parent_slot = self
                    .slots
                    .get(parent_id)
                    .map(|s| s.value().clone())
                    .ok_or_else(|| {
                        CoreError::NotReady(format!("parent {} has no live connection", parent_id))
                    })?;
                let stream = parent_slot
                    .transport
                    .open_tunnel(&node.endpoint.host, node.endpoint.port)
                    .await?;
                self.factory
                    .connect_via(stream, &node.endpoint, &credentials)
                    .await
            } else {
                self.factory.connect(&node.endpoint, &credentials).await
            }
        };

        tokio::time::timeout(self.config.connect_timeout(), connect_fut)
            .await
            .map_err(|_| {
                CoreError::HandshakeFailed(format!(
                    "connect to {} timed out after {}s",
                    node.endpoint.host, self.config.connect_timeout_secs
                ))
            })?
    }

    /// Enforce the capacity policy: evict the least-recently-active idle
    /// slot, or reject with `PoolExhausted` when nothing is evictable.
    /// The connecting node's own ancestor chain is never a victim — a
    /// chained connect must not tear down the hops it just came through.
    async fn ensure_capacity(self: &Arc<Self>, connecting_id: &str) -> Result<()> {
        let max = self.config.max_connections;
        if max == 0 || self.slots.len() < max {
            return Ok(());
        }

        let own_chain: HashSet<NodeId> = self
            .registry
            .get_path(connecting_id)?
            .into_iter()
            .collect();

        let mut candidate: Option<(NodeId, i64)> = None;
        for entry in self.slots.iter() {
            let slot = entry.value();
            if own_chain.contains(entry.key()) {
                continue;
            }
            if slot.ref_count() != 0 || slot.keep_alive.load(Ordering::SeqCst) {
                continue;
            }
            if !matches!(
                self.registry.readiness(entry.key()),
                Ok(NodeReadiness::Connected)
            ) {
                continue;
            }
            let last_active = slot.last_active_millis();
            if candidate
                .as_ref()
                .map(|(_, ts)| last_active < *ts)
                .unwrap_or(true)
            {
                candidate = Some((entry.key().clone(), last_active));
            }
        }

        match candidate {
            Some((victim, _)) => {
                info!(node_id = %victim, "Evicting idle connection to stay within capacity");
                self.disconnect_single(&victim).await
            }
            None => Err(CoreError::PoolExhausted(self.slots.len())),
        }
    }

    /// Open a logical channel over a connected node's transport.
    pub async fn open_channel(self: &Arc<Self>, node_id: &str, kind: ChannelKind) -> Result<String> {
        if self.registry.readiness(node_id)? != NodeReadiness::Connected {
            return Err(CoreError::NotReady(format!(
                "node {} is not connected",
                node_id
            )));
        }
        let slot = self
            .slots
            .get(node_id)
            .map(|s| s.value().clone())
            .ok_or_else(|| {
                CoreError::NotReady(format!("node {} has no live connection", node_id))
            })?;

        let channel = slot.transport.open_channel(&kind).await?;
        let channel_id = Uuid::new_v4().to_string();
        slot.channels.insert(
            channel_id.clone(),
            ChannelRecord {
                kind: kind.clone(),
                opened_at: Utc::now(),
                channel: AsyncMutex::new(Some(channel)),
            },
        );
        slot.cancel_idle_timer();
        let refs = slot.add_ref();
        self.registry.record_channel(node_id, &kind, &channel_id);
        self.registry.set_ref_count(node_id, refs);

        if matches!(kind, ChannelKind::Sftp) && slot.channel_count_of("sftp") == 1 {
            self.registry.set_sftp_ready(node_id, true);
            self.bus.publish(NodeEvent::SftpReady {
                node_id: node_id.to_string(),
                generation: self.bus.next_generation(node_id),
                ready: true,
                cwd: None,
            });
        }

        debug!(node_id = %node_id, channel_id = %channel_id, kind = kind.name(), refs, "Channel opened");
        Ok(channel_id)
    }

    /// Release a channel. Refcount 0 arms the idle-eviction timer.
    pub async fn close_channel(self: &Arc<Self>, node_id: &str, channel_id: &str) -> Result<()> {
        let slot = self
            .slots
            .get(node_id)
            .map(|s| s.value().clone())
            .ok_or_else(|| {
                CoreError::NotFound(format!("no live connection for node {}", node_id))
            })?;
        let (_, record) = slot
            .channels
            .remove(channel_id)
            .ok_or_else(|| CoreError::NotFound(format!("channel {}", channel_id)))?;

        if let Some(mut channel) = record.channel.lock().await.take() {
            if let Err(e) = channel.close().await {
                debug!(node_id = %node_id, channel_id = %channel_id, error = %e, "Channel close failed");
            }
        }

        let refs = slot.release();
        self.registry.remove_channel(node_id, &record.kind, channel_id);
        self.registry.set_ref_count(node_id, refs);

        if matches!(record.kind, ChannelKind::Sftp) && slot.channel_count_of("sftp") == 0 {
            self.registry.set_sftp_ready(node_id, false);
            self.bus.publish(NodeEvent::SftpReady {
                node_id: node_id.to_string(),
                generation: self.bus.next_generation(node_id),
                ready: false,
                cwd: None,
            });
        }

        debug!(node_id = %node_id, channel_id = %channel_id, refs, "Channel closed");
        if refs == 0 {
            self.arm_idle_timer(node_id, &slot);
        }
        Ok(())
    }

    fn arm_idle_timer(self: &Arc<Self>, node_id: &str, slot: &Arc<ConnectionSlot>) {
        let Some(timeout) = self.config.idle_timeout() else {
            return;
        };
        if slot.keep_alive.load(Ordering::SeqCst) {
            return;
        }
        debug!(node_id = %node_id, timeout_secs = self.config.idle_timeout_secs, "Arming idle timer");

        let pool = Arc::downgrade(self);
        let slot_ref = Arc::downgrade(slot);
        let node_id = node_id.to_string();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let (Some(pool), Some(slot)) = (pool.upgrade(), slot_ref.upgrade()) else {
                return;
            };
            // a channel may have been opened while we slept
            if slot.ref_count() != 0 {
                return;
            }
            if !matches!(
                pool.registry.readiness(&node_id),
                Ok(NodeReadiness::Connected)
            ) {
                return;
            }
            info!(node_id = %node_id, "Idle timeout reached, closing connection");
            if let Err(e) = pool.disconnect(&node_id, false).await {
                debug!(node_id = %node_id, error = %e, "Idle eviction skipped");
            }
        });
        slot.arm_idle_timer(handle);
    }

    /// Tear down a node's connection. With `cascade`, descendants are torn
    /// down strictly before the node itself (a child's transport rides the
    /// parent's session); without it, live descendants are a `Conflict`.
    pub async fn disconnect(self: &Arc<Self>, node_id: &str, cascade: bool) -> Result<()> {
        self.registry.get_node(node_id)?;
        if self.in_flight.contains_key(node_id) {
            return Err(CoreError::NodeLockBusy(format!(
                "connect in flight for node {}",
                node_id
            )));
        }

        let descendants = self.registry.get_descendants(node_id)?;
        let live_count = descendants
            .iter()
            .filter(|d| d.runtime.readiness.is_live())
            .count();
        if !cascade && live_count > 0 {
            return Err(CoreError::Conflict(format!(
                "node {} has {} live descendant(s); use cascade or tear them down first",
                node_id, live_count
            )));
        }

        if cascade {
            for d in &descendants {
                if self.in_flight.contains_key(&d.id) {
                    return Err(CoreError::NodeLockBusy(format!(
                        "connect in flight for descendant {}",
                        d.id
                    )));
                }
            }
            // reversed pre-order visits every node before its ancestors
            for d in descendants.iter().rev() {
                self.disconnect_single(&d.id).await?;
            }
        }

        self.disconnect_single(node_id).await
    }

    async fn disconnect_single(self: &Arc<Self>, node_id: &str) -> Result<()> {
        let Some((_, slot)) = self.slots.remove(node_id) else {
            // no live transport; normalize state anyway
            if self.registry.readiness(node_id)? != NodeReadiness::Disconnected {
                self.transition(node_id, NodeReadiness::Disconnected, None)?;
            }
            return Ok(());
        };

        slot.cancel_idle_timer();
        let had_sftp = slot.channel_count_of("sftp") > 0;

        // channels first, then the transport they ride on
        let channel_ids: Vec<String> = slot.channels.iter().map(|e| e.key().clone()).collect();
        for channel_id in channel_ids {
            if let Some((_, record)) = slot.channels.remove(&channel_id) {
                if let Some(mut channel) = record.channel.lock().await.take() {
                    if let Err(e) = channel.close().await {
                        debug!(node_id = %node_id, channel_id = %channel_id, error = %e, "Channel close failed during teardown");
                    }
                }
            }
        }
        slot.transport.close().await;

        // unpin the parent; with its last child gone it may idle out
        if let Ok(node) = self.registry.get_node(node_id) {
            if let Some(parent_id) = &node.parent_id {
                if let Some(parent_slot) = self.slots.get(parent_id).map(|s| s.value().clone()) {
                    let refs = parent_slot.release();
                    self.registry.set_ref_count(parent_id, refs);
                    if refs == 0
                        && matches!(
                            self.registry.readiness(parent_id),
                            Ok(NodeReadiness::Connected)
                        )
                    {
                        self.arm_idle_timer(parent_id, &parent_slot);
                    }
                }
            }
        }

        self.transition(node_id, NodeReadiness::Disconnected, None)?;
        if had_sftp {
            self.bus.publish(NodeEvent::SftpReady {
                node_id: node_id.to_string(),
                generation: self.bus.next_generation(node_id),
                ready: false,
                cwd: None,
            });
        }
        info!(node_id = %node_id, "Connection closed");
        Ok(())
    }

    fn release_parent_pin(&self, node: &Node) {
        let Some(parent_id) = &node.parent_id else {
            return;
        };
        if let Some(parent_slot) = self.slots.get(parent_id) {
            let refs = parent_slot.release();
            self.registry.set_ref_count(parent_id, refs);
        }
    }

    /// Lightweight liveness check. Healthy probes mutate nothing. A hard IO
    /// error, or a threshold of consecutive timeouts, declares the node dead:
    /// it and every connected descendant flip to `link_down` in one pass and
    /// the dead-connection signal fires for the supervisor.
    pub async fn probe(self: &Arc<Self>, node_id: &str) -> Result<ProbeOutcome> {
        let slot = self
            .slots
            .get(node_id)
            .map(|s| s.value().clone())
            .ok_or_else(|| {
                CoreError::NotReady(format!("node {} has no live connection", node_id))
            })?;

        let outcome = tokio::time::timeout(self.config.probe_timeout(), slot.transport.probe())
            .await
            .unwrap_or(ProbeOutcome::Timeout);

        match outcome {
            ProbeOutcome::Healthy => {
                slot.reset_probe_failures();
                Ok(ProbeOutcome::Healthy)
            }
            ProbeOutcome::Timeout => {
                let failures = slot.record_probe_failure();
                if failures >= self.config.probe_fail_threshold {
                    warn!(node_id = %node_id, failures, "Probe timeouts exceeded threshold, declaring link down");
                    self.mark_link_down(
                        node_id,
                        &format!("no keepalive reply after {} probes", failures),
                    )?;
                    Ok(ProbeOutcome::Dead)
                } else {
                    debug!(node_id = %node_id, failures, "Probe timeout (below threshold)");
                    Ok(ProbeOutcome::Timeout)
                }
            }
            ProbeOutcome::Dead => {
                warn!(node_id = %node_id, "Probe reported hard failure, declaring link down");
                self.mark_link_down(node_id, "connection lost")?;
                Ok(ProbeOutcome::Dead)
            }
        }
    }

    /// Flip a node and all its connected descendants to `link_down` in a
    /// single registry pass and raise the dead-connection signal for each.
    pub fn mark_link_down(&self, node_id: &str, reason: &str) -> Result<()> {
        let affected =
            self.registry
                .mark_subtree_link_down(node_id, self.bus.sequencer(), reason)?;
        for (id, generation) in affected {
            self.bus.publish(NodeEvent::ConnectionStateChanged {
                node_id: id.clone(),
                generation,
                state: NodeReadiness::LinkDown,
                reason: Some(reason.to_string()),
            });
            let _ = self.dead_tx.send(id);
        }
        Ok(())
    }

    /// Replace a dead transport. Only valid from `link_down`/`error`; the
    /// previous channel bookkeeping is dropped (those channel ids died with
    /// the old transport).
    pub async fn reconnect(
        self: &Arc<Self>,
        node_id: &str,
        password_override: Option<Secret>,
    ) -> Result<()> {
        let readiness = self.registry.readiness(node_id)?;
        if !matches!(readiness, NodeReadiness::LinkDown | NodeReadiness::Error) {
            return Err(CoreError::Conflict(format!(
                "node {} is {:?}, not awaiting reconnect",
                node_id, readiness
            )));
        }
        self.registry.clear_channels(node_id);
        self.connect_with_credentials(node_id, password_override)
            .await
    }

    pub fn get_stats(&self) -> PoolStats {
        let mut stats = PoolStats {
            capacity: self.config.max_connections,
            idle_timeout_secs: self.config.idle_timeout_secs,
            ..Default::default()
        };

        for entry in self.slots.iter() {
            let slot = entry.value();
            stats.terminal_channels += slot.channel_count_of("terminal");
            stats.sftp_channels += slot.channel_count_of("sftp");
            stats.forward_channels += slot.channel_count_of("forward");
            stats.total_ref_count += slot.ref_count();
        }

        for flat in self.registry.flatten() {
            match flat.readiness {
                NodeReadiness::Connected => {
                    let busy = self
                        .slots
                        .get(&flat.id)
                        .map(|s| s.ref_count() > 0)
                        .unwrap_or(false);
                    if busy {
                        stats.active += 1;
                    } else {
                        stats.idle += 1;
                    }
                }
                NodeReadiness::Connecting => stats.reconnecting += 1,
                NodeReadiness::LinkDown => stats.link_down += 1,
                _ => {}
            }
        }
        stats
    }

    /// True when the node currently holds a live slot.
    pub fn has_slot(&self, node_id: &str) -> bool {
        self.slots.contains_key(node_id)
    }
}
