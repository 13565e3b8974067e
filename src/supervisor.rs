//! Reconnection supervisor
//!
//! Finds dead connections proactively instead of waiting for an operation to
//! fail. External triggers (network transition, resume from sleep) and a
//! periodic heartbeat each request a sweep; sweeps are debounced so the
//! network can settle, and rate-limited so bursty triggers cannot cause probe
//! storms. Dead nodes reconnect automatically with capped exponential backoff
//! when their auth is non-interactive; password nodes instead raise a
//! reconnect-pending signal for the UI.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use parking_lot::Mutex;
use rand::Rng;
use serde::Serialize;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::SupervisorConfig;
use crate::error::Result;
use crate::node::{NodeId, NodeReadiness, NodeRegistry};
use crate::pool::ConnectionPool;
use crate::transport::Secret;

const PENDING_SIGNAL_CAPACITY: usize = 32;

/// What asked for a sweep. Logged, and useful for embedder diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SweepTrigger {
    /// OS went online/offline.
    NetworkChange,
    /// Resume from sleep or a long-hidden window.
    Resume,
    /// Periodic backend heartbeat.
    Heartbeat,
}

/// A password-auth node went link-down; the UI must collect a password and
/// call [`ReconnectionSupervisor::reconnect_with_password`].
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconnectPending {
    pub node_id: NodeId,
    pub host: String,
    pub username: String,
}

pub struct ReconnectionSupervisor {
    pool: Arc<ConnectionPool>,
    registry: Arc<NodeRegistry>,
    config: SupervisorConfig,
    /// Current attempt series per node; bumping it invalidates a running
    /// backoff loop (stale-attempt guard).
    attempt_ids: DashMap<NodeId, u64>,
    /// Running backoff loops.
    tasks: DashMap<NodeId, JoinHandle<()>>,
    pending_tx: broadcast::Sender<ReconnectPending>,
    /// A debounce timer is already pending.
    sweep_scheduled: AtomicBool,
    last_sweep: Mutex<Option<Instant>>,
    sweep_count: AtomicU64,
    background: Mutex<Vec<JoinHandle<()>>>,
}

impl ReconnectionSupervisor {
    pub fn new(
        pool: Arc<ConnectionPool>,
        registry: Arc<NodeRegistry>,
        config: SupervisorConfig,
    ) -> Arc<Self> {
        let (pending_tx, _) = broadcast::channel(PENDING_SIGNAL_CAPACITY);
        Arc::new(Self {
            pool,
            registry,
            config,
            attempt_ids: DashMap::new(),
            tasks: DashMap::new(),
            pending_tx,
            sweep_scheduled: AtomicBool::new(false),
            last_sweep: Mutex::new(None),
            sweep_count: AtomicU64::new(0),
            background: Mutex::new(Vec::new()),
        })
    }

    /// Spawn the heartbeat loop and the dead-connection listener.
    pub fn start(self: &Arc<Self>) {
        let mut background = self.background.lock();
        if !background.is_empty() {
            return;
        }

        let sup = self.clone();
        background.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(sup.config.heartbeat_interval());
            ticker.tick().await; // immediate first tick
            loop {
                ticker.tick().await;
                sup.maybe_sweep(SweepTrigger::Heartbeat).await;
            }
        }));

        let sup = self.clone();
        let mut dead_rx = self.pool.subscribe_dead();
        background.push(tokio::spawn(async move {
            loop {
                match dead_rx.recv().await {
                    Ok(node_id) => sup.schedule_reconnect(&node_id),
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!(missed = n, "Dead-connection signals lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }));

        info!("Reconnection supervisor started");
    }

    pub fn subscribe_pending(&self) -> broadcast::Receiver<ReconnectPending> {
        self.pending_tx.subscribe()
    }

    /// Request a sweep. Coalesces bursts: while a debounce timer is pending,
    /// further triggers are no-ops.
    pub fn trigger(self: &Arc<Self>, trigger: SweepTrigger) {
        if self.sweep_scheduled.swap(true, Ordering::SeqCst) {
            debug!(?trigger, "Sweep already scheduled, trigger coalesced");
            return;
        }
        debug!(?trigger, "Sweep scheduled");
        let sup = self.clone();
        let debounce = self.config.trigger_debounce();
        tokio::spawn(async move {
            tokio::time::sleep(debounce).await;
            sup.sweep_scheduled.store(false, Ordering::SeqCst);
            sup.maybe_sweep(trigger).await;
        });
    }

    /// Rate-limited sweep entry point.
    async fn maybe_sweep(self: &Arc<Self>, trigger: SweepTrigger) {
        {
            let mut last = self.last_sweep.lock();
            if let Some(at) = *last {
                if at.elapsed() < self.config.min_sweep_interval() {
                    debug!(?trigger, "Sweep rate-limited");
                    return;
                }
            }
            *last = Some(Instant::now());
        }
        self.sweep(trigger).await;
    }

    /// Probe every connected node and re-kick link-down nodes that lost
    /// their backoff loop (e.g. after give-up followed by a network change).
    async fn sweep(self: &Arc<Self>, trigger: SweepTrigger) {
        self.sweep_count.fetch_add(1, Ordering::SeqCst);
        let connected = self.registry.ids_with_readiness(NodeReadiness::Connected);
        debug!(?trigger, nodes = connected.len(), "Sweeping connected nodes");

        for node_id in connected {
            if let Err(e) = self.pool.probe(&node_id).await {
                debug!(node_id = %node_id, error = %e, "Probe skipped");
            }
            // a dead outcome raised the dead-connection signal; the listener
            // schedules the reconnect
        }

        for node_id in self.registry.ids_with_readiness(NodeReadiness::LinkDown) {
            self.schedule_reconnect(&node_id);
        }
    }

    /// Begin (or re-begin) recovery for a dead node. Password-auth nodes get
    /// a pending signal instead of an automatic loop; everything else gets a
    /// backoff loop unless one is already running.
    pub fn schedule_reconnect(self: &Arc<Self>, node_id: &str) {
        let Ok(node) = self.registry.get_node(node_id) else {
            return;
        };
        if !matches!(
            node.runtime.readiness,
            NodeReadiness::LinkDown | NodeReadiness::Error
        ) {
            return;
        }

        if node.endpoint.auth.requires_interactive_secret() {
            info!(node_id = %node_id, host = %node.endpoint.host, "Password auth, awaiting manual reconnect");
            let _ = self.pending_tx.send(ReconnectPending {
                node_id: node_id.to_string(),
                host: node.endpoint.host.clone(),
                username: node.endpoint.username.clone(),
            });
            return;
        }

        if let Some(task) = self.tasks.get(node_id) {
            if !task.is_finished() {
                return;
            }
        }

        let attempt_id = self.bump_attempt_id(node_id);
        info!(node_id = %node_id, host = %node.endpoint.host, "Scheduling automatic reconnect");

        let sup = self.clone();
        let id = node_id.to_string();
        let handle = tokio::spawn(async move {
            sup.reconnect_loop(&id, attempt_id).await;
            // only clear our own registration, not a newer series'
            if sup.attempt_ids.get(&id).map(|v| *v) == Some(attempt_id) {
                sup.tasks.remove(&id);
            }
        });
        self.tasks.insert(node_id.to_string(), handle);
    }

    /// Capped exponential backoff: a short first delay for the common case
    /// of a momentary blip, then doubling from the initial delay up to the
    /// cap, with +/-20% jitter. Gives up after the attempt budget; the node
    /// stays in `error` with the reason from the last failure.
    async fn reconnect_loop(self: &Arc<Self>, node_id: &str, attempt_id: u64) {
        let max_attempts = self.config.reconnect_max_attempts;
        let mut delay = self.config.reconnect_first_delay();

        for attempt in 1..=max_attempts {
            let jittered = {
                let mut rng = rand::thread_rng();
                delay.mul_f64(rng.gen_range(0.8..1.2))
            };
            tokio::time::sleep(jittered).await;

            // superseded by a manual reconnect or a newer series
            if self.attempt_ids.get(node_id).map(|v| *v) != Some(attempt_id) {
                debug!(node_id = %node_id, "Reconnect series superseded, stopping");
                return;
            }
            if !matches!(
                self.registry.readiness(node_id),
                Ok(NodeReadiness::LinkDown | NodeReadiness::Error)
            ) {
                debug!(node_id = %node_id, "Node no longer awaiting reconnect, stopping");
                return;
            }

            match self.pool.reconnect(node_id, None).await {
                Ok(()) => {
                    info!(node_id = %node_id, attempt, "Automatic reconnect succeeded");
                    return;
                }
                Err(e) => {
                    warn!(node_id = %node_id, attempt, max_attempts, error = %e, "Reconnect attempt failed");
                }
            }

            delay = if attempt == 1 {
                self.config.reconnect_initial_delay()
            } else {
                (delay * 2).min(self.config.reconnect_max_delay())
            };
        }

        warn!(node_id = %node_id, max_attempts, "Automatic reconnect gave up");
    }

    /// One-shot manual reconnect with a UI-collected password. Supersedes
    /// any running automatic loop; the password lives only for this attempt.
    pub async fn reconnect_with_password(
        self: &Arc<Self>,
        node_id: &str,
        password: Secret,
    ) -> Result<()> {
        self.bump_attempt_id(node_id);
        if let Some((_, task)) = self.tasks.remove(node_id) {
            task.abort();
        }
        info!(node_id = %node_id, "Manual password reconnect");
        self.pool.reconnect(node_id, Some(password)).await
    }

    fn bump_attempt_id(&self, node_id: &str) -> u64 {
        let mut entry = self.attempt_ids.entry(node_id.to_string()).or_insert(0);
        *entry += 1;
        *entry
    }

    pub fn active_reconnects(&self) -> usize {
        self.tasks.iter().filter(|t| !t.is_finished()).count()
    }

    pub fn sweep_count(&self) -> u64 {
        self.sweep_count.load(Ordering::SeqCst)
    }

    /// Stop background loops and any running backoff loops.
    pub fn shutdown(&self) {
        for handle in self.background.lock().drain(..) {
            handle.abort();
        }
        for entry in self.tasks.iter() {
            entry.value().abort();
        }
        self.tasks.clear();
        info!("Reconnection supervisor stopped");
    }
}
