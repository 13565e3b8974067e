//! Connection slot: one live transport and its multiplexed channels

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tracing::warn;

use crate::node::NodeId;
use crate::transport::{ChannelKind, SessionChannel, Transport};

/// Bookkeeping for one multiplexed channel.
pub struct ChannelRecord {
    pub kind: ChannelKind,
    pub opened_at: DateTime<Utc>,
    /// Held so the pool can close the channel on teardown. Consumers release
    /// via `close_channel`, never by destroying the slot.
    pub channel: AsyncMutex<Option<Box<dyn SessionChannel>>>,
}

/// The pool's record of one live transport.
///
/// Lock ordering: the channel table (`DashMap`) and the atomics are safe in
/// any order; `idle_timer` is a short parking_lot lock and must not be held
/// across `.await`.
pub struct ConnectionSlot {
    pub node_id: NodeId,
    pub transport: Box<dyn Transport>,
    pub channels: DashMap<String, ChannelRecord>,
    pub created_at: DateTime<Utc>,
    /// Suppresses idle eviction regardless of refcount.
    pub keep_alive: AtomicBool,
    ref_count: AtomicU32,
    /// Unix millis of the last channel open/close/probe-ok.
    last_active: AtomicI64,
    consecutive_probe_failures: AtomicU32,
    idle_timer: Mutex<Option<JoinHandle<()>>>,
}

impl ConnectionSlot {
    pub fn new(node_id: NodeId, transport: Box<dyn Transport>) -> Self {
        Self {
            node_id,
            transport,
            channels: DashMap::new(),
            created_at: Utc::now(),
            keep_alive: AtomicBool::new(false),
            ref_count: AtomicU32::new(0),
            last_active: AtomicI64::new(Utc::now().timestamp_millis()),
            consecutive_probe_failures: AtomicU32::new(0),
            idle_timer: Mutex::new(None),
        }
    }

    pub fn ref_count(&self) -> u32 {
        self.ref_count.load(Ordering::SeqCst)
    }

    pub fn add_ref(&self) -> u32 {
        self.touch();
        self.ref_count.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn release(&self) -> u32 {
        self.touch();
        let prev = self.ref_count.load(Ordering::SeqCst);
        if prev == 0 {
            warn!(node_id = %self.node_id, "Refcount release below zero ignored");
            return 0;
        }
        self.ref_count.fetch_sub(1, Ordering::SeqCst) - 1
    }

    pub fn touch(&self) {
        self.last_active
            .store(Utc::now().timestamp_millis(), Ordering::SeqCst);
    }

    pub fn last_active_millis(&self) -> i64 {
        self.last_active.load(Ordering::SeqCst)
    }

    pub fn idle_for(&self) -> Duration {
        let idle_ms = Utc::now().timestamp_millis() - self.last_active_millis();
        Duration::from_millis(idle_ms.max(0) as u64)
    }

    pub fn record_probe_failure(&self) -> u32 {
        self.consecutive_probe_failures
            .fetch_add(1, Ordering::SeqCst)
            + 1
    }

    pub fn reset_probe_failures(&self) {
        self.consecutive_probe_failures.store(0, Ordering::SeqCst);
    }

    /// Replace the idle timer, cancelling a previously armed one.
    pub fn arm_idle_timer(&self, handle: JoinHandle<()>) {
        let mut timer = self.idle_timer.lock();
        if let Some(old) = timer.take() {
            old.abort();
        }
        *timer = Some(handle);
    }

    pub fn cancel_idle_timer(&self) {
        if let Some(handle) = self.idle_timer.lock().take() {
            handle.abort();
        }
    }

    pub fn channel_count_of(&self, kind_name: &str) -> usize {
        self.channels
            .iter()
            .filter(|entry| entry.value().kind.name() == kind_name)
            .count()
    }
}
