//! Pool and supervisor configuration

use std::time::Duration;

use serde::{Deserialize, Serialize};

fn default_idle_timeout_secs() -> u64 {
    1800 // 30 minutes
}

fn default_connect_timeout_secs() -> u64 {
    30
}

fn default_probe_timeout_secs() -> u64 {
    5
}

fn default_probe_fail_threshold() -> u32 {
    2
}

fn default_true() -> bool {
    true
}

/// Connection pool policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolConfig {
    /// Seconds a zero-refcount slot may stay idle before eviction.
    /// 0 disables idle eviction.
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,

    /// Maximum concurrent slots. 0 = unbounded.
    #[serde(default)]
    pub max_connections: usize,

    /// Root nodes are never idle-evicted when set. Jump-host roots usually
    /// carry the whole chain, so dropping them costs the most to rebuild.
    #[serde(default = "default_true")]
    pub exempt_roots_from_idle: bool,

    /// Hard deadline for a single connect attempt (handshake + auth).
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,

    /// Deadline for one keepalive probe round trip.
    #[serde(default = "default_probe_timeout_secs")]
    pub probe_timeout_secs: u64,

    /// Consecutive probe timeouts before a connection is declared dead.
    /// A hard IO error is declared dead immediately.
    #[serde(default = "default_probe_fail_threshold")]
    pub probe_fail_threshold: u32,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            idle_timeout_secs: default_idle_timeout_secs(),
            max_connections: 0,
            exempt_roots_from_idle: true,
            connect_timeout_secs: default_connect_timeout_secs(),
            probe_timeout_secs: default_probe_timeout_secs(),
            probe_fail_threshold: default_probe_fail_threshold(),
        }
    }
}

impl PoolConfig {
    pub fn idle_timeout(&self) -> Option<Duration> {
        (self.idle_timeout_secs > 0).then(|| Duration::from_secs(self.idle_timeout_secs))
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }
}

fn default_heartbeat_interval_secs() -> u64 {
    15
}

fn default_trigger_debounce_ms() -> u64 {
    1000
}

fn default_min_sweep_interval_ms() -> u64 {
    5000
}

fn default_reconnect_first_delay_ms() -> u64 {
    200
}

fn default_reconnect_initial_delay_ms() -> u64 {
    500
}

fn default_reconnect_max_delay_secs() -> u64 {
    60
}

fn default_reconnect_max_attempts() -> u32 {
    5
}

/// Reconnection supervisor tunables.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SupervisorConfig {
    /// Interval of the periodic backend heartbeat sweep.
    #[serde(default = "default_heartbeat_interval_secs")]
    pub heartbeat_interval_secs: u64,

    /// Settle time after a network/resume trigger before probing.
    #[serde(default = "default_trigger_debounce_ms")]
    pub trigger_debounce_ms: u64,

    /// Minimum spacing between two probe sweeps (storm protection).
    #[serde(default = "default_min_sweep_interval_ms")]
    pub min_sweep_interval_ms: u64,

    /// First reconnect attempt fires fast: transient blips recover in
    /// well under a second.
    #[serde(default = "default_reconnect_first_delay_ms")]
    pub reconnect_first_delay_ms: u64,

    /// Base delay of the exponential backoff from the second attempt on.
    #[serde(default = "default_reconnect_initial_delay_ms")]
    pub reconnect_initial_delay_ms: u64,

    /// Backoff ceiling.
    #[serde(default = "default_reconnect_max_delay_secs")]
    pub reconnect_max_delay_secs: u64,

    /// Attempts before giving up into `error`.
    #[serde(default = "default_reconnect_max_attempts")]
    pub reconnect_max_attempts: u32,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_secs: default_heartbeat_interval_secs(),
            trigger_debounce_ms: default_trigger_debounce_ms(),
            min_sweep_interval_ms: default_min_sweep_interval_ms(),
            reconnect_first_delay_ms: default_reconnect_first_delay_ms(),
            reconnect_initial_delay_ms: default_reconnect_initial_delay_ms(),
            reconnect_max_delay_secs: default_reconnect_max_delay_secs(),
            reconnect_max_attempts: default_reconnect_max_attempts(),
        }
    }
}

impl SupervisorConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn trigger_debounce(&self) -> Duration {
        Duration::from_millis(self.trigger_debounce_ms)
    }

    pub fn min_sweep_interval(&self) -> Duration {
        Duration::from_millis(self.min_sweep_interval_ms)
    }

    pub fn reconnect_first_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_first_delay_ms)
    }

    pub fn reconnect_initial_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_initial_delay_ms)
    }

    pub fn reconnect_max_delay(&self) -> Duration {
        Duration::from_secs(self.reconnect_max_delay_secs)
    }
}
