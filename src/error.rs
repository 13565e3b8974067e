//! Core error types

use thiserror::Error;

/// Errors surfaced by the orchestration core.
///
/// `Clone` is required because a single connect outcome may be observed by
/// several callers joined on the same in-flight attempt.
#[derive(Error, Debug, Clone)]
pub enum CoreError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Node busy: {0}")]
    NodeLockBusy(String),

    #[error("Chain busy: {0}")]
    ChainLockBusy(String),

    #[error("No route found: {0}")]
    NoRouteFound(String),

    #[error("Manual credentials required: {0}")]
    ManualCredentialsRequired(String),

    #[error("Handshake failed: {0}")]
    HandshakeFailed(String),

    #[error("Connection pool exhausted: {0} slots in use")]
    PoolExhausted(usize),

    #[error("Node not ready: {0}")]
    NotReady(String),

    #[error("Channel error: {0}")]
    Channel(String),

    #[error("Transport error: {0}")]
    Transport(String),
}

pub type Result<T> = std::result::Result<T, CoreError>;

impl From<russh::Error> for CoreError {
    fn from(err: russh::Error) -> Self {
        CoreError::Transport(err.to_string())
    }
}

impl From<russh::keys::Error> for CoreError {
    fn from(err: russh::keys::Error) -> Self {
        CoreError::Transport(err.to_string())
    }
}

// Make CoreError serializable for IPC-style frontends
impl serde::Serialize for CoreError {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}
