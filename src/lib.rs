//! oxide-core - SSH session orchestration and connection pooling
//!
//! The connection core behind a multi-hop SSH client: a tree of endpoints
//! (jump chains), one pooled transport per connected node with multiplexed
//! terminal/SFTP/forward channels, shortest-path auto-routing over saved
//! endpoints, generation-stamped state events, and a reconnection supervisor
//! that recovers dead links after network changes.
//!
//! Everything hangs off one [`Orchestrator`] context; there are no global
//! singletons, so tests and embedders can run several cores side by side.

pub mod config;
pub mod error;
pub mod events;
pub mod node;
pub mod orchestrator;
pub mod pool;
pub mod route;
pub mod supervisor;
pub mod transport;

pub use error::{CoreError, Result};
pub use orchestrator::Orchestrator;
