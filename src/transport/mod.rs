//! Transport seam: traits the pool connects through
//!
//! The pool never talks to russh directly; it goes through [`Transport`] /
//! [`TransportFactory`]. Production uses the SSH implementation in
//! [`ssh`]; tests swap in the mock without touching pool logic.

pub mod agent;
pub mod ssh;

#[cfg(test)]
pub mod mock;

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::Result;
use crate::node::EndpointSpec;

/// Logical channel kinds multiplexed over one transport.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ChannelKind {
    Terminal,
    Sftp,
    /// Local forward: a direct-tcpip channel to `target_host:target_port`
    /// opened through the node's session.
    #[serde(rename_all = "camelCase")]
    Forward {
        target_host: String,
        target_port: u16,
    },
}

impl ChannelKind {
    pub fn name(&self) -> &'static str {
        match self {
            ChannelKind::Terminal => "terminal",
            ChannelKind::Sftp => "sftp",
            ChannelKind::Forward { .. } => "forward",
        }
    }
}

/// Secret string that is wiped on drop and never printed.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(****)")
    }
}

impl From<&str> for Secret {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// Credentials resolved for exactly one connect attempt. Dropped (and wiped)
/// as soon as the attempt resolves; the core never persists raw secrets.
#[derive(Debug, Default, Clone)]
pub struct Credentials {
    pub password: Option<Secret>,
    pub key_passphrase: Option<Secret>,
}

impl Credentials {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn with_password(password: Secret) -> Self {
        Self {
            password: Some(password),
            key_passphrase: None,
        }
    }
}

/// Supplies resolved credential material per connect attempt (keychain,
/// prompt dialog, agent handle lookup — owned by the embedder).
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    async fn resolve(&self, endpoint: &EndpointSpec) -> Result<Credentials>;
}

/// Host key verification verdict.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostKeyStatus {
    Verified,
    Unknown {
        fingerprint: String,
    },
    Changed {
        expected_fingerprint: String,
        actual_fingerprint: String,
    },
}

/// Caller decision for an unverified key. `Reject` aborts the handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostKeyDecision {
    TrustOnce,
    TrustAndPersist,
    Reject,
}

/// Invoked before a handshake completes. Unknown/changed keys block the
/// handshake until the verifier confirms a trust decision; persistence of
/// trusted keys is the verifier's own business.
#[async_trait]
pub trait HostKeyVerifier: Send + Sync {
    async fn verify(&self, host: &str, port: u16, key: &russh::keys::PublicKey) -> HostKeyStatus;

    async fn confirm(&self, host: &str, port: u16, status: &HostKeyStatus) -> HostKeyDecision;

    async fn persist(
        &self,
        host: &str,
        port: u16,
        key: &russh::keys::PublicKey,
    ) -> Result<()>;
}

/// One keepalive probe result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeOutcome {
    Healthy,
    /// No reply within the deadline. Possibly a slow network; the pool
    /// declares death only after a threshold of consecutive timeouts.
    Timeout,
    /// Hard IO error: the connection is gone.
    Dead,
}

/// Byte stream a child transport is tunneled over.
pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> AsyncStream for T {}

pub type TunnelStream = Box<dyn AsyncStream>;

/// An opened logical channel. The core only tracks and closes channels;
/// payload plumbing belongs to the terminal/SFTP/forward consumers.
#[async_trait]
pub trait SessionChannel: Send {
    async fn close(&mut self) -> Result<()>;
}

/// One live connection to an endpoint.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn open_channel(&self, kind: &ChannelKind) -> Result<Box<dyn SessionChannel>>;

    /// Open a raw byte stream to `host:port` through this session, used to
    /// carry a child node's handshake (SSH-over-SSH).
    async fn open_tunnel(&self, host: &str, port: u16) -> Result<TunnelStream>;

    /// Lightweight liveness check. Must not mutate session state on success.
    async fn probe(&self) -> ProbeOutcome;

    async fn close(&self);

    fn is_open(&self) -> bool;
}

/// Builds transports, either directly or through a parent's tunnel stream.
#[async_trait]
pub trait TransportFactory: Send + Sync {
    async fn connect(
        &self,
        endpoint: &EndpointSpec,
        credentials: &Credentials,
    ) -> Result<Box<dyn Transport>>;

    async fn connect_via(
        &self,
        stream: TunnelStream,
        endpoint: &EndpointSpec,
        credentials: &Credentials,
    ) -> Result<Box<dyn Transport>>;
}

/// Credential provider for setups where no secret is ever needed at connect
/// time (agent or unencrypted key auth).
pub struct NoCredentials;

#[async_trait]
impl CredentialProvider for NoCredentials {
    async fn resolve(&self, _endpoint: &EndpointSpec) -> Result<Credentials> {
        Ok(Credentials::none())
    }
}
