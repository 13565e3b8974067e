//! SSH transport backed by russh
//!
//! One task owns the russh `Handle` per connection ("single owner" pattern).
//! Everything else goes through a cloneable [`HandleController`] that sends
//! commands over an mpsc channel. This avoids `Arc<Mutex<Handle>>` contention,
//! deadlocks from holding locks across `.await`, and protocol violations from
//! concurrent Handle access.

use std::net::ToSocketAddrs;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use russh::client::{self, Handle, Msg};
use russh::keys::key::PrivateKeyWithHashAlg;
use russh::keys::PublicKey;
use russh::Channel;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::error::{CoreError, Result};
use crate::node::{AuthSpec, EndpointSpec};

use super::agent;
use super::{
    ChannelKind, Credentials, HostKeyDecision, HostKeyStatus, HostKeyVerifier, ProbeOutcome,
    SessionChannel, Transport, TransportFactory, TunnelStream,
};

/// Builds russh-backed transports; tunneled hops run the full SSH handshake
/// over a direct-tcpip channel stream of the parent session.
pub struct SshTransportFactory {
    verifier: Arc<dyn HostKeyVerifier>,
    connect_timeout: Duration,
    probe_timeout: Duration,
}

impl SshTransportFactory {
    pub fn new(verifier: Arc<dyn HostKeyVerifier>) -> Self {
        Self {
            verifier,
            connect_timeout: Duration::from_secs(30),
            probe_timeout: Duration::from_secs(5),
        }
    }

    pub fn with_timeouts(
        verifier: Arc<dyn HostKeyVerifier>,
        connect_timeout: Duration,
        probe_timeout: Duration,
    ) -> Self {
        Self {
            verifier,
            connect_timeout,
            probe_timeout,
        }
    }

    fn client_config() -> Arc<client::Config> {
        Arc::new(client::Config {
            inactivity_timeout: None, // app-level probing handles liveness
            keepalive_interval: Some(Duration::from_secs(30)),
            keepalive_max: 3,
            ..Default::default()
        })
    }

    fn handler(&self, endpoint: &EndpointSpec) -> VerifierHandler {
        VerifierHandler {
            host: endpoint.host.clone(),
            port: endpoint.port,
            verifier: self.verifier.clone(),
        }
    }

    async fn authenticate(
        &self,
        handle: &mut Handle<VerifierHandler>,
        endpoint: &EndpointSpec,
        credentials: &Credentials,
    ) -> Result<()> {
        let authenticated = match &endpoint.auth {
            AuthSpec::Password => {
                let password = credentials.password.as_ref().ok_or_else(|| {
                    CoreError::HandshakeFailed(format!(
                        "password auth for {} requires a resolved password",
                        endpoint.host
                    ))
                })?;
                handle
                    .authenticate_password(&endpoint.username, password.expose())
                    .await
                    .map_err(|e| CoreError::HandshakeFailed(e.to_string()))?
            }
            AuthSpec::Key { key_path } => {
                let key = russh::keys::load_secret_key(
                    key_path,
                    credentials.key_passphrase.as_ref().map(|p| p.expose()),
                )
                .map_err(|e| CoreError::HandshakeFailed(format!("key load failed: {}", e)))?;
                let key_with_hash = PrivateKeyWithHashAlg::new(Arc::new(key), None);
                handle
                    .authenticate_publickey(&endpoint.username, key_with_hash)
                    .await
                    .map_err(|e| CoreError::HandshakeFailed(e.to_string()))?
            }
            AuthSpec::Agent => {
                return agent::authenticate(handle, &endpoint.username).await;
            }
            AuthSpec::Certificate {
                key_path,
                cert_path,
            } => {
                let key = russh::keys::load_secret_key(
                    key_path,
                    credentials.key_passphrase.as_ref().map(|p| p.expose()),
                )
                .map_err(|e| CoreError::HandshakeFailed(format!("key load failed: {}", e)))?;
                let cert = russh::keys::load_openssh_certificate(cert_path).map_err(|e| {
                    CoreError::HandshakeFailed(format!("certificate load failed: {}", e))
                })?;
                handle
                    .authenticate_openssh_cert(&endpoint.username, Arc::new(key), cert)
                    .await
                    .map_err(|e| CoreError::HandshakeFailed(e.to_string()))?
            }
        };

        if !authenticated.success() {
            return Err(CoreError::HandshakeFailed(
                "authentication rejected by server".to_string(),
            ));
        }
        Ok(())
    }

    async fn finish(
        &self,
        mut handle: Handle<VerifierHandler>,
        endpoint: &EndpointSpec,
        credentials: &Credentials,
    ) -> Result<Box<dyn Transport>> {
        self.authenticate(&mut handle, endpoint, credentials).await?;
        info!(host = %endpoint.host, username = %endpoint.username, "SSH authentication successful");

        let label = format!("{}@{}:{}", endpoint.username, endpoint.host, endpoint.port);
        let controller = spawn_handle_owner(handle, label, self.probe_timeout);
        Ok(Box::new(SshTransport { controller }))
    }
}

#[async_trait]
impl TransportFactory for SshTransportFactory {
    async fn connect(
        &self,
        endpoint: &EndpointSpec,
        credentials: &Credentials,
    ) -> Result<Box<dyn Transport>> {
        let addr = format!("{}:{}", endpoint.host, endpoint.port);
        info!("Connecting to SSH server at {}", addr);

        let socket_addr = addr
            .to_socket_addrs()
            .map_err(|e| CoreError::HandshakeFailed(format!("address resolution failed: {}", e)))?
            .next()
            .ok_or_else(|| {
                CoreError::HandshakeFailed(format!("no address found for {}", addr))
            })?;

        let handle = tokio::time::timeout(
            self.connect_timeout,
            client::connect(Self::client_config(), socket_addr, self.handler(endpoint)),
        )
        .await
        .map_err(|_| CoreError::HandshakeFailed(format!("connect to {} timed out", addr)))?
        .map_err(|e| match e {
            CoreError::HandshakeFailed(_) => e,
            other => CoreError::HandshakeFailed(other.to_string()),
        })?;

        debug!(host = %endpoint.host, "SSH handshake completed");
        self.finish(handle, endpoint, credentials).await
    }

    async fn connect_via(
        &self,
        stream: TunnelStream,
        endpoint: &EndpointSpec,
        credentials: &Credentials,
    ) -> Result<Box<dyn Transport>> {
        info!(host = %endpoint.host, port = endpoint.port, "Connecting via parent tunnel");

        let handle = tokio::time::timeout(
            self.connect_timeout,
            client::connect_stream(Self::client_config(), stream, self.handler(endpoint)),
        )
        .await
        .map_err(|_| {
            CoreError::HandshakeFailed(format!(
                "tunneled connect to {}:{} timed out",
                endpoint.host, endpoint.port
            ))
        })?
        .map_err(|e| match e {
            CoreError::HandshakeFailed(_) => e,
            other => CoreError::HandshakeFailed(other.to_string()),
        })?;

        debug!(host = %endpoint.host, "Tunneled SSH handshake completed");
        self.finish(handle, endpoint, credentials).await
    }
}

/// russh callback handler: host key verification delegated to the injected
/// [`HostKeyVerifier`].
pub struct VerifierHandler {
    host: String,
    port: u16,
    verifier: Arc<dyn HostKeyVerifier>,
}

impl client::Handler for VerifierHandler {
    type Error = CoreError;

    async fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> std::result::Result<bool, Self::Error> {
        let status = self
            .verifier
            .verify(&self.host, self.port, server_public_key)
            .await;

        match &status {
            HostKeyStatus::Verified => {
                info!("Host key verified for {}:{}", self.host, self.port);
                return Ok(true);
            }
            HostKeyStatus::Unknown { fingerprint } => {
                info!(
                    "Unknown host key for {}:{} (fingerprint: {})",
                    self.host, self.port, fingerprint
                );
            }
            HostKeyStatus::Changed {
                expected_fingerprint,
                actual_fingerprint,
            } => {
                warn!(
                    "HOST KEY CHANGED for {}:{}! Expected {}, got {}. Possible MITM.",
                    self.host, self.port, expected_fingerprint, actual_fingerprint
                );
            }
        }

        // Unknown/changed keys block the handshake until the verifier
        // confirms an explicit trust decision.
        match self.verifier.confirm(&self.host, self.port, &status).await {
            HostKeyDecision::TrustOnce => Ok(true),
            HostKeyDecision::TrustAndPersist => {
                if let Err(e) = self
                    .verifier
                    .persist(&self.host, self.port, server_public_key)
                    .await
                {
                    warn!("Failed to persist host key for {}: {}", self.host, e);
                }
                Ok(true)
            }
            HostKeyDecision::Reject => Err(CoreError::HandshakeFailed(format!(
                "host key verification failed for {}:{}",
                self.host, self.port
            ))),
        }
    }
}

/// Commands sent to the handle owner task.
enum HandleCommand {
    OpenSession {
        reply_tx: oneshot::Sender<std::result::Result<Channel<Msg>, russh::Error>>,
    },
    OpenDirectTcpip {
        host: String,
        port: u32,
        originator_host: String,
        originator_port: u32,
        reply_tx: oneshot::Sender<std::result::Result<Channel<Msg>, russh::Error>>,
    },
    Ping {
        reply_tx: oneshot::Sender<ProbeOutcome>,
    },
    Disconnect,
}

/// Cloneable command endpoint for one handle owner task. Dropping every
/// controller terminates the task and closes the connection.
#[derive(Clone)]
pub struct HandleController {
    cmd_tx: mpsc::Sender<HandleCommand>,
}

impl HandleController {
    async fn open_session_channel(&self) -> Result<Channel<Msg>> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(HandleCommand::OpenSession { reply_tx })
            .await
            .map_err(|_| CoreError::Transport("connection closed".into()))?;
        reply_rx
            .await
            .map_err(|_| CoreError::Transport("connection closed".into()))?
            .map_err(|e| CoreError::Channel(e.to_string()))
    }

    async fn open_direct_tcpip(
        &self,
        host: &str,
        port: u32,
        originator_host: &str,
        originator_port: u32,
    ) -> Result<Channel<Msg>> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(HandleCommand::OpenDirectTcpip {
                host: host.to_string(),
                port,
                originator_host: originator_host.to_string(),
                originator_port,
                reply_tx,
            })
            .await
            .map_err(|_| CoreError::Transport("connection closed".into()))?;
        reply_rx
            .await
            .map_err(|_| CoreError::Transport("connection closed".into()))?
            .map_err(|e| CoreError::Channel(e.to_string()))
    }

    async fn ping(&self) -> ProbeOutcome {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self
            .cmd_tx
            .send(HandleCommand::Ping { reply_tx })
            .await
            .is_err()
        {
            return ProbeOutcome::Dead;
        }
        reply_rx.await.unwrap_or(ProbeOutcome::Dead)
    }

    async fn disconnect(&self) {
        let _ = self.cmd_tx.send(HandleCommand::Disconnect).await;
    }

    fn is_connected(&self) -> bool {
        !self.cmd_tx.is_closed()
    }
}

/// Spawn the task that solely owns the russh `Handle`.
fn spawn_handle_owner(
    handle: Handle<VerifierHandler>,
    label: String,
    probe_timeout: Duration,
) -> HandleController {
    let (cmd_tx, mut cmd_rx) = mpsc::channel::<HandleCommand>(64);

    tokio::spawn(async move {
        // sole owner of `handle` from here on
        debug!("Handle owner task started for {}", label);

        loop {
            match cmd_rx.recv().await {
                Some(HandleCommand::OpenSession { reply_tx }) => {
                    let result = handle.channel_open_session().await;
                    if reply_tx.send(result).is_err() {
                        warn!("Caller dropped before receiving session channel");
                        // dropped channel is closed by the server side
                    }
                }
                Some(HandleCommand::OpenDirectTcpip {
                    host,
                    port,
                    originator_host,
                    originator_port,
                    reply_tx,
                }) => {
                    let result = handle
                        .channel_open_direct_tcpip(&host, port, &originator_host, originator_port)
                        .await;
                    if reply_tx.send(result).is_err() {
                        warn!("Caller dropped before receiving direct-tcpip channel");
                    }
                }
                Some(HandleCommand::Ping { reply_tx }) => {
                    // send_keepalive(true) = SSH_MSG_GLOBAL_REQUEST
                    // "keepalive@openssh.com" with want_reply, the proper
                    // heartbeat; opening throwaway channels leaks server state.
                    let outcome =
                        match tokio::time::timeout(probe_timeout, handle.send_keepalive(true))
                            .await
                        {
                            Ok(Ok(())) => ProbeOutcome::Healthy,
                            Ok(Err(e)) => {
                                let error_str = format!("{:?}", e);
                                if error_str.to_lowercase().contains("disconnect") {
                                    warn!("Keepalive disconnect for {}: {:?}", label, e);
                                    ProbeOutcome::Dead
                                } else {
                                    warn!("Keepalive soft failure for {}: {:?}", label, e);
                                    ProbeOutcome::Timeout
                                }
                            }
                            Err(_) => {
                                warn!("Keepalive timeout for {}", label);
                                ProbeOutcome::Timeout
                            }
                        };
                    let _ = reply_tx.send(outcome);
                }
                Some(HandleCommand::Disconnect) => {
                    debug!("Disconnect requested for {}", label);
                    break;
                }
                None => {
                    debug!("All controllers dropped for {}", label);
                    break;
                }
            }
        }

        drain_pending_commands(&mut cmd_rx);
        let _ = handle
            .disconnect(russh::Disconnect::ByApplication, "Session closed", "en")
            .await;
        debug!("Handle owner task terminated for {}", label);
    });

    HandleController { cmd_tx }
}

/// Fail every queued command once the task is shutting down.
fn drain_pending_commands(cmd_rx: &mut mpsc::Receiver<HandleCommand>) {
    cmd_rx.close();
    while let Ok(cmd) = cmd_rx.try_recv() {
        match cmd {
            HandleCommand::OpenSession { reply_tx } => {
                let _ = reply_tx.send(Err(russh::Error::Disconnect));
            }
            HandleCommand::OpenDirectTcpip { reply_tx, .. } => {
                let _ = reply_tx.send(Err(russh::Error::Disconnect));
            }
            HandleCommand::Ping { reply_tx } => {
                let _ = reply_tx.send(ProbeOutcome::Dead);
            }
            HandleCommand::Disconnect => {}
        }
    }
}

struct SshTransport {
    controller: HandleController,
}

#[async_trait]
impl Transport for SshTransport {
    async fn open_channel(&self, kind: &ChannelKind) -> Result<Box<dyn SessionChannel>> {
        let channel = match kind {
            ChannelKind::Terminal => self.controller.open_session_channel().await?,
            ChannelKind::Sftp => {
                let channel = self.controller.open_session_channel().await?;
                channel
                    .request_subsystem(true, "sftp")
                    .await
                    .map_err(|e| CoreError::Channel(format!("sftp subsystem: {}", e)))?;
                channel
            }
            ChannelKind::Forward {
                target_host,
                target_port,
            } => {
                self.controller
                    .open_direct_tcpip(target_host, *target_port as u32, "127.0.0.1", 0)
                    .await?
            }
        };
        Ok(Box::new(SshSessionChannel {
            channel: Some(channel),
        }))
    }

    async fn open_tunnel(&self, host: &str, port: u16) -> Result<TunnelStream> {
        let channel = self
            .controller
            .open_direct_tcpip(host, port as u32, "127.0.0.1", 0)
            .await?;
        Ok(Box::new(channel.into_stream()))
    }

    async fn probe(&self) -> ProbeOutcome {
        self.controller.ping().await
    }

    async fn close(&self) {
        self.controller.disconnect().await;
    }

    fn is_open(&self) -> bool {
        self.controller.is_connected()
    }
}

struct SshSessionChannel {
    channel: Option<Channel<Msg>>,
}

#[async_trait]
impl SessionChannel for SshSessionChannel {
    async fn close(&mut self) -> Result<()> {
        if let Some(channel) = self.channel.take() {
            channel
                .close()
                .await
                .map_err(|e| CoreError::Channel(e.to_string()))?;
        }
        Ok(())
    }
}
