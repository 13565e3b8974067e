//! SSH agent authentication
//!
//! Connects to the system agent (Unix domain socket via `SSH_AUTH_SOCK`, or
//! the OpenSSH named pipe on Windows) and tries each held identity against
//! the server, delegating the challenge signing to the agent.

use std::future::Future;

use russh::client::Handle;
use russh::keys::agent::client::{AgentClient, AgentStream};
use russh::keys::ssh_key;
use russh::{AgentAuthError, CryptoVec, Signer};
use tracing::{debug, info, warn};

use crate::error::{CoreError, Result};

use super::ssh::VerifierHandler;

/// Send-safe [`Signer`] wrapper around [`AgentClient`].
///
/// russh's built-in `impl Signer for AgentClient` returns `impl Future + Send`
/// via RPITIT, and inside `authenticate_publickey_with` the generated future
/// borrows a local `PublicKey` across an `.await`; the compiler cannot prove
/// `Send` for that borrow (rust-lang/rust#100013). Cloning the key to an
/// owned value before the async block sidesteps the borrow entirely.
struct AgentSigner<'a> {
    agent: &'a mut AgentClient<Box<dyn AgentStream + Send + Unpin + 'static>>,
}

impl Signer for AgentSigner<'_> {
    type Error = AgentAuthError;

    fn auth_publickey_sign(
        &mut self,
        key: &ssh_key::PublicKey,
        hash_alg: Option<ssh_key::HashAlg>,
        to_sign: CryptoVec,
    ) -> impl Future<Output = std::result::Result<CryptoVec, Self::Error>> + Send {
        let key_owned = key.clone();
        async move {
            self.agent
                .sign_request(&key_owned, hash_alg, to_sign)
                .await
                .map_err(Into::into)
        }
    }
}

/// Connect to the system SSH agent with a type-erased stream.
async fn connect_agent() -> Result<AgentClient<Box<dyn AgentStream + Send + Unpin + 'static>>> {
    #[cfg(unix)]
    {
        let agent = AgentClient::connect_env().await.map_err(|e| {
            CoreError::HandshakeFailed(format!(
                "SSH agent not available: {}. Make sure SSH_AUTH_SOCK is set and ssh-agent is running.",
                e
            ))
        })?;
        debug!("Connected to SSH agent via SSH_AUTH_SOCK");
        Ok(agent.dynamic())
    }

    #[cfg(windows)]
    {
        let agent = AgentClient::connect_named_pipe(r"\\.\pipe\openssh-ssh-agent")
            .await
            .map_err(|e| {
                CoreError::HandshakeFailed(format!(
                    "SSH agent not available: {}. Make sure the OpenSSH Authentication Agent service is running.",
                    e
                ))
            })?;
        debug!("Connected to SSH agent via named pipe");
        Ok(agent.dynamic())
    }

    #[cfg(not(any(unix, windows)))]
    {
        Err(CoreError::HandshakeFailed(
            "SSH agent is not supported on this platform".to_string(),
        ))
    }
}

/// Authenticate against the server using agent-held keys, trying each
/// identity until one is accepted.
pub async fn authenticate(handle: &mut Handle<VerifierHandler>, username: &str) -> Result<()> {
    let mut agent = connect_agent().await?;

    let keys = agent
        .request_identities()
        .await
        .map_err(|e| CoreError::HandshakeFailed(format!("failed to list agent keys: {}", e)))?;

    if keys.is_empty() {
        return Err(CoreError::HandshakeFailed(
            "SSH agent has no keys loaded. Add keys with: ssh-add".to_string(),
        ));
    }

    info!("SSH agent reports {} key(s), attempting authentication", keys.len());

    let mut last_error: Option<String> = None;
    for key in &keys {
        debug!("Trying agent key: {} ({})", key.algorithm(), key.comment());

        match handle
            .authenticate_publickey_with(
                username,
                key.clone(),
                None,
                &mut AgentSigner { agent: &mut agent },
            )
            .await
        {
            Ok(result) if result.success() => {
                info!("SSH agent authentication succeeded with key: {}", key.comment());
                return Ok(());
            }
            Ok(_failure) => {
                debug!("Key rejected by server: {}", key.comment());
            }
            Err(e) => {
                warn!("Agent signing error for key {}: {}", key.comment(), e);
                last_error = Some(format!("{}", e));
            }
        }
    }

    Err(CoreError::HandshakeFailed(format!(
        "no agent key was accepted by the server (tried {} key(s)){}",
        keys.len(),
        last_error
            .map(|e| format!(". Last error: {}", e))
            .unwrap_or_default()
    )))
}

/// Quick pre-check: does an agent socket/pipe appear to exist? Actual
/// connection may still fail.
pub fn is_agent_available() -> bool {
    #[cfg(unix)]
    {
        std::env::var("SSH_AUTH_SOCK").is_ok()
    }

    #[cfg(windows)]
    {
        // The named pipe exists whenever the service is installed; real
        // availability is only known at connect time.
        true
    }

    #[cfg(not(any(unix, windows)))]
    {
        false
    }
}
