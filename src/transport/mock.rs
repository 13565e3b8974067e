//! In-memory transport for pool/resolver/supervisor tests

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::error::{CoreError, Result};
use crate::node::EndpointSpec;

use super::{
    ChannelKind, Credentials, ProbeOutcome, SessionChannel, Transport, TransportFactory,
    TunnelStream,
};

/// Scriptable factory: per-host failure injection, probe scripts, and an
/// observable connect/close order log.
#[derive(Default)]
pub struct MockTransportFactory {
    connect_log: Mutex<Vec<String>>,
    close_log: Arc<Mutex<Vec<String>>>,
    fail_hosts: Mutex<HashSet<String>>,
    require_password_hosts: Mutex<HashSet<String>>,
    connect_delay: Mutex<Duration>,
    probe_scripts: Mutex<HashMap<String, Arc<Mutex<VecDeque<ProbeOutcome>>>>>,
}

impl MockTransportFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn fail_host(&self, host: &str) {
        self.fail_hosts.lock().insert(host.to_string());
    }

    pub fn heal_host(&self, host: &str) {
        self.fail_hosts.lock().remove(host);
    }

    /// Host refuses connect attempts carrying no password.
    pub fn require_password(&self, host: &str) {
        self.require_password_hosts.lock().insert(host.to_string());
    }

    pub fn set_connect_delay(&self, delay: Duration) {
        *self.connect_delay.lock() = delay;
    }

    /// Queue probe outcomes for a host; an exhausted script reports healthy.
    pub fn script_probes(&self, host: &str, outcomes: Vec<ProbeOutcome>) {
        let script = self
            .probe_scripts
            .lock()
            .entry(host.to_string())
            .or_default()
            .clone();
        script.lock().extend(outcomes);
    }

    pub fn connect_count(&self, host: &str) -> usize {
        self.connect_log.lock().iter().filter(|h| *h == host).count()
    }

    pub fn connect_order(&self) -> Vec<String> {
        self.connect_log.lock().clone()
    }

    pub fn close_order(&self) -> Vec<String> {
        self.close_log.lock().clone()
    }

    async fn do_connect(
        &self,
        endpoint: &EndpointSpec,
        credentials: &Credentials,
    ) -> Result<Box<dyn Transport>> {
        let delay = *self.connect_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.connect_log.lock().push(endpoint.host.clone());

        if self.fail_hosts.lock().contains(&endpoint.host) {
            return Err(CoreError::HandshakeFailed(format!(
                "mock: connection to {} refused",
                endpoint.host
            )));
        }
        if self.require_password_hosts.lock().contains(&endpoint.host)
            && credentials.password.is_none()
        {
            return Err(CoreError::HandshakeFailed(format!(
                "mock: {} requires a password",
                endpoint.host
            )));
        }

        let probe_script = self
            .probe_scripts
            .lock()
            .entry(endpoint.host.clone())
            .or_default()
            .clone();

        Ok(Box::new(MockTransport {
            host: endpoint.host.clone(),
            open: AtomicBool::new(true),
            probe_script,
            close_log: self.close_log.clone(),
        }))
    }
}

#[async_trait]
impl TransportFactory for MockTransportFactory {
    async fn connect(
        &self,
        endpoint: &EndpointSpec,
        credentials: &Credentials,
    ) -> Result<Box<dyn Transport>> {
        self.do_connect(endpoint, credentials).await
    }

    async fn connect_via(
        &self,
        _stream: TunnelStream,
        endpoint: &EndpointSpec,
        credentials: &Credentials,
    ) -> Result<Box<dyn Transport>> {
        self.do_connect(endpoint, credentials).await
    }
}

pub struct MockTransport {
    host: String,
    open: AtomicBool,
    probe_script: Arc<Mutex<VecDeque<ProbeOutcome>>>,
    close_log: Arc<Mutex<Vec<String>>>,
}

#[async_trait]
impl Transport for MockTransport {
    async fn open_channel(&self, _kind: &ChannelKind) -> Result<Box<dyn SessionChannel>> {
        if !self.is_open() {
            return Err(CoreError::Channel("mock: transport closed".into()));
        }
        Ok(Box::new(MockChannel))
    }

    async fn open_tunnel(&self, _host: &str, _port: u16) -> Result<TunnelStream> {
        if !self.is_open() {
            return Err(CoreError::Channel("mock: transport closed".into()));
        }
        let (near, _far) = tokio::io::duplex(64);
        Ok(Box::new(near))
    }

    async fn probe(&self) -> ProbeOutcome {
        let outcome = self
            .probe_script
            .lock()
            .pop_front()
            .unwrap_or(ProbeOutcome::Healthy);
        if outcome == ProbeOutcome::Dead {
            self.open.store(false, Ordering::SeqCst);
        }
        outcome
    }

    async fn close(&self) {
        if self.open.swap(false, Ordering::SeqCst) {
            self.close_log.lock().push(self.host.clone());
        }
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }
}

struct MockChannel;

#[async_trait]
impl SessionChannel for MockChannel {
    async fn close(&mut self) -> Result<()> {
        Ok(())
    }
}
