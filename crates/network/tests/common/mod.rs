//! Shared fixtures for the network integration tests.

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use corelib::{KeyPair, NetworkType, PublicKey};
use network::{
    Backend, BackendError, DirectConfig, MemoryBackend, MemoryHub, MeshConfig, NetworkConfig,
    RawConn, RawListener, Readiness,
};
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

/// Installs a test subscriber honouring `RUST_LOG`. Safe to call repeatedly.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Ordered record of calls across every stub sharing it.
#[derive(Clone, Default)]
pub struct CallLog(Arc<Mutex<Vec<String>>>);

impl CallLog {
    pub fn push(&self, entry: String) {
        self.0.lock().push(entry);
    }

    pub fn entries(&self) -> Vec<String> {
        self.0.lock().clone()
    }

    pub fn position(&self, entry: &str) -> Option<usize> {
        self.0.lock().iter().position(|e| e == entry)
    }
}

/// How a stub's `serve` behaves.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ServeMode {
    /// Signal readiness (after the configured delay), then run until closed
    Normal,
    /// Return an error without signalling readiness
    FailBeforeReady,
    /// Hold the readiness handle without ever signalling
    NeverReady,
    /// Signal readiness, then panic
    PanicAfterReady,
}

/// Backend that records calls and delegates transport to a [`MemoryBackend`].
pub struct StubBackend {
    inner: MemoryBackend,
    network: NetworkType,
    log: CallLog,
    mode: ServeMode,
    ready_after: Duration,
    close_error: Option<String>,
    hang_close: bool,
    stop: CancellationToken,
    trip: CancellationToken,
    serve_calls: AtomicUsize,
    dial_calls: AtomicUsize,
    listen_calls: AtomicUsize,
    close_calls: AtomicUsize,
}

impl StubBackend {
    pub fn new(hub: &MemoryHub, pk: PublicKey, network: NetworkType, log: &CallLog) -> Self {
        Self {
            inner: MemoryBackend::new(hub, pk, network),
            network,
            log: log.clone(),
            mode: ServeMode::Normal,
            ready_after: Duration::ZERO,
            close_error: None,
            hang_close: false,
            stop: CancellationToken::new(),
            trip: CancellationToken::new(),
            serve_calls: AtomicUsize::new(0),
            dial_calls: AtomicUsize::new(0),
            listen_calls: AtomicUsize::new(0),
            close_calls: AtomicUsize::new(0),
        }
    }

    pub fn serve_mode(mut self, mode: ServeMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn ready_after(mut self, delay: Duration) -> Self {
        self.ready_after = delay;
        self
    }

    pub fn failing_close(mut self, message: &str) -> Self {
        self.close_error = Some(message.to_string());
        self
    }

    pub fn hanging_close(mut self) -> Self {
        self.hang_close = true;
        self
    }

    /// Makes a running `serve` return an error.
    pub fn trip(&self) {
        self.trip.cancel();
    }

    pub fn serve_calls(&self) -> usize {
        self.serve_calls.load(Ordering::SeqCst)
    }

    pub fn dial_calls(&self) -> usize {
        self.dial_calls.load(Ordering::SeqCst)
    }

    pub fn listen_calls(&self) -> usize {
        self.listen_calls.load(Ordering::SeqCst)
    }

    pub fn close_calls(&self) -> usize {
        self.close_calls.load(Ordering::SeqCst)
    }

    pub fn open_conns(&self) -> usize {
        self.inner.open_conns()
    }

    fn record(&self, call: &str) {
        self.log.push(format!("{}:{}", self.network, call));
    }
}

#[async_trait]
impl Backend for StubBackend {
    fn network_type(&self) -> NetworkType {
        self.network
    }

    async fn serve(&self, mut ready: Readiness) -> Result<(), BackendError> {
        self.serve_calls.fetch_add(1, Ordering::SeqCst);
        self.record("serve");

        match self.mode {
            ServeMode::FailBeforeReady => {
                return Err(BackendError::Other("refused to start".to_string()));
            }
            ServeMode::NeverReady => {
                self.stop.cancelled().await;
                drop(ready);
                return Ok(());
            }
            ServeMode::Normal | ServeMode::PanicAfterReady => {}
        }

        tokio::time::sleep(self.ready_after).await;
        self.record("ready");
        ready.notify();
        if self.mode == ServeMode::PanicAfterReady {
            panic!("{} loop crashed", self.network);
        }

        tokio::select! {
            _ = self.stop.cancelled() => Ok(()),
            _ = self.trip.cancelled() => Err(BackendError::Other("tripped".to_string())),
        }
    }

    async fn dial(
        &self,
        cancel: &CancellationToken,
        remote: PublicKey,
        port: u16,
    ) -> Result<Box<dyn RawConn>, BackendError> {
        self.dial_calls.fetch_add(1, Ordering::SeqCst);
        self.record("dial");
        self.inner.dial(cancel, remote, port).await
    }

    async fn listen(&self, port: u16) -> Result<Box<dyn RawListener>, BackendError> {
        self.listen_calls.fetch_add(1, Ordering::SeqCst);
        self.record("listen");
        self.inner.listen(port).await
    }

    async fn close(&self) -> Result<(), BackendError> {
        self.close_calls.fetch_add(1, Ordering::SeqCst);
        self.record("close");
        if self.hang_close {
            std::future::pending::<()>().await;
        }
        self.stop.cancel();
        self.inner.close().await?;
        match &self.close_error {
            Some(message) => Err(BackendError::Other(message.clone())),
            None => Ok(()),
        }
    }
}

pub fn mesh_config() -> MeshConfig {
    MeshConfig {
        discovery_addr: "http://discovery.test:9090".to_string(),
        min_sessions: 1,
    }
}

/// Direct block that makes the facade serve the direct slot.
pub fn serving_direct_config() -> DirectConfig {
    DirectConfig {
        local_addr: Some("127.0.0.1:0".to_string()),
        ..DirectConfig::default()
    }
}

/// Config with both slots configured and short timeouts.
pub fn stub_config(keys: KeyPair) -> NetworkConfig {
    let mut conf = NetworkConfig::new(keys)
        .with_mesh(mesh_config())
        .with_direct(serving_direct_config())
        .with_transport_networks([NetworkType::Direct]);
    conf.ready_timeout_ms = 500;
    conf.close_timeout_ms = 200;
    conf
}
