//! Network facade.
//!
//! [`Network`] owns at most one backend per [`NetworkType`] and puts a single
//! dial/listen surface in front of them. It is the only place that knows
//! which backends exist; callers pick one by type and get back wrapped
//! [`Conn`]s and [`Listener`]s.
//!
//! # Lifecycle
//!
//! `Constructed -> Initializing -> Initialized -> Closed`, with
//! `Initializing -> Failed` when [`Network::init`] fails. `close` is valid
//! from any state and runs at most once.
//!
//! # Thread Safety
//!
//! Backends are held behind `Arc` and never replaced after construction, so
//! dial/listen only take the state lock long enough to read it.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use corelib::{NetworkType, PublicKey, SecretKey};
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument, Span};

use crate::backend::{Backend, NoBackend};
use crate::config::{DirectConfig, NetworkConfig};
use crate::conn::{Conn, Listener};
use crate::direct::{DirectClient, DirectTable};
use crate::error::{BackendError, NetworkError, Result};
use crate::supervisor::{BackendFault, BackendStatus, HealthReport, Supervisor};

/// Lifecycle state of a [`Network`].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum NetworkState {
    Constructed,
    Initializing,
    Initialized,
    Failed,
    Closed,
}

impl fmt::Display for NetworkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            NetworkState::Constructed => "constructed",
            NetworkState::Initializing => "initializing",
            NetworkState::Initialized => "initialized",
            NetworkState::Failed => "failed",
            NetworkState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Public-key addressed network over a mesh backend `M` and a direct
/// backend `D`.
pub struct Network<M: Backend = NoBackend, D: Backend = DirectClient> {
    conf: NetworkConfig,
    mesh: Option<Arc<M>>,
    direct: Option<Arc<D>>,
    state: Mutex<NetworkState>,
    supervisor: Arc<Supervisor>,
    span: Span,
}

impl<M: Backend, D: Backend> Network<M, D> {
    /// Builds a facade over already constructed backends.
    ///
    /// Each supplied backend must report the type of the slot it is placed
    /// in, and a backend is supplied exactly when its configuration block is
    /// present.
    pub fn from_backends(conf: NetworkConfig, mesh: Option<M>, direct: Option<D>) -> Result<Self> {
        conf.validate()?;
        check_slot(&conf, NetworkType::Mesh, mesh.as_ref())?;
        check_slot(&conf, NetworkType::Direct, direct.as_ref())?;

        let mut owned = Vec::with_capacity(2);
        if mesh.is_some() {
            owned.push(NetworkType::Mesh);
        }
        if direct.is_some() {
            owned.push(NetworkType::Direct);
        }

        let span = info_span!("network", pk = %conf.local_pk());
        Ok(Self {
            conf,
            mesh: mesh.map(Arc::new),
            direct: direct.map(Arc::new),
            state: Mutex::new(NetworkState::Constructed),
            supervisor: Supervisor::new(&owned),
            span,
        })
    }

    /// Replaces the span facade events and serve tasks are recorded in.
    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    /// Starts the owned backends.
    ///
    /// The mesh backend is served first and must signal readiness before the
    /// direct backend is served. A direct backend without a bind address is
    /// left outbound-only. Each readiness wait is bounded by the configured
    /// ready timeout. Runs once; later calls fail with
    /// [`NetworkError::InvalidState`].
    pub async fn init(&self, cancel: &CancellationToken) -> Result<()> {
        self.transition(NetworkState::Constructed, NetworkState::Initializing)?;

        let result = self.start_backends(cancel).instrument(self.span.clone()).await;

        let mut state = self.state.lock();
        // close() may have run while the backends were starting.
        if *state == NetworkState::Initializing {
            *state = if result.is_ok() {
                NetworkState::Initialized
            } else {
                NetworkState::Failed
            };
        }
        result
    }

    async fn start_backends(&self, cancel: &CancellationToken) -> Result<()> {
        let timeout = self.conf.ready_timeout();

        if let Some(mesh) = &self.mesh {
            info!("starting mesh backend");
            self.supervisor.start(Arc::clone(mesh), timeout, cancel).await?;
        }

        if let Some(direct) = &self.direct {
            let bind = self.conf.direct.as_ref().and_then(DirectConfig::listen_addr);
            match bind {
                Some(addr) => {
                    info!(%addr, "starting direct backend");
                    self.supervisor.start(Arc::clone(direct), timeout, cancel).await?;
                }
                None => {
                    info!("direct backend has no bind address, dialing out only");
                    self.supervisor
                        .set_status(NetworkType::Direct, BackendStatus::OutboundOnly);
                }
            }
        }

        info!("network initialized");
        Ok(())
    }

    /// Dials `remote` on `port` through the backend of type `network`.
    ///
    /// A type with no owned backend fails with
    /// [`NetworkError::UnknownNetwork`] before anything else is checked.
    pub async fn dial(
        &self,
        cancel: &CancellationToken,
        network: NetworkType,
        remote: PublicKey,
        port: u16,
    ) -> Result<Conn> {
        let span = self.span.clone();
        match network {
            NetworkType::Mesh => {
                let mesh = slot(&self.mesh, network)?;
                self.dial_with(mesh.as_ref(), network, cancel, remote, port)
                    .instrument(span)
                    .await
            }
            NetworkType::Direct => {
                let direct = slot(&self.direct, network)?;
                self.dial_with(direct.as_ref(), network, cancel, remote, port)
                    .instrument(span)
                    .await
            }
        }
    }

    async fn dial_with<B: Backend>(
        &self,
        backend: &B,
        network: NetworkType,
        cancel: &CancellationToken,
        remote: PublicKey,
        port: u16,
    ) -> Result<Conn> {
        self.require(NetworkState::Initialized)?;
        debug!(%network, %remote, port, "dialing");

        let raw = backend
            .dial(cancel, remote, port)
            .await
            .map_err(|source| match source {
                BackendError::Cancelled => NetworkError::Cancelled,
                source => NetworkError::Dial { network, source },
            })?;
        Conn::wrap(raw, network)
    }

    /// Binds `port` on the backend of type `network`.
    pub async fn listen(&self, network: NetworkType, port: u16) -> Result<Listener> {
        let span = self.span.clone();
        match network {
            NetworkType::Mesh => {
                let mesh = slot(&self.mesh, network)?;
                self.listen_with(mesh.as_ref(), network, port)
                    .instrument(span)
                    .await
            }
            NetworkType::Direct => {
                let direct = slot(&self.direct, network)?;
                self.listen_with(direct.as_ref(), network, port)
                    .instrument(span)
                    .await
            }
        }
    }

    async fn listen_with<B: Backend>(
        &self,
        backend: &B,
        network: NetworkType,
        port: u16,
    ) -> Result<Listener> {
        self.require(NetworkState::Initialized)?;
        debug!(%network, port, "listening");

        let raw = backend
            .listen(port)
            .await
            .map_err(|source| NetworkError::Listen { network, source })?;
        Listener::wrap(raw, network)
    }

    /// Closes every owned backend.
    ///
    /// Backends close concurrently, each bounded by the configured close
    /// timeout, and all of them are waited on even if one fails. The mesh
    /// error wins when both fail. Serve tasks still running afterwards are
    /// aborted. A second call returns `Ok(())` without touching the backends.
    pub async fn close(&self) -> Result<()> {
        {
            let mut state = self.state.lock();
            if *state == NetworkState::Closed {
                return Ok(());
            }
            *state = NetworkState::Closed;
        }

        async {
            self.supervisor.begin_close();
            let timeout = self.conf.close_timeout();

            let (mesh_res, direct_res) = tokio::join!(
                close_backend(self.mesh.as_deref(), NetworkType::Mesh, timeout),
                close_backend(self.direct.as_deref(), NetworkType::Direct, timeout),
            );

            self.supervisor.join_all(timeout).await;
            if self.mesh.is_some() {
                self.supervisor.set_status(NetworkType::Mesh, BackendStatus::Closed);
            }
            if self.direct.is_some() {
                self.supervisor
                    .set_status(NetworkType::Direct, BackendStatus::Closed);
            }

            info!("network closed");
            mesh_res.and(direct_res)
        }
        .instrument(self.span.clone())
        .await
    }

    pub fn local_pk(&self) -> PublicKey {
        self.conf.local_pk()
    }

    pub fn local_sk(&self) -> &SecretKey {
        self.conf.local_sk()
    }

    /// Backend types used for peer-to-peer transports.
    pub fn transport_networks(&self) -> &[NetworkType] {
        &self.conf.transport_networks
    }

    pub fn config(&self) -> &NetworkConfig {
        &self.conf
    }

    pub fn mesh(&self) -> Option<&Arc<M>> {
        self.mesh.as_ref()
    }

    pub fn direct(&self) -> Option<&Arc<D>> {
        self.direct.as_ref()
    }

    pub fn state(&self) -> NetworkState {
        *self.state.lock()
    }

    /// Per-backend status snapshot.
    pub fn health(&self) -> HealthReport {
        self.supervisor.report()
    }

    /// Receives a [`BackendFault`] whenever a serve task ends unexpectedly.
    pub fn subscribe_faults(&self) -> broadcast::Receiver<BackendFault> {
        self.supervisor.subscribe()
    }

    fn transition(&self, from: NetworkState, to: NetworkState) -> Result<()> {
        let mut state = self.state.lock();
        if *state != from {
            return Err(NetworkError::InvalidState {
                state: *state,
                required: from,
            });
        }
        *state = to;
        Ok(())
    }

    fn require(&self, required: NetworkState) -> Result<()> {
        let state = *self.state.lock();
        if state != required {
            return Err(NetworkError::InvalidState { state, required });
        }
        Ok(())
    }
}

impl<M: Backend> Network<M, DirectClient> {
    /// Builds the direct backend from the configuration's direct block.
    pub fn new(conf: NetworkConfig, mesh: Option<M>) -> Result<Self> {
        let direct = conf.direct.as_ref().map(|direct| {
            DirectClient::new(
                conf.keys.clone(),
                direct.listen_addr().map(str::to_string),
                DirectTable::new(direct.table.clone()),
            )
        });
        Self::from_backends(conf, mesh, direct)
    }
}

impl Network<NoBackend, DirectClient> {
    /// Network with the direct backend only.
    pub fn direct_only(conf: NetworkConfig) -> Result<Self> {
        Self::new(conf, None)
    }
}

impl<M: Backend, D: Backend> fmt::Debug for Network<M, D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Network")
            .field("local_pk", &self.conf.local_pk())
            .field("state", &self.state())
            .field("mesh", &self.mesh.is_some())
            .field("direct", &self.direct.is_some())
            .finish()
    }
}

fn slot<B>(slot: &Option<Arc<B>>, network: NetworkType) -> Result<&Arc<B>> {
    slot.as_ref()
        .ok_or_else(|| NetworkError::UnknownNetwork(network.to_string()))
}

fn check_slot<B: Backend>(
    conf: &NetworkConfig,
    slot: NetworkType,
    backend: Option<&B>,
) -> Result<()> {
    match backend {
        Some(backend) if backend.network_type() != slot => Err(NetworkError::Config(format!(
            "{} backend supplied for the {} slot",
            backend.network_type(),
            slot
        ))),
        Some(_) if !conf.is_configured(slot) => Err(NetworkError::Config(format!(
            "{} backend supplied without a {} configuration block",
            slot, slot
        ))),
        None if conf.is_configured(slot) => Err(NetworkError::Config(format!(
            "{} is configured but no backend was supplied",
            slot
        ))),
        _ => Ok(()),
    }
}

async fn close_backend<B: Backend>(
    backend: Option<&B>,
    network: NetworkType,
    timeout: Duration,
) -> Result<()> {
    let Some(backend) = backend else {
        return Ok(());
    };

    match tokio::time::timeout(timeout, backend.close()).await {
        Ok(Ok(())) => {
            debug!(%network, "backend closed");
            Ok(())
        }
        Ok(Err(source)) => {
            warn!(%network, error = %source, "backend close failed");
            Err(NetworkError::Close { network, source })
        }
        Err(_) => {
            warn!(%network, ?timeout, "backend close timed out");
            Err(NetworkError::CloseTimeout { network, timeout })
        }
    }
}
