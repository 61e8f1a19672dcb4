//! In-process backend.
//!
//! [`MemoryBackend`]s registered on the same [`MemoryHub`] reach each other
//! by public key, with `tokio::io::duplex` pairs standing in for sockets.
//! Used to run several nodes inside one process, and as the mesh slot in
//! tests.

use std::collections::HashMap;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use async_trait::async_trait;
use corelib::{Addr, NetworkType, PublicKey};
use parking_lot::RwLock;
use tokio::io::{AsyncRead, AsyncWrite, DuplexStream, ReadBuf};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::backend::{Backend, RawConn, RawListener, Readiness};
use crate::error::BackendError;
use crate::ports::{Inbox, Lifeline, PortGuard, PortListener, PortTable};

const DUPLEX_BUF_SIZE: usize = 64 * 1024;

#[derive(Clone)]
struct Endpoint {
    ports: PortTable<Inbox<MemoryConn>>,
    open: Arc<AtomicUsize>,
    closed: CancellationToken,
}

/// Routes connections between [`MemoryBackend`]s.
///
/// Backends of different [`NetworkType`]s on one hub do not see each other.
#[derive(Clone, Default)]
pub struct MemoryHub {
    endpoints: Arc<RwLock<HashMap<(NetworkType, PublicKey), Endpoint>>>,
}

impl MemoryHub {
    pub fn new() -> Self {
        Self::default()
    }

    fn register(&self, network: NetworkType, pk: PublicKey, endpoint: Endpoint) {
        self.endpoints.write().insert((network, pk), endpoint);
    }

    /// Removes the registration only if it still belongs to `endpoint`.
    fn unregister(&self, network: NetworkType, pk: PublicKey, endpoint: &Endpoint) {
        let mut endpoints = self.endpoints.write();
        let owned = endpoints
            .get(&(network, pk))
            .is_some_and(|current| Arc::ptr_eq(&current.open, &endpoint.open));
        if owned {
            endpoints.remove(&(network, pk));
        }
    }

    fn lookup(&self, network: NetworkType, pk: &PublicKey) -> Option<Endpoint> {
        self.endpoints.read().get(&(network, *pk)).cloned()
    }

    /// Number of registered backends.
    pub fn len(&self) -> usize {
        self.endpoints.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.endpoints.read().is_empty()
    }
}

impl std::fmt::Debug for MemoryHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryHub")
            .field("backends", &self.len())
            .finish()
    }
}

/// One node's backend on a [`MemoryHub`].
pub struct MemoryBackend {
    hub: MemoryHub,
    pk: PublicKey,
    network: NetworkType,
    endpoint: Endpoint,
    online: AtomicBool,
}

impl MemoryBackend {
    /// Registers `pk` on `hub` under `network`, replacing any earlier
    /// registration for the same pair.
    pub fn new(hub: &MemoryHub, pk: PublicKey, network: NetworkType) -> Self {
        let endpoint = Endpoint {
            ports: PortTable::new(),
            open: Arc::new(AtomicUsize::new(0)),
            closed: CancellationToken::new(),
        };
        hub.register(network, pk, endpoint.clone());
        Self {
            hub: hub.clone(),
            pk,
            network,
            endpoint,
            online: AtomicBool::new(false),
        }
    }

    pub fn public_key(&self) -> PublicKey {
        self.pk
    }

    /// True between `serve` signalling readiness and `close`.
    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    /// Connections with this backend as an endpoint that are still alive.
    pub fn open_conns(&self) -> usize {
        self.endpoint.open.load(Ordering::SeqCst)
    }

    async fn connect(&self, remote: PublicKey, port: u16) -> Result<MemoryConn, BackendError> {
        let unreachable = || BackendError::Unreachable { pk: remote, port };
        let peer = self.hub.lookup(self.network, &remote).ok_or_else(unreachable)?;
        let inbox = peer.ports.listener(port).ok_or_else(unreachable)?;

        let guard = self.endpoint.ports.reserve_ephemeral()?;
        let local = Addr::new(self.pk, guard.port());
        let dst = Addr::new(remote, port);

        let (mine, theirs) = tokio::io::duplex(DUPLEX_BUF_SIZE);
        let accepted = MemoryConn::new(theirs, dst, local, None, &peer);
        inbox.send(accepted).await.map_err(|_| unreachable())?;

        Ok(MemoryConn::new(mine, local, dst, Some(guard), &self.endpoint))
    }
}

#[async_trait]
impl Backend for MemoryBackend {
    fn network_type(&self) -> NetworkType {
        self.network
    }

    async fn serve(&self, mut ready: Readiness) -> Result<(), BackendError> {
        self.online.store(true, Ordering::SeqCst);
        info!(pk = %self.pk, network = %self.network, "memory backend online");
        ready.notify();
        self.endpoint.closed.cancelled().await;
        Ok(())
    }

    async fn dial(
        &self,
        cancel: &CancellationToken,
        remote: PublicKey,
        port: u16,
    ) -> Result<Box<dyn RawConn>, BackendError> {
        let conn = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(BackendError::Cancelled),
            _ = self.endpoint.closed.cancelled() => return Err(BackendError::Closed),
            conn = self.connect(remote, port) => conn?,
        };
        debug!(local = %conn.local, remote = %conn.remote, "memory connection established");
        Ok(Box::new(conn))
    }

    async fn listen(&self, port: u16) -> Result<Box<dyn RawListener>, BackendError> {
        if self.endpoint.closed.is_cancelled() {
            return Err(BackendError::Closed);
        }
        let listener = PortListener::<MemoryConn>::bind(
            &self.endpoint.ports,
            self.pk,
            port,
            self.endpoint.closed.child_token(),
        )?;
        Ok(Box::new(listener))
    }

    async fn close(&self) -> Result<(), BackendError> {
        self.online.store(false, Ordering::SeqCst);
        if !self.endpoint.closed.is_cancelled() {
            self.endpoint.closed.cancel();
            self.hub.unregister(self.network, self.pk, &self.endpoint);
        }
        Ok(())
    }
}

/// One end of an in-process connection. Dies with the backend it belongs to.
pub struct MemoryConn {
    stream: DuplexStream,
    local: Addr,
    remote: Addr,
    _port: Option<PortGuard<Inbox<MemoryConn>>>,
    open: Arc<AtomicUsize>,
    reading: Lifeline,
    writing: Lifeline,
}

impl MemoryConn {
    fn new(
        stream: DuplexStream,
        local: Addr,
        remote: Addr,
        port: Option<PortGuard<Inbox<MemoryConn>>>,
        owner: &Endpoint,
    ) -> Self {
        owner.open.fetch_add(1, Ordering::SeqCst);
        Self {
            stream,
            local,
            remote,
            _port: port,
            open: Arc::clone(&owner.open),
            reading: Lifeline::new(&owner.closed),
            writing: Lifeline::new(&owner.closed),
        }
    }
}

impl Drop for MemoryConn {
    fn drop(&mut self) {
        self.open.fetch_sub(1, Ordering::SeqCst);
    }
}

impl RawConn for MemoryConn {
    fn local_addr(&self) -> String {
        self.local.to_string()
    }

    fn remote_addr(&self) -> String {
        self.remote.to_string()
    }
}

impl AsyncRead for MemoryConn {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        this.reading.check(cx)?;
        Pin::new(&mut this.stream).poll_read(cx, buf)
    }
}

impl AsyncWrite for MemoryConn {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        this.writing.check(cx)?;
        Pin::new(&mut this.stream).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        this.writing.check(cx)?;
        Pin::new(&mut this.stream).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().stream).poll_shutdown(cx)
    }
}
