//! Direct TCP backend.
//!
//! Peers are found through a static [`DirectTable`] and reached with a
//! plain TCP connection, one per stream. Every connection opens with the
//! signed handshake in [`super::handshake`], which names the source and
//! destination `(public key, port)` pairs and proves both ends hold their
//! secret keys. After the handshake the socket is handed to the caller as is,
//! until the client closes.

use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use corelib::{Addr, KeyPair, NetworkType, PublicKey};
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn, Instrument};

use super::handshake::{self, Status};
use super::table::DirectTable;
use crate::backend::{Backend, RawConn, RawListener, Readiness};
use crate::error::BackendError;
use crate::ports::{self, Lifeline, PortGuard, PortListener, PortTable};

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

type Inbox = ports::Inbox<DirectConn>;

/// TCP backend addressed through a static key to address table.
pub struct DirectClient {
    keys: KeyPair,
    local_addr: Option<String>,
    table: DirectTable,
    ports: PortTable<Inbox>,
    bound: Mutex<Option<SocketAddr>>,
    open: Arc<AtomicUsize>,
    closed: CancellationToken,
}

impl DirectClient {
    /// `local_addr` is where [`Backend::serve`] binds. Without one the client
    /// can only dial out.
    pub fn new(keys: KeyPair, local_addr: Option<String>, table: DirectTable) -> Self {
        Self {
            keys,
            local_addr,
            table,
            ports: PortTable::new(),
            bound: Mutex::new(None),
            open: Arc::new(AtomicUsize::new(0)),
            closed: CancellationToken::new(),
        }
    }

    pub fn public_key(&self) -> PublicKey {
        self.keys.public_key()
    }

    /// Socket address the listener is bound to, once serving.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.bound.lock()
    }

    pub fn table(&self) -> &DirectTable {
        &self.table
    }

    /// Connections created by this client and not yet dropped.
    pub fn open_conns(&self) -> usize {
        self.open.load(Ordering::SeqCst)
    }

    /// Local ports held by listeners and outgoing connections.
    pub fn ports_in_use(&self) -> usize {
        self.ports.len()
    }

    fn responder(&self) -> Responder {
        Responder {
            keys: self.keys.clone(),
            ports: self.ports.clone(),
            open: Arc::clone(&self.open),
            closed: self.closed.clone(),
        }
    }
}

#[async_trait]
impl Backend for DirectClient {
    fn network_type(&self) -> NetworkType {
        NetworkType::Direct
    }

    async fn serve(&self, mut ready: Readiness) -> Result<(), BackendError> {
        let addr = self
            .local_addr
            .as_deref()
            .ok_or_else(|| BackendError::Other("no local address to listen on".to_string()))?;
        let listener = TcpListener::bind(addr).await?;
        let bound = listener.local_addr()?;
        *self.bound.lock() = Some(bound);
        info!(%bound, "direct backend listening");
        ready.notify();

        loop {
            tokio::select! {
                biased;
                _ = self.closed.cancelled() => {
                    debug!(%bound, "direct listener stopped");
                    return Ok(());
                }
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        tokio::spawn(self.responder().run(stream, peer).in_current_span());
                    }
                    Err(err) => {
                        warn!(error = %err, "tcp accept failed");
                        tokio::time::sleep(ACCEPT_BACKOFF).await;
                    }
                },
            }
        }
    }

    async fn dial(
        &self,
        cancel: &CancellationToken,
        remote: PublicKey,
        port: u16,
    ) -> Result<Box<dyn RawConn>, BackendError> {
        if self.closed.is_cancelled() {
            return Err(BackendError::Closed);
        }
        let addr = self
            .table
            .lookup(&remote)
            .ok_or(BackendError::NoAddress(remote))?;
        let guard = self.ports.reserve_ephemeral()?;
        let local = Addr::new(self.keys.public_key(), guard.port());
        let dst = Addr::new(remote, port);

        let connect = async {
            let mut stream = TcpStream::connect(&addr).await?;
            stream.set_nodelay(true)?;
            tokio::time::timeout(
                HANDSHAKE_TIMEOUT,
                handshake::initiate(&mut stream, self.keys.secret_key(), local, dst),
            )
            .await
            .map_err(|_| BackendError::Handshake("timed out".to_string()))??;
            Ok::<_, BackendError>(stream)
        };

        // Dropping `connect` closes a half-open socket; dropping `guard`
        // frees the port.
        let stream = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(BackendError::Cancelled),
            _ = self.closed.cancelled() => return Err(BackendError::Closed),
            res = connect => res?,
        };

        debug!(%remote, port, %addr, local_port = local.port, "direct connection established");
        Ok(Box::new(DirectConn::new(
            stream,
            local,
            dst,
            Some(guard),
            Arc::clone(&self.open),
            &self.closed,
        )))
    }

    async fn listen(&self, port: u16) -> Result<Box<dyn RawListener>, BackendError> {
        if self.closed.is_cancelled() {
            return Err(BackendError::Closed);
        }
        let listener = PortListener::<DirectConn>::bind(
            &self.ports,
            self.keys.public_key(),
            port,
            self.closed.child_token(),
        )?;
        debug!(addr = %listener.addr(), "direct listener bound");
        Ok(Box::new(listener))
    }

    async fn close(&self) -> Result<(), BackendError> {
        if !self.closed.is_cancelled() {
            info!(
                conns = self.open_conns(),
                ports = self.ports_in_use(),
                "closing direct backend"
            );
            self.closed.cancel();
        }
        Ok(())
    }
}

/// Accepting side of the handshake, detached from the client so it can run
/// in its own task.
struct Responder {
    keys: KeyPair,
    ports: PortTable<Inbox>,
    open: Arc<AtomicUsize>,
    closed: CancellationToken,
}

impl Responder {
    /// Answers one inbound socket, giving up if the client closes first.
    async fn run(self, stream: TcpStream, peer: SocketAddr) {
        let closed = self.closed.clone();
        tokio::select! {
            _ = closed.cancelled() => debug!(%peer, "handshake abandoned on close"),
            res = self.handle(stream) => {
                if let Err(err) = res {
                    debug!(%peer, error = %err, "inbound connection rejected");
                }
            }
        }
    }

    async fn handle(self, mut stream: TcpStream) -> Result<(), BackendError> {
        stream.set_nodelay(true)?;
        let (request, inbox) = tokio::time::timeout(HANDSHAKE_TIMEOUT, self.answer(&mut stream))
            .await
            .map_err(|_| BackendError::Handshake("timed out".to_string()))??;

        let conn = DirectConn::new(
            stream,
            request.dst,
            request.src,
            None,
            self.open,
            &self.closed,
        );
        debug!(remote = %request.src, port = request.dst.port, "inbound connection accepted");
        inbox.send(conn).await.map_err(|_| BackendError::Closed)
    }

    async fn answer(
        &self,
        stream: &mut TcpStream,
    ) -> Result<(handshake::Request, Inbox), BackendError> {
        let request = handshake::read_request(stream).await?;
        let sk = self.keys.secret_key();

        if request.dst.pk != self.keys.public_key() {
            handshake::write_response(stream, &request, Status::WrongKey, sk).await?;
            return Err(BackendError::Handshake(format!(
                "request addressed to {}",
                request.dst.pk
            )));
        }

        let Some(inbox) = self.ports.listener(request.dst.port) else {
            handshake::write_response(stream, &request, Status::NoListener, sk).await?;
            return Err(BackendError::Unreachable {
                pk: request.dst.pk,
                port: request.dst.port,
            });
        };

        handshake::write_response(stream, &request, Status::Ok, sk).await?;
        Ok((request, inbox))
    }
}

/// A TCP stream that completed the handshake. Reads and writes fail once
/// the client that made it is closed.
pub struct DirectConn {
    stream: TcpStream,
    local: Addr,
    remote: Addr,
    _port: Option<PortGuard<Inbox>>,
    open: Arc<AtomicUsize>,
    reading: Lifeline,
    writing: Lifeline,
}

impl DirectConn {
    fn new(
        stream: TcpStream,
        local: Addr,
        remote: Addr,
        port: Option<PortGuard<Inbox>>,
        open: Arc<AtomicUsize>,
        closed: &CancellationToken,
    ) -> Self {
        open.fetch_add(1, Ordering::SeqCst);
        Self {
            stream,
            local,
            remote,
            _port: port,
            open,
            reading: Lifeline::new(closed),
            writing: Lifeline::new(closed),
        }
    }
}

impl Drop for DirectConn {
    fn drop(&mut self) {
        self.open.fetch_sub(1, Ordering::SeqCst);
    }
}

impl RawConn for DirectConn {
    fn local_addr(&self) -> String {
        self.local.to_string()
    }

    fn remote_addr(&self) -> String {
        self.remote.to_string()
    }
}

impl AsyncRead for DirectConn {
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

impl AsyncWrite for DirectConn {
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
