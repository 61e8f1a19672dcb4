//! Backend capability.
//!
//! Every transport the facade can drive implements [`Backend`]. A backend
//! addresses peers by public key and port, hands back raw connections and
//! listeners that report their endpoints in the textual address form, and
//! runs its background work inside [`Backend::serve`].
//!
//! # Readiness
//!
//! Backends do not share a startup signal, so `serve` is given a
//! [`Readiness`] handle and must call [`Readiness::notify`] once it is
//! accepting work. The facade waits on that signal before starting the next
//! backend.

use std::fmt;

use async_trait::async_trait;
use corelib::{NetworkType, PublicKey};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::error::BackendError;

/// A raw byte stream produced by a backend.
///
/// Addresses use the textual form `<public-key>:<port>` (or `:~`).
pub trait RawConn: AsyncRead + AsyncWrite + Send + Unpin + 'static {
    fn local_addr(&self) -> String;
    fn remote_addr(&self) -> String;
}

/// A raw listener produced by a backend.
#[async_trait]
pub trait RawListener: Send + Sync + 'static {
    /// Local address in textual form.
    fn addr(&self) -> String;

    /// Waits for the next inbound connection.
    ///
    /// Returns [`BackendError::Closed`] once the listener or its backend is
    /// closed.
    async fn accept(&self) -> Result<Box<dyn RawConn>, BackendError>;

    /// Stops accepting and releases the port. Idempotent.
    async fn close(&self) -> Result<(), BackendError>;
}

/// One-shot signal a backend gives once it is accepting work.
pub struct Readiness(Option<oneshot::Sender<()>>);

impl Readiness {
    /// Creates a signal and the receiver that observes it.
    pub fn channel() -> (Self, oneshot::Receiver<()>) {
        let (tx, rx) = oneshot::channel();
        (Self(Some(tx)), rx)
    }

    /// Marks the backend ready. Later calls are no-ops.
    pub fn notify(&mut self) {
        if let Some(tx) = self.0.take() {
            let _ = tx.send(());
        }
    }

    pub fn is_notified(&self) -> bool {
        self.0.is_none()
    }
}

impl fmt::Debug for Readiness {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Readiness")
            .field("notified", &self.is_notified())
            .finish()
    }
}

/// Transport backend contract.
///
/// # Thread Safety
///
/// The facade shares one backend between its serve task and every caller of
/// dial/listen, so implementations must be `Send + Sync`.
#[async_trait]
pub trait Backend: Send + Sync + 'static {
    /// Stable identifier, invariant for the backend's lifetime.
    fn network_type(&self) -> NetworkType;

    /// Runs background work until [`Backend::close`].
    ///
    /// Must call `ready.notify()` once the backend accepts work. Returning
    /// before `close` is treated as an unexpected termination.
    async fn serve(&self, ready: Readiness) -> Result<(), BackendError>;

    /// Opens a stream to `remote` on `port`.
    ///
    /// Returns [`BackendError::Cancelled`] if `cancel` fires first. Anything
    /// the attempt opened is released before returning.
    async fn dial(
        &self,
        cancel: &CancellationToken,
        remote: PublicKey,
        port: u16,
    ) -> Result<Box<dyn RawConn>, BackendError>;

    /// Binds `port` for inbound connections.
    ///
    /// Fails with [`BackendError::PortInUse`] if this backend already bound it.
    async fn listen(&self, port: u16) -> Result<Box<dyn RawListener>, BackendError>;

    /// Closes every session and listener owned by the backend. Idempotent.
    async fn close(&self) -> Result<(), BackendError>;
}

/// Type for an empty backend slot, as in `Network<NoBackend, DirectClient>`.
///
/// Uninhabited: a slot of this type is always `None`.
#[derive(Debug)]
pub enum NoBackend {}

#[async_trait]
impl Backend for NoBackend {
    fn network_type(&self) -> NetworkType {
        match *self {}
    }

    async fn serve(&self, _ready: Readiness) -> Result<(), BackendError> {
        match *self {}
    }

    async fn dial(
        &self,
        _cancel: &CancellationToken,
        _remote: PublicKey,
        _port: u16,
    ) -> Result<Box<dyn RawConn>, BackendError> {
        match *self {}
    }

    async fn listen(&self, _port: u16) -> Result<Box<dyn RawListener>, BackendError> {
        match *self {}
    }

    async fn close(&self) -> Result<(), BackendError> {
        match *self {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_readiness_notifies_once() {
        let (mut ready, rx) = Readiness::channel();
        assert!(!ready.is_notified());
        ready.notify();
        ready.notify();
        assert!(ready.is_notified());
        assert!(rx.await.is_ok());
    }

    #[tokio::test]
    async fn test_dropped_readiness_reports_error() {
        let (ready, rx) = Readiness::channel();
        drop(ready);
        assert!(rx.await.is_err());
    }
}
