//! Local port bookkeeping shared by the in-crate backends.
//!
//! A port is either bound by a listener, which stores its delivery value,
//! or reserved as the local end of an outgoing connection. Reservations are
//! held by a [`PortGuard`] and released when it drops.
//!
//! Connections hold a [`Lifeline`] to the backend that made them, so closing
//! the backend ends their I/O as well.

use std::collections::HashMap;
use std::future::Future;
use std::io;
use std::ops::RangeInclusive;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use async_trait::async_trait;
use corelib::Addr;
use parking_lot::Mutex;
use rand::Rng;
use tokio::sync::mpsc;
use tokio_util::sync::{CancellationToken, WaitForCancellationFutureOwned};

use crate::backend::{RawConn, RawListener};
use crate::error::BackendError;

/// Queue depth of connections waiting in a listener.
pub(crate) const LISTENER_BACKLOG: usize = 64;

/// Local ports handed to outgoing connections.
pub const EPHEMERAL_PORTS: RangeInclusive<u16> = 49152..=65535;

struct Entry<T> {
    id: u64,
    listener: Option<T>,
}

struct Inner<T> {
    ports: HashMap<u16, Entry<T>>,
    next_id: u64,
}

pub(crate) struct PortTable<T> {
    inner: Arc<Mutex<Inner<T>>>,
}

impl<T> Clone for PortTable<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Clone> PortTable<T> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                ports: HashMap::new(),
                next_id: 0,
            })),
        }
    }

    /// Binds `port` for a listener. Port 0 picks a free ephemeral port.
    pub fn bind(&self, port: u16, listener: T) -> Result<PortGuard<T>, BackendError> {
        if port == 0 {
            return self.reserve(Some(listener));
        }
        let mut inner = self.inner.lock();
        if inner.ports.contains_key(&port) {
            return Err(BackendError::PortInUse(port));
        }
        Ok(self.insert(&mut inner, port, Some(listener)))
    }

    /// Reserves a free ephemeral port for an outgoing connection.
    pub fn reserve_ephemeral(&self) -> Result<PortGuard<T>, BackendError> {
        self.reserve(None)
    }

    fn reserve(&self, listener: Option<T>) -> Result<PortGuard<T>, BackendError> {
        let mut inner = self.inner.lock();
        let span = u32::from(EPHEMERAL_PORTS.end() - EPHEMERAL_PORTS.start()) + 1;
        let start = rand::thread_rng().gen_range(0..span);

        for offset in 0..span {
            let port = EPHEMERAL_PORTS.start() + ((start + offset) % span) as u16;
            if !inner.ports.contains_key(&port) {
                return Ok(self.insert(&mut inner, port, listener));
            }
        }
        Err(BackendError::PortsExhausted)
    }

    fn insert(&self, inner: &mut Inner<T>, port: u16, listener: Option<T>) -> PortGuard<T> {
        let id = inner.next_id;
        inner.next_id += 1;
        inner.ports.insert(port, Entry { id, listener });
        PortGuard {
            port,
            id,
            inner: Arc::clone(&self.inner),
        }
    }

    /// Ports currently bound or reserved.
    pub fn len(&self) -> usize {
        self.inner.lock().ports.len()
    }

    /// Delivery value of the listener bound on `port`, if any.
    pub fn listener(&self, port: u16) -> Option<T> {
        self.inner
            .lock()
            .ports
            .get(&port)
            .and_then(|entry| entry.listener.clone())
    }
}

/// Holds a port until dropped.
pub(crate) struct PortGuard<T> {
    port: u16,
    id: u64,
    inner: Arc<Mutex<Inner<T>>>,
}

impl<T> PortGuard<T> {
    pub fn port(&self) -> u16 {
        self.port
    }
}

impl<T> Drop for PortGuard<T> {
    fn drop(&mut self) {
        let mut inner = self.inner.lock();
        if inner.ports.get(&self.port).map(|e| e.id) == Some(self.id) {
            inner.ports.remove(&self.port);
        }
    }
}

/// Fails a connection's I/O once its backend has closed.
///
/// Keep one per direction: the wakeup goes to the task that polled last.
pub(crate) struct Lifeline(Pin<Box<WaitForCancellationFutureOwned>>);

impl Lifeline {
    pub fn new(closed: &CancellationToken) -> Self {
        Self(Box::pin(closed.clone().cancelled_owned()))
    }

    /// `Ok` while the backend is open.
    pub fn check(&mut self, cx: &mut Context<'_>) -> io::Result<()> {
        match self.0.as_mut().poll(cx) {
            Poll::Ready(()) => Err(io::Error::new(
                io::ErrorKind::ConnectionAborted,
                "backend closed",
            )),
            Poll::Pending => Ok(()),
        }
    }
}

/// Where a backend delivers connections for a bound port.
pub(crate) type Inbox<C> = mpsc::Sender<C>;

/// Listener fed by a backend through the [`Inbox`] stored in its port
/// table entry.
pub(crate) struct PortListener<C> {
    addr: Addr,
    incoming: tokio::sync::Mutex<mpsc::Receiver<C>>,
    guard: Mutex<Option<PortGuard<Inbox<C>>>>,
    closed: CancellationToken,
}

impl<C: RawConn> PortListener<C> {
    /// Binds `port` in `ports`. `closed` ends accepts when cancelled.
    pub fn bind(
        ports: &PortTable<Inbox<C>>,
        local: corelib::PublicKey,
        port: u16,
        closed: CancellationToken,
    ) -> Result<Self, BackendError> {
        let (inbox, incoming) = mpsc::channel(LISTENER_BACKLOG);
        let guard = ports.bind(port, inbox)?;
        Ok(Self {
            addr: Addr::new(local, guard.port()),
            incoming: tokio::sync::Mutex::new(incoming),
            guard: Mutex::new(Some(guard)),
            closed,
        })
    }
}

#[async_trait]
impl<C: RawConn> RawListener for PortListener<C> {
    fn addr(&self) -> String {
        self.addr.to_string()
    }

    async fn accept(&self) -> Result<Box<dyn RawConn>, BackendError> {
        let mut incoming = self.incoming.lock().await;
        tokio::select! {
            biased;
            _ = self.closed.cancelled() => Err(BackendError::Closed),
            conn = incoming.recv() => match conn {
                Some(conn) => Ok(Box::new(conn) as Box<dyn RawConn>),
                None => Err(BackendError::Closed),
            },
        }
    }

    async fn close(&self) -> Result<(), BackendError> {
        self.closed.cancel();
        // Removing the port entry drops the inbox sender, so connections
        // still in flight for it are refused instead of queued.
        self.guard.lock().take();
        Ok(())
    }
}
