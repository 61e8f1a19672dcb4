//! Supervised backend serve tasks.
//!
//! Each backend's [`Backend::serve`] runs in its own tokio task. The
//! supervisor waits for the backend's readiness signal during init, keeps
//! per-backend status for health checks, and turns a serve task that ends
//! outside of shutdown, panics included, into a [`BackendFault`].
//!
//! Events are recorded in the caller's current span; serve tasks run in a
//! `serve` child span of it.

use std::any::Any;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use corelib::NetworkType;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{broadcast, oneshot};
use tokio::task::{AbortHandle, JoinHandle};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::backend::{Backend, Readiness};
use crate::error::{BackendError, NetworkError, Result};

const FAULT_CHANNEL_CAPACITY: usize = 16;

/// Lifecycle status of one backend slot.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "reason", rename_all = "snake_case")]
pub enum BackendStatus {
    /// No backend of this type is owned by the facade
    Unconfigured,
    /// Owned but not started
    Idle,
    /// Serve task running, readiness not yet signalled
    Starting,
    /// Serving
    Ready,
    /// Direct backend without a bind address: dials out, never listens
    OutboundOnly,
    /// Failed to start, or the serve task ended unexpectedly
    Faulted(String),
    /// Shut down
    Closed,
}

impl BackendStatus {
    fn is_operational(&self) -> bool {
        matches!(self, BackendStatus::Ready | BackendStatus::OutboundOnly)
    }
}

/// Snapshot of every backend slot, for health-check callers.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct HealthReport {
    pub backends: BTreeMap<NetworkType, BackendStatus>,
}

impl HealthReport {
    pub fn status(&self, network: NetworkType) -> BackendStatus {
        self.backends
            .get(&network)
            .cloned()
            .unwrap_or(BackendStatus::Unconfigured)
    }

    /// True when every owned backend is serving or dialing out.
    pub fn is_healthy(&self) -> bool {
        self.backends
            .values()
            .filter(|s| **s != BackendStatus::Unconfigured)
            .all(BackendStatus::is_operational)
    }
}

/// A serve task ended while the network was not shutting down.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BackendFault {
    pub network: NetworkType,
    pub reason: String,
}

pub(crate) struct Supervisor {
    statuses: Mutex<BTreeMap<NetworkType, BackendStatus>>,
    tasks: Mutex<Vec<ServeTask>>,
    faults: broadcast::Sender<BackendFault>,
    closing: AtomicBool,
}

impl Supervisor {
    pub(crate) fn new(owned: &[NetworkType]) -> Arc<Self> {
        let statuses = NetworkType::ALL
            .into_iter()
            .map(|network| {
                let status = if owned.contains(&network) {
                    BackendStatus::Idle
                } else {
                    BackendStatus::Unconfigured
                };
                (network, status)
            })
            .collect();
        let (faults, _) = broadcast::channel(FAULT_CHANNEL_CAPACITY);

        Arc::new(Self {
            statuses: Mutex::new(statuses),
            tasks: Mutex::new(Vec::new()),
            faults,
            closing: AtomicBool::new(false),
        })
    }

    pub(crate) fn set_status(&self, network: NetworkType, status: BackendStatus) {
        self.statuses.lock().insert(network, status);
    }

    pub(crate) fn report(&self) -> HealthReport {
        HealthReport {
            backends: self.statuses.lock().clone(),
        }
    }

    pub(crate) fn subscribe(&self) -> broadcast::Receiver<BackendFault> {
        self.faults.subscribe()
    }

    /// Spawns `backend.serve` and waits for its readiness signal.
    ///
    /// Fails if `cancel` fires, the deadline passes, or serve returns first.
    /// On failure the serve task is aborted and the slot is marked faulted.
    pub(crate) async fn start<B: Backend>(
        self: &Arc<Self>,
        backend: Arc<B>,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let network = backend.network_type();
        self.set_status(network, BackendStatus::Starting);

        let (ready, ready_rx) = Readiness::channel();
        let (exit_tx, mut exit_rx) = oneshot::channel();

        // A panicking serve surfaces as a JoinError in the watcher.
        let span = info_span!("serve", %network);
        let serve = tokio::spawn(
            async move { backend.serve(ready).await }.instrument(span.clone()),
        );
        let abort = serve.abort_handle();

        let supervisor = Arc::clone(self);
        let watcher = tokio::spawn(
            async move {
                let result = match serve.await {
                    Ok(result) => result,
                    Err(err) if err.is_panic() => Err(BackendError::Other(format!(
                        "serve panicked: {}",
                        panic_reason(err.into_panic())
                    ))),
                    // Aborted by start() or join_all().
                    Err(_) => return,
                };
                supervisor.finished(network, result, exit_tx);
            }
            .instrument(span),
        );
        self.tasks.lock().push(ServeTask {
            network,
            watcher,
            serve: abort.clone(),
        });

        let deadline = Instant::now() + timeout;
        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(NetworkError::Cancelled),
            waited = tokio::time::timeout_at(deadline, ready_rx) => match waited {
                Ok(Ok(())) => Ok(()),
                // Readiness handle dropped: serve is returning without it.
                Ok(Err(_)) => {
                    let source = match tokio::time::timeout_at(deadline, &mut exit_rx).await {
                        Ok(Ok(Err(source))) => source,
                        _ => BackendError::Other("serve exited before becoming ready".to_string()),
                    };
                    Err(NetworkError::Init { network, source })
                }
                Err(_) => Err(NetworkError::ReadinessTimeout { network, timeout }),
            },
        };

        match outcome {
            Ok(()) => {
                // From here on an exit is a fault, not an init failure.
                exit_rx.close();
                if let Ok(result) = exit_rx.try_recv() {
                    self.fault(network, result);
                } else {
                    self.set_status(network, BackendStatus::Ready);
                    info!(%network, "backend ready");
                }
                Ok(())
            }
            Err(err) => {
                abort.abort();
                self.set_status(network, BackendStatus::Faulted(err.to_string()));
                error!(%network, error = %err, "backend failed to start");
                Err(err)
            }
        }
    }

    fn finished(
        &self,
        network: NetworkType,
        result: std::result::Result<(), BackendError>,
        exit_tx: oneshot::Sender<std::result::Result<(), BackendError>>,
    ) {
        if self.closing.load(Ordering::SeqCst) {
            debug!(%network, "serve task stopped");
            return;
        }
        // Delivered to a start() still waiting on readiness; otherwise a fault.
        if let Err(result) = exit_tx.send(result) {
            self.fault(network, result);
        }
    }

    fn fault(&self, network: NetworkType, result: std::result::Result<(), BackendError>) {
        let reason = match result {
            Ok(()) => "serve returned unexpectedly".to_string(),
            Err(err) => err.to_string(),
        };
        error!(%network, %reason, "backend serve task terminated");
        self.set_status(network, BackendStatus::Faulted(reason.clone()));
        // No subscribers is fine; the status still records the fault.
        let _ = self.faults.send(BackendFault { network, reason });
    }

    /// Marks the network as shutting down so serve exits are not faults.
    pub(crate) fn begin_close(&self) {
        self.closing.store(true, Ordering::SeqCst);
    }

    /// Waits up to `grace` per serve task, aborting stragglers.
    pub(crate) async fn join_all(&self, grace: Duration) {
        let tasks = std::mem::take(&mut *self.tasks.lock());
        for mut task in tasks {
            if tokio::time::timeout(grace, &mut task.watcher).await.is_err() {
                warn!(network = %task.network, "serve task did not stop, aborting");
                task.serve.abort();
                task.watcher.abort();
            }
        }
    }
}

struct ServeTask {
    network: NetworkType,
    watcher: JoinHandle<()>,
    serve: AbortHandle,
}

fn panic_reason(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
