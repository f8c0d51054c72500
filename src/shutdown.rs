//! Coordinated graceful shutdown.
//!
//! The coordinator fans out two signals. The *shutdown* signal tells
//! transports to stop accepting new work while in-flight dispatches run to
//! completion. The *cancellation* signal fires only when the grace deadline
//! elapses and is what request contexts observe, so cooperative handlers
//! are not interrupted by the shutdown signal itself.
//!
//! Transports register every dispatch with an [`InFlightGuard`];
//! [`ShutdownCoordinator::drain`] waits for the table to empty, bounded by
//! the grace deadline, and reports the correlation tokens of any work it
//! had to abandon.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::{watch, Notify};

use crate::protocol::RequestId;

/// Outcome of draining in-flight work.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DrainOutcome {
    /// All in-flight dispatches completed within the grace deadline.
    Completed,
    /// The deadline elapsed; these request tokens were abandoned.
    Abandoned(Vec<String>),
}

#[derive(Debug)]
struct Inner {
    shutdown: watch::Sender<bool>,
    cancel: watch::Sender<bool>,
    in_flight: Mutex<HashMap<u64, String>>,
    next_token: AtomicU64,
    idle: Notify,
}

impl Inner {
    fn lock_in_flight(&self) -> std::sync::MutexGuard<'_, HashMap<u64, String>> {
        self.in_flight.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Owns the shutdown state; cheap to clone and share.
#[derive(Debug, Clone)]
pub struct ShutdownCoordinator {
    inner: Arc<Inner>,
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl ShutdownCoordinator {
    /// Creates a coordinator with no signal raised.
    #[must_use]
    pub fn new() -> Self {
        let (shutdown, _) = watch::channel(false);
        let (cancel, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                shutdown,
                cancel,
                in_flight: Mutex::new(HashMap::new()),
                next_token: AtomicU64::new(0),
                idle: Notify::new(),
            }),
        }
    }

    /// Returns a handle for transports and request contexts.
    #[must_use]
    pub fn handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            inner: Arc::clone(&self.inner),
        }
    }

    /// Raises the shutdown signal. Idempotent.
    pub fn trigger(&self) {
        self.inner.shutdown.send_replace(true);
    }

    /// Whether shutdown has been requested.
    #[must_use]
    pub fn is_triggered(&self) -> bool {
        *self.inner.shutdown.borrow()
    }

    /// Correlation tokens of dispatches currently in flight, sorted.
    #[must_use]
    pub fn outstanding(&self) -> Vec<String> {
        let mut tokens: Vec<String> = self.inner.lock_in_flight().values().cloned().collect();
        tokens.sort();
        tokens
    }

    /// Waits for in-flight dispatches to complete, bounded by `grace`.
    ///
    /// On deadline expiry the cancellation signal is raised so remaining
    /// handlers observe it, and the abandoned tokens are reported.
    pub async fn drain(&self, grace: Duration) -> DrainOutcome {
        let drained = tokio::time::timeout(grace, self.wait_until_idle()).await;
        if drained.is_ok() {
            return DrainOutcome::Completed;
        }

        // Snapshot before raising the cancellation signal: cooperative
        // handlers may clear the table as soon as it fires.
        let abandoned = self.outstanding();
        self.inner.cancel.send_replace(true);
        DrainOutcome::Abandoned(abandoned)
    }

    async fn wait_until_idle(&self) {
        loop {
            let notified = self.inner.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.inner.lock_in_flight().is_empty() {
                return;
            }
            notified.await;
        }
    }
}

/// A transport-side view of the coordinator.
#[derive(Debug, Clone)]
pub struct ShutdownHandle {
    inner: Arc<Inner>,
}

impl ShutdownHandle {
    /// Whether shutdown has been requested.
    #[must_use]
    pub fn is_triggered(&self) -> bool {
        *self.inner.shutdown.borrow()
    }

    /// Resolves once shutdown is requested.
    pub async fn triggered(&self) {
        let mut shutdown = self.inner.shutdown.subscribe();
        while !*shutdown.borrow_and_update() {
            if shutdown.changed().await.is_err() {
                return;
            }
        }
    }

    /// A cancellation receiver for request contexts.
    ///
    /// Fires at the hard shutdown deadline, not at the shutdown signal.
    #[must_use]
    pub fn cancellation(&self) -> watch::Receiver<bool> {
        self.inner.cancel.subscribe()
    }

    /// Registers one dispatch as in flight until the guard is dropped.
    #[must_use]
    pub fn begin(&self, request_id: &RequestId) -> InFlightGuard {
        let token = self.inner.next_token.fetch_add(1, Ordering::Relaxed);
        self.inner
            .lock_in_flight()
            .insert(token, request_id.to_string());
        InFlightGuard {
            inner: Arc::clone(&self.inner),
            token,
        }
    }
}

/// RAII registration of one in-flight dispatch.
#[derive(Debug)]
pub struct InFlightGuard {
    inner: Arc<Inner>,
    token: u64,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        let mut in_flight = self.inner.lock_in_flight();
        in_flight.remove(&self.token);
        let empty = in_flight.is_empty();
        drop(in_flight);
        if empty {
            self.inner.idle.notify_waiters();
        }
    }
}

/// Waits for a termination signal, then triggers the coordinator.
#[cfg(unix)]
pub async fn listen_for_signals(coordinator: ShutdownCoordinator) {
    use tokio::signal::unix::{signal, SignalKind};

    let (mut sigint, mut sigterm) = match (
        signal(SignalKind::interrupt()),
        signal(SignalKind::terminate()),
    ) {
        (Ok(sigint), Ok(sigterm)) => (sigint, sigterm),
        (Err(e), _) | (_, Err(e)) => {
            tracing::error!(error = %e, "failed to install signal handlers");
            return;
        }
    };

    tokio::select! {
        _ = sigint.recv() => {
            tracing::info!("received SIGINT, initiating graceful shutdown");
        }
        _ = sigterm.recv() => {
            tracing::info!("received SIGTERM, initiating graceful shutdown");
        }
    }

    coordinator.trigger();
}

/// Waits for a termination signal, then triggers the coordinator.
#[cfg(windows)]
pub async fn listen_for_signals(coordinator: ShutdownCoordinator) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to install Ctrl+C handler");
        return;
    }
    tracing::info!("received Ctrl+C, initiating graceful shutdown");
    coordinator.trigger();
}
