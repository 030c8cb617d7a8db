//! Process shutdown coordination.
//!
//! [`ShutdownCoordinator::shutdown`] stops new leases, closes idle
//! connections and stops registered background workers. The readiness latch
//! is left alone; health checks observe draining through [`ShutdownCoordinator::token`]. It is idempotent:
//! duplicate signal delivery or a second explicit call only logs.

use crate::db::{ConnectionPool, Connector};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::signal;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// How long a worker gets to observe cancellation before it is aborted.
pub const DEFAULT_WORKER_GRACE: Duration = Duration::from_secs(5);

struct Worker {
    name: &'static str,
    handle: JoinHandle<()>,
}

pub struct ShutdownCoordinator<C: Connector> {
    pool: Arc<ConnectionPool<C>>,
    workers: Mutex<Vec<Worker>>,
    token: CancellationToken,
    started: AtomicBool,
    worker_grace: Duration,
}

impl<C: Connector> ShutdownCoordinator<C> {
    pub fn new(pool: Arc<ConnectionPool<C>>) -> Self {
        Self {
            pool,
            workers: Mutex::new(Vec::new()),
            token: CancellationToken::new(),
            started: AtomicBool::new(false),
            worker_grace: DEFAULT_WORKER_GRACE,
        }
    }

    pub fn with_worker_grace(mut self, grace: Duration) -> Self {
        self.worker_grace = grace;
        self
    }

    /// Token cancelled at the start of shutdown. Workers select on it.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    /// Track a background task so shutdown can stop it.
    ///
    /// A worker registered after shutdown started is aborted immediately.
    pub fn register_worker(&self, name: &'static str, handle: JoinHandle<()>) {
        let mut workers = self.workers.lock().unwrap_or_else(PoisonError::into_inner);
        if self.is_shutting_down() {
            debug!(worker = name, "Shutdown in progress, aborting late worker");
            handle.abort();
            return;
        }
        debug!(worker = name, "Registered background worker");
        workers.push(Worker { name, handle });
    }

    /// Run the shutdown sequence once. Later calls are no-ops.
    pub async fn shutdown(&self) {
        let pending = {
            let mut workers = self.workers.lock().unwrap_or_else(PoisonError::into_inner);
            if self.started.swap(true, Ordering::AcqRel) {
                debug!("Shutdown already requested");
                return;
            }
            std::mem::take(&mut *workers)
        };

        info!("Shutting down database layer");
        self.token.cancel();

        info!("Closing connection pool");
        self.pool.close().await;

        if !pending.is_empty() {
            info!(count = pending.len(), "Stopping background workers");
        }
        for Worker { name, mut handle } in pending {
            match tokio::time::timeout(self.worker_grace, &mut handle).await {
                Ok(Ok(())) => debug!(worker = name, "Background worker stopped"),
                Ok(Err(e)) if e.is_cancelled() => debug!(worker = name, "Background worker was aborted"),
                Ok(Err(e)) => warn!(worker = name, error = %e, "Background worker ended abnormally"),
                Err(_) => {
                    warn!(
                        worker = name,
                        grace_ms = self.worker_grace.as_millis() as u64,
                        "Background worker did not stop in time, aborting"
                    );
                    handle.abort();
                }
            }
        }

        info!("Database layer shut down");
    }

    /// Wait for SIGINT/SIGTERM, then shut down.
    pub async fn run_until_signal(&self) {
        wait_for_signal().await;
        self.shutdown().await;
    }
}

impl<C: Connector> std::fmt::Debug for ShutdownCoordinator<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShutdownCoordinator")
            .field("shutting_down", &self.is_shutting_down())
            .field("worker_grace", &self.worker_grace)
            .finish_non_exhaustive()
    }
}

/// Wait for a shutdown signal (SIGINT or SIGTERM).
pub async fn wait_for_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for SIGINT");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received SIGINT"),
        _ = terminate => info!("Received SIGTERM"),
    }
}
