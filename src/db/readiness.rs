//! Boot-time readiness gate.
//!
//! [`ReadinessGate::wait_for_db`] blocks startup until the database answers a
//! trivial probe, sleeping `attempt * base_delay` between failed attempts
//! (2s, 4s, 6s, ... by default). Giving up is fatal: the caller is expected to
//! abort boot instead of serving traffic.
//!
//! [`ReadinessState`] is the latch the health endpoints read. It never touches
//! the pool, and once set it stays set for the life of the process.

use crate::config::{DEFAULT_READY_BASE_DELAY_SECS, DEFAULT_READY_MAX_RETRIES};
use crate::db::connection::{Connection, Connector};
use crate::error::{DbError, DbResult};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Shared readiness flag plus the bookkeeping health checks report.
#[derive(Debug, Default)]
pub struct ReadinessState {
    ready: AtomicBool,
    failed_attempts: AtomicU32,
    last_error: Mutex<Option<String>>,
    ready_at: Mutex<Option<DateTime<Utc>>>,
}

/// Serializable view of [`ReadinessState`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReadinessSnapshot {
    pub ready: bool,
    pub failed_attempts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ready_at: Option<DateTime<Utc>>,
}

impl ReadinessState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    pub fn mark_ready(&self) {
        *self.ready_at.lock().unwrap_or_else(PoisonError::into_inner) = Some(Utc::now());
        self.ready.store(true, Ordering::Release);
    }

    pub fn record_failure(&self, error: &DbError) {
        self.failed_attempts.fetch_add(1, Ordering::Relaxed);
        *self.last_error.lock().unwrap_or_else(PoisonError::into_inner) = Some(error.to_string());
    }

    pub fn snapshot(&self) -> ReadinessSnapshot {
        ReadinessSnapshot {
            ready: self.is_ready(),
            failed_attempts: self.failed_attempts.load(Ordering::Relaxed),
            last_error: self
                .last_error
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone(),
            ready_at: *self.ready_at.lock().unwrap_or_else(PoisonError::into_inner),
        }
    }
}

/// One readiness check: open a connection and run a trivial probe.
pub trait ReadinessProbe: Send + Sync {
    fn probe(&self) -> impl Future<Output = DbResult<()>> + Send;
}

/// Probes through a [`Connector`], bypassing the pool.
#[derive(Debug)]
pub struct ConnectorProbe<'a, C>(pub &'a C);

impl<C: Connector> ReadinessProbe for ConnectorProbe<'_, C> {
    async fn probe(&self) -> DbResult<()> {
        let mut conn = self.0.connect().await?;
        let result = conn.ping().await;
        if let Err(e) = conn.close().await {
            tracing::debug!(error = %e, "Error closing readiness probe connection");
        }
        result
    }
}

/// Sleep seam so backoff can be observed without waiting.
pub trait Sleeper: Send + Sync {
    fn sleep(&self, duration: Duration) -> impl Future<Output = ()> + Send;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TokioSleeper;

impl Sleeper for TokioSleeper {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Blocks startup until the database is reachable.
#[derive(Debug)]
pub struct ReadinessGate<S: Sleeper = TokioSleeper> {
    max_retries: u32,
    base_delay: Duration,
    sleeper: S,
    state: Arc<ReadinessState>,
}

impl ReadinessGate<TokioSleeper> {
    pub fn new(state: Arc<ReadinessState>) -> Self {
        Self {
            max_retries: DEFAULT_READY_MAX_RETRIES,
            base_delay: Duration::from_secs(DEFAULT_READY_BASE_DELAY_SECS),
            sleeper: TokioSleeper,
            state,
        }
    }
}

impl<S: Sleeper> ReadinessGate<S> {
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_base_delay(mut self, base_delay: Duration) -> Self {
        self.base_delay = base_delay;
        self
    }

    pub fn with_sleeper<T: Sleeper>(self, sleeper: T) -> ReadinessGate<T> {
        ReadinessGate {
            max_retries: self.max_retries,
            base_delay: self.base_delay,
            sleeper,
            state: self.state,
        }
    }

    pub fn state(&self) -> &Arc<ReadinessState> {
        &self.state
    }

    /// Delay slept after failed attempt `attempt` (1-based).
    pub fn delay_after(&self, attempt: u32) -> Duration {
        self.base_delay.saturating_mul(attempt)
    }

    /// Probe until success or `max_retries` failed attempts.
    pub async fn wait_for_db<P: ReadinessProbe>(&self, probe: &P) -> DbResult<()> {
        self.wait_for_db_with(probe, &CancellationToken::new()).await
    }

    /// Like [`wait_for_db`](Self::wait_for_db), abandoned when `cancel` fires.
    pub async fn wait_for_db_with<P: ReadinessProbe>(
        &self,
        probe: &P,
        cancel: &CancellationToken,
    ) -> DbResult<()> {
        let mut last_error = String::from("no attempts made");

        for attempt in 1..=self.max_retries {
            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(DbError::cancelled("waiting for database")),
                result = probe.probe() => result,
            };

            match result {
                Ok(()) => {
                    self.state.mark_ready();
                    info!(attempt, "Database is ready");
                    return Ok(());
                }
                Err(e) => {
                    warn!(
                        attempt,
                        max_retries = self.max_retries,
                        error = %e,
                        "Database not ready"
                    );
                    self.state.record_failure(&e);
                    last_error = e.to_string();
                }
            }

            if attempt < self.max_retries {
                let delay = self.delay_after(attempt);
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Err(DbError::cancelled("waiting for database")),
                    _ = self.sleeper.sleep(delay) => {}
                }
            }
        }

        error!(
            attempts = self.max_retries,
            error = %last_error,
            "Database never became ready"
        );
        Err(DbError::readiness_timeout(self.max_retries, last_error))
    }
}
