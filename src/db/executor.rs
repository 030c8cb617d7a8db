//! Query execution with bounded, classified retry.
//!
//! Every attempt leases its own connection. A retryable failure (stale SSL
//! session, dropped socket, server restart) discards the connection and the
//! next attempt starts on a fresh one; a fatal failure is returned after one
//! attempt. Once attempts are exhausted the caller receives the original
//! driver error, never a wrapper.

use crate::config::RetryPolicy;
use crate::db::classify::{ErrorKind, classify};
use crate::db::connection::{Connection, Connector, FetchMode, QueryOutput, QueryParam};
use crate::db::pool::ConnectionPool;
use crate::error::{DbError, DbResult};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

/// Per-call limits for [`QueryExecutor::execute_with`].
#[derive(Debug, Clone, Default)]
pub struct ExecuteOptions {
    /// Abort the whole call, including retries and backoff, at this instant.
    pub deadline: Option<Instant>,
    /// Abort the whole call when this token fires.
    pub cancel: Option<CancellationToken>,
}

impl ExecuteOptions {
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.deadline = Some(Instant::now() + timeout);
        self
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn with_cancel(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }
}

/// Runs statements against a [`ConnectionPool`], retrying transient failures.
pub struct QueryExecutor<C: Connector> {
    pool: Arc<ConnectionPool<C>>,
    policy: RetryPolicy,
}

impl<C: Connector> QueryExecutor<C> {
    pub fn new(pool: Arc<ConnectionPool<C>>) -> Self {
        Self::with_policy(pool, RetryPolicy::default())
    }

    pub fn with_policy(pool: Arc<ConnectionPool<C>>, policy: RetryPolicy) -> Self {
        Self { pool, policy }
    }

    pub fn pool(&self) -> &Arc<ConnectionPool<C>> {
        &self.pool
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Run `statement` with up to `max_attempts` attempts.
    pub async fn execute(
        &self,
        statement: &str,
        params: &[QueryParam],
        fetch: FetchMode,
    ) -> DbResult<QueryOutput> {
        self.execute_with(statement, params, fetch, &ExecuteOptions::default())
            .await
    }

    /// Like [`execute`](Self::execute), bounded by a deadline and/or a cancellation token.
    ///
    /// An attempt in flight when the call is aborted loses its connection: the
    /// lease is dropped and discarded, never returned to the idle set.
    pub async fn execute_with(
        &self,
        statement: &str,
        params: &[QueryParam],
        fetch: FetchMode,
        options: &ExecuteOptions,
    ) -> DbResult<QueryOutput> {
        let started = Instant::now();
        let cancel = options.cancel.clone().unwrap_or_default();

        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                warn!(elapsed_ms = started.elapsed().as_millis() as u64, "Query cancelled");
                Err(DbError::cancelled("query execution"))
            }
            _ = sleep_until(options.deadline) => {
                warn!(elapsed_ms = started.elapsed().as_millis() as u64, "Query deadline exceeded");
                Err(DbError::deadline_exceeded("query execution", started.elapsed()))
            }
            result = self.run_attempts(statement, params, fetch) => result,
        }
    }

    async fn run_attempts(
        &self,
        statement: &str,
        params: &[QueryParam],
        fetch: FetchMode,
    ) -> DbResult<QueryOutput> {
        let max_attempts = self.policy.max_attempts.max(1);
        let mut attempt = 0;

        loop {
            attempt += 1;

            let result = match self.pool.acquire().await {
                Ok(mut conn) => {
                    let result = conn.run(statement, params, fetch).await;
                    self.pool.release(Some(conn), result.is_err()).await;
                    result
                }
                Err(e) => Err(e),
            };

            let err = match result {
                Ok(output) => {
                    if attempt > 1 {
                        debug!(attempt, "Query succeeded after retry");
                    }
                    return Ok(output);
                }
                Err(e) => e,
            };

            let kind = classify(&err);
            if kind == ErrorKind::Fatal {
                warn!(attempt, kind = %kind, error = %err, "Query failed");
                return Err(err);
            }
            if attempt >= max_attempts {
                error!(
                    attempt,
                    max_attempts,
                    kind = %kind,
                    error = %err,
                    "Query failed after exhausting retries"
                );
                return Err(err);
            }

            warn!(
                attempt,
                max_attempts,
                kind = %kind,
                error = %err,
                "retrying with fresh connection"
            );
            let delay = self.policy.base_delay.saturating_mul(attempt);
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
        }
    }
}

impl<C: Connector> Clone for QueryExecutor<C> {
    fn clone(&self) -> Self {
        Self {
            pool: Arc::clone(&self.pool),
            policy: self.policy,
        }
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
