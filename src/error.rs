//! Error types for the database resilience layer.
//!
//! This module defines all error types using `thiserror` for ergonomic error handling.
//! Driver errors are carried unchanged in [`DbError::Driver`] so that callers and
//! upstream logging see exactly what the database reported, even after the retry
//! layer has given up.

use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DbError {
    /// Error raised by the database driver itself. Only this variant is eligible
    /// for non-fatal classification.
    #[error(transparent)]
    Driver(#[from] sqlx::Error),

    #[error(
        "Connection pool exhausted: no connection available within {waited_ms}ms (max_connections: {max_connections})"
    )]
    PoolExhausted { max_connections: u32, waited_ms: u64 },

    #[error("Connection pool is closed")]
    PoolClosed,

    #[error("Database never became ready after {attempts} attempts: {last_error}")]
    ReadinessTimeout { attempts: u32, last_error: String },

    #[error("Cancelled: {operation}")]
    Cancelled { operation: String },

    #[error("Deadline exceeded: {operation} after {elapsed_ms}ms")]
    DeadlineExceeded { operation: String, elapsed_ms: u64 },

    #[error("Configuration error: {message}")]
    Configuration { message: String },

    #[error("Too many attempts for '{key}', retry in {retry_after_secs}s")]
    RateLimited { key: String, retry_after_secs: u64 },

    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl DbError {
    /// Create a pool exhausted error.
    pub fn pool_exhausted(max_connections: u32, waited: Duration) -> Self {
        Self::PoolExhausted {
            max_connections,
            waited_ms: waited.as_millis() as u64,
        }
    }

    /// Create a readiness timeout error.
    pub fn readiness_timeout(attempts: u32, last_error: impl Into<String>) -> Self {
        Self::ReadinessTimeout {
            attempts,
            last_error: last_error.into(),
        }
    }

    /// Create a cancellation error.
    pub fn cancelled(operation: impl Into<String>) -> Self {
        Self::Cancelled {
            operation: operation.into(),
        }
    }

    /// Create a deadline exceeded error.
    pub fn deadline_exceeded(operation: impl Into<String>, elapsed: Duration) -> Self {
        Self::DeadlineExceeded {
            operation: operation.into(),
            elapsed_ms: elapsed.as_millis() as u64,
        }
    }

    /// Create a configuration error.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Create a rate limited error.
    pub fn rate_limited(key: impl Into<String>, retry_after_secs: u64) -> Self {
        Self::RateLimited {
            key: key.into(),
            retry_after_secs,
        }
    }

    /// Create an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Whether this error was raised by the database driver.
    pub fn is_driver(&self) -> bool {
        matches!(self, Self::Driver(_))
    }

    /// Check if this error is retryable with a fresh connection.
    pub fn is_retryable(&self) -> bool {
        crate::db::classify(self).is_retryable()
    }
}

/// Result type alias for database operations.
pub type DbResult<T> = Result<T, DbError>;
