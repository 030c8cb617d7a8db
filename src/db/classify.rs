//! Driver error classification.
//!
//! Decides whether a failed query is worth retrying on a fresh connection.
//! Matching is a case-insensitive substring search over the driver's message
//! text, plus the socket-level I/O kinds sqlx reports when a peer disappears.
//! Anything that is not a driver error is fatal, so the retry layer can never
//! hide a programming error.

use crate::error::DbError;
use std::io;

/// Message fragments produced by a TLS session that went stale underneath an
/// idle connection.
pub const SSL_STALE_PATTERNS: &[&str] = &[
    "decryption failed or bad record mac",
    "bad record mac",
    "ssl error",
    "unexpected eof",
    "ssl connection has been closed unexpectedly",
];

/// Message fragments for network blips, server restarts and recovery mode.
/// Transient matching also includes every [`SSL_STALE_PATTERNS`] entry.
pub const TRANSIENT_PATTERNS: &[&str] = &[
    "connection refused",
    "could not connect to server",
    "server closed the connection unexpectedly",
    "connection reset by peer",
    "timeout expired",
    "the database system is starting up",
    "the database system is in recovery mode",
    "in recovery",
    "too many connections for role",
    "connection is closed",
    "terminating connection due to administrator command",
];

/// Classification of a failed operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Stale or half-open TLS session. A subset of transient failures.
    SslStale,
    /// The connection is broken but a new one will likely work.
    TransientConnection,
    /// Retrying will not help.
    Fatal,
}

impl ErrorKind {
    /// Whether a fresh connection may succeed where this one failed.
    pub fn is_retryable(self) -> bool {
        !matches!(self, ErrorKind::Fatal)
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorKind::SslStale => write!(f, "ssl_stale"),
            ErrorKind::TransientConnection => write!(f, "transient_connection"),
            ErrorKind::Fatal => write!(f, "fatal"),
        }
    }
}

/// Classify an error raised while talking to the database.
pub fn classify(error: &DbError) -> ErrorKind {
    match error {
        DbError::Driver(err) => match classify_message(&err.to_string()) {
            ErrorKind::Fatal => match err {
                sqlx::Error::Io(source) if is_dropped_socket(source.kind()) => {
                    ErrorKind::TransientConnection
                }
                _ => ErrorKind::Fatal,
            },
            kind => kind,
        },
        _ => ErrorKind::Fatal,
    }
}

/// I/O kinds sqlx surfaces when the server restarts or the socket goes half-open.
fn is_dropped_socket(kind: io::ErrorKind) -> bool {
    matches!(
        kind,
        io::ErrorKind::UnexpectedEof
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::TimedOut
    )
}

/// Classify raw driver message text.
pub fn classify_message(message: &str) -> ErrorKind {
    let lower = message.to_lowercase();
    if matches_any(&lower, SSL_STALE_PATTERNS) {
        ErrorKind::SslStale
    } else if matches_any(&lower, TRANSIENT_PATTERNS) {
        ErrorKind::TransientConnection
    } else {
        ErrorKind::Fatal
    }
}

/// True when the message matches the stale-TLS pattern set.
pub fn is_ssl_stale_message(message: &str) -> bool {
    matches_any(&message.to_lowercase(), SSL_STALE_PATTERNS)
}

/// True when the message matches the transient pattern set, which includes
/// every stale-TLS pattern.
pub fn is_transient_message(message: &str) -> bool {
    let lower = message.to_lowercase();
    matches_any(&lower, SSL_STALE_PATTERNS) || matches_any(&lower, TRANSIENT_PATTERNS)
}

fn matches_any(lower: &str, patterns: &[&str]) -> bool {
    patterns.iter().any(|p| lower.contains(p))
}
