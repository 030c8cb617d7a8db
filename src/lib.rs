//! Database connectivity resilience layer.
//!
//! Keeps a service talking to PostgreSQL through network blips, stale SSL
//! sessions, server restarts and aborted transactions:
//! - classified, bounded query retry on fresh connections
//! - a bounded pool that rolls every connection back before reuse
//! - a boot-time readiness gate with linear backoff
//! - TCP keepalive tuning and a background keepalive pinger
//! - idempotent shutdown and health endpoints

pub mod config;
pub mod db;
pub mod error;
pub mod http;
pub mod rate_limit;
pub mod shutdown;

pub use config::Config;
pub use db::{ConnectionPool, PgConnector, QueryExecutor, ReadinessGate, ReadinessState};
pub use error::{DbError, DbResult};
pub use shutdown::ShutdownCoordinator;
