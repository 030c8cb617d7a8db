//! Database connectivity layer.
//!
//! This module provides:
//! - Error classification (stale SSL, transient connection, fatal)
//! - Connection validation
//! - A bounded pool with rollback-before-reuse
//! - Query execution with classified retry
//! - The boot-time readiness gate
//! - TCP keepalive settings and the background keepalive pinger
//! - The sqlx-backed PostgreSQL connector and row decoding

pub mod classify;
pub mod connection;
pub mod executor;
pub mod keepalive;
pub mod pool;
pub mod postgres;
pub mod readiness;
pub mod types;
pub mod validator;

pub use classify::{ErrorKind, classify};
pub use connection::{Connection, Connector, FetchMode, JsonRow, QueryOutput, QueryParam};
pub use executor::{ExecuteOptions, QueryExecutor};
pub use keepalive::{PingReport, apply_keepalive, ping_idle, spawn_pinger};
pub use pool::{ConnectionHandle, ConnectionPool, ConnectionState, PoolStatus, PooledConnection};
pub use postgres::{PgConnector, PgSession};
pub use readiness::{
    ConnectorProbe, ReadinessGate, ReadinessProbe, ReadinessSnapshot, ReadinessState, Sleeper,
    TokioSleeper,
};
pub use validator::ConnectionValidator;
