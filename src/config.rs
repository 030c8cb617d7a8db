//! Configuration handling for the resilience layer.
//!
//! This module provides configuration management via CLI arguments and environment variables.
//! Values are consumed as given: nothing here corrects or second-guesses them.

use clap::{ArgAction, Parser};
use std::time::Duration;
use url::Url;

pub const DEFAULT_HTTP_HOST: &str = "127.0.0.1";
pub const DEFAULT_HTTP_PORT: u16 = 8080;

// Pool configuration defaults
pub const DEFAULT_MAX_CONNECTIONS: u32 = 30;
pub const DEFAULT_MIN_CONNECTIONS: u32 = 5;
pub const DEFAULT_RECYCLE_SECS: u64 = 180;
pub const DEFAULT_ACQUIRE_TIMEOUT_SECS: u64 = 30;

// TCP keepalive defaults (detection window: 20 + 5 * 3 = 35s)
pub const DEFAULT_KEEPALIVE_IDLE_SECS: u32 = 20;
pub const DEFAULT_KEEPALIVE_INTERVAL_SECS: u32 = 5;
pub const DEFAULT_KEEPALIVE_COUNT: u32 = 3;
pub const DEFAULT_TCP_USER_TIMEOUT_MS: u32 = 20_000;

// Background ping intervals
pub const DEFAULT_PING_INTERVAL_SECS: u64 = 120;
pub const AGGRESSIVE_PING_INTERVAL_SECS: u64 = 60;

// Query retry and boot readiness
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;
pub const DEFAULT_READY_MAX_RETRIES: u32 = 5;
pub const DEFAULT_READY_BASE_DELAY_SECS: u64 = 2;

/// Connection pool options.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolOptions {
    /// Upper bound on leased + idle connections.
    pub max_connections: u32,
    /// Idle connections kept open by warm-up and the keepalive pinger.
    pub min_connections: u32,
    /// Connections older than this are closed instead of reused.
    pub recycle: Duration,
    /// How long `acquire` waits for capacity. Zero fails immediately.
    pub acquire_timeout: Duration,
    /// Validate idle connections before handing them out.
    pub pre_ping: bool,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            max_connections: DEFAULT_MAX_CONNECTIONS,
            min_connections: DEFAULT_MIN_CONNECTIONS,
            recycle: Duration::from_secs(DEFAULT_RECYCLE_SECS),
            acquire_timeout: Duration::from_secs(DEFAULT_ACQUIRE_TIMEOUT_SECS),
            pre_ping: true,
        }
    }
}

/// TCP keepalive parameters applied to every physical connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeepaliveSettings {
    pub enabled: bool,
    /// Idle seconds before the first probe.
    pub idle_secs: u32,
    /// Seconds between probes.
    pub interval_secs: u32,
    /// Unanswered probes before the peer is declared dead.
    pub count: u32,
    /// Protocol-level backstop, independent of the OS keepalive timer.
    pub user_timeout_ms: u32,
}

impl KeepaliveSettings {
    /// Worst-case time to notice a dead peer through keepalive probes alone.
    pub fn detection_window(&self) -> Duration {
        let secs = u64::from(self.idle_secs) + u64::from(self.interval_secs) * u64::from(self.count);
        Duration::from_secs(secs)
    }
}

impl Default for KeepaliveSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            idle_secs: DEFAULT_KEEPALIVE_IDLE_SECS,
            interval_secs: DEFAULT_KEEPALIVE_INTERVAL_SECS,
            count: DEFAULT_KEEPALIVE_COUNT,
            user_timeout_ms: DEFAULT_TCP_USER_TIMEOUT_MS,
        }
    }
}

/// Retry policy for [`QueryExecutor`](crate::db::QueryExecutor).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    /// Linear backoff base between attempts (`attempt * base_delay`). Zero retries immediately.
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base_delay: Duration::ZERO,
        }
    }
}

/// Configuration for the resilience layer and its health server.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "db-resilience",
    about = "Database connectivity resilience layer with health endpoints",
    version,
    author
)]
pub struct Config {
    /// Database connection URL (sensitive - not logged).
    #[arg(long, value_name = "URL", env = "DATABASE_URL")]
    pub database_url: String,

    /// Maximum number of pooled connections
    #[arg(long, default_value_t = DEFAULT_MAX_CONNECTIONS, env = "DB_POOL_MAX_CONNECTIONS")]
    pub pool_max_connections: u32,

    /// Minimum number of idle connections to keep open
    #[arg(long, default_value_t = DEFAULT_MIN_CONNECTIONS, env = "DB_POOL_MIN_CONNECTIONS")]
    pub pool_min_connections: u32,

    /// Connection age in seconds after which it is recycled
    #[arg(long, default_value_t = DEFAULT_RECYCLE_SECS, env = "DB_POOL_RECYCLE_SECONDS")]
    pub pool_recycle_seconds: u64,

    /// Seconds to wait for a free connection before reporting exhaustion
    #[arg(long, default_value_t = DEFAULT_ACQUIRE_TIMEOUT_SECS, env = "DB_POOL_TIMEOUT_SECONDS")]
    pub pool_timeout_seconds: u64,

    /// Validate idle connections before handing them out
    #[arg(long, default_value_t = true, action = ArgAction::Set, env = "DB_POOL_PRE_PING")]
    pub pool_pre_ping: bool,

    /// Apply TCP keepalive settings to new connections
    #[arg(long, default_value_t = true, action = ArgAction::Set, env = "TCP_KEEPALIVE_ENABLED")]
    pub tcp_keepalive_enabled: bool,

    /// Seconds of idleness before the first keepalive probe
    #[arg(long, default_value_t = DEFAULT_KEEPALIVE_IDLE_SECS, env = "TCP_KEEPALIVE_IDLE")]
    pub tcp_keepalive_idle: u32,

    /// Seconds between keepalive probes
    #[arg(long, default_value_t = DEFAULT_KEEPALIVE_INTERVAL_SECS, env = "TCP_KEEPALIVE_INTERVAL")]
    pub tcp_keepalive_interval: u32,

    /// Unanswered probes before the connection is considered dead
    #[arg(long, default_value_t = DEFAULT_KEEPALIVE_COUNT, env = "TCP_KEEPALIVE_COUNT")]
    pub tcp_keepalive_count: u32,

    /// TCP user timeout in milliseconds
    #[arg(long, default_value_t = DEFAULT_TCP_USER_TIMEOUT_MS, env = "TCP_USER_TIMEOUT_MS")]
    pub tcp_user_timeout_ms: u32,

    /// Use the aggressive background ping interval
    #[arg(long, env = "DB_KEEPALIVE_AGGRESSIVE")]
    pub keepalive_aggressive: bool,

    /// Background ping interval in seconds (overrides the mode default)
    #[arg(long, env = "DB_KEEPALIVE_INTERVAL_SECONDS")]
    pub keepalive_interval_seconds: Option<u64>,

    /// Attempts per query before the error is surfaced
    #[arg(long, default_value_t = DEFAULT_MAX_ATTEMPTS, env = "DB_QUERY_MAX_ATTEMPTS")]
    pub query_max_attempts: u32,

    /// Backoff base in milliseconds between query attempts
    #[arg(long, default_value_t = 0, env = "DB_QUERY_RETRY_DELAY_MS")]
    pub query_retry_delay_ms: u64,

    /// Boot-time readiness probe attempts
    #[arg(long, default_value_t = DEFAULT_READY_MAX_RETRIES, env = "DB_READY_MAX_RETRIES")]
    pub ready_max_retries: u32,

    /// Backoff base in seconds between readiness attempts
    #[arg(long, default_value_t = DEFAULT_READY_BASE_DELAY_SECS, env = "DB_READY_BASE_DELAY_SECONDS")]
    pub ready_base_delay_seconds: u64,

    /// Health server host
    #[arg(long, default_value = DEFAULT_HTTP_HOST, env = "HTTP_HOST")]
    pub http_host: String,

    /// Health server port
    #[arg(long, default_value_t = DEFAULT_HTTP_PORT, env = "HTTP_PORT")]
    pub http_port: u16,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", env = "LOG_LEVEL")]
    pub log_level: String,

    /// Enable JSON logging format
    #[arg(long, env = "JSON_LOGS")]
    pub json_logs: bool,
}

impl Config {
    /// Parse configuration from command line arguments.
    pub fn parse_args() -> Self {
        Self::parse()
    }

    /// Create a default configuration (useful for testing).
    pub fn default_config() -> Self {
        Self {
            database_url: "postgres://localhost/postgres".to_string(),
            pool_max_connections: DEFAULT_MAX_CONNECTIONS,
            pool_min_connections: DEFAULT_MIN_CONNECTIONS,
            pool_recycle_seconds: DEFAULT_RECYCLE_SECS,
            pool_timeout_seconds: DEFAULT_ACQUIRE_TIMEOUT_SECS,
            pool_pre_ping: true,
            tcp_keepalive_enabled: true,
            tcp_keepalive_idle: DEFAULT_KEEPALIVE_IDLE_SECS,
            tcp_keepalive_interval: DEFAULT_KEEPALIVE_INTERVAL_SECS,
            tcp_keepalive_count: DEFAULT_KEEPALIVE_COUNT,
            tcp_user_timeout_ms: DEFAULT_TCP_USER_TIMEOUT_MS,
            keepalive_aggressive: false,
            keepalive_interval_seconds: None,
            query_max_attempts: DEFAULT_MAX_ATTEMPTS,
            query_retry_delay_ms: 0,
            ready_max_retries: DEFAULT_READY_MAX_RETRIES,
            ready_base_delay_seconds: DEFAULT_READY_BASE_DELAY_SECS,
            http_host: DEFAULT_HTTP_HOST.to_string(),
            http_port: DEFAULT_HTTP_PORT,
            log_level: "info".to_string(),
            json_logs: false,
        }
    }

    pub fn pool_options(&self) -> PoolOptions {
        PoolOptions {
            max_connections: self.pool_max_connections,
            min_connections: self.pool_min_connections,
            recycle: Duration::from_secs(self.pool_recycle_seconds),
            acquire_timeout: Duration::from_secs(self.pool_timeout_seconds),
            pre_ping: self.pool_pre_ping,
        }
    }

    pub fn keepalive_settings(&self) -> KeepaliveSettings {
        KeepaliveSettings {
            enabled: self.tcp_keepalive_enabled,
            idle_secs: self.tcp_keepalive_idle,
            interval_secs: self.tcp_keepalive_interval,
            count: self.tcp_keepalive_count,
            user_timeout_ms: self.tcp_user_timeout_ms,
        }
    }

    /// Background ping interval: explicit value, else 60s in aggressive mode, else 120s.
    pub fn ping_interval(&self) -> Duration {
        let secs = self.keepalive_interval_seconds.unwrap_or(if self.keepalive_aggressive {
            AGGRESSIVE_PING_INTERVAL_SECS
        } else {
            DEFAULT_PING_INTERVAL_SECS
        });
        Duration::from_secs(secs)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.query_max_attempts,
            base_delay: Duration::from_millis(self.query_retry_delay_ms),
        }
    }

    pub fn ready_base_delay(&self) -> Duration {
        Duration::from_secs(self.ready_base_delay_seconds)
    }

    /// Get the health server bind address.
    pub fn http_bind_addr(&self) -> String {
        format!("{}:{}", self.http_host, self.http_port)
    }

    /// Database URL with the password masked, safe for logs.
    pub fn redacted_database_url(&self) -> String {
        redact_url(&self.database_url)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::default_config()
    }
}

/// Mask the password of a connection URL. Unparsable input is hidden entirely.
pub fn redact_url(raw: &str) -> String {
    match Url::parse(raw) {
        Ok(mut url) => {
            if url.password().is_some() {
                let _ = url.set_password(Some("***"));
            }
            url.to_string()
        }
        Err(_) => "<invalid url>".to_string(),
    }
}
