//! Keepalive handling.
//!
//! Two mechanisms keep pooled connections honest:
//! - TCP keepalive and user-timeout session settings applied when a physical
//!   connection is created, so the server drops a dead client within
//!   [`KeepaliveSettings::detection_window`] instead of the OS default of hours
//! - a background pinger that periodically validates idle connections and
//!   tops the pool back up to `min_connections`
//!
//! sqlx gives no access to the client socket, so the `tcp_keepalives_*` and
//! `tcp_user_timeout` values only tune the server's end of the connection.
//! A server that vanishes is not detected client-side within that window;
//! on this side a dead peer surfaces as an I/O error on the next round trip
//! (classified transient and retried), or through the pinger and pre-ping.

use crate::config::KeepaliveSettings;
use crate::db::connection::Connector;
use crate::db::pool::ConnectionPool;
use sqlx::postgres::PgConnectOptions;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Server session settings derived from the keepalive configuration.
///
/// Empty when keepalive is disabled. Values are passed through unchanged.
pub fn session_settings(settings: &KeepaliveSettings) -> Vec<(&'static str, String)> {
    if !settings.enabled {
        return Vec::new();
    }
    vec![
        ("tcp_keepalives_idle", settings.idle_secs.to_string()),
        ("tcp_keepalives_interval", settings.interval_secs.to_string()),
        ("tcp_keepalives_count", settings.count.to_string()),
        ("tcp_user_timeout", settings.user_timeout_ms.to_string()),
    ]
}

/// Apply keepalive settings to the options every physical connection is opened with.
pub fn apply_keepalive(options: PgConnectOptions, settings: &KeepaliveSettings) -> PgConnectOptions {
    let session = session_settings(settings);
    if session.is_empty() {
        return options;
    }
    debug!(
        idle_secs = settings.idle_secs,
        interval_secs = settings.interval_secs,
        count = settings.count,
        user_timeout_ms = settings.user_timeout_ms,
        "Applying TCP keepalive settings"
    );
    options.options(session)
}

/// Outcome of one pinger pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PingReport {
    pub checked: usize,
    pub discarded: usize,
    pub opened: usize,
}

/// Validate every currently idle connection once, then replenish to `min_connections`.
pub async fn ping_idle<C: Connector>(pool: &Arc<ConnectionPool<C>>) -> PingReport {
    let mut report = PingReport::default();
    let idle = pool.status().idle;

    for _ in 0..idle {
        let Some(mut conn) = pool.try_acquire_idle() else {
            break;
        };
        let valid = pool.validator().is_valid(Some(&mut *conn)).await;
        report.checked += 1;
        if !valid {
            report.discarded += 1;
        }
        pool.release(Some(conn), !valid).await;
    }

    report.opened = pool.warm_up().await;

    if report.discarded > 0 {
        warn!(
            checked = report.checked,
            discarded = report.discarded,
            "Keepalive ping discarded dead connections"
        );
    } else {
        debug!(checked = report.checked, opened = report.opened, "Keepalive ping complete");
    }
    report
}

/// Spawn the background pinger. It stops when `cancel` fires or the pool closes.
pub fn spawn_pinger<C: Connector>(
    pool: Arc<ConnectionPool<C>>,
    interval: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        if interval.is_zero() {
            warn!("Keepalive ping interval is zero, pinger disabled");
            return;
        }
        info!(interval_secs = interval.as_secs(), "Keepalive pinger started");
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // First tick completes immediately
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if pool.is_closed() {
                        break;
                    }
                    ping_idle(&pool).await;
                }
            }
        }
        debug!("Keepalive pinger stopped");
    })
}
