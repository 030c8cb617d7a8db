//! db-resilience - Main entry point.
//!
//! Boots the database layer behind a readiness gate, keeps the pool warm and
//! serves health endpoints until SIGINT/SIGTERM.

use clap::Parser;
use db_resilience::config::Config;
use db_resilience::db::{
    ConnectionPool, ConnectorProbe, PgConnector, QueryExecutor, ReadinessGate, ReadinessState,
    spawn_pinger,
};
use db_resilience::http::{HealthState, router};
use db_resilience::shutdown::{ShutdownCoordinator, wait_for_signal};
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Initialize the tracing subscriber for logging.
fn init_tracing(config: &Config) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    let subscriber = tracing_subscriber::registry().with(filter);

    if config.json_logs {
        subscriber.with(fmt::layer().json()).init();
    } else {
        subscriber
            .with(fmt::layer().with_target(true).with_thread_ids(false))
            .init();
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Parse configuration from command line and environment
    let config = Config::parse();

    // Initialize logging
    init_tracing(&config);

    info!(
        database = %config.redacted_database_url(),
        "Starting db-resilience v{}",
        env!("CARGO_PKG_VERSION")
    );

    let keepalive = config.keepalive_settings();
    if keepalive.enabled {
        info!(
            detection_window_secs = keepalive.detection_window().as_secs(),
            "TCP keepalive enabled"
        );
    }

    let connector = PgConnector::new(&config.database_url, &keepalive);
    let pool = ConnectionPool::new(connector, config.pool_options());
    let readiness = Arc::new(ReadinessState::new());
    let coordinator = Arc::new(ShutdownCoordinator::new(Arc::clone(&pool)));

    // A signal during boot aborts the readiness wait as well as serving
    let signal_task = {
        let coordinator = Arc::clone(&coordinator);
        tokio::spawn(async move {
            wait_for_signal().await;
            coordinator.shutdown().await;
        })
    };

    let gate = ReadinessGate::new(Arc::clone(&readiness))
        .with_max_retries(config.ready_max_retries)
        .with_base_delay(config.ready_base_delay());

    if let Err(e) = gate
        .wait_for_db_with(&ConnectorProbe(pool.connector()), &coordinator.token())
        .await
    {
        error!(error = %e, "Aborting startup");
        coordinator.shutdown().await;
        signal_task.abort();
        return Err(e.into());
    }

    let warmed = pool.warm_up().await;
    info!(
        opened = warmed,
        max_connections = config.pool_max_connections,
        "Connection pool ready"
    );

    let pinger = spawn_pinger(Arc::clone(&pool), config.ping_interval(), coordinator.token());
    coordinator.register_worker("keepalive-pinger", pinger);

    let executor = QueryExecutor::with_policy(Arc::clone(&pool), config.retry_policy());
    let health =
        HealthState::new(Arc::clone(&readiness), executor).with_shutdown(coordinator.token());
    let app = router(Arc::new(health));

    let bind_addr = config.http_bind_addr();
    let listener = TcpListener::bind(&bind_addr)
        .await
        .map_err(|e| format!("Failed to bind to {}: {}", bind_addr, e))?;
    info!(addr = %bind_addr, "Health endpoints listening");

    let token = coordinator.token();
    let served = axum::serve(listener, app)
        .with_graceful_shutdown(async move { token.cancelled().await })
        .await;

    coordinator.shutdown().await;
    signal_task.abort();

    if let Err(e) = served {
        error!(error = %e, "HTTP server error");
        return Err(e.into());
    }

    info!("Shutdown complete");
    Ok(())
}
