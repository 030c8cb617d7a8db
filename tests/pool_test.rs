//! Integration tests for the connection pool's lease and release discipline.

mod common;

use common::{Event, Script, test_options, test_pool, wait_until};
use db_resilience::config::PoolOptions;
use db_resilience::db::{Connection, ConnectionState, FetchMode};
use db_resilience::error::DbError;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

#[tokio::test]
async fn test_release_rolls_back_once_and_reuses() {
    let script = Script::new();
    let pool = test_pool(&script, test_options(2));

    let conn = pool.acquire().await.unwrap();
    let handle = conn.handle();
    pool.release(Some(conn), false).await;

    assert_eq!(script.events(), vec![Event::Connect(0), Event::Rollback(0)]);
    let status = pool.status();
    assert_eq!(status.idle, 1);
    assert_eq!(status.leased, 0);
    assert_eq!(pool.connection_state(handle), Some(ConnectionState::Idle));

    // Reuses the idle connection instead of opening another
    let again = pool.acquire().await.unwrap();
    assert_eq!(again.handle(), handle);
    assert_eq!(script.connects(), 1);
    pool.release(Some(again), false).await;
    assert_eq!(script.rollbacks(), 2);
}

#[tokio::test]
async fn test_rollback_failure_closes_connection() {
    let script = Script::new();
    let pool = test_pool(&script, test_options(2));

    let conn = pool.acquire().await.unwrap();
    script.set_fail_rollback(true);
    pool.release(Some(conn), false).await;

    assert_eq!(
        script.events(),
        vec![Event::Connect(0), Event::Rollback(0), Event::Close(0)]
    );
    assert_eq!(pool.status().idle, 0);

    script.set_fail_rollback(false);
    let fresh = pool.acquire().await.unwrap();
    assert_eq!(script.connects(), 2);
    pool.release(Some(fresh), false).await;
}

#[tokio::test]
async fn test_release_none_is_noop() {
    let script = Script::new();
    let pool = test_pool(&script, test_options(2));

    pool.release(None, false).await;
    pool.release(None, true).await;

    assert!(script.events().is_empty());
    assert_eq!(pool.status().leased, 0);
}

#[tokio::test]
async fn test_discard_rolls_back_then_closes() {
    let script = Script::new();
    let pool = test_pool(&script, test_options(2));

    let conn = pool.acquire().await.unwrap();
    let handle = conn.handle();
    pool.release(Some(conn), true).await;

    assert_eq!(
        script.events(),
        vec![Event::Connect(0), Event::Rollback(0), Event::Close(0)]
    );
    assert_eq!(pool.status().idle, 0);
    assert_eq!(pool.connection_state(handle), Some(ConnectionState::Closed));
}

#[tokio::test]
async fn test_discard_with_failed_rollback_still_closes_once() {
    let script = Script::new();
    let pool = test_pool(&script, test_options(1));

    let conn = pool.acquire().await.unwrap();
    script.set_fail_rollback(true);
    pool.release(Some(conn), true).await;

    assert_eq!(script.rollbacks(), 1);
    assert_eq!(script.closes(), 1);
    assert_eq!(pool.status().idle, 0);
}

#[tokio::test(start_paused = true)]
async fn test_exhausted_pool_reports_instead_of_blocking() {
    let script = Script::new();
    let pool = test_pool(&script, test_options(1));

    let held = pool.acquire().await.unwrap();
    let err = pool.acquire().await.unwrap_err();

    assert!(matches!(
        err,
        DbError::PoolExhausted {
            max_connections: 1,
            waited_ms: 50
        }
    ));
    assert!(!err.is_retryable());
    assert_eq!(script.connects(), 1);
    pool.release(Some(held), false).await;
}

#[tokio::test]
async fn test_exhausted_pool_with_zero_timeout_fails_immediately() {
    let script = Script::new();
    let pool = test_pool(
        &script,
        PoolOptions {
            acquire_timeout: Duration::ZERO,
            ..test_options(1)
        },
    );

    let held = pool.acquire().await.unwrap();
    let err = pool.acquire().await.unwrap_err();
    assert!(matches!(err, DbError::PoolExhausted { waited_ms: 0, .. }));
    pool.release(Some(held), false).await;
}

#[tokio::test]
async fn test_waiter_receives_released_connection() {
    let script = Script::new();
    let pool = test_pool(
        &script,
        PoolOptions {
            acquire_timeout: Duration::from_secs(5),
            ..test_options(1)
        },
    );

    let held = pool.acquire().await.unwrap();
    let handle = held.handle();

    let waiter = {
        let pool = Arc::clone(&pool);
        tokio::spawn(async move { pool.acquire().await })
    };
    tokio::task::yield_now().await;

    pool.release(Some(held), false).await;
    let conn = waiter.await.unwrap().unwrap();
    assert_eq!(conn.handle(), handle);
    assert_eq!(script.connects(), 1);
    pool.release(Some(conn), false).await;
}

#[tokio::test(start_paused = true)]
async fn test_connection_past_recycle_age_is_closed_on_release() {
    let script = Script::new();
    let pool = test_pool(
        &script,
        PoolOptions {
            recycle: Duration::from_secs(60),
            ..test_options(2)
        },
    );

    let conn = pool.acquire().await.unwrap();
    tokio::time::advance(Duration::from_secs(61)).await;
    pool.release(Some(conn), false).await;

    assert_eq!(
        script.events(),
        vec![Event::Connect(0), Event::Rollback(0), Event::Close(0)]
    );
    assert_eq!(pool.status().idle, 0);
}

#[tokio::test(start_paused = true)]
async fn test_idle_connection_past_recycle_age_is_replaced_on_acquire() {
    let script = Script::new();
    let pool = test_pool(
        &script,
        PoolOptions {
            recycle: Duration::from_secs(60),
            ..test_options(2)
        },
    );

    let conn = pool.acquire().await.unwrap();
    pool.release(Some(conn), false).await;
    tokio::time::advance(Duration::from_secs(61)).await;

    let fresh = pool.acquire().await.unwrap();
    assert_eq!(script.connects(), 2);
    assert!(script.events().contains(&Event::Close(0)));
    pool.release(Some(fresh), false).await;
}

#[tokio::test]
async fn test_pre_ping_discards_dead_idle_connection() {
    let script = Script::new();
    let pool = test_pool(
        &script,
        PoolOptions {
            pre_ping: true,
            ..test_options(2)
        },
    );

    let conn = pool.acquire().await.unwrap();
    pool.release(Some(conn), false).await;

    script.set_fail_ping(true);
    let fresh = pool.acquire().await.unwrap();

    let events = script.events();
    assert!(events.contains(&Event::Ping(0)));
    assert!(events.contains(&Event::Close(0)));
    assert!(events.contains(&Event::Connect(1)));
    assert_eq!(pool.status().leased, 1);
    pool.release(Some(fresh), false).await;
}

#[tokio::test]
async fn test_close_is_idempotent() {
    let script = Script::new();
    let pool = test_pool(&script, test_options(2));

    let conn = pool.acquire().await.unwrap();
    pool.release(Some(conn), false).await;

    pool.close().await;
    pool.close().await;

    assert!(pool.is_closed());
    assert_eq!(script.closes(), 1);
    assert!(matches!(pool.acquire().await, Err(DbError::PoolClosed)));
}

#[tokio::test]
async fn test_release_after_close_closes_connection() {
    let script = Script::new();
    let pool = test_pool(&script, test_options(2));

    let conn = pool.acquire().await.unwrap();
    pool.close().await;
    pool.release(Some(conn), false).await;

    assert_eq!(
        script.events(),
        vec![Event::Connect(0), Event::Rollback(0), Event::Close(0)]
    );
    assert_eq!(pool.status().idle, 0);
}

#[tokio::test]
async fn test_concurrent_leases_never_exceed_max() {
    let script = Script::new();
    let pool = test_pool(
        &script,
        PoolOptions {
            acquire_timeout: Duration::from_secs(5),
            ..test_options(3)
        },
    );
    let peak = Arc::new(AtomicUsize::new(0));

    let mut tasks = Vec::new();
    for _ in 0..12 {
        let pool = Arc::clone(&pool);
        let peak = Arc::clone(&peak);
        tasks.push(tokio::spawn(async move {
            let mut conn = pool.acquire().await.unwrap();
            peak.fetch_max(pool.status().leased, Ordering::SeqCst);
            conn.run("SELECT 1", &[], FetchMode::Scalar).await.unwrap();
            tokio::time::sleep(Duration::from_millis(5)).await;
            pool.release(Some(conn), false).await;
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    assert!(peak.load(Ordering::SeqCst) <= 3);
    assert!(script.connects() <= 3);
    assert_eq!(pool.status().leased, 0);
    assert_eq!(script.rollbacks(), 12);
}

#[tokio::test]
async fn test_dropped_lease_is_discarded_not_reused() {
    let script = Script::new();
    let pool = test_pool(&script, test_options(1));

    let conn = pool.acquire().await.unwrap();
    let handle = conn.handle();
    drop(conn);

    wait_until(|| script.closes() == 1).await;
    wait_until(|| pool.status().leased == 0).await;

    assert_eq!(
        script.events(),
        vec![Event::Connect(0), Event::Rollback(0), Event::Close(0)]
    );
    assert_eq!(pool.status().idle, 0);
    assert_eq!(pool.connection_state(handle), Some(ConnectionState::Closed));

    // The permit came back with the slot
    let fresh = pool.acquire().await.unwrap();
    assert_eq!(script.connects(), 2);
    pool.release(Some(fresh), false).await;
}

#[tokio::test]
async fn test_failed_connect_frees_slot() {
    let script = Script::new();
    let pool = test_pool(&script, test_options(1));

    script.push_connect_failure("connection refused");
    let err = pool.acquire().await.unwrap_err();
    assert!(err.is_retryable());
    assert_eq!(pool.status().leased, 0);

    let conn = pool.acquire().await.unwrap();
    pool.release(Some(conn), false).await;
    assert_eq!(pool.status().idle, 1);
}

#[tokio::test]
async fn test_warm_up_opens_min_connections() {
    let script = Script::new();
    let pool = test_pool(
        &script,
        PoolOptions {
            min_connections: 2,
            ..test_options(5)
        },
    );

    assert_eq!(pool.warm_up().await, 2);
    assert_eq!(pool.status().idle, 2);
    assert_eq!(pool.warm_up().await, 0);
    assert_eq!(script.connects(), 2);
}

#[tokio::test]
async fn test_warm_up_stops_at_first_failure() {
    let script = Script::new();
    let pool = test_pool(
        &script,
        PoolOptions {
            min_connections: 3,
            ..test_options(5)
        },
    );

    script.push_connect_failure("the database system is starting up");
    assert_eq!(pool.warm_up().await, 0);
    assert_eq!(pool.status().idle, 0);
    assert_eq!(pool.status().leased, 0);
}

#[tokio::test]
async fn test_try_acquire_idle() {
    let script = Script::new();
    let pool = test_pool(&script, test_options(2));

    assert!(pool.try_acquire_idle().is_none());

    let conn = pool.acquire().await.unwrap();
    pool.release(Some(conn), false).await;

    let idle = pool.try_acquire_idle().unwrap();
    assert_eq!(script.connects(), 1);
    assert_eq!(pool.status().leased, 1);
    pool.release(Some(idle), false).await;
}
