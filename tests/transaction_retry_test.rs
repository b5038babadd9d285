// Transaction and Retry Integration Tests
// Commit/rollback choreography, deadlock re-drive, and retry bounds through
// the public API against the mock driver.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use rusty_mysql::driver::mock::{MockDriver, MockHandle};
use rusty_mysql::{ConnectionPool, Context, DbConfig, DbError, Value};

async fn setup(config_fn: impl FnOnce(&mut DbConfig)) -> (ConnectionPool, MockHandle) {
    let driver = Arc::new(MockDriver::new());
    let handle = driver.handle();
    let mut config = DbConfig::for_driver("mock");
    config.endpoint.database = "app".into();
    config_fn(&mut config);
    let pool = ConnectionPool::connect_with_driver(config, driver)
        .await
        .unwrap();
    (pool, handle)
}

#[tokio::test]
async fn test_commit_path_persists_insert() {
    let (pool, handle) = setup(|_| {}).await;
    let ctx = Context::background();

    pool.within_tx(&ctx, |tx, ctx| {
        Box::pin(async move {
            tx.exec(ctx, "INSERT INTO t(a) VALUES(?)", &[Value::Int(1)])
                .await?;
            Ok(())
        })
    })
    .await
    .unwrap();

    assert_eq!(handle.committed_matching("INSERT INTO t"), 1);
    assert!(handle.rolled_back().is_empty());
}

#[tokio::test]
async fn test_rollback_path_discards_insert_and_returns_error() {
    let (pool, handle) = setup(|_| {}).await;
    let ctx = Context::background();

    let result = pool
        .within_tx(&ctx, |tx, ctx| {
            Box::pin(async move {
                tx.exec(ctx, "INSERT INTO t(a) VALUES(?)", &[Value::Int(1)])
                    .await?;
                Err(DbError::Builder("sentinel".into()))
            })
        })
        .await;

    match result {
        Err(DbError::Builder(message)) => assert_eq!(message, "sentinel"),
        other => panic!("expected sentinel error, got {other:?}"),
    }
    assert_eq!(handle.committed_matching("INSERT INTO t"), 0);
    assert_eq!(handle.rolled_back().len(), 1);
}

#[tokio::test]
async fn test_deadlock_retries_then_succeeds() {
    let (pool, handle) = setup(|c| {
        c.retry.max_attempts = 2;
        c.retry.base_backoff = Duration::from_millis(1);
        c.retry.max_backoff = Duration::from_millis(2);
        c.retry.jitter = false;
    })
    .await;
    let ctx = Context::background();
    handle.script_error("UPDATE t", 1213, "Deadlock found when trying to get lock", 1);

    pool.within_tx(&ctx, |tx, ctx| {
        Box::pin(async move {
            tx.exec(ctx, "UPDATE t SET a=2 WHERE id=1", &[]).await?;
            Ok(())
        })
    })
    .await
    .unwrap();

    assert_eq!(handle.statements_matching("UPDATE t"), 2);
    assert_eq!(handle.committed_matching("UPDATE t"), 1);
}

#[tokio::test]
async fn test_conflict_error_is_not_retried() {
    let (pool, handle) = setup(|c| {
        c.retry.max_attempts = 5;
        c.retry.base_backoff = Duration::from_millis(1);
        c.retry.max_backoff = Duration::from_millis(1);
    })
    .await;
    let ctx = Context::background();
    handle.script_error("INSERT INTO t", 1062, "Duplicate entry 'x'", 10);

    let attempts = Arc::new(AtomicU32::new(0));
    let counted = attempts.clone();
    let result = pool
        .within_tx(&ctx, move |tx, ctx| {
            counted.fetch_add(1, Ordering::SeqCst);
            Box::pin(async move {
                tx.exec(ctx, "INSERT INTO t(a) VALUES(?)", &[Value::Int(1)])
                    .await?;
                Ok(())
            })
        })
        .await;

    assert_eq!(attempts.load(Ordering::SeqCst), 1);
    assert_eq!(result.unwrap_err().code(), Some(1062));
}

#[tokio::test]
async fn test_read_only_error_is_retried() {
    let (pool, handle) = setup(|c| {
        c.retry.max_attempts = 2;
        c.retry.base_backoff = Duration::from_millis(1);
        c.retry.max_backoff = Duration::from_millis(1);
        c.retry.jitter = false;
    })
    .await;
    let ctx = Context::background();
    handle.script_error(
        "INSERT INTO t",
        1290,
        "The MySQL server is running with the --read-only option",
        1,
    );

    pool.within_tx(&ctx, |tx, ctx| {
        Box::pin(async move {
            tx.exec(ctx, "INSERT INTO t(a) VALUES(?)", &[Value::Int(7)])
                .await?;
            Ok(())
        })
    })
    .await
    .unwrap();
    assert_eq!(handle.committed_matching("INSERT INTO t"), 1);
}

#[tokio::test]
async fn test_attempt_count_bounded_by_policy() {
    let (pool, handle) = setup(|c| {
        c.retry.max_attempts = 3;
        c.retry.base_backoff = Duration::from_millis(1);
        c.retry.max_backoff = Duration::from_millis(2);
        c.retry.jitter = false;
    })
    .await;
    let ctx = Context::background();
    handle.script_error("UPDATE t", 1205, "Lock wait timeout exceeded", 100);

    let result = pool
        .within_tx(&ctx, |tx, ctx| {
            Box::pin(async move {
                tx.exec(ctx, "UPDATE t SET a=1", &[]).await?;
                Ok(())
            })
        })
        .await;

    assert_eq!(handle.statements_matching("UPDATE t"), 3);
    match result {
        Err(DbError::TransactionAborted { source }) => assert_eq!(source.code(), Some(1205)),
        other => panic!("expected TransactionAborted, got {other:?}"),
    }
}

#[tokio::test]
async fn test_backoff_sleep_stays_within_budget() {
    let (pool, handle) = setup(|c| {
        c.retry.max_attempts = 3;
        c.retry.base_backoff = Duration::from_millis(10);
        c.retry.max_backoff = Duration::from_millis(15);
        c.retry.jitter = false;
    })
    .await;
    let ctx = Context::background();
    handle.script_error("UPDATE t", 1213, "Deadlock found", 100);

    let started = Instant::now();
    let _ = pool
        .within_tx(&ctx, |tx, ctx| {
            Box::pin(async move {
                tx.exec(ctx, "UPDATE t SET a=1", &[]).await?;
                Ok(())
            })
        })
        .await;

    // Sleeps: min(10*1, 15) + min(10*2, 15) = 25ms, plus small overhead.
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_millis(25));
    assert!(elapsed < Duration::from_millis(500));
}

#[tokio::test]
async fn test_no_partial_state_across_attempts() {
    let (pool, handle) = setup(|c| {
        c.retry.max_attempts = 3;
        c.retry.base_backoff = Duration::from_millis(1);
        c.retry.max_backoff = Duration::from_millis(1);
        c.retry.jitter = false;
    })
    .await;
    let ctx = Context::background();
    handle.script_error("UPDATE accounts SET debit", 1213, "Deadlock found", 2);

    pool.within_tx(&ctx, |tx, ctx| {
        Box::pin(async move {
            tx.exec(ctx, "UPDATE accounts SET credit = credit - 10 WHERE id = 1", &[])
                .await?;
            tx.exec(ctx, "UPDATE accounts SET debit = debit + 10 WHERE id = 2", &[])
                .await?;
            Ok(())
        })
    })
    .await
    .unwrap();

    // Exactly one credit and one debit are visible; the two aborted
    // attempts rolled their credit halves back.
    assert_eq!(handle.committed_matching("credit"), 1);
    assert_eq!(handle.committed_matching("debit"), 1);
    assert_eq!(handle.rolled_back().len(), 2);
}
