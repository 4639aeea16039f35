use bagpool::pool::metrics::SimpleMetricsTracker;
use bagpool::Error;
use bagpool_test::{eventually, options, pool, MockDataSource};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[tokio::test(start_paused = true)]
async fn it_acquires_and_returns_connections() -> anyhow::Result<()> {
    let source = MockDataSource::new();
    let pool = pool(&source, 2).await?;

    let conn = pool.acquire().await?;
    let id = conn.id();

    assert_eq!(pool.active_connections(), 1);
    assert_eq!(pool.total_connections(), 1);

    conn.release().await;

    assert_eq!(pool.active_connections(), 0);
    assert_eq!(pool.idle_connections(), 1);

    // the same connection comes back
    let conn = pool.acquire().await?;
    assert_eq!(conn.id(), id);
    assert_eq!(source.state.opened(), 1);

    Ok(())
}

#[tokio::test(start_paused = true)]
async fn second_borrower_waits_for_the_only_connection() -> anyhow::Result<()> {
    let source = MockDataSource::new();
    let pool = options(&source)
        .max_pool_size(1)
        .min_idle(1)
        .connection_timeout(Duration::from_millis(1000))
        .connect()
        .await?;

    let first = pool.acquire().await?;
    let first_id = first.id();

    let second = tokio::spawn({
        let pool = pool.clone();
        async move { pool.acquire().await.map(|conn| conn.id()) }
    });

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(!second.is_finished());
    assert_eq!(pool.threads_awaiting_connection(), 1);

    drop(first);

    let second_id = second.await??;
    assert_eq!(second_id, first_id);
    assert_eq!(source.state.opened(), 1);

    Ok(())
}

#[tokio::test(start_paused = true)]
async fn unbounded_acquire_waits_for_a_return() -> anyhow::Result<()> {
    let source = MockDataSource::new();
    let pool = pool(&source, 1).await?;

    let held = pool.acquire().await?;
    let held_id = held.id();

    let waiter = tokio::spawn({
        let pool = pool.clone();
        async move { pool.acquire_timeout(Duration::MAX).await.map(|conn| conn.id()) }
    });

    tokio::time::sleep(Duration::from_secs(60)).await;
    assert!(!waiter.is_finished());

    held.release().await;
    assert_eq!(waiter.await??, held_id);

    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn pool_never_exceeds_max_size() -> anyhow::Result<()> {
    let source = MockDataSource::new();
    source.state.set_connect_delay(Duration::from_millis(5));

    let pool = pool(&source, 5).await?;
    let max_total = Arc::new(AtomicUsize::new(0));
    let mut tasks = Vec::new();

    for _ in 0..50 {
        let pool = pool.clone();
        let max_total = max_total.clone();

        tasks.push(tokio::spawn(async move {
            for _ in 0..10 {
                let conn = pool.acquire().await?;
                max_total.fetch_max(pool.total_connections(), Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(1)).await;
                conn.release().await;
            }

            Ok::<_, Error>(())
        }));
    }

    for task in tasks {
        task.await??;
    }

    assert!(max_total.load(Ordering::SeqCst) <= 5);
    assert!(source.state.peak_open() <= 5);
    assert!(pool.total_connections() <= 5);

    Ok(())
}

#[tokio::test(start_paused = true)]
async fn dead_connection_is_replaced_within_one_acquire() -> anyhow::Result<()> {
    let source = MockDataSource::new();
    let pool = options(&source)
        .max_pool_size(2)
        .min_idle(0)
        .connection_timeout(Duration::from_secs(2))
        .connect()
        .await?;

    let stale = pool.acquire().await?;
    let stale_id = stale.id();
    stale.release().await;

    // past the alive bypass window, so the next borrow validates the connection
    tokio::time::sleep(Duration::from_secs(1)).await;
    source.state.fail_validations(1);

    let fresh = pool.acquire().await?;

    assert_ne!(fresh.id(), stale_id);
    assert_eq!(source.state.opened(), 2);
    assert!(eventually(Duration::from_secs(1), || source.state.closed() == 1).await);
    assert_eq!(pool.total_connections(), 1);

    Ok(())
}

#[tokio::test(start_paused = true)]
async fn recently_used_connection_skips_validation() -> anyhow::Result<()> {
    let source = MockDataSource::new();
    let pool = pool(&source, 1).await?;

    pool.acquire().await?.release().await;
    let validations = source.state.validations();

    // within the bypass window
    pool.acquire().await?.release().await;
    assert_eq!(source.state.validations(), validations);

    tokio::time::sleep(Duration::from_secs(1)).await;
    pool.acquire().await?.release().await;
    assert_eq!(source.state.validations(), validations + 1);

    Ok(())
}

#[tokio::test(start_paused = true)]
async fn timeout_reports_last_connect_failure() -> anyhow::Result<()> {
    let source = MockDataSource::new();
    let metrics = SimpleMetricsTracker::new();

    let pool = options(&source)
        .max_pool_size(1)
        .min_idle(0)
        .metrics_tracker(metrics.tracker())
        .connect()
        .await?;

    source.state.fail_connects(true);

    let err = pool
        .acquire_timeout(Duration::from_millis(500))
        .await
        .unwrap_err();

    match &err {
        Error::PoolTimedOut {
            timeout,
            last_connect_error,
            ..
        } => {
            assert!(*timeout >= Duration::from_millis(499));
            assert!(matches!(last_connect_error.as_deref(), Some(Error::Io(_))));
        }
        other => panic!("unexpected error: {other:?}"),
    }

    assert_eq!(metrics.connection_timeouts(), 1);
    assert!(pool.last_connection_failure().is_some());

    // creation recovers once the source does
    source.state.fail_connects(false);
    let conn = pool.acquire_timeout(Duration::from_secs(15)).await?;
    assert_eq!(pool.total_connections(), 1);
    drop(conn);

    Ok(())
}

#[tokio::test(start_paused = true)]
async fn dropped_acquire_does_not_lose_connections() -> anyhow::Result<()> {
    let source = MockDataSource::new();
    let pool = pool(&source, 1).await?;

    pool.acquire().await?.release().await;
    tokio::time::sleep(Duration::from_secs(1)).await;

    // cancel acquires at every point, including while the connection is being validated
    for _ in 0..5 {
        let acquire = pool.acquire();
        let _ = tokio::time::timeout(Duration::ZERO, acquire).await;
        tokio::time::sleep(Duration::from_millis(600)).await;
    }

    assert!(eventually(Duration::from_secs(1), || pool.idle_connections() == 1).await);
    assert_eq!(pool.total_connections(), 1);

    pool.acquire_timeout(Duration::from_millis(500)).await?;

    Ok(())
}

#[tokio::test(start_paused = true)]
async fn runtime_config_changes_apply() -> anyhow::Result<()> {
    let source = MockDataSource::new();
    let pool = pool(&source, 1).await?;

    assert!(pool.config().set_max_pool_size(0).is_err());
    assert!(pool.config().set_connection_timeout(Duration::from_millis(100)).is_err());

    pool.config().set_max_pool_size(2)?;

    let _first = pool.acquire().await?;
    let _second = pool.acquire().await?;
    assert_eq!(pool.total_connections(), 2);

    let stats = pool.stats();
    assert_eq!(stats.active_connections, 2);
    assert_eq!(stats.max_connections, 2);

    Ok(())
}

#[tokio::test(start_paused = true)]
async fn credentials_reach_the_data_source() -> anyhow::Result<()> {
    let source = MockDataSource::new();
    let pool = options(&source)
        .username("app")
        .password("secret")
        .max_pool_size(1)
        .connect()
        .await?;

    let conn = pool.acquire().await?;
    assert_eq!(conn.username.as_deref(), Some("app"));

    assert!(!format!("{:?}", pool.config()).contains("secret"));

    Ok(())
}
