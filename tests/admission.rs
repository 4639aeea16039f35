use bagpool::Error;
use bagpool_test::{options, pool, MockDataSource};
use std::time::Duration;

#[tokio::test(start_paused = true)]
async fn suspended_pool_admits_after_resume() -> anyhow::Result<()> {
    let source = MockDataSource::new();
    let pool = options(&source)
        .max_pool_size(2)
        .min_idle(0)
        .allow_pool_suspension(true)
        .connect()
        .await?;

    pool.suspend_pool().await?;

    let waiter = tokio::spawn({
        let pool = pool.clone();
        async move { pool.acquire().await.map(|conn| conn.id()) }
    });

    // the gate holds borrowers past their connection timeout
    tokio::time::sleep(Duration::from_secs(60)).await;
    assert!(!waiter.is_finished());
    assert_eq!(source.state.opened(), 0);

    pool.resume_pool();

    waiter.await??;
    assert_eq!(pool.total_connections(), 1);

    Ok(())
}

#[tokio::test(start_paused = true)]
async fn suspended_pool_can_fail_fast() -> anyhow::Result<()> {
    let source = MockDataSource::new();
    let pool = options(&source)
        .max_pool_size(1)
        .min_idle(0)
        .allow_pool_suspension(true)
        .fail_if_suspended(true)
        .connect()
        .await?;

    pool.suspend_pool().await?;
    assert!(matches!(pool.acquire().await, Err(Error::PoolSuspended)));

    pool.resume_pool();
    pool.acquire().await?;

    Ok(())
}

#[tokio::test(start_paused = true)]
async fn suspension_must_be_enabled() -> anyhow::Result<()> {
    let source = MockDataSource::new();
    let pool = pool(&source, 1).await?;

    let err = pool.suspend_pool().await.unwrap_err();
    assert!(matches!(err, Error::Configuration(_)), "{err:?}");

    // resuming a pool that was never suspended does nothing
    pool.resume_pool();
    pool.acquire().await?;

    Ok(())
}

#[tokio::test(start_paused = true)]
async fn suspend_waits_for_acquires_in_flight() -> anyhow::Result<()> {
    let source = MockDataSource::new();
    let pool = options(&source)
        .max_pool_size(1)
        .min_idle(0)
        .allow_pool_suspension(true)
        .connection_timeout(Duration::from_secs(2))
        .connect()
        .await?;

    let held = pool.acquire().await?;

    let waiter = tokio::spawn({
        let pool = pool.clone();
        async move { pool.acquire().await.map(|conn| conn.id()) }
    });

    tokio::time::sleep(Duration::from_millis(100)).await;

    let suspending = tokio::spawn({
        let pool = pool.clone();
        async move { pool.suspend_pool().await }
    });

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!suspending.is_finished());

    drop(held);
    waiter.await??;
    suspending.await??;

    pool.resume_pool();

    Ok(())
}

#[tokio::test(start_paused = true)]
async fn timed_out_acquires_release_their_admission() -> anyhow::Result<()> {
    let source = MockDataSource::new();
    let pool = options(&source)
        .max_pool_size(1)
        .min_idle(0)
        .allow_pool_suspension(true)
        .connect()
        .await?;

    let held = pool.acquire().await?;

    for _ in 0..5 {
        let err = pool
            .acquire_timeout(Duration::from_millis(300))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::PoolTimedOut { .. }), "{err:?}");
    }

    // dropped mid-wait, too
    let _ = tokio::time::timeout(Duration::from_millis(50), pool.acquire()).await;

    held.release().await;

    // suspension only completes once every admission came back
    tokio::time::timeout(Duration::from_secs(1), pool.suspend_pool()).await??;
    pool.resume_pool();

    pool.acquire_timeout(Duration::from_millis(500)).await?;

    Ok(())
}

#[tokio::test(start_paused = true)]
async fn close_wakes_suspended_borrowers() -> anyhow::Result<()> {
    let source = MockDataSource::new();
    let pool = options(&source)
        .max_pool_size(1)
        .min_idle(0)
        .allow_pool_suspension(true)
        .connect()
        .await?;

    pool.suspend_pool().await?;

    let waiter = tokio::spawn({
        let pool = pool.clone();
        async move { pool.acquire().await.map(|conn| conn.id()) }
    });

    tokio::time::sleep(Duration::from_millis(100)).await;
    pool.close().await;

    assert!(matches!(waiter.await?, Err(Error::PoolClosed)));

    Ok(())
}
