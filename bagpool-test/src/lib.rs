//! An in-memory driver for exercising the pool without a database.
//!
//! [`MockDataSource`] hands out [`MockConnection`]s that share one [`MockState`], so tests
//! can script failures and count what the pool did with its connections.

use std::borrow::Cow;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bagpool::error::DatabaseError;
use bagpool::pool::PoolOptions;
use bagpool::{Connection, DataSource, Driver, Error, IsolationLevel, Pool, Result};
use futures_core::future::BoxFuture;
use parking_lot::Mutex;

pub fn setup_if_needed() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// An error with an SQLSTATE, as a driver would report it.
#[derive(Debug, thiserror::Error)]
#[error("{message}")]
pub struct MockError {
    pub message: String,
    pub sql_state: Option<String>,
    pub vendor_code: Option<i32>,
}

impl MockError {
    pub fn new(message: impl Into<String>, sql_state: &str) -> Self {
        MockError {
            message: message.into(),
            sql_state: Some(sql_state.to_owned()),
            vendor_code: None,
        }
    }

    /// A communication failure (SQLSTATE class `08`).
    pub fn link_failure() -> Error {
        Error::from(MockError::new("connection reset by peer", "08S01"))
    }

    /// A syntax error, which leaves the connection usable.
    pub fn syntax_error() -> Error {
        Error::from(MockError::new("syntax error", "42601"))
    }
}

impl DatabaseError for MockError {
    fn message(&self) -> &str {
        &self.message
    }

    fn code(&self) -> Option<Cow<'_, str>> {
        self.sql_state.as_deref().map(Cow::Borrowed)
    }

    fn vendor_code(&self) -> Option<i32> {
        self.vendor_code
    }
}

/// State shared by a [`MockDataSource`] and every connection it opened.
#[derive(Debug, Default)]
pub struct MockState {
    connect_attempts: AtomicUsize,
    opened: AtomicUsize,
    closed: AtomicUsize,
    open: AtomicUsize,
    peak_open: AtomicUsize,
    validations: AtomicUsize,
    rollbacks: AtomicUsize,
    fail_connect: AtomicBool,
    connect_error_state: Mutex<Option<String>>,
    invalid_validations: AtomicUsize,
    no_network_timeout: AtomicBool,
    connect_delay: Mutex<Duration>,
    failing_statements: Mutex<HashSet<String>>,
    executed: Mutex<Vec<String>>,
    default_isolation: Mutex<Option<IsolationLevel>>,
}

impl MockState {
    /// Calls to [`DataSource::connect`], successful or not.
    pub fn connect_attempts(&self) -> usize {
        self.connect_attempts.load(Ordering::SeqCst)
    }

    pub fn opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }

    pub fn closed(&self) -> usize {
        self.closed.load(Ordering::SeqCst)
    }

    /// Connections opened and not yet closed.
    pub fn open(&self) -> usize {
        self.open.load(Ordering::SeqCst)
    }

    /// The most connections that were ever open at once.
    pub fn peak_open(&self) -> usize {
        self.peak_open.load(Ordering::SeqCst)
    }

    pub fn validations(&self) -> usize {
        self.validations.load(Ordering::SeqCst)
    }

    pub fn rollbacks(&self) -> usize {
        self.rollbacks.load(Ordering::SeqCst)
    }

    /// Every statement executed so far, in order.
    pub fn executed(&self) -> Vec<String> {
        self.executed.lock().clone()
    }

    /// Make every connect attempt fail with an I/O error until reset.
    pub fn fail_connects(&self, fail: bool) {
        self.fail_connect.store(fail, Ordering::SeqCst);
    }

    /// Make connect attempts fail with a database error carrying `sql_state`.
    pub fn fail_connects_with(&self, sql_state: &str) {
        *self.connect_error_state.lock() = Some(sql_state.to_owned());
        self.fail_connects(true);
    }

    /// Report the next `count` liveness checks as failed.
    pub fn fail_validations(&self, count: usize) {
        self.invalid_validations.store(count, Ordering::SeqCst);
    }

    /// Make executing `sql` fail with a syntax error.
    pub fn fail_statement(&self, sql: &str) {
        self.failing_statements.lock().insert(sql.to_owned());
    }

    pub fn without_network_timeout(&self) {
        self.no_network_timeout.store(true, Ordering::SeqCst);
    }

    /// Delay every connect by `delay`.
    pub fn set_connect_delay(&self, delay: Duration) {
        *self.connect_delay.lock() = delay;
    }

    pub fn set_default_isolation(&self, level: IsolationLevel) {
        *self.default_isolation.lock() = Some(level);
    }

    fn connection_closed(&self) {
        self.closed.fetch_add(1, Ordering::SeqCst);
        self.open.fetch_sub(1, Ordering::SeqCst);
    }
}

/// A [`DataSource`] of [`MockConnection`]s.
#[derive(Debug, Clone, Default)]
pub struct MockDataSource {
    pub state: Arc<MockState>,
}

impl MockDataSource {
    pub fn new() -> Self {
        Self::default()
    }

    async fn open(&self, username: Option<&str>) -> Result<MockConnection> {
        let state = &self.state;
        state.connect_attempts.fetch_add(1, Ordering::SeqCst);

        let delay = *state.connect_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        if state.fail_connect.load(Ordering::SeqCst) {
            return match state.connect_error_state.lock().as_deref() {
                Some(sql_state) => Err(MockError::new("connection refused", sql_state).into()),
                None => Err(Error::Io(std::io::Error::new(
                    std::io::ErrorKind::ConnectionRefused,
                    "connection refused",
                ))),
            };
        }

        state.opened.fetch_add(1, Ordering::SeqCst);
        let open = state.open.fetch_add(1, Ordering::SeqCst) + 1;
        state.peak_open.fetch_max(open, Ordering::SeqCst);

        let isolation = state
            .default_isolation
            .lock()
            .unwrap_or(IsolationLevel::ReadCommitted);

        Ok(MockConnection {
            state: self.state.clone(),
            username: username.map(str::to_owned),
            read_only: false,
            auto_commit: true,
            isolation,
            catalog: None,
            schema: None,
            network_timeout: Duration::ZERO,
            query_timeout: None,
            closed: false,
        })
    }
}

impl DataSource<MockConnection> for MockDataSource {
    fn connect<'a>(
        &'a self,
        username: Option<&'a str>,
        _password: Option<&'a str>,
    ) -> BoxFuture<'a, Result<MockConnection>> {
        Box::pin(self.open(username))
    }
}

/// Serves `mock:` URLs from a [`MockDataSource`].
#[derive(Debug, Clone, Default)]
pub struct MockDriver {
    pub source: MockDataSource,
}

impl Driver<MockConnection> for MockDriver {
    fn accepts_url(&self, url: &str) -> bool {
        url.starts_with("mock:")
    }

    fn connect<'a>(
        &'a self,
        _url: &'a str,
        username: Option<&'a str>,
        _password: Option<&'a str>,
    ) -> BoxFuture<'a, Result<MockConnection>> {
        Box::pin(self.source.open(username))
    }
}

#[derive(Debug)]
pub struct MockConnection {
    state: Arc<MockState>,
    pub username: Option<String>,
    pub read_only: bool,
    pub auto_commit: bool,
    pub isolation: IsolationLevel,
    pub catalog: Option<String>,
    pub schema: Option<String>,
    pub network_timeout: Duration,
    pub query_timeout: Option<Duration>,
    closed: bool,
}

impl MockConnection {
    fn statement(&mut self, sql: &str) -> Result<()> {
        self.state.executed.lock().push(sql.to_owned());

        if self.state.failing_statements.lock().contains(sql) {
            return Err(MockError::syntax_error());
        }

        Ok(())
    }
}

impl Connection for MockConnection {
    fn is_valid(&mut self, _timeout: Duration) -> BoxFuture<'_, Result<bool>> {
        let state = &self.state;
        state.validations.fetch_add(1, Ordering::SeqCst);

        let invalid = state
            .invalid_validations
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();

        Box::pin(async move { Ok(!invalid) })
    }

    fn execute<'c>(&'c mut self, sql: &'c str) -> BoxFuture<'c, Result<()>> {
        Box::pin(async move { self.statement(sql) })
    }

    fn commit(&mut self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move { self.statement("COMMIT") })
    }

    fn rollback(&mut self) -> BoxFuture<'_, Result<()>> {
        self.state.rollbacks.fetch_add(1, Ordering::SeqCst);
        Box::pin(async move { self.statement("ROLLBACK") })
    }

    fn close(mut self) -> BoxFuture<'static, Result<()>> {
        self.closed = true;
        self.state.connection_closed();
        Box::pin(async { Ok(()) })
    }

    fn is_read_only(&self) -> bool {
        self.read_only
    }

    fn set_read_only(&mut self, read_only: bool) -> BoxFuture<'_, Result<()>> {
        self.read_only = read_only;
        Box::pin(async { Ok(()) })
    }

    fn is_auto_commit(&self) -> bool {
        self.auto_commit
    }

    fn set_auto_commit(&mut self, auto_commit: bool) -> BoxFuture<'_, Result<()>> {
        self.auto_commit = auto_commit;
        Box::pin(async { Ok(()) })
    }

    fn transaction_isolation(&mut self) -> BoxFuture<'_, Result<IsolationLevel>> {
        let isolation = self.isolation;
        Box::pin(async move { Ok(isolation) })
    }

    fn set_transaction_isolation(&mut self, level: IsolationLevel) -> BoxFuture<'_, Result<()>> {
        self.isolation = level;
        Box::pin(async { Ok(()) })
    }

    fn set_catalog<'c>(&'c mut self, catalog: &'c str) -> BoxFuture<'c, Result<()>> {
        self.catalog = Some(catalog.to_owned());
        Box::pin(async { Ok(()) })
    }

    fn set_schema<'c>(&'c mut self, schema: &'c str) -> BoxFuture<'c, Result<()>> {
        self.schema = Some(schema.to_owned());
        Box::pin(async { Ok(()) })
    }

    fn network_timeout(&self) -> Result<Duration> {
        if self.state.no_network_timeout.load(Ordering::SeqCst) {
            return Err(Error::Unsupported("network timeouts"));
        }

        Ok(self.network_timeout)
    }

    fn set_network_timeout(&mut self, timeout: Duration) -> Result<()> {
        if self.state.no_network_timeout.load(Ordering::SeqCst) {
            return Err(Error::Unsupported("network timeouts"));
        }

        self.network_timeout = timeout;
        Ok(())
    }

    fn set_query_timeout(&mut self, timeout: Option<Duration>) -> Result<()> {
        self.query_timeout = timeout;
        Ok(())
    }
}

/// A connection dropped without being closed by the pool still counts as closed.
impl Drop for MockConnection {
    fn drop(&mut self) {
        if !self.closed {
            self.closed = true;
            self.state.connection_closed();
        }
    }
}

/// Options for a pool over `source` that starts without waiting for a connection.
pub fn options(source: &MockDataSource) -> PoolOptions<MockConnection> {
    setup_if_needed();

    PoolOptions::new()
        .data_source(source.clone())
        .initialization_fail_timeout(None)
}

/// A pool of up to `max` connections with no idle minimum.
pub async fn pool(source: &MockDataSource, max: u32) -> anyhow::Result<Pool<MockConnection>> {
    let pool = options(source)
        .max_pool_size(max)
        .min_idle(0)
        .connect()
        .await?;

    Ok(pool)
}

/// Poll `check` every 10ms until it returns `true` or `within` elapses.
pub async fn eventually(within: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + within;

    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }

        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    check()
}
