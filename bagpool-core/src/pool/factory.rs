//! Opening, configuring, validating and resetting physical connections.

use std::cmp;
use std::fmt::Display;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::connection::{Connection, DataSource};
use crate::error::{Error, Result};
use crate::isolation_level::IsolationLevel;
use crate::pool::config::PoolConfig;
use crate::pool::connection::{DirtyBits, SessionState};
use crate::pool::metrics::MetricsTracker;
use crate::pool::options::PoolOptions;
use crate::rt::{self, Instant};

const CLOSE_NETWORK_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum Support {
    Unknown,
    Yes,
    No,
}

/// What the pool learned about the driver from the first connection it set up.
#[derive(Debug)]
struct Capabilities {
    /// The driver's own network timeout, restored after internal operations.
    network_timeout: Option<Duration>,
    network_timeout_support: Support,
    query_timeout_support: Support,
    validation_checked: bool,
    default_isolation: Option<IsolationLevel>,
    transaction_isolation: Option<IsolationLevel>,
}

/// A failed attempt to create a connection.
#[derive(Debug, Clone)]
pub(crate) enum CreateError {
    /// The data source did not produce a connection.
    Connect(Arc<Error>),
    /// A connection was opened but could not be configured; it has been closed.
    Setup(Arc<Error>),
}

impl CreateError {
    pub fn error(&self) -> &Arc<Error> {
        match self {
            CreateError::Connect(error) | CreateError::Setup(error) => error,
        }
    }
}

/// Creates raw connections from the configured source and keeps their session state in
/// line with the pool's settings.
pub(crate) struct ConnectionFactory<C> {
    pool_name: Arc<str>,
    source: Arc<dyn DataSource<C>>,
    schema: Option<String>,
    read_only: bool,
    auto_commit: bool,
    isolate_internal_queries: bool,
    test_query: Option<String>,
    init_sql: Option<String>,
    capabilities: Mutex<Capabilities>,
    last_failure: Mutex<Option<Arc<Error>>>,
    metrics: Option<Arc<dyn MetricsTracker>>,
}

/// Drivers are given `connection_timeout` plus a half-second of slack to log in,
/// in whole seconds and never less than one.
pub(crate) fn login_timeout(connection_timeout: Duration) -> Option<Duration> {
    if connection_timeout >= rt::INFINITE {
        return None;
    }

    let seconds = (connection_timeout + Duration::from_millis(500)).as_secs();
    Some(Duration::from_secs(cmp::max(1, seconds)))
}

impl<C: Connection> ConnectionFactory<C> {
    pub fn new(
        pool_name: Arc<str>,
        source: Arc<dyn DataSource<C>>,
        options: &PoolOptions<C>,
    ) -> Self {
        ConnectionFactory {
            pool_name,
            source,
            schema: options.schema.clone(),
            read_only: options.read_only,
            auto_commit: options.auto_commit,
            isolate_internal_queries: options.isolate_internal_queries,
            test_query: options.connection_test_query.clone(),
            init_sql: options.connection_init_sql.clone(),
            capabilities: Mutex::new(Capabilities {
                network_timeout: None,
                network_timeout_support: Support::Unknown,
                query_timeout_support: Support::Unknown,
                validation_checked: false,
                default_isolation: None,
                transaction_isolation: options.transaction_isolation,
            }),
            last_failure: Mutex::new(None),
            metrics: options.metrics_tracker.clone(),
        }
    }

    pub fn last_failure(&self) -> Option<Arc<Error>> {
        self.last_failure.lock().clone()
    }

    /// The isolation level connections are reset to; `None` until learned from the driver
    /// if not configured.
    pub fn transaction_isolation(&self) -> Option<IsolationLevel> {
        self.capabilities.lock().transaction_isolation
    }

    fn network_timeout(&self) -> Duration {
        self.capabilities.lock().network_timeout.unwrap_or_default()
    }

    fn network_timeout_support(&self) -> Support {
        self.capabilities.lock().network_timeout_support
    }

    /// The session state of a connection fresh out of the pool.
    pub fn baseline(&self, read_only: bool, auto_commit: bool, config: &PoolConfig) -> SessionState {
        SessionState {
            read_only,
            auto_commit,
            isolation: self.transaction_isolation(),
            catalog: config.catalog(),
            schema: self.schema.clone(),
            network_timeout: self.network_timeout(),
        }
    }

    /// Open and configure a new connection.
    ///
    /// A connection that fails setup is closed before the error is returned. Every failure
    /// is remembered as the pool's last connection failure.
    pub async fn new_connection(&self, config: &PoolConfig) -> Result<C, CreateError> {
        let started = Instant::now();
        let credentials = config.credentials();

        let connect = self
            .source
            .connect(credentials.username.as_deref(), credentials.password.as_deref());

        let connected = match login_timeout(config.connection_timeout()) {
            Some(timeout) => rt::timeout(timeout, connect)
                .await
                .unwrap_or(Err(Error::ConnectTimedOut)),
            None => connect.await,
        };

        let outcome = match connected {
            Ok(mut connection) => match self.setup_connection(&mut connection, config).await {
                Ok(()) => {
                    *self.last_failure.lock() = None;
                    Ok(connection)
                }
                Err(error) => {
                    self.quietly_close(connection, "new", "(Failed to create/setup connection)")
                        .await;
                    Err(CreateError::Setup(Arc::new(error)))
                }
            },
            Err(error) => {
                if self.last_failure.lock().is_none() {
                    tracing::debug!(
                        target: "bagpool::pool",
                        "{} - Failed to create/setup connection: {}",
                        self.pool_name,
                        error
                    );
                }

                Err(CreateError::Connect(Arc::new(error)))
            }
        };

        if let Err(failure) = &outcome {
            *self.last_failure.lock() = Some(failure.error().clone());
        }

        self.metrics.record_connection_created(started.elapsed());

        outcome
    }

    async fn setup_connection(&self, connection: &mut C, config: &PoolConfig) -> Result<()> {
        let validation_timeout = config.validation_timeout();

        let learned = self.capabilities.lock().network_timeout.is_some();
        if learned {
            self.set_network_timeout(connection, validation_timeout)?;
        } else {
            let original = self.get_and_set_network_timeout(connection, validation_timeout);
            self.capabilities.lock().network_timeout = Some(original);
        }

        if connection.is_read_only() != self.read_only {
            connection.set_read_only(self.read_only).await?;
        }

        if connection.is_auto_commit() != self.auto_commit {
            connection.set_auto_commit(self.auto_commit).await?;
        }

        self.check_driver_support(connection).await?;

        let (target, default) = {
            let capabilities = self.capabilities.lock();
            (capabilities.transaction_isolation, capabilities.default_isolation)
        };

        if let Some(level) = target.filter(|level| Some(*level) != default) {
            connection.set_transaction_isolation(level).await?;
        }

        if let Some(catalog) = config.catalog() {
            connection.set_catalog(&catalog).await?;
        }

        if let Some(schema) = &self.schema {
            connection.set_schema(schema).await?;
        }

        self.execute_sql(connection, self.init_sql.as_deref(), true)
            .await?;

        self.set_network_timeout(connection, self.network_timeout())
    }

    async fn check_driver_support(&self, connection: &mut C) -> Result<()> {
        if self.capabilities.lock().validation_checked {
            return Ok(());
        }

        self.check_validation_support(connection).await?;
        self.check_default_isolation(connection).await?;

        self.capabilities.lock().validation_checked = true;
        Ok(())
    }

    async fn check_validation_support(&self, connection: &mut C) -> Result<()> {
        let checked = match self.test_query.as_deref() {
            None => connection.is_valid(Duration::from_secs(1)).await.map(drop),
            Some(query) => self.execute_sql(connection, Some(query), false).await,
        };

        if let Err(error) = &checked {
            tracing::error!(
                target: "bagpool::pool",
                "{} - Failed to execute{} connection test query ({}).",
                self.pool_name,
                if self.test_query.is_none() {
                    " is_valid() for connection, configure"
                } else {
                    ""
                },
                error
            );
        }

        checked
    }

    async fn check_default_isolation(&self, connection: &mut C) -> Result<()> {
        match connection.transaction_isolation().await {
            Ok(level) => {
                let mut capabilities = self.capabilities.lock();
                capabilities.default_isolation = Some(level);
                capabilities.transaction_isolation.get_or_insert(level);
                Ok(())
            }
            Err(error) => {
                tracing::warn!(
                    target: "bagpool::pool",
                    "{} - Default transaction isolation level detection failed ({}).",
                    self.pool_name,
                    error
                );

                match error.sql_state() {
                    Some(state) if !state.starts_with("08") => Err(error),
                    _ => Ok(()),
                }
            }
        }
    }

    /// Returns `true` if `connection` answered a liveness check within the validation timeout.
    ///
    /// Never fails: errors are logged and remembered as the last connection failure.
    pub async fn is_connection_alive(&self, connection: &mut C, config: &PoolConfig) -> bool {
        let validation_timeout = config.validation_timeout();
        // the check itself only takes whole seconds
        let validation_seconds =
            Duration::from_secs(cmp::max(Duration::from_secs(1), validation_timeout).as_secs());

        let checked = match self.set_network_timeout(connection, validation_timeout) {
            Ok(()) => self.check_alive(connection, validation_seconds).await,
            Err(error) => Err(error),
        };

        let restored = self.set_network_timeout(connection, self.network_timeout());

        let rolled_back = if self.isolate_internal_queries && !self.auto_commit {
            connection.rollback().await
        } else {
            Ok(())
        };

        match checked.and_then(|alive| restored.and(rolled_back).map(|()| alive)) {
            Ok(alive) => alive,
            Err(error) => {
                tracing::warn!(
                    target: "bagpool::pool",
                    "{} - Failed to validate connection ({}). Possibly consider using a shorter max_lifetime value.",
                    self.pool_name,
                    error
                );

                *self.last_failure.lock() = Some(Arc::new(error));
                false
            }
        }
    }

    async fn check_alive(&self, connection: &mut C, timeout: Duration) -> Result<bool> {
        let Some(query) = self.test_query.as_deref() else {
            return connection.is_valid(timeout).await;
        };

        let bounded = self.network_timeout_support() != Support::Yes
            && self.set_query_timeout(connection, timeout);

        let executed = connection.execute(query).await;

        if bounded {
            let _ = connection.set_query_timeout(None);
        }

        executed.map(|()| true)
    }

    /// Restore the session attributes flagged in `dirty` that differ from the pool's settings.
    ///
    /// `state` is updated to match, so repeating the call is free. Returns the attributes
    /// that were actually reset.
    pub async fn reset_connection_state(
        &self,
        connection: &mut C,
        state: &mut SessionState,
        dirty: DirtyBits,
        config: &PoolConfig,
        id: u64,
    ) -> Result<DirtyBits> {
        let mut reset = DirtyBits::empty();

        if dirty.contains(DirtyBits::READ_ONLY) && state.read_only != self.read_only {
            connection.set_read_only(self.read_only).await?;
            state.read_only = self.read_only;
            reset |= DirtyBits::READ_ONLY;
        }

        if dirty.contains(DirtyBits::AUTO_COMMIT) && state.auto_commit != self.auto_commit {
            connection.set_auto_commit(self.auto_commit).await?;
            state.auto_commit = self.auto_commit;
            reset |= DirtyBits::AUTO_COMMIT;
        }

        if dirty.contains(DirtyBits::ISOLATION) {
            if let Some(level) = self
                .transaction_isolation()
                .filter(|level| state.isolation != Some(*level))
            {
                connection.set_transaction_isolation(level).await?;
                state.isolation = Some(level);
                reset |= DirtyBits::ISOLATION;
            }
        }

        if dirty.contains(DirtyBits::CATALOG) {
            if let Some(catalog) = config
                .catalog()
                .filter(|catalog| state.catalog.as_ref() != Some(catalog))
            {
                connection.set_catalog(&catalog).await?;
                state.catalog = Some(catalog);
                reset |= DirtyBits::CATALOG;
            }
        }

        let network_timeout = self.network_timeout();
        if dirty.contains(DirtyBits::NET_TIMEOUT) && state.network_timeout != network_timeout {
            self.set_network_timeout(connection, network_timeout)?;
            state.network_timeout = network_timeout;
            reset |= DirtyBits::NET_TIMEOUT;
        }

        if dirty.contains(DirtyBits::SCHEMA) {
            if let Some(schema) = self
                .schema
                .as_ref()
                .filter(|schema| state.schema.as_ref() != Some(*schema))
            {
                connection.set_schema(schema).await?;
                state.schema = Some(schema.clone());
                reset |= DirtyBits::SCHEMA;
            }
        }

        if !reset.is_empty() {
            tracing::debug!(
                target: "bagpool::pool",
                "{} - Reset ({}) on connection {}",
                self.pool_name,
                reset,
                id
            );
        }

        Ok(reset)
    }

    /// Close a connection, ignoring any errors.
    pub async fn quietly_close(&self, mut connection: C, id: impl Display, reason: &str) {
        tracing::debug!(
            target: "bagpool::pool",
            "{} - Closing connection {}: {}",
            self.pool_name,
            id,
            reason
        );

        // continue with the close even if this fails
        let _ = connection.set_network_timeout(CLOSE_NETWORK_TIMEOUT);

        if let Err(error) = connection.close().await {
            tracing::debug!(
                target: "bagpool::pool",
                "{} - Closing connection {} failed: {}",
                self.pool_name,
                id,
                error
            );
        }
    }

    async fn execute_sql(&self, connection: &mut C, sql: Option<&str>, commit: bool) -> Result<()> {
        let Some(sql) = sql else {
            return Ok(());
        };

        connection.execute(sql).await?;

        if self.isolate_internal_queries && !self.auto_commit {
            if commit {
                connection.commit().await?;
            } else {
                connection.rollback().await?;
            }
        }

        Ok(())
    }

    fn get_and_set_network_timeout(&self, connection: &mut C, timeout: Duration) -> Duration {
        if self.network_timeout_support() == Support::No {
            return Duration::ZERO;
        }

        let swapped = connection
            .network_timeout()
            .and_then(|original| connection.set_network_timeout(timeout).map(|()| original));

        let mut capabilities = self.capabilities.lock();

        match swapped {
            Ok(original) => {
                capabilities.network_timeout_support = Support::Yes;
                original
            }
            Err(error) => {
                if capabilities.network_timeout_support == Support::Unknown {
                    capabilities.network_timeout_support = Support::No;

                    tracing::info!(
                        target: "bagpool::pool",
                        "{} - Driver does not support get/set network timeout for connections. ({})",
                        self.pool_name,
                        error
                    );

                    if timeout < Duration::from_secs(1) {
                        tracing::warn!(
                            target: "bagpool::pool",
                            "{} - A validation_timeout of less than 1 second cannot be honored on drivers without network timeout support.",
                            self.pool_name
                        );
                    } else if timeout.subsec_nanos() != 0 {
                        tracing::warn!(
                            target: "bagpool::pool",
                            "{} - A validation_timeout with fractional second granularity cannot be honored on drivers without network timeout support.",
                            self.pool_name
                        );
                    }
                }

                Duration::ZERO
            }
        }
    }

    fn set_network_timeout(&self, connection: &mut C, timeout: Duration) -> Result<()> {
        if self.network_timeout_support() == Support::Yes {
            connection.set_network_timeout(timeout)
        } else {
            Ok(())
        }
    }

    /// Returns `true` if the timeout was applied.
    fn set_query_timeout(&self, connection: &mut C, timeout: Duration) -> bool {
        let mut capabilities = self.capabilities.lock();

        if capabilities.query_timeout_support == Support::No {
            return false;
        }

        match connection.set_query_timeout(Some(timeout)) {
            Ok(()) => {
                capabilities.query_timeout_support = Support::Yes;
                true
            }
            Err(error) => {
                if capabilities.query_timeout_support == Support::Unknown {
                    capabilities.query_timeout_support = Support::No;

                    tracing::info!(
                        target: "bagpool::pool",
                        "{} - Failed to set query timeout for statement. ({})",
                        self.pool_name,
                        error
                    );
                }

                false
            }
        }
    }
}
