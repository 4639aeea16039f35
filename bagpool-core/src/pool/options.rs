use std::fmt::{self, Debug, Display, Formatter};
use std::sync::Arc;
use std::time::Duration;

use log::LevelFilter;

use super::config::{ConfigValues, Credentials, SOFT_TIMEOUT_FLOOR};
use super::error_override::ErrorOverride;
use super::metrics::MetricsTracker;
use super::name::PoolNameRegistry;
use super::Pool;
use crate::connection::{Connection, DataSource, Driver, DriverDataSource};
use crate::error::{Error, Result};
use crate::isolation_level::IsolationLevel;
use crate::logger::mask_url_password;
use crate::rt;

const CONNECTION_TIMEOUT: Duration = Duration::from_secs(30);
const VALIDATION_TIMEOUT: Duration = Duration::from_secs(5);
const IDLE_TIMEOUT: Duration = Duration::from_secs(10 * 60);
const MAX_LIFETIME: Duration = Duration::from_secs(30 * 60);
const DEFAULT_POOL_SIZE: u32 = 10;
const HOUSEKEEPING_PERIOD: Duration = Duration::from_secs(30);

/// Configuration options/builder for constructing a [`Pool`].
///
/// Consumed by [`connect()`][Self::connect]; afterwards only the settings exposed by
/// [`PoolConfig`][super::PoolConfig] can change.
///
/// See the source of [`Self::new()`] for the current defaults.
pub struct PoolOptions<C> {
    pub(crate) data_source: Option<Arc<dyn DataSource<C>>>,
    pub(crate) driver: Option<Arc<dyn Driver<C>>>,
    pub(crate) url: Option<String>,
    pub(crate) username: Option<String>,
    pub(crate) password: Option<String>,
    pub(crate) pool_name: Option<String>,
    pub(crate) catalog: Option<String>,
    pub(crate) schema: Option<String>,
    pub(crate) read_only: bool,
    pub(crate) auto_commit: bool,
    pub(crate) transaction_isolation: Option<IsolationLevel>,
    pub(crate) connection_test_query: Option<String>,
    pub(crate) connection_init_sql: Option<String>,
    pub(crate) isolate_internal_queries: bool,
    pub(crate) allow_pool_suspension: bool,
    pub(crate) fail_if_suspended: bool,
    pub(crate) initialization_fail_timeout: Option<Duration>,
    pub(crate) connection_timeout: Duration,
    pub(crate) validation_timeout: Duration,
    pub(crate) idle_timeout: Duration,
    pub(crate) max_lifetime: Duration,
    pub(crate) leak_detection_threshold: Duration,
    pub(crate) max_pool_size: Option<u32>,
    pub(crate) min_idle: Option<u32>,
    pub(crate) housekeeping_period: Duration,
    pub(crate) alive_bypass_window: Duration,
    pub(crate) shutdown_grace_period: Duration,
    pub(crate) error_override: Option<Arc<dyn ErrorOverride>>,
    pub(crate) metrics_tracker: Option<Arc<dyn MetricsTracker>>,
    pub(crate) acquire_time_level: LevelFilter,
    pub(crate) acquire_slow_level: LevelFilter,
    pub(crate) acquire_slow_threshold: Duration,
}

impl<C: Connection> Default for PoolOptions<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C: Connection> PoolOptions<C> {
    /// Create a new `PoolOptions` with some arbitrary, but sane, default values.
    ///
    /// See the source of this method for the current values.
    pub fn new() -> Self {
        PoolOptions {
            data_source: None,
            driver: None,
            url: None,
            username: None,
            password: None,
            // assigned from the process-wide registry at startup
            pool_name: None,
            catalog: None,
            schema: None,
            read_only: false,
            auto_commit: true,
            // use the driver's default
            transaction_isolation: None,
            // use `Connection::is_valid()`
            connection_test_query: None,
            connection_init_sql: None,
            isolate_internal_queries: false,
            allow_pool_suspension: false,
            fail_if_suspended: false,
            initialization_fail_timeout: Some(Duration::from_millis(1)),
            connection_timeout: CONNECTION_TIMEOUT,
            validation_timeout: VALIDATION_TIMEOUT,
            idle_timeout: IDLE_TIMEOUT,
            max_lifetime: MAX_LIFETIME,
            leak_detection_threshold: Duration::ZERO,
            // 10 unless `min_idle` says otherwise
            max_pool_size: None,
            // same as `max_pool_size`: a fixed-size pool
            min_idle: None,
            housekeeping_period: HOUSEKEEPING_PERIOD,
            alive_bypass_window: Duration::from_millis(500),
            shutdown_grace_period: Duration::from_secs(10),
            error_override: None,
            metrics_tracker: None,
            acquire_time_level: LevelFilter::Off,
            acquire_slow_level: LevelFilter::Warn,
            acquire_slow_threshold: Duration::from_secs(2),
        }
    }

    /// Open connections through `data_source`.
    pub fn data_source(mut self, data_source: impl DataSource<C>) -> Self {
        self.data_source = Some(Arc::new(data_source));
        self
    }

    /// Open connections by passing `url` to `driver`.
    pub fn driver(mut self, driver: impl Driver<C>, url: impl Into<String>) -> Self {
        self.driver = Some(Arc::new(driver));
        self.url = Some(url.into());
        self
    }

    pub fn username(mut self, username: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self
    }

    pub fn password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    /// Name the pool in log messages. Defaults to `BagPool-<n>`.
    pub fn pool_name(mut self, name: impl Into<String>) -> Self {
        self.pool_name = Some(name.into());
        self
    }

    pub fn catalog(mut self, catalog: impl Into<String>) -> Self {
        self.catalog = Some(catalog.into());
        self
    }

    pub fn schema(mut self, schema: impl Into<String>) -> Self {
        self.schema = Some(schema.into());
        self
    }

    pub fn read_only(mut self, read_only: bool) -> Self {
        self.read_only = read_only;
        self
    }

    pub fn auto_commit(mut self, auto_commit: bool) -> Self {
        self.auto_commit = auto_commit;
        self
    }

    pub fn transaction_isolation(mut self, level: IsolationLevel) -> Self {
        self.transaction_isolation = Some(level);
        self
    }

    /// Validate connections with this query instead of [`Connection::is_valid()`].
    pub fn connection_test_query(mut self, query: impl Into<String>) -> Self {
        self.connection_test_query = Some(query.into());
        self
    }

    /// Execute this statement on every new connection before it joins the pool.
    pub fn connection_init_sql(mut self, sql: impl Into<String>) -> Self {
        self.connection_init_sql = Some(sql.into());
        self
    }

    /// Commit or roll back the pool's own statements when auto-commit is off.
    pub fn isolate_internal_queries(mut self, isolate: bool) -> Self {
        self.isolate_internal_queries = isolate;
        self
    }

    /// Allow [`Pool::suspend_pool()`], at a small cost on every acquire.
    pub fn allow_pool_suspension(mut self, allow: bool) -> Self {
        self.allow_pool_suspension = allow;
        self
    }

    /// Make [`Pool::acquire()`] fail with [`Error::PoolSuspended`] instead of waiting while
    /// the pool is suspended.
    pub fn fail_if_suspended(mut self, fail: bool) -> Self {
        self.fail_if_suspended = fail;
        self
    }

    /// How long [`connect()`][Self::connect] keeps trying to open a first connection.
    ///
    /// `Some(Duration::ZERO)` tries once and starts the pool even if that failed;
    /// `None` skips the attempt entirely.
    pub fn initialization_fail_timeout(mut self, timeout: impl Into<Option<Duration>>) -> Self {
        self.initialization_fail_timeout = timeout.into();
        self
    }

    /// Set the amount of time a task should wait while attempting to acquire a connection.
    ///
    /// If this timeout elapses, [`Pool::acquire()`] will return an error. Zero waits forever.
    pub fn connection_timeout(mut self, timeout: Duration) -> Self {
        self.connection_timeout = timeout;
        self
    }

    pub fn validation_timeout(mut self, timeout: Duration) -> Self {
        self.validation_timeout = timeout;
        self
    }

    /// Set a maximum idle duration for individual connections.
    ///
    /// Any connection idle longer than this will be closed by housekeeping. Has no effect
    /// on fixed-size pools, where `min_idle` equals `max_pool_size`.
    pub fn idle_timeout(mut self, timeout: impl Into<Option<Duration>>) -> Self {
        self.idle_timeout = timeout.into().unwrap_or_default();
        self
    }

    /// Set the maximum lifetime of individual connections.
    ///
    /// Any connection with a lifetime greater than this will be closed once it is not in use.
    ///
    /// Long-lived connections are not recommended due to the unfortunate reality of memory/resource
    /// leaks on the database-side. It is better to retire connections periodically.
    pub fn max_lifetime(mut self, lifetime: impl Into<Option<Duration>>) -> Self {
        self.max_lifetime = lifetime.into().unwrap_or_default();
        self
    }

    /// Log a warning for connections held longer than `threshold`.
    pub fn leak_detection_threshold(mut self, threshold: impl Into<Option<Duration>>) -> Self {
        self.leak_detection_threshold = threshold.into().unwrap_or_default();
        self
    }

    pub fn max_pool_size(mut self, max: u32) -> Self {
        self.max_pool_size = Some(max);
        self
    }

    /// The number of idle connections housekeeping tries to keep ready.
    pub fn min_idle(mut self, min: u32) -> Self {
        self.min_idle = Some(min);
        self
    }

    pub fn housekeeping_period(mut self, period: Duration) -> Self {
        self.housekeeping_period = period;
        self
    }

    /// Connections used more recently than this are handed out without validation.
    pub fn alive_bypass_window(mut self, window: Duration) -> Self {
        self.alive_bypass_window = window;
        self
    }

    /// How long [`Pool::close()`] waits for borrowed connections before abandoning them.
    pub fn shutdown_grace_period(mut self, period: Duration) -> Self {
        self.shutdown_grace_period = period;
        self
    }

    /// Decide which driver errors mark a connection as broken.
    pub fn error_override(mut self, error_override: impl ErrorOverride) -> Self {
        self.error_override = Some(Arc::new(error_override));
        self
    }

    pub fn metrics_tracker(mut self, tracker: Arc<dyn MetricsTracker>) -> Self {
        self.metrics_tracker = Some(tracker);
        self
    }

    /// Log every successful acquire at `level`.
    pub fn acquire_time_level(mut self, level: LevelFilter) -> Self {
        self.acquire_time_level = level;
        self
    }

    /// Log acquires that took longer than `threshold` at `level`.
    pub fn acquire_slow_level(mut self, level: LevelFilter, threshold: Duration) -> Self {
        self.acquire_slow_level = level;
        self.acquire_slow_threshold = threshold;
        self
    }

    /// Start the pool.
    ///
    /// Unless `initialization_fail_timeout` is `None`, waits for a first connection to be
    /// opened and fails with [`Error::PoolInitialization`] if none could be.
    pub async fn connect(self) -> Result<Pool<C>> {
        Pool::connect_with(self).await
    }

    pub(crate) fn name(&self) -> &str {
        self.pool_name.as_deref().unwrap_or_default()
    }

    /// Check the settings once before the pool starts, clamping out-of-range values.
    ///
    /// Returns the resolved connection source.
    pub(crate) fn validate(&mut self) -> Result<Arc<dyn DataSource<C>>> {
        if self.pool_name.as_deref().map_or(true, str::is_empty) {
            self.pool_name = Some(PoolNameRegistry::global().next_name());
        }

        for value in [
            &mut self.catalog,
            &mut self.connection_init_sql,
            &mut self.connection_test_query,
            &mut self.url,
        ] {
            if value.as_deref().is_some_and(|s| s.trim().is_empty()) {
                *value = None;
            }
        }

        let source = self.resolve_data_source()?;

        self.validate_numerics();

        if tracing::enabled!(target: "bagpool::pool", tracing::Level::DEBUG) {
            self.log_configuration();
        }

        Ok(source)
    }

    fn resolve_data_source(&self) -> Result<Arc<dyn DataSource<C>>> {
        let name = self.name();

        match (&self.data_source, &self.driver, &self.url) {
            (Some(_), Some(_), _) => {
                tracing::error!(target: "bagpool::pool", "{name} - cannot use data_source and driver together.");
                Err(Error::config("cannot use data_source and driver together"))
            }
            (Some(source), None, url) => {
                if url.is_some() {
                    tracing::warn!(target: "bagpool::pool", "{name} - using data_source and ignoring url.");
                }
                Ok(source.clone())
            }
            (None, Some(driver), Some(url)) => {
                Ok(Arc::new(DriverDataSource::new(driver.clone(), url.clone())?))
            }
            (None, Some(_), None) => {
                tracing::error!(target: "bagpool::pool", "{name} - url is required with driver.");
                Err(Error::config("url is required with driver"))
            }
            (None, None, Some(_)) => {
                tracing::error!(target: "bagpool::pool", "{name} - driver is required with url.");
                Err(Error::config("driver is required with url"))
            }
            (None, None, None) => {
                tracing::error!(target: "bagpool::pool", "{name} - data_source or driver is required.");
                Err(Error::config("data_source or driver is required"))
            }
        }
    }

    fn validate_numerics(&mut self) {
        let name = self.name().to_owned();

        if !self.max_lifetime.is_zero() && self.max_lifetime < Duration::from_secs(30) {
            tracing::warn!(
                target: "bagpool::pool",
                "{name} - max_lifetime is less than 30000ms, setting to default {}ms.",
                MAX_LIFETIME.as_millis()
            );
            self.max_lifetime = MAX_LIFETIME;
        }

        if !self.leak_detection_threshold.is_zero()
            && (self.leak_detection_threshold < Duration::from_secs(2)
                || (self.leak_detection_threshold > self.max_lifetime
                    && !self.max_lifetime.is_zero()))
        {
            tracing::warn!(
                target: "bagpool::pool",
                "{name} - leak_detection_threshold is less than 2000ms or more than max_lifetime, disabling it."
            );
            self.leak_detection_threshold = Duration::ZERO;
        }

        if self.connection_timeout.is_zero() {
            self.connection_timeout = rt::INFINITE;
        } else if self.connection_timeout < SOFT_TIMEOUT_FLOOR {
            tracing::warn!(
                target: "bagpool::pool",
                "{name} - connection_timeout is less than 250ms, setting to {}ms.",
                CONNECTION_TIMEOUT.as_millis()
            );
            self.connection_timeout = CONNECTION_TIMEOUT;
        }

        if self.validation_timeout < SOFT_TIMEOUT_FLOOR {
            tracing::warn!(
                target: "bagpool::pool",
                "{name} - validation_timeout is less than 250ms, setting to {}ms.",
                VALIDATION_TIMEOUT.as_millis()
            );
            self.validation_timeout = VALIDATION_TIMEOUT;
        }

        let max_pool_size = match self.max_pool_size {
            Some(max) if max >= 1 => max,
            _ => DEFAULT_POOL_SIZE,
        };
        self.max_pool_size = Some(max_pool_size);

        let min_idle = match self.min_idle {
            Some(min) if min <= max_pool_size => min,
            _ => max_pool_size,
        };
        self.min_idle = Some(min_idle);

        if self.idle_timeout + Duration::from_secs(1) > self.max_lifetime
            && !self.max_lifetime.is_zero()
            && min_idle < max_pool_size
        {
            tracing::warn!(
                target: "bagpool::pool",
                "{name} - idle_timeout is close to or more than max_lifetime, disabling it."
            );
            self.idle_timeout = Duration::ZERO;
        } else if !self.idle_timeout.is_zero()
            && self.idle_timeout < Duration::from_secs(10)
            && min_idle < max_pool_size
        {
            tracing::warn!(
                target: "bagpool::pool",
                "{name} - idle_timeout is less than 10000ms, setting to default {}ms.",
                IDLE_TIMEOUT.as_millis()
            );
            self.idle_timeout = IDLE_TIMEOUT;
        } else if self.idle_timeout != IDLE_TIMEOUT
            && !self.idle_timeout.is_zero()
            && min_idle == max_pool_size
        {
            tracing::warn!(
                target: "bagpool::pool",
                "{name} - idle_timeout has been set but has no effect because the pool is operating as a fixed size pool."
            );
        }

        if self.housekeeping_period.is_zero() {
            tracing::warn!(
                target: "bagpool::pool",
                "{name} - housekeeping_period cannot be zero, setting to default {}ms.",
                HOUSEKEEPING_PERIOD.as_millis()
            );
            self.housekeeping_period = HOUSEKEEPING_PERIOD;
        }
    }

    fn log_configuration(&self) {
        fn quoted(value: &Option<String>) -> String {
            value
                .as_ref()
                .map_or_else(|| "none".to_owned(), |s| format!("{s:?}"))
        }

        fn millis(value: Duration) -> String {
            value.as_millis().to_string()
        }

        let name = self.name();

        let properties: [(&str, String); 28] = [
            ("acquire_slow_level", self.acquire_slow_level.to_string()),
            ("acquire_slow_threshold", millis(self.acquire_slow_threshold)),
            ("acquire_time_level", self.acquire_time_level.to_string()),
            ("alive_bypass_window", millis(self.alive_bypass_window)),
            ("allow_pool_suspension", self.allow_pool_suspension.to_string()),
            ("auto_commit", self.auto_commit.to_string()),
            ("catalog", quoted(&self.catalog)),
            ("connection_init_sql", quoted(&self.connection_init_sql)),
            ("connection_test_query", quoted(&self.connection_test_query)),
            ("connection_timeout", millis(self.connection_timeout)),
            ("data_source", provided(self.data_source.is_some())),
            ("error_override", provided(self.error_override.is_some())),
            ("fail_if_suspended", self.fail_if_suspended.to_string()),
            ("housekeeping_period", millis(self.housekeeping_period)),
            ("idle_timeout", millis(self.idle_timeout)),
            (
                "initialization_fail_timeout",
                self.initialization_fail_timeout
                    .map_or_else(|| "skipped".to_owned(), millis),
            ),
            ("isolate_internal_queries", self.isolate_internal_queries.to_string()),
            ("leak_detection_threshold", millis(self.leak_detection_threshold)),
            ("max_lifetime", millis(self.max_lifetime)),
            ("max_pool_size", display_or_none(self.max_pool_size)),
            ("metrics_tracker", provided(self.metrics_tracker.is_some())),
            ("min_idle", display_or_none(self.min_idle)),
            ("password", "<masked>".to_owned()),
            ("read_only", self.read_only.to_string()),
            ("schema", quoted(&self.schema)),
            (
                "transaction_isolation",
                self.transaction_isolation
                    .map_or_else(|| "default".to_owned(), |level| level.to_string()),
            ),
            (
                "url",
                self.url
                    .as_deref()
                    .map_or_else(|| "none".to_owned(), mask_url_password),
            ),
            ("username", quoted(&self.username)),
        ];

        tracing::debug!(target: "bagpool::pool", "{name} - configuration:");

        for (property, value) in properties {
            tracing::debug!(target: "bagpool::pool", "{property:.<32}{value}");
        }
    }

    pub(crate) fn config_values(&self) -> ConfigValues {
        ConfigValues {
            connection_timeout: self.connection_timeout,
            validation_timeout: self.validation_timeout,
            idle_timeout: self.idle_timeout,
            leak_detection_threshold: self.leak_detection_threshold,
            max_lifetime: self.max_lifetime,
            min_idle: self.min_idle.unwrap_or_default(),
            max_pool_size: self.max_pool_size.unwrap_or(DEFAULT_POOL_SIZE),
            catalog: self.catalog.clone(),
            credentials: Credentials {
                username: self.username.clone(),
                password: self.password.clone(),
            },
        }
    }
}

fn provided(is_some: bool) -> String {
    if is_some { "provided" } else { "none" }.to_owned()
}

fn display_or_none(value: Option<impl Display>) -> String {
    value.map_or_else(|| "none".to_owned(), |v| v.to_string())
}

impl<C> Debug for PoolOptions<C> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("PoolOptions")
            .field("pool_name", &self.pool_name)
            .field("url", &self.url.as_deref().map(mask_url_password))
            .field("max_pool_size", &self.max_pool_size)
            .field("min_idle", &self.min_idle)
            .field("connection_timeout", &self.connection_timeout)
            .field("idle_timeout", &self.idle_timeout)
            .field("max_lifetime", &self.max_lifetime)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_core::future::BoxFuture;

    struct NoSource;

    struct NoConnection;

    impl Connection for NoConnection {
        fn is_valid(&mut self, _: Duration) -> BoxFuture<'_, Result<bool>> {
            Box::pin(async { Ok(true) })
        }

        fn execute<'c>(&'c mut self, _: &'c str) -> BoxFuture<'c, Result<()>> {
            Box::pin(async { Ok(()) })
        }

        fn commit(&mut self) -> BoxFuture<'_, Result<()>> {
            Box::pin(async { Ok(()) })
        }

        fn rollback(&mut self) -> BoxFuture<'_, Result<()>> {
            Box::pin(async { Ok(()) })
        }

        fn close(self) -> BoxFuture<'static, Result<()>> {
            Box::pin(async { Ok(()) })
        }

        fn is_read_only(&self) -> bool {
            false
        }

        fn set_read_only(&mut self, _: bool) -> BoxFuture<'_, Result<()>> {
            Box::pin(async { Ok(()) })
        }

        fn is_auto_commit(&self) -> bool {
            true
        }

        fn set_auto_commit(&mut self, _: bool) -> BoxFuture<'_, Result<()>> {
            Box::pin(async { Ok(()) })
        }

        fn transaction_isolation(&mut self) -> BoxFuture<'_, Result<IsolationLevel>> {
            Box::pin(async { Ok(IsolationLevel::ReadCommitted) })
        }

        fn set_transaction_isolation(&mut self, _: IsolationLevel) -> BoxFuture<'_, Result<()>> {
            Box::pin(async { Ok(()) })
        }

        fn set_catalog<'c>(&'c mut self, _: &'c str) -> BoxFuture<'c, Result<()>> {
            Box::pin(async { Ok(()) })
        }

        fn set_schema<'c>(&'c mut self, _: &'c str) -> BoxFuture<'c, Result<()>> {
            Box::pin(async { Ok(()) })
        }
    }

    impl DataSource<NoConnection> for NoSource {
        fn connect<'a>(
            &'a self,
            _: Option<&'a str>,
            _: Option<&'a str>,
        ) -> BoxFuture<'a, Result<NoConnection>> {
            Box::pin(async { Ok(NoConnection) })
        }
    }

    impl Driver<NoConnection> for NoSource {
        fn connect<'a>(
            &'a self,
            _: &'a str,
            _: Option<&'a str>,
            _: Option<&'a str>,
        ) -> BoxFuture<'a, Result<NoConnection>> {
            Box::pin(async { Ok(NoConnection) })
        }
    }

    fn options() -> PoolOptions<NoConnection> {
        PoolOptions::new().data_source(NoSource).pool_name("test")
    }

    #[test]
    fn defaults_make_a_fixed_size_pool() {
        let mut options = options();
        options.validate().unwrap();

        assert_eq!(options.max_pool_size, Some(10));
        assert_eq!(options.min_idle, Some(10));
        assert_eq!(options.idle_timeout, IDLE_TIMEOUT);
        assert_eq!(options.max_lifetime, MAX_LIFETIME);
    }

    #[test]
    fn out_of_range_values_are_clamped() {
        let mut options = options()
            .max_pool_size(0)
            .min_idle(50)
            .max_lifetime(Duration::from_secs(5))
            .connection_timeout(Duration::from_millis(100))
            .validation_timeout(Duration::from_millis(100))
            .leak_detection_threshold(Duration::from_millis(500));
        options.validate().unwrap();

        assert_eq!(options.max_pool_size, Some(DEFAULT_POOL_SIZE));
        assert_eq!(options.min_idle, Some(DEFAULT_POOL_SIZE));
        assert_eq!(options.max_lifetime, MAX_LIFETIME);
        assert_eq!(options.connection_timeout, CONNECTION_TIMEOUT);
        assert_eq!(options.validation_timeout, VALIDATION_TIMEOUT);
        assert_eq!(options.leak_detection_threshold, Duration::ZERO);
    }

    #[test]
    fn zero_connection_timeout_waits_forever() {
        let mut options = options().connection_timeout(Duration::ZERO);
        options.validate().unwrap();

        assert_eq!(options.connection_timeout, rt::INFINITE);
    }

    #[test]
    fn idle_timeout_rules() {
        let mut close_to_lifetime = options()
            .min_idle(1)
            .max_pool_size(5)
            .max_lifetime(Duration::from_secs(60))
            .idle_timeout(Duration::from_secs(60));
        close_to_lifetime.validate().unwrap();
        assert_eq!(close_to_lifetime.idle_timeout, Duration::ZERO);

        let mut too_short = options()
            .min_idle(1)
            .max_pool_size(5)
            .idle_timeout(Duration::from_secs(2));
        too_short.validate().unwrap();
        assert_eq!(too_short.idle_timeout, IDLE_TIMEOUT);

        // fixed size pools keep the value and only warn
        let mut fixed = options()
            .max_pool_size(5)
            .idle_timeout(Duration::from_secs(2));
        fixed.validate().unwrap();
        assert_eq!(fixed.idle_timeout, Duration::from_secs(2));
        assert_eq!(fixed.max_lifetime, MAX_LIFETIME);
    }

    #[test]
    fn contradictory_sources_are_rejected() {
        let mut both = options().driver(NoSource, "mock://db");
        assert!(matches!(both.validate(), Err(Error::Configuration(_))));

        let mut neither = PoolOptions::<NoConnection>::new();
        assert!(matches!(neither.validate(), Err(Error::Configuration(_))));

        let mut driver_only = PoolOptions::new().driver(NoSource, "mock://db");
        assert!(driver_only.validate().is_ok());
    }

    #[test]
    fn empty_strings_become_none() {
        let mut options = options().connection_test_query("  ").catalog("");
        options.validate().unwrap();

        assert_eq!(options.connection_test_query, None);
        assert_eq!(options.catalog, None);
    }

    #[test]
    fn generated_names_come_from_the_registry() {
        let mut options = PoolOptions::new().data_source(NoSource);
        options.validate().unwrap();

        assert!(options.name().starts_with("BagPool-"));
    }
}
