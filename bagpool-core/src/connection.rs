use std::fmt::{self, Debug, Formatter};
use std::sync::Arc;
use std::time::Duration;

use futures_core::future::BoxFuture;

use crate::error::{Error, Result};
use crate::isolation_level::IsolationLevel;

/// Represents a single physical database connection, as produced by a driver.
///
/// Session-level setters are async because most drivers need a round-trip to apply them;
/// the network and query timeout hooks are synchronous and optional.
pub trait Connection: Send + 'static {
    /// Ask the driver whether the connection is still usable, waiting at most `timeout`.
    fn is_valid(&mut self, timeout: Duration) -> BoxFuture<'_, Result<bool>>;

    /// Execute a statement, discarding any results.
    fn execute<'c>(&'c mut self, sql: &'c str) -> BoxFuture<'c, Result<()>>;

    fn commit(&mut self) -> BoxFuture<'_, Result<()>>;

    fn rollback(&mut self) -> BoxFuture<'_, Result<()>>;

    /// Explicitly close this database connection.
    ///
    /// This notifies the database server that the connection is closing so that it can
    /// free up any server-side resources in use.
    fn close(self) -> BoxFuture<'static, Result<()>>
    where
        Self: Sized;

    fn is_read_only(&self) -> bool;

    fn set_read_only(&mut self, read_only: bool) -> BoxFuture<'_, Result<()>>;

    fn is_auto_commit(&self) -> bool;

    fn set_auto_commit(&mut self, auto_commit: bool) -> BoxFuture<'_, Result<()>>;

    fn transaction_isolation(&mut self) -> BoxFuture<'_, Result<IsolationLevel>>;

    fn set_transaction_isolation(&mut self, level: IsolationLevel) -> BoxFuture<'_, Result<()>>;

    fn set_catalog<'c>(&'c mut self, catalog: &'c str) -> BoxFuture<'c, Result<()>>;

    fn set_schema<'c>(&'c mut self, schema: &'c str) -> BoxFuture<'c, Result<()>>;

    /// The socket-level timeout currently applied to driver I/O.
    fn network_timeout(&self) -> Result<Duration> {
        Err(Error::Unsupported("network timeouts"))
    }

    fn set_network_timeout(&mut self, timeout: Duration) -> Result<()> {
        let _ = timeout;
        Err(Error::Unsupported("network timeouts"))
    }

    /// Bound the next statements executed on this connection; `None` clears the bound.
    fn set_query_timeout(&mut self, timeout: Option<Duration>) -> Result<()> {
        let _ = timeout;
        Err(Error::Unsupported("query timeouts"))
    }
}

/// A configured source of new physical connections.
pub trait DataSource<C>: Send + Sync + 'static {
    fn connect<'a>(
        &'a self,
        username: Option<&'a str>,
        password: Option<&'a str>,
    ) -> BoxFuture<'a, Result<C>>;
}

/// A driver that opens connections from a URL.
pub trait Driver<C>: Send + Sync + 'static {
    /// Returns `false` if this driver cannot interpret `url`.
    fn accepts_url(&self, url: &str) -> bool {
        let _ = url;
        true
    }

    fn connect<'a>(
        &'a self,
        url: &'a str,
        username: Option<&'a str>,
        password: Option<&'a str>,
    ) -> BoxFuture<'a, Result<C>>;
}

/// Adapts a [`Driver`] and a connection URL into a [`DataSource`].
pub struct DriverDataSource<C> {
    driver: Arc<dyn Driver<C>>,
    url: String,
}

impl<C: Connection> DriverDataSource<C> {
    pub fn new(driver: Arc<dyn Driver<C>>, url: impl Into<String>) -> Result<Self> {
        let url = url.into();

        if !driver.accepts_url(&url) {
            return Err(Error::config(format!(
                "driver does not accept the connection URL {}",
                crate::logger::mask_url_password(&url)
            )));
        }

        Ok(Self { driver, url })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

impl<C: Connection> DataSource<C> for DriverDataSource<C> {
    fn connect<'a>(
        &'a self,
        username: Option<&'a str>,
        password: Option<&'a str>,
    ) -> BoxFuture<'a, Result<C>> {
        self.driver.connect(&self.url, username, password)
    }
}

impl<C: Connection> Debug for DriverDataSource<C> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("DriverDataSource")
            .field("url", &crate::logger::mask_url_password(&self.url))
            .finish()
    }
}
