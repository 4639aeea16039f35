//! Provides the connection pool for asynchronous database drivers.
//!
//! Opening a database connection for each and every operation can be very costly. The
//! connection pool keeps connections open and hands them out on demand; a connection
//! dropped by its borrower goes back into the pool.
//!
//! The pool is built on a [`ConcurrentBag`][crate::bag::ConcurrentBag]: idle connections are
//! preferably handed back to the task that last returned one, and a returned connection is
//! passed directly to a waiting borrower when there is one.
//!
//! Configure a pool with [`PoolOptions`] and start it with [`PoolOptions::connect()`].
//! [`Pool`] is `Send`, `Sync` and `Clone`; clones share the same connections, so it is
//! intended to be created once at the start of your application/daemon and then shared.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use self::inner::PoolInner;
use crate::connection::Connection;
use crate::error::{Error, Result};

mod config;
mod connection;
mod entry;
mod error_override;
mod factory;
mod inner;
mod leak;
mod lock;
mod name;
mod options;
mod scheduler;
mod size;
mod stats;

pub mod metrics;

#[cfg(feature = "toml")]
mod settings;

pub use self::config::PoolConfig;
pub use self::connection::{DirtyBits, PoolConnection, SessionState};
pub use self::error_override::{ErrorOverride, Override};
pub use self::metrics::MetricsTracker;
pub use self::name::{pool_name, PoolNameRegistry};
pub use self::options::PoolOptions;
pub use self::stats::PoolStats;

#[cfg(feature = "toml")]
pub use self::settings::PoolSettings;

/// An asynchronous pool of database connections.
///
/// Create a pool with [`PoolOptions::connect()`] and then call [`Pool::acquire()`] to get
/// a connection from the pool; when the connection is dropped it is returned to the pool
/// so it can be reused.
///
/// `Pool` is `Send`, `Sync` and `Clone`. Cloning is cheap as it is just a reference-counted
/// handle to the inner pool state; the pool is shut down by [`Pool::close()`] or, failing
/// that, when the last handle and connection are dropped.
pub struct Pool<C: Connection>(pub(crate) Arc<PoolInner<C>>);

impl<C: Connection> Pool<C> {
    /// Start a pool configured by `options`.
    ///
    /// Unless [`PoolOptions::initialization_fail_timeout()`] is `None`, this waits until one
    /// connection could be opened and fails with [`Error::PoolInitialization`] if it could not.
    pub async fn connect_with(options: PoolOptions<C>) -> Result<Self> {
        let inner = PoolInner::start(options).await?;

        Ok(Pool(inner))
    }

    /// Retrieves a connection from the pool.
    ///
    /// Waits for at most the configured connection timeout before returning
    /// [`Error::PoolTimedOut`].
    ///
    /// ### Cancellation safety
    /// Dropping the returned future while it waits never loses a connection: one that was
    /// already claimed for this call is put back into the pool.
    pub async fn acquire(&self) -> Result<PoolConnection<C>> {
        self.0.acquire(self.0.config.connection_timeout()).await
    }

    /// Retrieves a connection from the pool, waiting at most `timeout`.
    pub async fn acquire_timeout(&self, timeout: Duration) -> Result<PoolConnection<C>> {
        self.0.acquire(timeout).await
    }

    /// The name of this pool as it appears in log output.
    pub fn name(&self) -> &str {
        &self.0.name
    }

    /// The settings that may be changed while the pool is running.
    pub fn config(&self) -> &PoolConfig {
        &self.0.config
    }

    /// Connections sitting idle in the pool.
    pub fn idle_connections(&self) -> usize {
        self.0.idle_connections()
    }

    /// Connections currently borrowed.
    pub fn active_connections(&self) -> usize {
        self.0.active_connections()
    }

    /// All connections of the pool, idle or not.
    pub fn total_connections(&self) -> usize {
        self.0.total_connections()
    }

    /// Tasks currently waiting in [`Pool::acquire()`].
    pub fn threads_awaiting_connection(&self) -> usize {
        self.0.threads_awaiting_connection()
    }

    pub fn stats(&self) -> PoolStats {
        self.0.stats()
    }

    /// The last error encountered while opening a connection, if any.
    pub fn last_connection_failure(&self) -> Option<Arc<Error>> {
        self.0.last_connection_failure()
    }

    /// Evict every connection: idle ones are closed right away, borrowed ones when they
    /// are returned.
    pub fn soft_evict_connections(&self) {
        self.0.soft_evict_connections();
    }

    /// Close a borrowed connection instead of returning it to the pool.
    pub fn evict_connection(&self, conn: PoolConnection<C>) {
        conn.evict();
    }

    /// Stop handing out connections until [`Pool::resume_pool()`] is called.
    ///
    /// Waits for acquires in progress to complete. Fails with [`Error::Configuration`]
    /// unless the pool was configured with [`PoolOptions::allow_pool_suspension()`].
    pub async fn suspend_pool(&self) -> Result<()> {
        self.0.suspend().await
    }

    /// Resume a suspended pool. Has no effect otherwise.
    pub fn resume_pool(&self) {
        self.0.resume();
    }

    /// Shut down the connection pool, immediately waking all tasks waiting for a
    /// connection.
    ///
    /// Upon calling this method, any currently waiting or subsequent calls to
    /// [`Pool::acquire`] will return [`Error::PoolClosed`].
    ///
    /// Idle connections are closed right away. Connections still borrowed are given the
    /// configured grace period to be returned; after that they are abandoned and closed
    /// whenever their borrower lets go of them.
    pub async fn close(&self) {
        self.0.close().await;
    }

    /// Returns `true` if [`.close()`][Pool::close] has been called on the pool.
    pub fn is_closed(&self) -> bool {
        self.0.is_shutdown()
    }
}

/// Returns a new [Pool] tied to the same shared connection pool.
impl<C: Connection> Clone for Pool<C> {
    fn clone(&self) -> Self {
        Self(Arc::clone(&self.0))
    }
}

impl<C: Connection> fmt::Debug for Pool<C> {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt.debug_struct("Pool")
            .field("name", &self.name())
            .field("size", &self.total_connections())
            .field("num_idle", &self.idle_connections())
            .field("is_closed", &self.is_closed())
            .field("config", &self.0.config)
            .finish()
    }
}
