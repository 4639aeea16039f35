#![cfg_attr(docsrs, feature(doc_cfg))]
//! An async, low-contention connection pool for relational database drivers.
//!
//! Plug a driver in through [`Connection`] and [`DataSource`] (or [`Driver`] plus a URL),
//! configure the pool with [`PoolOptions`], then [`Pool::acquire`] connections.

// Modules
pub use bagpool_core::{bag, connection, error, pool, rt};

// Types
pub use bagpool_core::connection::{Connection, DataSource, Driver, DriverDataSource};
pub use bagpool_core::error::{Error, Result};
pub use bagpool_core::isolation_level::IsolationLevel;
pub use bagpool_core::pool::{Pool, PoolConfig, PoolConnection, PoolOptions, PoolStats};

#[cfg(feature = "toml")]
#[cfg_attr(docsrs, doc(cfg(feature = "toml")))]
pub use bagpool_core::pool::PoolSettings;
