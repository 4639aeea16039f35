use std::fmt::{self, Debug, Formatter};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::RwLock;

use crate::error::{Error, Result};
use crate::rt;

/// Timeouts below this are rejected or replaced with defaults.
pub(crate) const SOFT_TIMEOUT_FLOOR: Duration = Duration::from_millis(250);

/// The settings of a running pool that may be changed at runtime.
///
/// Obtained from [`Pool::config`][crate::pool::Pool::config]. Every other setting is fixed
/// once the pool has started. Changes take effect the next time the pool reads a value:
/// timeouts on the next acquire or validation, the leak threshold and idle timeout at the
/// next housekeeping run, credentials and catalog on the next new connection.
pub struct PoolConfig {
    connection_timeout_ms: AtomicU64,
    validation_timeout_ms: AtomicU64,
    idle_timeout_ms: AtomicU64,
    leak_detection_threshold_ms: AtomicU64,
    max_lifetime_ms: AtomicU64,
    min_idle: AtomicU32,
    max_pool_size: AtomicU32,
    catalog: RwLock<Option<String>>,
    credentials: RwLock<Credentials>,
}

#[derive(Clone, Default)]
pub(crate) struct Credentials {
    pub username: Option<String>,
    pub password: Option<String>,
}

/// Initial values, taken from validated options.
pub(crate) struct ConfigValues {
    pub connection_timeout: Duration,
    pub validation_timeout: Duration,
    pub idle_timeout: Duration,
    pub leak_detection_threshold: Duration,
    pub max_lifetime: Duration,
    pub min_idle: u32,
    pub max_pool_size: u32,
    pub catalog: Option<String>,
    pub credentials: Credentials,
}

fn load(millis: &AtomicU64) -> Duration {
    Duration::from_millis(millis.load(Ordering::Acquire))
}

fn store(millis: &AtomicU64, value: Duration) {
    millis.store(rt::as_millis(value), Ordering::Release);
}

impl PoolConfig {
    pub(crate) fn new(values: ConfigValues) -> Self {
        PoolConfig {
            connection_timeout_ms: AtomicU64::new(rt::as_millis(values.connection_timeout)),
            validation_timeout_ms: AtomicU64::new(rt::as_millis(values.validation_timeout)),
            idle_timeout_ms: AtomicU64::new(rt::as_millis(values.idle_timeout)),
            leak_detection_threshold_ms: AtomicU64::new(rt::as_millis(
                values.leak_detection_threshold,
            )),
            max_lifetime_ms: AtomicU64::new(rt::as_millis(values.max_lifetime)),
            min_idle: AtomicU32::new(values.min_idle),
            max_pool_size: AtomicU32::new(values.max_pool_size),
            catalog: RwLock::new(values.catalog),
            credentials: RwLock::new(values.credentials),
        }
    }

    /// The longest [`Pool::acquire`][crate::pool::Pool::acquire] waits for a connection.
    pub fn connection_timeout(&self) -> Duration {
        load(&self.connection_timeout_ms)
    }

    /// Set the connection timeout. Zero means wait (practically) forever.
    pub fn set_connection_timeout(&self, timeout: Duration) -> Result<()> {
        if timeout.is_zero() {
            store(&self.connection_timeout_ms, rt::INFINITE);
        } else if timeout < SOFT_TIMEOUT_FLOOR {
            return Err(Error::config("connection_timeout cannot be less than 250ms"));
        } else {
            store(&self.connection_timeout_ms, timeout);
        }

        Ok(())
    }

    /// The longest a liveness check may take.
    pub fn validation_timeout(&self) -> Duration {
        load(&self.validation_timeout_ms)
    }

    pub fn set_validation_timeout(&self, timeout: Duration) -> Result<()> {
        if timeout < SOFT_TIMEOUT_FLOOR {
            return Err(Error::config("validation_timeout cannot be less than 250ms"));
        }

        store(&self.validation_timeout_ms, timeout);
        Ok(())
    }

    /// How long a connection may sit idle before housekeeping retires it. Zero disables.
    pub fn idle_timeout(&self) -> Duration {
        load(&self.idle_timeout_ms)
    }

    pub fn set_idle_timeout(&self, timeout: Duration) {
        store(&self.idle_timeout_ms, timeout);
    }

    /// How long a connection may be held before a leak is reported. Zero disables.
    pub fn leak_detection_threshold(&self) -> Duration {
        load(&self.leak_detection_threshold_ms)
    }

    pub fn set_leak_detection_threshold(&self, threshold: Duration) {
        store(&self.leak_detection_threshold_ms, threshold);
    }

    /// The maximum age of a connection. Zero means connections never expire.
    pub fn max_lifetime(&self) -> Duration {
        load(&self.max_lifetime_ms)
    }

    pub fn set_max_lifetime(&self, lifetime: Duration) {
        store(&self.max_lifetime_ms, lifetime);
    }

    /// The number of idle connections housekeeping tries to maintain.
    pub fn min_idle(&self) -> u32 {
        self.min_idle.load(Ordering::Acquire)
    }

    pub fn set_min_idle(&self, min_idle: u32) {
        self.min_idle.store(min_idle, Ordering::Release);
    }

    /// The most connections the pool will hold, idle and in use.
    pub fn max_pool_size(&self) -> u32 {
        self.max_pool_size.load(Ordering::Acquire)
    }

    pub fn set_max_pool_size(&self, max_pool_size: u32) -> Result<()> {
        if max_pool_size < 1 {
            return Err(Error::config("max_pool_size cannot be less than 1"));
        }

        self.max_pool_size.store(max_pool_size, Ordering::Release);
        Ok(())
    }

    pub fn catalog(&self) -> Option<String> {
        self.catalog.read().clone()
    }

    pub fn set_catalog(&self, catalog: Option<String>) {
        *self.catalog.write() = catalog;
    }

    pub fn username(&self) -> Option<String> {
        self.credentials.read().username.clone()
    }

    pub fn set_username(&self, username: Option<String>) {
        self.credentials.write().username = username;
    }

    pub fn set_password(&self, password: Option<String>) {
        self.credentials.write().password = password;
    }

    pub(crate) fn credentials(&self) -> Credentials {
        self.credentials.read().clone()
    }
}

impl Debug for PoolConfig {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("PoolConfig")
            .field("connection_timeout", &self.connection_timeout())
            .field("validation_timeout", &self.validation_timeout())
            .field("idle_timeout", &self.idle_timeout())
            .field("leak_detection_threshold", &self.leak_detection_threshold())
            .field("max_lifetime", &self.max_lifetime())
            .field("min_idle", &self.min_idle())
            .field("max_pool_size", &self.max_pool_size())
            .field("catalog", &self.catalog())
            .field("username", &self.username())
            .field("password", &"<masked>")
            .finish()
    }
}
