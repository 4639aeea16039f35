//! Types for working with errors produced by bagpool.

use std::borrow::Cow;
use std::error::Error as StdError;
use std::fmt::Display;
use std::io;
use std::result::Result as StdResult;
use std::sync::Arc;
use std::time::Duration;

/// A specialized `Result` type for bagpool.
pub type Result<T, E = Error> = StdResult<T, E>;

// Convenience type alias for usage within bagpool.
pub type BoxDynError = Box<dyn StdError + 'static + Send + Sync>;

/// SQLSTATE values (beyond class `08`) after which a connection cannot be trusted.
const FATAL_SQL_STATES: &[&str] = &["0A000", "57P01", "57P02", "57P03", "01002", "JZ0C0", "JZ0C1"];

/// Vendor error codes after which a connection cannot be trusted.
const FATAL_VENDOR_CODES: &[i32] = &[500150, 2399, 1105];

/// Represents all the ways a method can fail within bagpool.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// The pool configuration is invalid or contradictory.
    #[error("invalid pool configuration: {0}")]
    Configuration(String),

    /// The pool could not produce a usable connection while starting up.
    #[error("failed to initialize pool: {0}")]
    PoolInitialization(#[source] Arc<Error>),

    /// A [`Pool::acquire`] timed out because no connection became available in time.
    ///
    /// `last_connect_error` is the most recent failure seen while creating connections,
    /// if there was one.
    ///
    /// [`Pool::acquire`]: crate::pool::Pool::acquire
    #[error("{pool} - connection is not available, request timed out after {}ms", .timeout.as_millis())]
    PoolTimedOut {
        pool: String,
        timeout: Duration,
        #[source]
        last_connect_error: Option<Arc<Error>>,
    },

    /// The pool is suspended and was configured to fail instead of waiting.
    #[error("the pool is currently suspended and configured to fail upon acquisition")]
    PoolSuspended,

    /// [`Pool::close`] was called before or while we were waiting in [`Pool::acquire`].
    ///
    /// [`Pool::acquire`]: crate::pool::Pool::acquire
    /// [`Pool::close`]: crate::pool::Pool::close
    #[error("attempted to acquire a connection on a closed pool")]
    PoolClosed,

    /// An entry was added to a bag that has already been closed.
    #[error("the connection bag has been closed")]
    BagClosed,

    /// Error returned from the database.
    #[error("error returned from database: {0}")]
    Database(Box<dyn DatabaseError>),

    /// Error communicating with the database backend.
    #[error("error communicating with the server: {0}")]
    Io(#[from] io::Error),

    /// Establishing a connection took longer than the login timeout.
    #[error("timed out while establishing a connection")]
    ConnectTimedOut,

    /// The driver does not support the requested capability.
    #[error("driver does not support {0}")]
    Unsupported(&'static str),
}

impl Error {
    #[inline]
    pub(crate) fn config(msg: impl Display) -> Self {
        Error::Configuration(msg.to_string())
    }

    /// Returns the SQLSTATE of a database error, if any.
    pub fn sql_state(&self) -> Option<Cow<'_, str>> {
        match self {
            Error::Database(err) => err.code(),
            _ => None,
        }
    }

    /// Returns `true` if this error means the connection that produced it
    /// should not be returned to circulation.
    ///
    /// This is the default adjudication applied by
    /// [`PoolConnection::check_error`][crate::pool::PoolConnection::check_error].
    pub fn is_fatal_connection_error(&self) -> bool {
        match self {
            Error::Io(_) | Error::ConnectTimedOut => true,
            Error::Database(err) => {
                let by_state = err
                    .code()
                    .is_some_and(|state| state.starts_with("08") || FATAL_SQL_STATES.contains(&&*state));

                let by_vendor = err
                    .vendor_code()
                    .is_some_and(|code| FATAL_VENDOR_CODES.contains(&code));

                by_state || by_vendor
            }
            _ => false,
        }
    }
}

/// An error that was returned from the database.
pub trait DatabaseError: 'static + Send + Sync + StdError {
    /// The primary, human-readable error message.
    fn message(&self) -> &str;

    /// The (SQLSTATE) code for the error.
    fn code(&self) -> Option<Cow<'_, str>> {
        None
    }

    /// The driver or vendor specific numeric error code.
    fn vendor_code(&self) -> Option<i32> {
        None
    }
}

impl<E> From<E> for Error
where
    E: DatabaseError,
{
    #[inline]
    fn from(error: E) -> Self {
        Error::Database(Box::new(error))
    }
}
