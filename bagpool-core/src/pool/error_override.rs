use crate::error::Error;

/// The verdict of an [`ErrorOverride`].
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub enum Override {
    /// Apply the default policy: evict the connection.
    #[default]
    ContinueEvict,
    /// Keep the connection in circulation despite the error.
    DoNotEvict,
}

/// Decides whether a connection that produced a fatal-looking error is really broken.
///
/// Consulted by [`PoolConnection::check_error`][crate::pool::PoolConnection::check_error]
/// only for errors that [`Error::is_fatal_connection_error`] already flags.
pub trait ErrorOverride: Send + Sync + 'static {
    fn adjudicate(&self, error: &Error) -> Override {
        let _ = error;
        Override::ContinueEvict
    }
}

impl<F> ErrorOverride for F
where
    F: Fn(&Error) -> Override + Send + Sync + 'static,
{
    fn adjudicate(&self, error: &Error) -> Override {
        self(error)
    }
}
