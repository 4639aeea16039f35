//! Metrics collection utilities for [`Pool`][crate::pool::Pool].

use std::sync::Arc;
use std::time::Duration;

// Saves a bunch of redundant links in docs.
// Just `#[cfg(doc)]` doesn't work for some reason.
#[cfg_attr(not(doc), allow(unused_imports))]
use crate::pool::{Pool, PoolConnection, PoolOptions};

mod simple;

pub use simple::{SimpleMetricsSnapshot, SimpleMetricsTracker, SimpleTimingStats};

/// Describes a type that can collect metrics from [`Pool`].
///
/// You can set the tracker for a `Pool` instance using [`PoolOptions::metrics_tracker`].
///
/// For an easy-start implementation, see [`SimpleMetricsTracker`].
///
/// All methods on this trait have provided impls so you can override just the ones you care about.
pub trait MetricsTracker: Send + Sync + 'static {
    /// Record how long it took to open and set up a new connection, successful or not.
    fn record_connection_created(&self, _elapsed: Duration) {}

    /// Record how long a [`Pool::acquire()`] call waited, including calls that timed out.
    fn record_connection_acquired(&self, _elapsed: Duration) {}

    /// Record how long a [`PoolConnection`] was held before being returned.
    fn record_connection_usage(&self, _elapsed: Duration) {}

    /// Record when [`Pool::acquire()`] times out.
    fn record_connection_timeout(&self) {}
}

macro_rules! opt_delegate {
    ($receiver:ident.$method:ident $( ( $($arg:expr),*) )?) => {
        if let Some(this) = $receiver {
            this.$method($( $($arg),* )?);
        }
    }
}

#[doc(hidden)]
impl MetricsTracker for Option<Arc<dyn MetricsTracker>> {
    fn record_connection_created(&self, elapsed: Duration) {
        opt_delegate!(self.record_connection_created(elapsed));
    }

    fn record_connection_acquired(&self, elapsed: Duration) {
        opt_delegate!(self.record_connection_acquired(elapsed));
    }

    fn record_connection_usage(&self, elapsed: Duration) {
        opt_delegate!(self.record_connection_usage(elapsed));
    }

    fn record_connection_timeout(&self) {
        opt_delegate!(self.record_connection_timeout());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct TimeoutsOnly(AtomicUsize);

    impl MetricsTracker for TimeoutsOnly {
        fn record_connection_timeout(&self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn unimplemented_hooks_do_nothing() {
        let tracker = Arc::new(TimeoutsOnly::default());
        let delegate: Option<Arc<dyn MetricsTracker>> = Some(tracker.clone());

        delegate.record_connection_created(Duration::from_millis(5));
        delegate.record_connection_acquired(Duration::MAX);
        delegate.record_connection_usage(Duration::ZERO);
        delegate.record_connection_timeout();

        assert_eq!(tracker.0.load(Ordering::SeqCst), 1);

        let none: Option<Arc<dyn MetricsTracker>> = None;
        none.record_connection_timeout();
    }
}
