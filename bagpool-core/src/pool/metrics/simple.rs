use std::cmp;
use std::fmt::{self, Formatter};
use std::sync::atomic::{self, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::pool::metrics::MetricsTracker;
// Saves a bunch of redundant links in docs.
// Just `#[cfg(doc)]` doesn't work for some reason.
#[cfg_attr(not(doc), allow(unused_imports))]
use crate::pool::{Pool, PoolConnection, PoolOptions};

/// A simple but hopefully useful metrics tracker for [`Pool`].
///
/// See [`SimpleMetricsSnapshot`] for the metrics collected by this implementation.
///
/// # Example
///
/// ```rust,ignore
/// use bagpool::pool::metrics::SimpleMetricsTracker;
///
/// let metrics = SimpleMetricsTracker::new();
///
/// let pool = PoolOptions::new()
///     .data_source(source)
///     .metrics_tracker(metrics.tracker())
///     .connect()
///     .await?;
///
/// // use `pool`...
///
/// println!("current pool metrics: {:#?}", metrics.snapshot());
/// ```
#[derive(Clone)]
pub struct SimpleMetricsTracker {
    inner: Arc<SimpleMetricsInner>,
}

/// A snapshot of metrics returned by [`SimpleMetricsTracker::snapshot()`].
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct SimpleMetricsSnapshot {
    /// Time spent opening and setting up connections, including failed attempts.
    pub connection_created: SimpleTimingStats,

    /// Time [`Pool::acquire()`] spent waiting, including calls that timed out.
    pub connection_acquired: SimpleTimingStats,

    /// Time a [`PoolConnection`] was held before being returned.
    pub connection_usage: SimpleTimingStats,

    /// Total number of times [`Pool::acquire()`] timed out.
    pub connection_timeouts: u64,
}

/// The statistics for an individual [`Pool`] timing metric collected by [`SimpleMetricsTracker`].
#[derive(Debug, Clone, Default)]
#[non_exhaustive]
pub struct SimpleTimingStats {
    /// The total count of samples collected for this metric.
    pub sample_count: u64,

    /// The minimum time for this metric. [`Duration::ZERO`] if no samples were collected.
    pub min: Duration,

    /// The average time for this metric, calculated as an [Exponential Moving Average].
    ///
    /// [`Duration::ZERO`] if no samples were collected.
    ///
    /// [Exponential Moving Average]: https://en.wikipedia.org/wiki/Moving_average#Exponential_moving_average
    pub average: Duration,

    /// The maximum time for this metric. [`Duration::ZERO`] if no samples were collected.
    pub max: Duration,
}

#[derive(Default)]
struct SimpleMetricsInner {
    ema_coefficient: f64,
    connection_created: AtomicTimingStats,
    connection_acquired: AtomicTimingStats,
    connection_usage: AtomicTimingStats,
    connection_timeouts: AtomicU64,
}

#[derive(Default)]
struct AtomicTimingStats {
    sample_count: AtomicU64,
    min_nanos: AtomicU64,
    average_nanos: AtomicU64,
    max_nanos: AtomicU64,
}

impl SimpleMetricsTracker {
    /// Construct with default settings.
    pub fn new() -> SimpleMetricsTracker {
        // Arbitrarily chosen, but should give decent metrics.
        Self::with_ema_coefficient(0.01)
    }

    /// Construct with the given coefficient for calculating Exponential Moving Averages.
    ///
    /// A smaller coefficient produces a more stable but more slowly moving average,
    /// a larger coefficient produces a quickly moving but chaotic average.
    ///
    /// ### Panics
    /// If `ema_coefficient` is outside the range `(0, 1)` or is non-normal.
    pub fn with_ema_coefficient(ema_coefficient: f64) -> Self {
        assert!(ema_coefficient.is_normal());
        assert!(ema_coefficient > 0.0);
        assert!(ema_coefficient < 1.0);

        SimpleMetricsTracker {
            inner: Arc::new(SimpleMetricsInner {
                ema_coefficient,
                ..SimpleMetricsInner::default()
            }),
        }
    }

    /// Get the tracker instance to pass to [`PoolOptions::metrics_tracker()`].
    pub fn tracker(&self) -> Arc<dyn MetricsTracker> {
        self.inner.clone()
    }

    pub fn connection_timeouts(&self) -> u64 {
        self.inner.connection_timeouts.load(Ordering::Acquire)
    }

    /// Load the current values for all metrics.
    pub fn snapshot(&self) -> SimpleMetricsSnapshot {
        use Ordering::*;

        atomic::fence(Acquire);

        SimpleMetricsSnapshot {
            connection_created: self.inner.connection_created.get(),
            connection_acquired: self.inner.connection_acquired.get(),
            connection_usage: self.inner.connection_usage.get(),
            connection_timeouts: self.inner.connection_timeouts.load(Relaxed),
        }
    }
}

impl Default for SimpleMetricsTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// Debug-prints the current metrics as determined by [`Self::snapshot()`].
impl fmt::Debug for SimpleMetricsTracker {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("SimpleMetricsTracker")
            .field("current", &self.snapshot())
            .finish()
    }
}

impl MetricsTracker for SimpleMetricsInner {
    fn record_connection_created(&self, elapsed: Duration) {
        self.connection_created.update(self.ema_coefficient, elapsed);
    }

    fn record_connection_acquired(&self, elapsed: Duration) {
        self.connection_acquired.update(self.ema_coefficient, elapsed);
    }

    fn record_connection_usage(&self, elapsed: Duration) {
        self.connection_usage.update(self.ema_coefficient, elapsed);
    }

    fn record_connection_timeout(&self) {
        self.connection_timeouts.fetch_add(1, Ordering::AcqRel);
    }
}

impl AtomicTimingStats {
    #[allow(
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss,
        clippy::cast_precision_loss
    )]
    fn update(&self, ema_coefficient: f64, time_sample: Duration) {
        use Ordering::*;

        let nanos = u64::try_from(time_sample.as_nanos()).unwrap_or(u64::MAX);

        // Since this is just collecting some statistics, consistency isn't *too* important.
        // We use relaxed orderings for all internal updates and just emit a single fence to
        // get some semblance of synchronization.
        atomic::fence(Acquire);

        let first = self.sample_count.fetch_add(1, Relaxed) == 0;

        let _ = self.min_nanos.fetch_update(Relaxed, Relaxed, |prev| {
            Some(if first { nanos } else { cmp::min(prev, nanos) })
        });

        let _ = self
            .average_nanos
            .fetch_update(Relaxed, Relaxed, |average| {
                if first {
                    return Some(nanos);
                }

                // Exponential Moving Average algorithm
                Some(
                    ((nanos as f64 * ema_coefficient) + (average as f64 * (1.0 - ema_coefficient)))
                        as u64,
                )
            });

        let _ = self
            .max_nanos
            .fetch_update(Relaxed, Relaxed, |prev| Some(cmp::max(prev, nanos)));

        // Suggest that our update be published to main memory.
        atomic::fence(Release);
    }

    /// Assumes an atomic fence is issued first.
    fn get(&self) -> SimpleTimingStats {
        use Ordering::*;

        SimpleTimingStats {
            sample_count: self.sample_count.load(Relaxed),
            min: Duration::from_nanos(self.min_nanos.load(Relaxed)),
            average: Duration::from_nanos(self.average_nanos.load(Relaxed)),
            max: Duration::from_nanos(self.max_nanos.load(Relaxed)),
        }
    }
}
