//! Thin runtime layer over Tokio.
//!
//! All timestamps in the pool come from [`Instant`] here so that a paused
//! test clock moves every deadline, lifetime and idle check together.

use std::future::Future;
use std::time::Duration;

pub use tokio::task::{AbortHandle, JoinHandle};
pub use tokio::time::Instant;

#[derive(Debug, thiserror::Error)]
#[error("operation timed out")]
pub struct TimeoutError;

/// Approximately 24.8 days; used where a setting means "wait forever".
pub const INFINITE: Duration = Duration::from_millis(2_147_483_647);

pub async fn timeout<F: Future>(duration: Duration, f: F) -> Result<F::Output, TimeoutError> {
    tokio::time::timeout(duration, f)
        .await
        .map_err(|_| TimeoutError)
}

pub async fn timeout_at<F: Future>(deadline: Instant, f: F) -> Result<F::Output, TimeoutError> {
    tokio::time::timeout_at(deadline, f)
        .await
        .map_err(|_| TimeoutError)
}

/// `now + timeout`, or [`INFINITE`] from `now` if that is not representable.
pub fn deadline_after(now: Instant, timeout: Duration) -> Instant {
    now.checked_add(timeout).unwrap_or_else(|| now + INFINITE)
}

pub async fn sleep(duration: Duration) {
    tokio::time::sleep(duration).await
}

pub async fn yield_now() {
    tokio::task::yield_now().await
}

pub fn as_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Render an elapsed duration the way pool diagnostics print it, e.g. `1m12s340ms`.
pub fn elapsed_display(earlier: Instant, now: Instant) -> String {
    let elapsed = now.saturating_duration_since(earlier);
    let mut millis = as_millis(elapsed);
    let mut out = String::new();

    for (unit, suffix) in [(86_400_000, "d"), (3_600_000, "h"), (60_000, "m"), (1_000, "s")] {
        if millis >= unit {
            out.push_str(&format!("{}{suffix}", millis / unit));
            millis %= unit;
        }
    }

    if millis > 0 || out.is_empty() {
        out.push_str(&format!("{millis}ms"));
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn elapsed_display_formats_units() {
        let start = Instant::now();

        assert_eq!(elapsed_display(start, start), "0ms");
        assert_eq!(
            elapsed_display(start, start + Duration::from_millis(72_340)),
            "1m12s340ms"
        );
        assert_eq!(elapsed_display(start, start + Duration::from_secs(3_600)), "1h");
    }

    #[test]
    fn unrepresentable_deadline_falls_back_to_infinite() {
        let now = Instant::now();

        assert_eq!(deadline_after(now, Duration::MAX), now + INFINITE);
        assert_eq!(
            deadline_after(now, Duration::from_secs(5)),
            now + Duration::from_secs(5)
        );
    }
}
