use std::backtrace::Backtrace;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::pool::scheduler::{ScheduledTask, Scheduler};
use crate::rt;

/// Arms a [`LeakTask`] for every borrowed connection while a threshold is configured.
pub(crate) struct LeakTaskFactory {
    threshold_millis: AtomicU64,
}

/// Warns if a borrowed connection is held past the leak detection threshold.
///
/// Purely diagnostic: a reported connection is still returned to the pool normally.
#[derive(Debug)]
pub(crate) struct LeakTask {
    armed: Option<Armed>,
}

#[derive(Debug)]
struct Armed {
    task: ScheduledTask,
    report: Arc<LeakReport>,
}

#[derive(Debug)]
struct LeakReport {
    pool_name: Arc<str>,
    connection: String,
    thread: String,
}

impl LeakTaskFactory {
    pub fn new(threshold: Duration) -> Self {
        LeakTaskFactory {
            threshold_millis: AtomicU64::new(rt::as_millis(threshold)),
        }
    }

    pub fn update_threshold(&self, threshold: Duration) {
        self.threshold_millis
            .store(rt::as_millis(threshold), Ordering::Release);
    }

    pub fn threshold(&self) -> Duration {
        Duration::from_millis(self.threshold_millis.load(Ordering::Acquire))
    }

    pub fn schedule(
        &self,
        scheduler: &Scheduler,
        pool_name: &Arc<str>,
        connection: impl ToString,
    ) -> LeakTask {
        let threshold = self.threshold();

        if threshold.is_zero() {
            return LeakTask::NONE;
        }

        let report = Arc::new(LeakReport {
            pool_name: pool_name.clone(),
            connection: connection.to_string(),
            thread: current_thread_name(),
        });

        // captured here so the report shows where the connection was borrowed
        let backtrace = Backtrace::force_capture();

        let task = scheduler.schedule(threshold, {
            let report = report.clone();
            async move {
                tracing::warn!(
                    target: "bagpool::pool",
                    "{} - Connection leak detection triggered for {} on thread {}, stack trace follows\n{}",
                    report.pool_name,
                    report.connection,
                    report.thread,
                    backtrace
                );
            }
        });

        LeakTask {
            armed: Some(Armed { task, report }),
        }
    }
}

impl LeakTask {
    pub const NONE: LeakTask = LeakTask { armed: None };

    /// Disarm the task; logs if the connection had already been reported.
    pub fn cancel(&mut self) {
        let Some(Armed { task, report }) = self.armed.take() else {
            return;
        };

        if !task.cancel() && task.has_fired() {
            tracing::info!(
                target: "bagpool::pool",
                "{} - Previously reported leaked connection {} on thread {} was returned.",
                report.pool_name,
                report.connection,
                report.thread
            );
        }
    }

    #[cfg(test)]
    fn is_armed(&self) -> bool {
        self.armed.is_some()
    }
}

impl Drop for LeakTask {
    fn drop(&mut self) {
        if let Some(Armed { task, .. }) = self.armed.take() {
            task.cancel();
        }
    }
}

fn current_thread_name() -> String {
    let thread = std::thread::current();

    thread
        .name()
        .map(str::to_owned)
        .unwrap_or_else(|| format!("{:?}", thread.id()))
}
