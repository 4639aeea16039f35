use std::future::Future;
use std::io;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;

use crate::error::Error;
use crate::rt::{self, AbortHandle, JoinHandle};

const PENDING: u8 = 0;
const RUNNING: u8 = 1;
const CANCELLED: u8 = 2;

/// Runs the pool's background work: housekeeping, connection creation and closing,
/// and per-connection timers.
///
/// Holds a handle to the runtime the pool was created on so that work can be spawned
/// from `Drop` impls running outside of it. Everything spawned here stops at the next
/// `.await` once [`shutdown`][Self::shutdown] is called.
#[derive(Clone)]
pub(crate) struct Scheduler {
    handle: Handle,
    token: CancellationToken,
}

/// A cancellable delayed task, see [`Scheduler::schedule`].
#[derive(Debug)]
pub(crate) struct ScheduledTask {
    state: Arc<AtomicU8>,
    abort: AbortHandle,
}

impl Scheduler {
    pub fn for_current_runtime() -> Result<Self, Error> {
        let handle = Handle::try_current().map_err(|e| Error::Io(io::Error::other(e)))?;

        Ok(Scheduler {
            handle,
            token: CancellationToken::new(),
        })
    }

    pub fn spawn<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let token = self.token.clone();

        self.handle.spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = task => {}
            }
        });
    }

    /// Spawn work that must run to completion even after shutdown, such as closing
    /// a connection.
    pub fn spawn_detached<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.handle.spawn(task);
    }

    /// Spawn `task` and hand back its output. The task runs to completion even if the
    /// handle is dropped or the scheduler shuts down.
    pub fn run<F>(&self, task: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.handle.spawn(task)
    }

    /// Run `task` once `delay` has elapsed, unless cancelled first.
    pub fn schedule<F>(&self, delay: Duration, task: F) -> ScheduledTask
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let state = Arc::new(AtomicU8::new(PENDING));
        let token = self.token.clone();

        let join = self.handle.spawn({
            let state = state.clone();

            async move {
                tokio::select! {
                    _ = token.cancelled() => {}
                    _ = rt::sleep(delay) => {
                        if state
                            .compare_exchange(PENDING, RUNNING, Ordering::AcqRel, Ordering::Acquire)
                            .is_ok()
                        {
                            task.await;
                        }
                    }
                }
            }
        });

        ScheduledTask {
            state,
            abort: join.abort_handle(),
        }
    }

    pub fn shutdown(&self) {
        self.token.cancel();
    }

    #[cfg(test)]
    fn is_shutdown(&self) -> bool {
        self.token.is_cancelled()
    }
}

impl ScheduledTask {
    /// Cancel the task if it has not started yet.
    ///
    /// Returns `false` if the task already fired; cancelling twice is a no-op that
    /// returns `true`.
    pub fn cancel(&self) -> bool {
        match self
            .state
            .compare_exchange(PENDING, CANCELLED, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => {
                self.abort.abort();
                true
            }
            Err(state) => state == CANCELLED,
        }
    }

    /// Returns `true` once the task body has started running.
    pub fn has_fired(&self) -> bool {
        self.state.load(Ordering::Acquire) == RUNNING
    }

    /// Returns `true` if the task has stopped, for any reason.
    #[cfg(test)]
    fn is_done(&self) -> bool {
        self.abort.is_finished()
    }
}
