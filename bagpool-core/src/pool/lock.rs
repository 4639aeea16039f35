use tokio::sync::{Semaphore, SemaphorePermit};

use crate::error::Error;

/// Enough permits that admission never throttles a running pool.
const MAX_PERMITS: u32 = 10_000;

/// The admission gate used to suspend and resume a pool.
///
/// Every acquire takes one permit for its duration; suspending drains all of them, so new
/// acquires wait (or fail, with `fail_if_suspended`) until the pool is resumed.
pub(crate) enum SuspendResumeLock {
    /// Suspension is not enabled; admission always succeeds.
    Faux,
    Gate {
        permits: Semaphore,
        fail_if_suspended: bool,
    },
}

/// Held for the duration of an acquire.
#[must_use]
pub(crate) struct AdmissionPermit<'a>(Option<SemaphorePermit<'a>>);

impl SuspendResumeLock {
    pub fn new(allow_suspension: bool, fail_if_suspended: bool) -> Self {
        if allow_suspension {
            SuspendResumeLock::Gate {
                permits: Semaphore::new(MAX_PERMITS as usize),
                fail_if_suspended,
            }
        } else {
            SuspendResumeLock::Faux
        }
    }

    pub fn is_faux(&self) -> bool {
        matches!(self, SuspendResumeLock::Faux)
    }

    pub async fn acquire(&self) -> Result<AdmissionPermit<'_>, Error> {
        let SuspendResumeLock::Gate {
            permits,
            fail_if_suspended,
        } = self
        else {
            return Ok(AdmissionPermit(None));
        };

        if let Ok(permit) = permits.try_acquire() {
            return Ok(AdmissionPermit(Some(permit)));
        }

        if *fail_if_suspended {
            return Err(Error::PoolSuspended);
        }

        permits
            .acquire()
            .await
            .map(|permit| AdmissionPermit(Some(permit)))
            .map_err(|_| Error::PoolClosed)
    }

    /// Wait for every outstanding permit, then hold all of them.
    pub async fn suspend(&self) {
        if let SuspendResumeLock::Gate { permits, .. } = self {
            if let Ok(all) = permits.acquire_many(MAX_PERMITS).await {
                all.forget();
            }
        }
    }

    pub fn resume(&self) {
        if let SuspendResumeLock::Gate { permits, .. } = self {
            permits.add_permits(MAX_PERMITS as usize);
        }
    }

    /// Wake every waiter with [`Error::PoolClosed`].
    pub fn close(&self) {
        if let SuspendResumeLock::Gate { permits, .. } = self {
            permits.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn faux_lock_always_admits() {
        let lock = SuspendResumeLock::new(false, true);
        lock.suspend().await;

        assert!(lock.is_faux());
        assert!(lock.acquire().await.is_ok());
    }

    #[tokio::test]
    async fn suspended_gate_fails_fast_when_configured() {
        let lock = SuspendResumeLock::new(true, true);
        lock.suspend().await;

        assert!(matches!(lock.acquire().await, Err(Error::PoolSuspended)));

        lock.resume();
        assert!(lock.acquire().await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn suspended_gate_blocks_until_resume() {
        let lock = SuspendResumeLock::new(true, false);
        lock.suspend().await;

        let blocked = tokio::time::timeout(Duration::from_secs(1), lock.acquire()).await;
        assert!(blocked.is_err());

        lock.resume();
        assert!(lock.acquire().await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn suspend_waits_for_outstanding_permits() {
        let lock = SuspendResumeLock::new(true, false);
        let permit = lock.acquire().await.unwrap();

        assert!(tokio::time::timeout(Duration::from_secs(1), lock.suspend())
            .await
            .is_err());

        drop(permit);
        lock.suspend().await;
        assert!(tokio::time::timeout(Duration::from_secs(1), lock.acquire())
            .await
            .is_err());
    }
}
