use std::mem;
use std::sync::atomic::{AtomicU32, Ordering};

/// Counts the connections a pool owns, including ones still being opened.
///
/// Capacity is reserved with [`try_increase`][Self::try_increase] before a connection is
/// opened, so concurrent creators can never push the count past the maximum.
pub(in crate::pool) struct PoolSize {
    size: AtomicU32,
}

/// Reserved capacity; released on drop unless [`commit`][Self::commit]ted.
pub(in crate::pool) struct IncreaseGuard<'a> {
    size: &'a AtomicU32,
}

impl PoolSize {
    pub fn new() -> Self {
        PoolSize {
            size: AtomicU32::new(0),
        }
    }

    pub fn current(&self) -> u32 {
        self.size.load(Ordering::Acquire)
    }

    /// Reserve room for one more connection if the pool holds fewer than `max_size`.
    ///
    /// `max_size` is passed per call because it may be tuned at runtime; lowering it never
    /// closes connections, it only stops new ones.
    pub fn try_increase(&self, max_size: u32) -> Option<IncreaseGuard<'_>> {
        let mut size = self.current();

        while size < max_size {
            // we want to stop at size == max_size
            match self
                .size
                .compare_exchange_weak(size, size + 1, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return Some(IncreaseGuard { size: &self.size }),
                Err(actual) => size = actual,
            }
        }

        None
    }

    /// Release the capacity of a connection that was closed.
    pub fn decrease(&self) {
        let _ = self
            .size
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |size| size.checked_sub(1));
    }
}

impl IncreaseGuard<'_> {
    pub fn commit(self) {
        mem::forget(self);
    }
}

impl Drop for IncreaseGuard<'_> {
    fn drop(&mut self) {
        self.size.fetch_sub(1, Ordering::AcqRel);
    }
}
