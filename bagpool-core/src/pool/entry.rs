use std::fmt::{self, Debug, Formatter};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;

use crate::bag::{AtomicState, BagEntry, State};
use crate::pool::scheduler::ScheduledTask;
use crate::rt::{self, Instant};

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// The pool's record of one physical connection.
///
/// The raw connection lives here while the entry is idle and moves into the
/// [`PoolConnection`][crate::pool::PoolConnection] for the duration of a loan. Once
/// [`close`][Self::close]d the entry never holds a connection again.
pub(crate) struct PoolEntry<C> {
    id: u64,
    state: AtomicState,
    connection: Mutex<Option<C>>,
    closed: AtomicBool,
    evict: AtomicBool,
    created_at: Instant,
    last_accessed: Mutex<Instant>,
    last_borrowed: Mutex<Instant>,
    end_of_life: Mutex<Option<ScheduledTask>>,
    is_read_only: bool,
    is_auto_commit: bool,
}

impl<C> PoolEntry<C> {
    pub fn new(connection: C, is_read_only: bool, is_auto_commit: bool) -> Self {
        let now = Instant::now();

        PoolEntry {
            id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            state: AtomicState::new(State::NotInUse),
            connection: Mutex::new(Some(connection)),
            closed: AtomicBool::new(false),
            evict: AtomicBool::new(false),
            created_at: now,
            last_accessed: Mutex::new(now),
            last_borrowed: Mutex::new(now),
            end_of_life: Mutex::new(None),
            is_read_only,
            is_auto_commit,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn state(&self) -> State {
        self.state.load()
    }

    pub fn is_read_only(&self) -> bool {
        self.is_read_only
    }

    pub fn is_auto_commit(&self) -> bool {
        self.is_auto_commit
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn last_accessed(&self) -> Instant {
        *self.last_accessed.lock()
    }

    /// Record the end of a loan at `now`.
    pub fn mark_accessed(&self, now: Instant) {
        *self.last_accessed.lock() = now;
    }

    pub fn mark_borrowed(&self, now: Instant) {
        *self.last_borrowed.lock() = now;
    }

    pub fn elapsed_since_borrowed(&self) -> Duration {
        self.last_borrowed.lock().elapsed()
    }

    pub fn is_marked_evicted(&self) -> bool {
        self.evict.load(Ordering::Acquire)
    }

    pub fn mark_evicted(&self) {
        self.evict.store(true, Ordering::Release);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn set_end_of_life(&self, task: ScheduledTask) {
        *self.end_of_life.lock() = Some(task);
    }

    /// Move the raw connection out for a loan.
    pub fn take_connection(&self) -> Option<C> {
        self.connection.lock().take()
    }

    /// Put the raw connection back after a loan.
    ///
    /// Hands the connection back if the entry was closed in the meantime.
    pub fn restore_connection(&self, connection: C) -> Result<(), C> {
        let mut slot = self.connection.lock();

        if self.is_closed() {
            return Err(connection);
        }

        *slot = Some(connection);
        Ok(())
    }

    /// Retire this entry: cancel its end-of-life timer and detach the raw connection,
    /// if it is not out on loan.
    pub fn close(&self) -> Option<C> {
        if let Some(end_of_life) = self.end_of_life.lock().take() {
            // false if the timer already fired, in which case it is what is closing us
            let _ = end_of_life.cancel();
        }

        let mut slot = self.connection.lock();
        self.closed.store(true, Ordering::Release);
        slot.take()
    }
}

impl<C: Send + 'static> BagEntry for PoolEntry<C> {
    fn bag_state(&self) -> &AtomicState {
        &self.state
    }
}

impl<C> Debug for PoolEntry<C> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "connection {}, accessed {} ago, {}",
            self.id,
            rt::elapsed_display(self.last_accessed(), Instant::now()),
            self.state()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_moves_out_for_loans() {
        let entry = PoolEntry::new("raw", false, true);

        assert_eq!(entry.take_connection(), Some("raw"));
        assert_eq!(entry.take_connection(), None);
        assert!(entry.restore_connection("raw").is_ok());
        assert_eq!(entry.close(), Some("raw"));
    }

    #[test]
    fn closed_entry_refuses_connection() {
        let entry = PoolEntry::new("raw", false, true);
        let loaned = entry.take_connection().unwrap();

        assert_eq!(entry.close(), None);
        assert!(entry.is_closed());
        assert_eq!(entry.restore_connection(loaned), Err("raw"));
    }

    #[test]
    fn eviction_flag_is_sticky() {
        let entry = PoolEntry::new((), true, false);

        assert!(!entry.is_marked_evicted());
        entry.mark_evicted();
        entry.mark_evicted();
        assert!(entry.is_marked_evicted());
        assert!(entry.is_read_only());
        assert!(!entry.is_auto_commit());
    }
}
