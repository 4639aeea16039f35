//! A concurrent container of pooled entries with low-contention borrow and return.
//!
//! Lookups go through three tiers:
//!
//! 1. the calling thread's affinity cache, holding entries recently returned on this thread;
//! 2. a linear scan of the shared list;
//! 3. a zero-capacity rendezvous channel on which returned or newly added entries are
//!    handed directly to parked borrowers.
//!
//! An entry's [`State`] is the only proof of ownership. Every tier claims an entry with a
//! `NotInUse -> InUse` compare-and-set, so a cached or handed-off reference that was stolen
//! in the meantime is simply skipped.

use std::any::Any;
use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt::{self, Debug};
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use arc_swap::ArcSwap;

use crate::error::{Error, Result};
use crate::rt::{self, Instant};

/// Entries cached per thread, per bag.
const AFFINITY_CAPACITY: usize = 50;

/// A waiter whose remaining budget falls below this gives up.
const HANDOFF_EPSILON: Duration = Duration::from_micros(10);

/// Parked borrowers rescan the shared list this often, covering a return that raced
/// with the borrower parking.
const RESCAN_INTERVAL: Duration = Duration::from_millis(10);

/// Upper bound on handoff attempts by a returning or adding task.
const MAX_HANDOFF_SPINS: usize = 0x3ff;

static NEXT_BAG_ID: AtomicU64 = AtomicU64::new(1);

type AffinityList = Vec<Weak<dyn Any + Send + Sync>>;

thread_local! {
    static AFFINITY: RefCell<HashMap<u64, AffinityList>> = RefCell::new(HashMap::new());
}

/// Ownership state of a bag entry.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum State {
    NotInUse = 0,
    InUse = 1,
    Removed = -1,
    Reserved = -2,
}

impl State {
    fn from_raw(raw: i32) -> State {
        match raw {
            0 => State::NotInUse,
            1 => State::InUse,
            -2 => State::Reserved,
            _ => State::Removed,
        }
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            State::NotInUse => "NOT_IN_USE",
            State::InUse => "IN_USE",
            State::Removed => "REMOVED",
            State::Reserved => "RESERVED",
        })
    }
}

/// An atomically updated [`State`].
pub struct AtomicState(AtomicI32);

impl AtomicState {
    pub const fn new(state: State) -> Self {
        AtomicState(AtomicI32::new(state as i32))
    }

    pub fn load(&self) -> State {
        State::from_raw(self.0.load(Ordering::Acquire))
    }

    pub fn store(&self, state: State) {
        self.0.store(state as i32, Ordering::Release);
    }

    /// Returns `true` if the state was `current` and is now `new`.
    pub fn compare_and_set(&self, current: State, new: State) -> bool {
        self.0
            .compare_exchange(current as i32, new as i32, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

impl Default for AtomicState {
    fn default() -> Self {
        AtomicState::new(State::NotInUse)
    }
}

impl Debug for AtomicState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        Debug::fmt(&self.load(), f)
    }
}

/// An item that can be stored in a [`ConcurrentBag`].
pub trait BagEntry: Debug + Send + Sync + 'static {
    fn bag_state(&self) -> &AtomicState;
}

/// Receives requests from a [`ConcurrentBag`] to grow its supply.
pub trait BagStateListener: Send + Sync + 'static {
    /// Called when a borrower found no free entry; `waiting` borrowers are currently parked.
    fn add_bag_item(&self, waiting: usize);
}

impl<F> BagStateListener for F
where
    F: Fn(usize) + Send + Sync + 'static,
{
    fn add_bag_item(&self, waiting: usize) {
        self(waiting)
    }
}

/// Point-in-time counts of a bag's entries by state.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct StateCounts {
    pub not_in_use: usize,
    pub in_use: usize,
    pub reserved: usize,
    pub removed: usize,
    pub total: usize,
    pub waiting: usize,
}

pub struct ConcurrentBag<T: BagEntry> {
    id: u64,
    shared: ArcSwap<Vec<Arc<T>>>,
    listener: Box<dyn BagStateListener>,
    waiters: AtomicUsize,
    closed: AtomicBool,
    handoff_tx: flume::Sender<Arc<T>>,
    handoff_rx: flume::Receiver<Arc<T>>,
}

struct WaiterGuard<'a>(&'a AtomicUsize);

impl Drop for WaiterGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

impl<T: BagEntry> ConcurrentBag<T> {
    pub fn new(listener: impl BagStateListener) -> Self {
        let (handoff_tx, handoff_rx) = flume::bounded(0);

        ConcurrentBag {
            id: NEXT_BAG_ID.fetch_add(1, Ordering::Relaxed),
            shared: ArcSwap::from_pointee(Vec::new()),
            listener: Box::new(listener),
            waiters: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
            handoff_tx,
            handoff_rx,
        }
    }

    /// Claim a free entry, waiting at most `timeout` for one to be returned or added.
    ///
    /// Returns `None` if the timeout elapsed first.
    pub async fn borrow(&self, timeout: Duration) -> Option<Arc<T>> {
        if let Some(entry) = self.borrow_from_affinity() {
            return Some(entry);
        }

        let deadline = rt::deadline_after(Instant::now(), timeout);
        let waiting = self.waiters.fetch_add(1, Ordering::AcqRel) + 1;
        let _guard = WaiterGuard(&self.waiters);

        if let Some(entry) = self.claim_shared() {
            // we may have taken an entry another waiter was about to receive
            if waiting > 1 {
                self.listener.add_bag_item(waiting - 1);
            }

            return Some(entry);
        }

        self.listener.add_bag_item(waiting);

        loop {
            let slice_end = deadline.min(Instant::now() + RESCAN_INTERVAL);

            match rt::timeout_at(slice_end, self.handoff_rx.recv_async()).await {
                Ok(Ok(entry)) => {
                    if entry.bag_state().compare_and_set(State::NotInUse, State::InUse) {
                        return Some(entry);
                    }
                }
                // unreachable while `self` holds the sender
                Ok(Err(_)) => return None,
                Err(_) => {}
            }

            if let Some(entry) = self.claim_shared() {
                return Some(entry);
            }

            if deadline.saturating_duration_since(Instant::now()) <= HANDOFF_EPSILON {
                return None;
            }
        }
    }

    /// Return a borrowed entry, handing it to a parked borrower if there is one.
    ///
    /// An entry removed while it was borrowed stays removed.
    pub async fn requite(&self, entry: Arc<T>) {
        if !entry
            .bag_state()
            .compare_and_set(State::InUse, State::NotInUse)
        {
            tracing::debug!(
                target: "bagpool::bag",
                "ignoring return of an entry that is no longer borrowed: {entry:?}"
            );
            return;
        }

        if self.offer(&entry, true).await {
            return;
        }

        self.push_affinity(&entry);
    }

    /// Add a new entry to the bag.
    pub async fn add(&self, entry: Arc<T>) -> Result<()> {
        if self.is_closed() {
            tracing::info!(target: "bagpool::bag", "bag has been closed, ignoring add()");
            return Err(Error::BagClosed);
        }

        self.shared.rcu(|list| {
            let mut list = Vec::clone(list);
            list.push(entry.clone());
            list
        });

        self.offer(&entry, false).await;

        Ok(())
    }

    /// Remove an entry that is borrowed or reserved.
    ///
    /// Returns `false` if the entry was in neither state or was not in the bag.
    pub fn remove(&self, entry: &Arc<T>) -> bool {
        let state = entry.bag_state();
        let closed = self.is_closed();

        if !state.compare_and_set(State::InUse, State::Removed)
            && !state.compare_and_set(State::Reserved, State::Removed)
            && !closed
        {
            tracing::warn!(
                target: "bagpool::bag",
                "attempt to remove an object from the bag that was not borrowed or reserved: {entry:?}"
            );
            return false;
        }

        let mut removed = false;

        self.shared.rcu(|list| {
            let mut list = Vec::clone(list);
            let before = list.len();
            list.retain(|other| !Arc::ptr_eq(other, entry));
            removed = list.len() != before;
            list
        });

        if !removed && !closed {
            tracing::warn!(
                target: "bagpool::bag",
                "attempt to remove an object from the bag that does not exist: {entry:?}"
            );
        }

        self.forget_affinity(entry);

        removed
    }

    /// Take a free entry out of circulation without removing it.
    pub fn reserve(&self, entry: &T) -> bool {
        entry
            .bag_state()
            .compare_and_set(State::NotInUse, State::Reserved)
    }

    /// Put a reserved entry back into circulation.
    pub async fn unreserve(&self, entry: &Arc<T>) {
        if entry
            .bag_state()
            .compare_and_set(State::Reserved, State::NotInUse)
        {
            self.offer(entry, false).await;
        } else {
            tracing::warn!(
                target: "bagpool::bag",
                "attempt to relinquish an object to the bag that was not reserved: {entry:?}"
            );
        }
    }

    /// Entries currently in `state`, most recently added first.
    pub fn values_in(&self, state: State) -> Vec<Arc<T>> {
        self.shared
            .load()
            .iter()
            .rev()
            .filter(|entry| entry.bag_state().load() == state)
            .cloned()
            .collect()
    }

    /// A snapshot of every entry in the bag.
    pub fn values(&self) -> Vec<Arc<T>> {
        self.shared.load().iter().cloned().collect()
    }

    pub fn count(&self, state: State) -> usize {
        self.shared
            .load()
            .iter()
            .filter(|entry| entry.bag_state().load() == state)
            .count()
    }

    pub fn state_counts(&self) -> StateCounts {
        let list = self.shared.load();
        let mut counts = StateCounts {
            total: list.len(),
            waiting: self.waiting_count(),
            ..StateCounts::default()
        };

        for entry in list.iter() {
            match entry.bag_state().load() {
                State::NotInUse => counts.not_in_use += 1,
                State::InUse => counts.in_use += 1,
                State::Reserved => counts.reserved += 1,
                State::Removed => counts.removed += 1,
            }
        }

        counts
    }

    /// The number of borrowers currently past the affinity cache.
    pub fn waiting_count(&self) -> usize {
        self.waiters.load(Ordering::Acquire)
    }

    pub fn len(&self) -> usize {
        self.shared.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Refuse further [`add`][Self::add] calls.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);

        // release entries stranded in the channel by borrowers that timed out
        while self.handoff_rx.try_recv().is_ok() {}
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn dump_state(&self) {
        for entry in self.shared.load().iter() {
            tracing::info!(target: "bagpool::bag", "{entry:?}");
        }
    }

    fn claim_shared(&self) -> Option<Arc<T>> {
        self.shared
            .load()
            .iter()
            .find(|entry| entry.bag_state().compare_and_set(State::NotInUse, State::InUse))
            .cloned()
    }

    /// Offer `entry` to parked borrowers until one takes it, it is claimed elsewhere,
    /// nobody is waiting, or the spin budget runs out.
    ///
    /// Returns `true` if the entry no longer needs a home.
    async fn offer(&self, entry: &Arc<T>, park: bool) -> bool {
        let mut spins = 0usize;

        while self.waiting_count() > 0 {
            if entry.bag_state().load() != State::NotInUse
                || self.handoff_tx.try_send(entry.clone()).is_ok()
            {
                return true;
            }

            if spins >= MAX_HANDOFF_SPINS {
                break;
            }

            if park && spins & 0xff == 0xff {
                rt::sleep(Duration::from_micros(10)).await;
            } else {
                rt::yield_now().await;
            }

            spins += 1;
        }

        false
    }

    fn borrow_from_affinity(&self) -> Option<Arc<T>> {
        AFFINITY.with(|affinity| {
            let mut affinity = affinity.borrow_mut();
            let list = affinity.get_mut(&self.id)?;

            while let Some(weak) = list.pop() {
                let Some(entry) = weak.upgrade().and_then(|any| any.downcast::<T>().ok()) else {
                    continue;
                };

                if entry.bag_state().compare_and_set(State::NotInUse, State::InUse) {
                    return Some(entry);
                }
            }

            None
        })
    }

    fn push_affinity(&self, entry: &Arc<T>) {
        let weak: Weak<dyn Any + Send + Sync> = Arc::downgrade(entry) as Weak<dyn Any + Send + Sync>;

        AFFINITY.with(|affinity| {
            let mut affinity = affinity.borrow_mut();
            let list = affinity.entry(self.id).or_default();

            if list.len() < AFFINITY_CAPACITY {
                list.push(weak);
            }
        });
    }

    fn forget_affinity(&self, entry: &Arc<T>) {
        AFFINITY.with(|affinity| {
            if let Some(list) = affinity.borrow_mut().get_mut(&self.id) {
                list.retain(|weak| !ptr::addr_eq(weak.as_ptr(), Arc::as_ptr(entry)));
            }
        });
    }
}

impl<T: BagEntry> Drop for ConcurrentBag<T> {
    fn drop(&mut self) {
        // Only the dropping thread's cache can be cleared; other threads hold dead weak refs
        // that are discarded on their next lookup of this id, which never comes.
        let _ = AFFINITY.try_with(|affinity| {
            if let Ok(mut affinity) = affinity.try_borrow_mut() {
                affinity.remove(&self.id);
            }
        });
    }
}

impl<T: BagEntry> Debug for ConcurrentBag<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConcurrentBag")
            .field("counts", &self.state_counts())
            .field("closed", &self.is_closed())
            .finish()
    }
}
