use std::cmp;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use event_listener::Event;
use rand::Rng;
use tokio::time::MissedTickBehavior;
use tracing::Level;

use super::config::PoolConfig;
use super::connection::{DirtyBits, Live, PoolConnection};
use super::entry::PoolEntry;
use super::error_override::{ErrorOverride, Override};
use super::factory::{ConnectionFactory, CreateError};
use super::leak::{LeakTask, LeakTaskFactory};
use super::lock::SuspendResumeLock;
use super::metrics::MetricsTracker;
use super::options::PoolOptions;
use super::scheduler::Scheduler;
use super::size::PoolSize;
use super::stats::PoolStats;
use crate::bag::{ConcurrentBag, State};
use crate::connection::Connection;
use crate::error::{Error, Result};
use crate::logger::private_level_filter_to_trace_level;
use crate::rt::{self, Instant};

const POOL_NORMAL: u8 = 0;
const POOL_SUSPENDED: u8 = 1;
const POOL_SHUTDOWN: u8 = 2;

const HOUSEKEEPING_DELAY: Duration = Duration::from_millis(100);
/// Housekeeping runs this much early before it counts as the clock going backwards.
const CLOCK_SKEW_TOLERANCE: Duration = Duration::from_millis(128);
const INITIAL_BACKOFF: Duration = Duration::from_millis(250);
const MAX_BACKOFF: Duration = Duration::from_secs(10);
const FAIL_FAST_RETRY: Duration = Duration::from_secs(1);
const SHUTDOWN_RESCAN: Duration = Duration::from_millis(100);

const EVICTED_CONNECTION_MESSAGE: &str = "(connection was evicted)";
const DEAD_CONNECTION_MESSAGE: &str = "(connection is dead)";
const EXPIRED_CONNECTION_MESSAGE: &str = "(connection has passed maxLifetime)";

pub(crate) struct PoolInner<C: Connection> {
    pub(super) name: Arc<str>,
    pub(super) config: PoolConfig,
    pub(super) bag: ConcurrentBag<PoolEntry<C>>,
    pub(super) factory: ConnectionFactory<C>,
    pub(crate) scheduler: Scheduler,
    lock: SuspendResumeLock,
    size: PoolSize,
    leak_tasks: LeakTaskFactory,
    state: AtomicU8,
    pending_creates: Arc<AtomicUsize>,
    creating: tokio::sync::Mutex<()>,
    on_shutdown: Event,
    on_entry_closed: Event,
    read_only: bool,
    auto_commit: bool,
    housekeeping_period: Duration,
    alive_bypass_window: Duration,
    shutdown_grace_period: Duration,
    error_override: Option<Arc<dyn ErrorOverride>>,
    metrics: Option<Arc<dyn MetricsTracker>>,
    acquire_time_level: Option<Level>,
    acquire_slow_level: Option<Level>,
    acquire_slow_threshold: Duration,
}

/// Counts a creator task from spawn until it exits, however it exits.
struct PendingCreate(Arc<AtomicUsize>);

impl Drop for PendingCreate {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

fn signed(count: usize) -> i64 {
    i64::try_from(count).unwrap_or(i64::MAX)
}

impl<C: Connection> PoolInner<C> {
    /// Validate `options`, start the pool and wait for the fail-fast check.
    pub(super) async fn start(mut options: PoolOptions<C>) -> Result<Arc<Self>> {
        let source = options.validate()?;
        let name: Arc<str> = Arc::from(options.name());

        tracing::info!(target: "bagpool::pool", "{name} - Starting...");

        let scheduler = Scheduler::for_current_runtime()?;

        let pool = Arc::<Self>::new_cyclic(|pool_weak| {
            let pool_weak = pool_weak.clone();

            let on_starved = move |waiting: usize| {
                if let Some(pool) = pool_weak.upgrade() {
                    pool.add_bag_item(waiting);
                }
            };

            Self {
                factory: ConnectionFactory::new(name.clone(), source, &options),
                config: PoolConfig::new(options.config_values()),
                bag: ConcurrentBag::new(on_starved),
                scheduler,
                lock: SuspendResumeLock::new(
                    options.allow_pool_suspension,
                    options.fail_if_suspended,
                ),
                size: PoolSize::new(),
                leak_tasks: LeakTaskFactory::new(options.leak_detection_threshold),
                state: AtomicU8::new(POOL_NORMAL),
                pending_creates: Arc::new(AtomicUsize::new(0)),
                creating: tokio::sync::Mutex::new(()),
                on_shutdown: Event::new(),
                on_entry_closed: Event::new(),
                read_only: options.read_only,
                auto_commit: options.auto_commit,
                housekeeping_period: options.housekeeping_period,
                alive_bypass_window: options.alive_bypass_window,
                shutdown_grace_period: options.shutdown_grace_period,
                error_override: options.error_override.clone(),
                metrics: options.metrics_tracker.clone(),
                acquire_time_level: private_level_filter_to_trace_level(
                    options.acquire_time_level,
                ),
                acquire_slow_level: private_level_filter_to_trace_level(
                    options.acquire_slow_level,
                ),
                acquire_slow_threshold: options.acquire_slow_threshold,
                name,
            }
        });

        if let Err(error) = pool.check_fail_fast(options.initialization_fail_timeout).await {
            pool.scheduler.shutdown();
            pool.bag.close();
            return Err(error);
        }

        pool.spawn_housekeeper();

        tracing::info!(target: "bagpool::pool", "{} - Start completed.", pool.name);

        Ok(pool)
    }

    fn pool_state(&self) -> u8 {
        self.state.load(Ordering::Acquire)
    }

    fn is_normal(&self) -> bool {
        self.pool_state() == POOL_NORMAL
    }

    pub(super) fn is_shutdown(&self) -> bool {
        self.pool_state() == POOL_SHUTDOWN
    }

    pub(super) fn idle_connections(&self) -> usize {
        self.bag.count(State::NotInUse)
    }

    pub(super) fn active_connections(&self) -> usize {
        self.bag.count(State::InUse)
    }

    pub(super) fn total_connections(&self) -> usize {
        self.bag.len()
    }

    pub(super) fn threads_awaiting_connection(&self) -> usize {
        self.bag.waiting_count()
    }

    pub(super) fn stats(&self) -> PoolStats {
        let counts = self.bag.state_counts();

        PoolStats {
            total_connections: counts.total,
            idle_connections: counts.not_in_use,
            active_connections: counts.in_use,
            pending_threads: counts.waiting,
            max_connections: self.config.max_pool_size(),
            min_connections: self.config.min_idle(),
        }
    }

    pub(super) fn last_connection_failure(&self) -> Option<Arc<Error>> {
        self.factory.last_failure()
    }

    pub(super) fn log_pool_state(&self, prefix: &str) {
        if tracing::enabled!(target: "bagpool::pool", Level::DEBUG) {
            let counts = self.bag.state_counts();

            tracing::debug!(
                target: "bagpool::pool",
                "{} - {}stats (total={}, active={}, idle={}, waiting={})",
                self.name,
                prefix,
                counts.total,
                counts.in_use,
                counts.not_in_use,
                counts.waiting
            );
        }
    }

    pub(super) async fn acquire(self: &Arc<Self>, timeout: Duration) -> Result<PoolConnection<C>> {
        let started = Instant::now();

        // listen before checking the state so a concurrent shutdown cannot be missed
        let shutdown = self.on_shutdown.listen();

        if self.is_shutdown() {
            return Err(Error::PoolClosed);
        }

        let mut conn = tokio::select! {
            biased;
            _ = shutdown => return Err(Error::PoolClosed),
            acquired = self.acquire_until(timeout) => acquired?,
        };

        let acquired_after = started.elapsed();
        self.metrics.record_connection_acquired(acquired_after);

        // armed here so the report points at the borrower
        let leak = self.leak_tasks.schedule(
            &self.scheduler,
            &self.name,
            format!("connection {}", conn.id()),
        );
        conn.set_leak_task(leak);

        let acquire_slow_level = self
            .acquire_slow_level
            .filter(|_| acquired_after > self.acquire_slow_threshold);

        if let Some(level) = acquire_slow_level {
            private_tracing_dynamic_event!(
                target: "bagpool::pool::acquire",
                level,
                pool = %self.name,
                connection_id = conn.id(),
                acquired_after_secs = acquired_after.as_secs_f64(),
                slow_acquire_threshold_secs = self.acquire_slow_threshold.as_secs_f64(),
                "acquired connection, but time to acquire exceeded slow threshold"
            );
        } else if let Some(level) = self.acquire_time_level {
            private_tracing_dynamic_event!(
                target: "bagpool::pool::acquire",
                level,
                pool = %self.name,
                connection_id = conn.id(),
                acquired_after_secs = acquired_after.as_secs_f64(),
                "acquired connection"
            );
        }

        Ok(conn)
    }

    async fn acquire_until(self: &Arc<Self>, timeout: Duration) -> Result<PoolConnection<C>> {
        let _permit = self.lock.acquire().await?;

        // the timeout runs from admission, not from the call
        let started = Instant::now();
        let deadline = rt::deadline_after(started, timeout);

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());

            let Some(entry) = self.bag.borrow(remaining).await else {
                break;
            };

            // Validation runs in its own task so the entry finds its way back to the bag
            // even if this future is dropped while waiting.
            let checked = self.scheduler.run(self.clone().finish_acquire(entry)).await;

            if let Ok(Some(conn)) = checked {
                return Ok(conn);
            }
        }

        self.log_pool_state("Timeout failure ");
        self.metrics.record_connection_timeout();
        self.metrics.record_connection_acquired(started.elapsed());

        Err(Error::PoolTimedOut {
            pool: self.name.to_string(),
            timeout: started.elapsed(),
            last_connect_error: self.factory.last_failure(),
        })
    }

    /// Check a freshly borrowed entry and wrap it, or close it if it is unusable.
    async fn finish_acquire(self: Arc<Self>, entry: Arc<PoolEntry<C>>) -> Option<PoolConnection<C>> {
        let Some(mut raw) = entry.take_connection() else {
            self.close_connection(&entry, None, EVICTED_CONNECTION_MESSAGE);
            return None;
        };

        let now = Instant::now();

        let rejected = if entry.is_marked_evicted() {
            Some(EVICTED_CONNECTION_MESSAGE)
        } else if self.has_passed_max_lifetime(&entry, now) {
            Some(EXPIRED_CONNECTION_MESSAGE)
        } else if now.saturating_duration_since(entry.last_accessed()) > self.alive_bypass_window
            && !self.factory.is_connection_alive(&mut raw, &self.config).await
        {
            Some(DEAD_CONNECTION_MESSAGE)
        } else {
            None
        };

        if let Some(reason) = rejected {
            self.close_connection(&entry, Some(raw), reason);
            return None;
        }

        entry.mark_borrowed(now);

        let session = self
            .factory
            .baseline(entry.is_read_only(), entry.is_auto_commit(), &self.config);

        let live = Live {
            raw,
            entry,
            leak: LeakTask::NONE,
            session,
            dirty: DirtyBits::empty(),
            commit_dirty: false,
        };

        Some(PoolConnection::new(live, self))
    }

    fn has_passed_max_lifetime(&self, entry: &PoolEntry<C>, now: Instant) -> bool {
        let max_lifetime = self.config.max_lifetime();

        !max_lifetime.is_zero() && now.saturating_duration_since(entry.created_at()) >= max_lifetime
    }

    /// The return path of a [`PoolConnection`].
    pub(crate) async fn release(self: Arc<Self>, live: Live<C>) {
        let Live {
            mut raw,
            entry,
            mut leak,
            mut session,
            dirty,
            commit_dirty,
        } = live;

        leak.cancel();

        if entry.is_closed() || entry.state() == State::Removed {
            self.factory
                .quietly_close(raw, entry.id(), "(connection returned after removal)")
                .await;
            return;
        }

        let mut reset = Ok(());

        if commit_dirty && !session.auto_commit {
            reset = raw.rollback().await;

            if reset.is_ok() {
                tracing::debug!(
                    target: "bagpool::pool",
                    "{} - Executed rollback on connection {} due to dirty commit state on return.",
                    self.name,
                    entry.id()
                );
            }
        }

        if reset.is_ok() && !dirty.is_empty() {
            reset = self
                .factory
                .reset_connection_state(&mut raw, &mut session, dirty, &self.config, entry.id())
                .await
                .map(drop);
        }

        if let Err(error) = reset {
            if !entry.is_marked_evicted() {
                tracing::warn!(
                    target: "bagpool::pool",
                    "{} - Failed to reset connection {} on return ({}), evicting it.",
                    self.name,
                    entry.id(),
                    error
                );
                entry.mark_evicted();
            }
        }

        self.metrics
            .record_connection_usage(entry.elapsed_since_borrowed());
        entry.mark_accessed(Instant::now());

        if entry.is_marked_evicted() {
            self.close_connection(&entry, Some(raw), EVICTED_CONNECTION_MESSAGE);
            return;
        }

        if self.is_shutdown() {
            self.close_connection(&entry, Some(raw), "(connection returned after shutdown)");
            return;
        }

        match entry.restore_connection(raw) {
            Ok(()) => self.bag.requite(entry).await,
            Err(raw) => self.close_connection(&entry, Some(raw), EVICTED_CONNECTION_MESSAGE),
        }
    }

    /// Returns `true` if `error` means the borrowed connection is broken; it is then
    /// closed when returned.
    pub(crate) fn check_error(&self, live: &mut Live<C>, error: &Error) -> bool {
        if !error.is_fatal_connection_error() {
            return false;
        }

        if let Some(error_override) = &self.error_override {
            if error_override.adjudicate(error) == Override::DoNotEvict {
                tracing::debug!(
                    target: "bagpool::pool",
                    "{} - Error on connection {} was not considered fatal by the error override: {}",
                    self.name,
                    live.entry.id(),
                    error
                );
                return false;
            }
        }

        let vendor_code = match error {
            Error::Database(e) => e.vendor_code(),
            _ => None,
        };

        tracing::warn!(
            target: "bagpool::pool",
            "{} - Connection {} marked as broken because of SQLSTATE({}), ErrorCode({}): {}",
            self.name,
            live.entry.id(),
            error.sql_state().as_deref().unwrap_or("none"),
            vendor_code.map_or_else(|| "none".to_owned(), |code| code.to_string()),
            error
        );

        live.leak.cancel();
        live.entry.mark_evicted();
        true
    }

    /// Close a borrowed connection instead of returning it.
    pub(crate) fn evict_connection(self: &Arc<Self>, live: Live<C>) {
        let Live {
            raw,
            entry,
            mut leak,
            ..
        } = live;

        leak.cancel();
        entry.mark_evicted();
        self.close_connection(&entry, Some(raw), "(connection evicted by user)");
    }

    /// Mark `entry` for eviction and close it now if it is idle.
    ///
    /// Returns `true` if it was closed.
    fn soft_evict_connection(self: &Arc<Self>, entry: &Arc<PoolEntry<C>>, reason: &'static str) -> bool {
        entry.mark_evicted();

        if self.bag.reserve(entry) {
            self.close_connection(entry, None, reason);
            return true;
        }

        false
    }

    pub(super) fn soft_evict_connections(self: &Arc<Self>) {
        for entry in self.bag.values() {
            self.soft_evict_connection(&entry, "(connection evicted)");
        }
    }

    /// Remove `entry` from the pool and close its connection in the background.
    ///
    /// `raw` is the entry's connection if it is out on loan; it is closed in any case.
    fn close_connection(self: &Arc<Self>, entry: &Arc<PoolEntry<C>>, raw: Option<C>, reason: &'static str) {
        let mut raw = raw;

        if self.bag.remove(entry) {
            let detached = entry.close();
            raw = raw.or(detached);

            self.size.decrease();
            self.on_entry_closed.notify(usize::MAX);
        }

        let Some(raw) = raw else {
            return;
        };

        let pool = self.clone();
        let id = entry.id();

        self.scheduler.spawn_detached(async move {
            pool.factory.quietly_close(raw, id, reason).await;

            if pool.is_normal() {
                pool.fill_pool(false);
            }
        });
    }

    /// Called by the bag when borrowers are starved for connections.
    fn add_bag_item(self: &Arc<Self>, waiting: usize) {
        let pending = self.pending_creates.load(Ordering::Acquire);
        let max = usize::try_from(self.config.max_pool_size()).unwrap_or(usize::MAX);

        if waiting >= pending && pending < max {
            self.spawn_creator(None);
        }
    }

    /// Top up to `min_idle` idle connections without exceeding `max_pool_size`.
    pub(super) fn fill_pool(self: &Arc<Self>, after_add: bool) {
        let max = i64::from(self.config.max_pool_size());
        let min_idle = i64::from(self.config.min_idle());
        let total = signed(self.total_connections());
        let idle = signed(self.idle_connections());
        let pending = signed(self.pending_creates.load(Ordering::Acquire));

        let to_add = cmp::min(max - total, min_idle - idle) - pending;

        if to_add <= 0 {
            if after_add {
                tracing::debug!(
                    target: "bagpool::pool",
                    "{} - Fill pool skipped, pool has sufficient level or currently being filled.",
                    self.name
                );
            }

            return;
        }

        for i in 0..to_add {
            self.spawn_creator((i == to_add - 1).then_some("After adding "));
        }
    }

    fn should_create_another(&self) -> bool {
        let max = usize::try_from(self.config.max_pool_size()).unwrap_or(usize::MAX);
        let min_idle = usize::try_from(self.config.min_idle()).unwrap_or(usize::MAX);

        self.total_connections() < max
            && (self.bag.waiting_count() > 0 || self.idle_connections() < min_idle)
    }

    fn spawn_creator(self: &Arc<Self>, after_prefix: Option<&'static str>) {
        self.pending_creates.fetch_add(1, Ordering::AcqRel);
        let pending = PendingCreate(self.pending_creates.clone());

        // the creator must not keep the pool alive while it backs off
        let pool = Arc::downgrade(self);

        self.scheduler.spawn(async move {
            let _pending = pending;
            Self::create_until_satisfied(pool, after_prefix).await;
        });
    }

    /// Add one connection while the pool needs one, backing off after failures.
    async fn create_until_satisfied(pool: Weak<Self>, after_prefix: Option<&'static str>) {
        let mut backoff = INITIAL_BACKOFF;

        loop {
            let Some(pool) = pool.upgrade() else {
                return;
            };

            let connection_timeout = pool.config.connection_timeout();

            {
                // connections are opened one at a time
                let _creating = pool.creating.lock().await;

                if !pool.is_normal() || !pool.should_create_another() {
                    return;
                }

                let Some(reserved) = pool.size.try_increase(pool.config.max_pool_size()) else {
                    return;
                };

                if let Ok(entry) = pool.create_pool_entry().await {
                    reserved.commit();
                    pool.add_entry(entry).await;

                    if let Some(prefix) = after_prefix {
                        pool.log_pool_state(prefix);
                    }

                    return;
                }
            }

            if after_prefix.is_some() {
                tracing::debug!(
                    target: "bagpool::pool",
                    "{} - Connection add failed, sleeping with backoff: {}ms",
                    pool.name,
                    backoff.as_millis()
                );
            }

            drop(pool);
            rt::sleep(backoff).await;

            backoff = cmp::min(MAX_BACKOFF, cmp::min(connection_timeout, backoff * 3 / 2));
        }
    }

    /// Put a new entry whose size has been accounted for into the bag.
    async fn add_entry(self: &Arc<Self>, entry: Arc<PoolEntry<C>>) {
        let id = entry.id();

        if self.bag.add(entry.clone()).await.is_ok() {
            tracing::debug!(target: "bagpool::pool", "{} - Added connection {}", self.name, id);

            // raced with the eviction pass of a shutdown
            if self.is_shutdown() {
                self.soft_evict_connection(&entry, "(connection added during shutdown)");
            }

            return;
        }

        self.size.decrease();

        if let Some(raw) = entry.close() {
            let pool = self.clone();

            self.scheduler.spawn_detached(async move {
                pool.factory
                    .quietly_close(raw, id, "(connection added after shutdown)")
                    .await;
            });
        }
    }

    async fn create_pool_entry(self: &Arc<Self>) -> Result<Arc<PoolEntry<C>>, CreateError> {
        let raw = match self.factory.new_connection(&self.config).await {
            Ok(raw) => raw,
            Err(failure) => {
                if self.is_normal() {
                    match &failure {
                        CreateError::Setup(error) => tracing::error!(
                            target: "bagpool::pool",
                            "{} - Error thrown while acquiring connection from data source: {}",
                            self.name,
                            error
                        ),
                        CreateError::Connect(error) => tracing::debug!(
                            target: "bagpool::pool",
                            "{} - Cannot acquire connection from data source: {}",
                            self.name,
                            error
                        ),
                    }
                }

                return Err(failure);
            }
        };

        let entry = Arc::new(PoolEntry::new(raw, self.read_only, self.auto_commit));

        let max_lifetime = self.config.max_lifetime();

        if !max_lifetime.is_zero() {
            // variance of up to 2.5% so connections do not all expire at once
            let variance = if max_lifetime > Duration::from_secs(10) {
                Duration::from_millis(
                    rand::thread_rng().gen_range(0..rt::as_millis(max_lifetime) / 40),
                )
            } else {
                Duration::ZERO
            };

            let pool = Arc::downgrade(self);
            let weak_entry = Arc::downgrade(&entry);

            let end_of_life = self.scheduler.schedule(max_lifetime - variance, async move {
                let (Some(pool), Some(entry)) = (pool.upgrade(), weak_entry.upgrade()) else {
                    return;
                };

                if pool.soft_evict_connection(&entry, EXPIRED_CONNECTION_MESSAGE) {
                    pool.add_bag_item(pool.bag.waiting_count());
                }
            });

            entry.set_end_of_life(end_of_life);
        }

        Ok(entry)
    }

    /// Open one connection before the pool starts, retrying until `timeout`.
    async fn check_fail_fast(self: &Arc<Self>, timeout: Option<Duration>) -> Result<()> {
        let Some(timeout) = timeout else {
            return Ok(());
        };

        let started = Instant::now();
        let mut last_failure = None;

        loop {
            if let Some(reserved) = self.size.try_increase(self.config.max_pool_size()) {
                match self.create_pool_entry().await {
                    Ok(entry) => {
                        reserved.commit();

                        if self.config.min_idle() > 0 {
                            self.add_entry(entry).await;
                        } else {
                            self.size.decrease();

                            if let Some(raw) = entry.close() {
                                self.factory
                                    .quietly_close(
                                        raw,
                                        entry.id(),
                                        "(initialization check complete and min_idle is zero)",
                                    )
                                    .await;
                            }
                        }

                        return Ok(());
                    }
                    Err(CreateError::Setup(error)) => {
                        return Err(Error::PoolInitialization(error));
                    }
                    Err(CreateError::Connect(error)) => last_failure = Some(error),
                }
            }

            rt::sleep(FAIL_FAST_RETRY).await;

            if started.elapsed() >= timeout {
                break;
            }
        }

        match last_failure {
            Some(error) if !timeout.is_zero() => Err(Error::PoolInitialization(error)),
            _ => Ok(()),
        }
    }

    fn spawn_housekeeper(self: &Arc<Self>) {
        let pool = Arc::downgrade(self);
        let period = self.housekeeping_period;

        self.scheduler.spawn(async move {
            let mut interval = tokio::time::interval_at(Instant::now() + HOUSEKEEPING_DELAY, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

            let mut previous = None;

            loop {
                interval.tick().await;

                let Some(pool) = pool.upgrade() else {
                    return;
                };

                previous = Some(pool.housekeep(previous));
            }
        });
    }

    /// One housekeeping run: retire idle connections, then top up the pool.
    ///
    /// Returns the time of this run.
    fn housekeep(self: &Arc<Self>, previous: Option<Instant>) -> Instant {
        self.leak_tasks
            .update_threshold(self.config.leak_detection_threshold());

        let now = Instant::now();
        let period = self.housekeeping_period;

        if let Some(previous) = previous {
            if now + CLOCK_SKEW_TOLERANCE < previous + period {
                tracing::warn!(
                    target: "bagpool::pool",
                    "{} - Retrograde clock change detected (housekeeper delta={}), soft-evicting connections from pool.",
                    self.name,
                    rt::elapsed_display(now, previous + period)
                );

                self.soft_evict_connections();
                return now;
            } else if now > previous + period * 3 / 2 {
                tracing::warn!(
                    target: "bagpool::pool",
                    "{} - Thread starvation or clock leap detected (housekeeper delta={}).",
                    self.name,
                    rt::elapsed_display(previous, now)
                );
            }
        }

        let idle_timeout = self.config.idle_timeout();
        let mut after_prefix = "Pool ";

        if !idle_timeout.is_zero() && self.config.min_idle() < self.config.max_pool_size() {
            self.log_pool_state("Before cleanup ");
            after_prefix = "After cleanup  ";

            for entry in self.bag.values_in(State::NotInUse) {
                if now.saturating_duration_since(entry.last_accessed()) > idle_timeout
                    && self.bag.reserve(&entry)
                {
                    self.close_connection(&entry, None, "(connection has passed idleTimeout)");
                }
            }
        }

        self.log_pool_state(after_prefix);
        self.fill_pool(true);

        now
    }

    pub(super) async fn suspend(&self) -> Result<()> {
        if self.lock.is_faux() {
            return Err(Error::config(format!("{} - is not suspendable", self.name)));
        }

        if self.is_normal() {
            self.lock.suspend().await;

            let _ = self.state.compare_exchange(
                POOL_NORMAL,
                POOL_SUSPENDED,
                Ordering::AcqRel,
                Ordering::Acquire,
            );
        }

        Ok(())
    }

    pub(super) fn resume(self: &Arc<Self>) {
        if self
            .state
            .compare_exchange(POOL_SUSPENDED, POOL_NORMAL, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            self.fill_pool(false);
            self.lock.resume();
        }
    }

    /// Shut the pool down, waiting up to the grace period for borrowed connections.
    pub(super) async fn close(self: &Arc<Self>) {
        if self.state.swap(POOL_SHUTDOWN, Ordering::AcqRel) == POOL_SHUTDOWN {
            return;
        }

        self.on_shutdown.notify(usize::MAX);

        tracing::info!(target: "bagpool::pool", "{} - Shutdown initiated...", self.name);
        self.log_pool_state("Before shutdown ");

        self.scheduler.shutdown();
        self.soft_evict_connections();

        let deadline = rt::deadline_after(Instant::now(), self.shutdown_grace_period);

        loop {
            let closed = self.on_entry_closed.listen();

            if self.bag.is_empty() {
                break;
            }

            // entries returned or added since the last pass
            self.soft_evict_connections();

            let now = Instant::now();

            if now >= deadline {
                break;
            }

            let _ = rt::timeout_at(cmp::min(deadline, now + SHUTDOWN_RESCAN), closed).await;
        }

        // a connection still on loan is closed by its borrower when returned
        for entry in self.bag.values_in(State::InUse) {
            entry.mark_evicted();
            self.close_connection(&entry, None, "(connection aborted during shutdown)");
        }

        self.soft_evict_connections();
        self.bag.close();
        self.lock.close();

        self.log_pool_state("After shutdown ");
        tracing::info!(target: "bagpool::pool", "{} - Shutdown completed.", self.name);
    }
}

impl<C: Connection> Drop for PoolInner<C> {
    fn drop(&mut self) {
        self.scheduler.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::DataSource;
    use crate::isolation_level::IsolationLevel;
    use futures_core::future::BoxFuture;

    #[derive(Default)]
    struct Tally {
        closed: AtomicUsize,
        leaked: AtomicUsize,
    }

    /// Counts driver closes and connections dropped without one.
    struct Tracked {
        tally: Arc<Tally>,
        closed: bool,
    }

    impl Drop for Tracked {
        fn drop(&mut self) {
            if !self.closed {
                self.tally.leaked.fetch_add(1, Ordering::SeqCst);
            }
        }
    }

    impl Connection for Tracked {
        fn is_valid(&mut self, _: Duration) -> BoxFuture<'_, Result<bool>> {
            Box::pin(async { Ok(true) })
        }

        fn execute<'c>(&'c mut self, _: &'c str) -> BoxFuture<'c, Result<()>> {
            Box::pin(async { Ok(()) })
        }

        fn commit(&mut self) -> BoxFuture<'_, Result<()>> {
            Box::pin(async { Ok(()) })
        }

        fn rollback(&mut self) -> BoxFuture<'_, Result<()>> {
            Box::pin(async { Ok(()) })
        }

        fn close(mut self) -> BoxFuture<'static, Result<()>> {
            self.closed = true;
            self.tally.closed.fetch_add(1, Ordering::SeqCst);
            Box::pin(async { Ok(()) })
        }

        fn is_read_only(&self) -> bool {
            false
        }

        fn set_read_only(&mut self, _: bool) -> BoxFuture<'_, Result<()>> {
            Box::pin(async { Ok(()) })
        }

        fn is_auto_commit(&self) -> bool {
            true
        }

        fn set_auto_commit(&mut self, _: bool) -> BoxFuture<'_, Result<()>> {
            Box::pin(async { Ok(()) })
        }

        fn transaction_isolation(&mut self) -> BoxFuture<'_, Result<IsolationLevel>> {
            Box::pin(async { Ok(IsolationLevel::ReadCommitted) })
        }

        fn set_transaction_isolation(&mut self, _: IsolationLevel) -> BoxFuture<'_, Result<()>> {
            Box::pin(async { Ok(()) })
        }

        fn set_catalog<'c>(&'c mut self, _: &'c str) -> BoxFuture<'c, Result<()>> {
            Box::pin(async { Ok(()) })
        }

        fn set_schema<'c>(&'c mut self, _: &'c str) -> BoxFuture<'c, Result<()>> {
            Box::pin(async { Ok(()) })
        }
    }

    #[derive(Clone, Default)]
    struct TrackedSource(Arc<Tally>);

    impl TrackedSource {
        fn open(&self) -> Tracked {
            Tracked {
                tally: self.0.clone(),
                closed: false,
            }
        }
    }

    impl DataSource<Tracked> for TrackedSource {
        fn connect<'a>(
            &'a self,
            _: Option<&'a str>,
            _: Option<&'a str>,
        ) -> BoxFuture<'a, Result<Tracked>> {
            Box::pin(async { Ok(self.open()) })
        }
    }

    async fn closes_reach(tally: &Tally, count: usize) -> bool {
        rt::timeout(Duration::from_secs(1), async {
            while tally.closed.load(Ordering::SeqCst) < count {
                tokio::task::yield_now().await;
            }
        })
        .await
        .is_ok()
    }

    #[tokio::test]
    async fn forced_shutdown_closes_a_connection_restored_mid_return() {
        let source = TrackedSource::default();
        let tally = source.0.clone();

        let pool = PoolInner::start(
            PoolOptions::new()
                .data_source(source.clone())
                .max_pool_size(1)
                .min_idle(0)
                .initialization_fail_timeout(None)
                .shutdown_grace_period(Duration::ZERO),
        )
        .await
        .unwrap();

        let conn = pool.acquire(Duration::from_secs(1)).await.unwrap();

        // a return that restored its connection just before shutdown began
        let entry = pool.bag.values_in(State::InUse).pop().expect("borrowed entry");
        assert!(entry.restore_connection(source.open()).is_ok());

        pool.close().await;

        assert!(closes_reach(&tally, 1).await);
        assert_eq!(entry.state(), State::Removed);
        assert_eq!(pool.total_connections(), 0);

        // the borrower's own connection is closed once it comes back
        drop(conn);
        assert!(closes_reach(&tally, 2).await);
        assert_eq!(tally.leaked.load(Ordering::SeqCst), 0);
    }
}
