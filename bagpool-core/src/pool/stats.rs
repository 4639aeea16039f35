/// A point-in-time view of a pool's connections, see
/// [`Pool::stats`][crate::pool::Pool::stats].
///
/// The counts are read one after another while the pool keeps running, so they are not
/// guaranteed to add up exactly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub struct PoolStats {
    pub total_connections: usize,
    pub idle_connections: usize,
    pub active_connections: usize,
    /// Tasks currently waiting in [`Pool::acquire`][crate::pool::Pool::acquire].
    pub pending_threads: usize,
    pub max_connections: u32,
    pub min_connections: u32,
}
