use std::sync::atomic::{AtomicU64, Ordering};

/// Hands out default pool names of the form `BagPool-<n>`.
#[derive(Debug)]
pub struct PoolNameRegistry {
    next: AtomicU64,
}

static GLOBAL: PoolNameRegistry = PoolNameRegistry::starting_at(1);

impl PoolNameRegistry {
    pub const fn starting_at(first: u64) -> Self {
        PoolNameRegistry {
            next: AtomicU64::new(first),
        }
    }

    /// The process-wide registry used for pools created without a name.
    pub fn global() -> &'static PoolNameRegistry {
        &GLOBAL
    }

    pub fn next_name(&self) -> String {
        pool_name(self.next.fetch_add(1, Ordering::Relaxed))
    }
}

pub fn pool_name(n: u64) -> String {
    format!("BagPool-{n}")
}
