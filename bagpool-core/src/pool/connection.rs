use std::borrow::{Borrow, BorrowMut};
use std::fmt::{self, Debug, Display, Formatter};
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::time::Duration;

use bitflags::bitflags;

use super::entry::PoolEntry;
use super::inner::PoolInner;
use super::leak::LeakTask;
use crate::connection::Connection;
use crate::error::{Error, Result};
use crate::isolation_level::IsolationLevel;

bitflags! {
    /// The session attributes a borrower changed, consulted when the connection is returned.
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Default)]
    pub struct DirtyBits: u8 {
        const READ_ONLY = 0b00_0001;
        const AUTO_COMMIT = 0b00_0010;
        const ISOLATION = 0b00_0100;
        const CATALOG = 0b00_1000;
        const NET_TIMEOUT = 0b01_0000;
        const SCHEMA = 0b10_0000;
    }
}

const RESET_STATES: [(DirtyBits, &str); 6] = [
    (DirtyBits::READ_ONLY, "readOnly"),
    (DirtyBits::AUTO_COMMIT, "autoCommit"),
    (DirtyBits::ISOLATION, "isolation"),
    (DirtyBits::CATALOG, "catalog"),
    (DirtyBits::NET_TIMEOUT, "netTimeout"),
    (DirtyBits::SCHEMA, "schema"),
];

/// Lists the attribute names, e.g. `readOnly, isolation`.
impl Display for DirtyBits {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let mut first = true;

        for (bit, name) in RESET_STATES {
            if self.contains(bit) {
                if !first {
                    f.write_str(", ")?;
                }

                f.write_str(name)?;
                first = false;
            }
        }

        Ok(())
    }
}

/// The session attributes of a borrowed connection as last set through [`PoolConnection`].
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub struct SessionState {
    pub read_only: bool,
    pub auto_commit: bool,
    /// `None` if the driver's default level could not be determined.
    pub isolation: Option<IsolationLevel>,
    pub catalog: Option<String>,
    pub schema: Option<String>,
    pub network_timeout: Duration,
}

/// A connection checked out from [`Pool`][crate::pool::Pool].
///
/// Will be returned to the pool on-drop. Session attributes changed through the setters
/// on this type are restored to the pool's configuration before the connection is handed
/// to the next borrower; changes made on the raw connection behind [`Deref`] are not tracked.
pub struct PoolConnection<C: Connection> {
    live: Option<Live<C>>,
    pub(crate) pool: Arc<PoolInner<C>>,
}

pub(crate) struct Live<C> {
    pub raw: C,
    pub entry: Arc<PoolEntry<C>>,
    pub leak: LeakTask,
    pub session: SessionState,
    pub dirty: DirtyBits,
    /// Statements ran without auto-commit and no commit or rollback followed.
    pub commit_dirty: bool,
}

const DEREF_ERR: &str = "(bug) connection already released to pool";

impl<C: Connection> Debug for PoolConnection<C> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let mut s = f.debug_struct("PoolConnection");

        if let Some(live) = &self.live {
            s.field("id", &live.entry.id())
                .field("session", &live.session)
                .field("dirty", &live.dirty);
        }

        s.finish()
    }
}

impl<C: Connection> Borrow<C> for PoolConnection<C> {
    fn borrow(&self) -> &C {
        self
    }
}

impl<C: Connection> BorrowMut<C> for PoolConnection<C> {
    fn borrow_mut(&mut self) -> &mut C {
        self
    }
}

impl<C: Connection> Deref for PoolConnection<C> {
    type Target = C;

    fn deref(&self) -> &Self::Target {
        &self.live.as_ref().expect(DEREF_ERR).raw
    }
}

impl<C: Connection> DerefMut for PoolConnection<C> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.live.as_mut().expect(DEREF_ERR).raw
    }
}

impl<C: Connection> PoolConnection<C> {
    pub(crate) fn new(live: Live<C>, pool: Arc<PoolInner<C>>) -> Self {
        PoolConnection {
            live: Some(live),
            pool,
        }
    }

    pub(crate) fn set_leak_task(&mut self, leak: LeakTask) {
        if let Some(live) = self.live.as_mut() {
            live.leak = leak;
        }
    }

    fn live(&mut self) -> &mut Live<C> {
        self.live.as_mut().expect(DEREF_ERR)
    }

    /// The pool-wide identifier of the underlying connection.
    pub fn id(&self) -> u64 {
        self.live.as_ref().map_or(0, |live| live.entry.id())
    }

    /// The session attributes as tracked by this handle.
    pub fn session(&self) -> &SessionState {
        &self.live.as_ref().expect(DEREF_ERR).session
    }

    /// The attributes that will be reset when this connection is returned.
    pub fn dirty_bits(&self) -> DirtyBits {
        self.live.as_ref().map_or(DirtyBits::empty(), |live| live.dirty)
    }

    pub async fn set_read_only(&mut self, read_only: bool) -> Result<()> {
        let result = self.live().raw.set_read_only(read_only).await;
        self.checked(result)?;

        let live = self.live();
        live.session.read_only = read_only;
        live.dirty |= DirtyBits::READ_ONLY;
        Ok(())
    }

    /// Turning auto-commit on also commits any open transaction, as drivers do.
    pub async fn set_auto_commit(&mut self, auto_commit: bool) -> Result<()> {
        let result = self.live().raw.set_auto_commit(auto_commit).await;
        self.checked(result)?;

        let live = self.live();
        live.session.auto_commit = auto_commit;
        live.dirty |= DirtyBits::AUTO_COMMIT;
        if auto_commit {
            live.commit_dirty = false;
        }
        Ok(())
    }

    pub async fn set_transaction_isolation(&mut self, level: IsolationLevel) -> Result<()> {
        let result = self.live().raw.set_transaction_isolation(level).await;
        self.checked(result)?;

        let live = self.live();
        live.session.isolation = Some(level);
        live.dirty |= DirtyBits::ISOLATION;
        Ok(())
    }

    pub async fn set_catalog(&mut self, catalog: &str) -> Result<()> {
        let result = self.live().raw.set_catalog(catalog).await;
        self.checked(result)?;

        let live = self.live();
        live.session.catalog = Some(catalog.to_owned());
        live.dirty |= DirtyBits::CATALOG;
        Ok(())
    }

    pub async fn set_schema(&mut self, schema: &str) -> Result<()> {
        let result = self.live().raw.set_schema(schema).await;
        self.checked(result)?;

        let live = self.live();
        live.session.schema = Some(schema.to_owned());
        live.dirty |= DirtyBits::SCHEMA;
        Ok(())
    }

    pub fn set_network_timeout(&mut self, timeout: Duration) -> Result<()> {
        let result = self.live().raw.set_network_timeout(timeout);
        self.checked(result)?;

        let live = self.live();
        live.session.network_timeout = timeout;
        live.dirty |= DirtyBits::NET_TIMEOUT;
        Ok(())
    }

    /// Execute a statement. Without auto-commit, the work is rolled back on return unless
    /// committed first.
    pub async fn execute(&mut self, sql: &str) -> Result<()> {
        let live = self.live();
        if !live.session.auto_commit {
            live.commit_dirty = true;
        }

        let result = live.raw.execute(sql).await;
        self.checked(result)
    }

    pub async fn commit(&mut self) -> Result<()> {
        let result = self.live().raw.commit().await;
        self.checked(result)?;

        self.live().commit_dirty = false;
        Ok(())
    }

    pub async fn rollback(&mut self) -> Result<()> {
        let result = self.live().raw.rollback().await;
        self.checked(result)?;

        self.live().commit_dirty = false;
        Ok(())
    }

    /// Report an error raised while using this connection.
    ///
    /// Returns `true` if the error means the connection is broken, in which case it is
    /// closed instead of going back into rotation. The tracked setters call this already.
    pub fn check_error(&mut self, error: &Error) -> bool {
        let pool = self.pool.clone();

        match self.live.as_mut() {
            Some(live) => pool.check_error(live, error),
            None => false,
        }
    }

    /// Close the underlying connection instead of returning it to the pool.
    pub fn evict(mut self) {
        if let Some(live) = self.live.take() {
            self.pool.evict_connection(live);
        }
    }

    /// Return the connection to the pool, waiting for its session to be reset.
    ///
    /// Dropping the connection does the same in a background task.
    pub async fn release(mut self) {
        if let Some(live) = self.live.take() {
            self.pool.clone().release(live).await;
        }
    }

    fn checked<T>(&mut self, result: Result<T>) -> Result<T> {
        if let Err(error) = &result {
            self.check_error(error);
        }

        result
    }
}

/// Returns the connection to the [`Pool`][crate::pool::Pool] it was checked-out from.
impl<C: Connection> Drop for PoolConnection<C> {
    fn drop(&mut self) {
        if let Some(live) = self.live.take() {
            let pool = self.pool.clone();

            self.pool.scheduler.spawn_detached(async move {
                pool.release(live).await;
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dirty_bits_display_in_reset_order() {
        let bits = DirtyBits::SCHEMA | DirtyBits::READ_ONLY | DirtyBits::NET_TIMEOUT;
        assert_eq!(bits.to_string(), "readOnly, netTimeout, schema");

        assert_eq!(DirtyBits::empty().to_string(), "");
        assert_eq!(
            DirtyBits::all().to_string(),
            "readOnly, autoCommit, isolation, catalog, netTimeout, schema"
        );
    }
}
