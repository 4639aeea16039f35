use std::fmt::{self, Display, Formatter};
use std::str::FromStr;

use crate::error::Error;

/// Transaction isolation level; controls the degree of locking that occurs
/// when selecting data.
///
/// Numeric ids follow the values drivers commonly report for each level, so a
/// level may be configured either by name or by id.
///
/// See <https://en.wikipedia.org/wiki/Isolation_(database_systems)#Isolation_levels>.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum IsolationLevel {
    /// Transactions are not supported.
    None,

    /// The lowest isolation level. Dirty reads are allowed, so one transaction
    /// may see **not yet committed** changes made by other transactions.
    ReadUncommitted,

    /// A `SELECT` query will only see data that has been committed before the
    /// query began.
    ///
    /// However, two successive `SELECT` queries can see different data,
    /// even though they are within a single transaction, if a concurrent
    /// transaction has committed in-between.
    ReadCommitted,

    /// DB2 cursor stability.
    CursorStability,

    /// A `SELECT` query will only see data committed before the transaction
    /// began.
    RepeatableRead,

    /// Informix last committed.
    LastCommitted,

    Serializable,

    /// SQL Server snapshot isolation.
    SqlServerSnapshot,
}

impl IsolationLevel {
    const ALL: [IsolationLevel; 8] = [
        IsolationLevel::None,
        IsolationLevel::ReadUncommitted,
        IsolationLevel::ReadCommitted,
        IsolationLevel::CursorStability,
        IsolationLevel::RepeatableRead,
        IsolationLevel::LastCommitted,
        IsolationLevel::Serializable,
        IsolationLevel::SqlServerSnapshot,
    ];

    pub const fn id(self) -> i32 {
        match self {
            IsolationLevel::None => 0,
            IsolationLevel::ReadUncommitted => 1,
            IsolationLevel::ReadCommitted => 2,
            IsolationLevel::CursorStability => 3,
            IsolationLevel::RepeatableRead => 4,
            IsolationLevel::LastCommitted => 5,
            IsolationLevel::Serializable => 8,
            IsolationLevel::SqlServerSnapshot => 4096,
        }
    }

    pub fn from_id(id: i32) -> Option<Self> {
        Self::ALL.into_iter().find(|level| level.id() == id)
    }

    /// The conventional `TRANSACTION_*` name of this level.
    pub const fn name(self) -> &'static str {
        match self {
            IsolationLevel::None => "TRANSACTION_NONE",
            IsolationLevel::ReadUncommitted => "TRANSACTION_READ_UNCOMMITTED",
            IsolationLevel::ReadCommitted => "TRANSACTION_READ_COMMITTED",
            IsolationLevel::CursorStability => "TRANSACTION_CURSOR_STABILITY",
            IsolationLevel::RepeatableRead => "TRANSACTION_REPEATABLE_READ",
            IsolationLevel::LastCommitted => "TRANSACTION_LAST_COMMITTED",
            IsolationLevel::Serializable => "TRANSACTION_SERIALIZABLE",
            IsolationLevel::SqlServerSnapshot => "TRANSACTION_SQL_SERVER_SNAPSHOT_ISOLATION_LEVEL",
        }
    }
}

impl Display for IsolationLevel {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for IsolationLevel {
    type Err = Error;

    /// Accepts `TRANSACTION_READ_COMMITTED`, `read_committed` or `2`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let upper = trimmed.to_ascii_uppercase();
        let bare = upper.strip_prefix("TRANSACTION_").unwrap_or(&upper);

        let by_name = Self::ALL
            .into_iter()
            .find(|level| &level.name()["TRANSACTION_".len()..] == bare);

        by_name
            .or_else(|| trimmed.parse::<i32>().ok().and_then(Self::from_id))
            .ok_or_else(|| Error::config(format!("invalid transaction isolation value: {s}")))
    }
}

#[cfg(test)]
mod tests {
    use super::IsolationLevel;

    #[test]
    fn parses_names_with_or_without_prefix() {
        assert_eq!(
            "TRANSACTION_READ_COMMITTED".parse::<IsolationLevel>().unwrap(),
            IsolationLevel::ReadCommitted
        );
        assert_eq!(
            "serializable".parse::<IsolationLevel>().unwrap(),
            IsolationLevel::Serializable
        );
        assert_eq!(
            "transaction_sql_server_snapshot_isolation_level"
                .parse::<IsolationLevel>()
                .unwrap(),
            IsolationLevel::SqlServerSnapshot
        );
    }

    #[test]
    fn parses_numeric_ids() {
        assert_eq!("4".parse::<IsolationLevel>().unwrap(), IsolationLevel::RepeatableRead);
        assert_eq!(
            "4096".parse::<IsolationLevel>().unwrap(),
            IsolationLevel::SqlServerSnapshot
        );
        assert!("7".parse::<IsolationLevel>().is_err());
    }

    #[test]
    fn rejects_unknown_names() {
        assert!("SNAPSHOT".parse::<IsolationLevel>().is_err());
        assert!("".parse::<IsolationLevel>().is_err());
    }
}
