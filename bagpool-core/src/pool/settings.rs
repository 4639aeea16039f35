use std::time::Duration;

use super::options::PoolOptions;
use crate::connection::Connection;
use crate::error::{Error, Result};
use crate::isolation_level::IsolationLevel;

/// Pool settings as written in a TOML document.
///
/// Every field is optional; anything not set keeps the [`PoolOptions`] default. Durations
/// are given in milliseconds. The connection source cannot be described here and must be
/// set on the resulting options.
///
/// ### Example
/// ```toml
/// pool_name = "reporting"
/// maximum_pool_size = 20
/// minimum_idle = 5
/// connection_timeout = 5000
/// # disables idle eviction
/// idle_timeout = 0
/// transaction_isolation = "read_committed"
/// ```
#[derive(Debug, Default, Clone, PartialEq, Eq, serde::Deserialize)]
#[serde(default, rename_all = "snake_case", deny_unknown_fields)]
pub struct PoolSettings {
    pub pool_name: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub catalog: Option<String>,
    pub schema: Option<String>,
    pub read_only: Option<bool>,
    pub auto_commit: Option<bool>,
    /// Parsed with [`IsolationLevel`]'s `FromStr` impl.
    pub transaction_isolation: Option<String>,
    pub connection_test_query: Option<String>,
    pub connection_init_sql: Option<String>,
    pub isolate_internal_queries: Option<bool>,
    pub allow_pool_suspension: Option<bool>,
    pub fail_if_suspended: Option<bool>,
    /// A negative value skips the initialization check.
    pub initialization_fail_timeout: Option<i64>,
    pub connection_timeout: Option<u64>,
    pub validation_timeout: Option<u64>,
    pub idle_timeout: Option<u64>,
    pub max_lifetime: Option<u64>,
    pub leak_detection_threshold: Option<u64>,
    pub maximum_pool_size: Option<u32>,
    pub minimum_idle: Option<u32>,
    pub housekeeping_period: Option<u64>,
    pub alive_bypass_window: Option<u64>,
    pub shutdown_grace_period: Option<u64>,
}

impl PoolSettings {
    pub fn from_toml_str(document: &str) -> Result<Self> {
        toml::from_str(document).map_err(|e| Error::config(format!("invalid pool settings: {e}")))
    }
}

impl<C: Connection> PoolOptions<C> {
    /// Start from the defaults, overridden by every field set in `settings`.
    pub fn from_settings(settings: &PoolSettings) -> Result<Self> {
        let mut options = PoolOptions::new();
        let settings = settings.clone();

        if let Some(level) = &settings.transaction_isolation {
            options = options.transaction_isolation(level.parse::<IsolationLevel>()?);
        }

        macro_rules! apply {
            ($($field:ident => $setter:ident),* $(,)?) => {$(
                if let Some(value) = settings.$field {
                    options = options.$setter(value);
                }
            )*};
        }

        macro_rules! apply_millis {
            ($($field:ident),* $(,)?) => {$(
                if let Some(millis) = settings.$field {
                    options = options.$field(Duration::from_millis(millis));
                }
            )*};
        }

        apply! {
            pool_name => pool_name,
            username => username,
            password => password,
            catalog => catalog,
            schema => schema,
            read_only => read_only,
            auto_commit => auto_commit,
            connection_test_query => connection_test_query,
            connection_init_sql => connection_init_sql,
            isolate_internal_queries => isolate_internal_queries,
            allow_pool_suspension => allow_pool_suspension,
            fail_if_suspended => fail_if_suspended,
            maximum_pool_size => max_pool_size,
            minimum_idle => min_idle,
        }

        apply_millis! {
            connection_timeout,
            validation_timeout,
            idle_timeout,
            max_lifetime,
            leak_detection_threshold,
            housekeeping_period,
            alive_bypass_window,
            shutdown_grace_period,
        }

        if let Some(millis) = settings.initialization_fail_timeout {
            let timeout = u64::try_from(millis).ok().map(Duration::from_millis);
            options = options.initialization_fail_timeout(timeout);
        }

        Ok(options)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_partial_document() {
        let settings = PoolSettings::from_toml_str(
            r#"
            pool_name = "reporting"
            maximum_pool_size = 20
            idle_timeout = 0
            initialization_fail_timeout = -1
            transaction_isolation = "read_committed"
            "#,
        )
        .unwrap();

        assert_eq!(settings.pool_name.as_deref(), Some("reporting"));
        assert_eq!(settings.maximum_pool_size, Some(20));
        assert_eq!(settings.idle_timeout, Some(0));
        assert_eq!(settings.initialization_fail_timeout, Some(-1));
        assert_eq!(settings.minimum_idle, None);
    }

    #[test]
    fn rejects_unknown_fields() {
        let err = PoolSettings::from_toml_str("maximumPoolSize = 3").unwrap_err();
        assert!(matches!(err, Error::Configuration(_)), "{err:?}");
    }
}
