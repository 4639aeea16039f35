use bagpool::pool::PoolOptions;
use bagpool::{Error, PoolSettings};
use bagpool_test::{MockConnection, MockDataSource};
use std::time::Duration;

const SETTINGS: &str = r#"
pool_name = "inventory"
username = "app"
maximum_pool_size = 4
minimum_idle = 2
connection_timeout = 5000
idle_timeout = 0
max_lifetime = 600000
schema = "stock"
transaction_isolation = "serializable"
initialization_fail_timeout = -1
"#;

#[tokio::test(start_paused = true)]
async fn pool_starts_from_a_settings_document() -> anyhow::Result<()> {
    bagpool_test::setup_if_needed();

    let source = MockDataSource::new();
    let settings = PoolSettings::from_toml_str(SETTINGS)?;

    let pool = PoolOptions::from_settings(&settings)?
        .data_source(source.clone())
        .connect()
        .await?;

    assert_eq!(pool.name(), "inventory");

    let config = pool.config();
    assert_eq!(config.max_pool_size(), 4);
    assert_eq!(config.min_idle(), 2);
    assert_eq!(config.connection_timeout(), Duration::from_secs(5));
    assert_eq!(config.idle_timeout(), Duration::ZERO);
    assert_eq!(config.max_lifetime(), Duration::from_secs(600));
    assert_eq!(config.username().as_deref(), Some("app"));

    let conn = pool.acquire().await?;
    assert_eq!(conn.schema.as_deref(), Some("stock"));
    assert_eq!(conn.isolation, bagpool::IsolationLevel::Serializable);
    assert_eq!(conn.username.as_deref(), Some("app"));

    Ok(())
}

#[test]
fn invalid_settings_are_configuration_errors() {
    let err = PoolSettings::from_toml_str("maximum_pool_size = \"many\"").unwrap_err();
    assert!(matches!(err, Error::Configuration(_)), "{err:?}");

    let settings = PoolSettings {
        transaction_isolation: Some("eventually_consistent".to_owned()),
        ..PoolSettings::default()
    };

    let err = PoolOptions::<MockConnection>::from_settings(&settings).unwrap_err();
    assert!(matches!(err, Error::Configuration(_)), "{err:?}");
}
