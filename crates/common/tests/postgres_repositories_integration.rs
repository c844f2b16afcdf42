#![cfg(feature = "integration-tests")]

use chrono::Utc;
use common::domain::{
    DeviceMappingSource, SettingsSource, SystemSettings, TelemetryTransaction,
    TelemetryTransactionRepository, TransactionStatus,
};
use common::postgres::{
    PostgresClient, PostgresConfig, PostgresDeviceMappingRepository, PostgresSettingsRepository,
    PostgresTelemetryTransactionRepository,
};
use testcontainers::runners::AsyncRunner;
use testcontainers::ContainerAsync;
use testcontainers_modules::postgres::Postgres;

const PLATFORM_SCHEMA: &str = include_str!("fixtures/platform_schema.sql");

async fn setup_test_db() -> (ContainerAsync<Postgres>, PostgresClient) {
    let postgres = Postgres::default().start().await.unwrap();
    let host = postgres.get_host().await.unwrap();
    let port = postgres.get_host_port_ipv4(5432).await.unwrap();

    let client = PostgresClient::new(&PostgresConfig {
        host: host.to_string(),
        port,
        database: "postgres".to_string(),
        username: "postgres".to_string(),
        password: "postgres".to_string(),
        max_pool_size: 2,
    })
    .expect("Failed to create client");

    client
        .get_connection()
        .await
        .unwrap()
        .batch_execute(PLATFORM_SCHEMA)
        .await
        .expect("Schema setup failed");

    (postgres, client)
}

async fn execute(client: &PostgresClient, sql: &str) {
    client
        .get_connection()
        .await
        .unwrap()
        .batch_execute(sql)
        .await
        .unwrap();
}

#[tokio::test]
async fn test_load_device_mappings_filters_and_normalizes() {
    let (_container, client) = setup_test_db().await;
    execute(
        &client,
        "INSERT INTO devices (id, tenant_id, name, logical_id, protocol, status) VALUES
            ('dev-1', 'T1', 'Boiler', ' AA:BB:CC ', 'mqtt', 'active'),
            ('dev-2', 'T1', NULL, 'dd:ee:ff', 'mqtt', 'active'),
            ('dev-3', 'T2', 'Retired', '11:22:33', 'mqtt', 'inactive'),
            ('dev-4', 'T2', 'No logical id', NULL, 'mqtt', 'active'),
            ('dev-5', 'T2', 'Other transport', '44:55:66', 'lorawan', 'active')",
    )
    .await;

    let repo = PostgresDeviceMappingRepository::new(client, "mqtt");
    let mut mappings = repo.load_device_mappings().await.unwrap();
    mappings.sort_by(|a, b| a.platform_device_id.cmp(&b.platform_device_id));

    assert_eq!(mappings.len(), 2);
    assert_eq!(mappings[0].external_id, "aa:bb:cc");
    assert_eq!(mappings[0].tenant_id, "T1");
    assert_eq!(mappings[0].display_name, "Boiler");
    assert_eq!(mappings[1].external_id, "dd:ee:ff");
    assert_eq!(mappings[1].display_name, "dev-2");
}

#[tokio::test]
async fn test_load_settings_absent_then_present() {
    let (_container, client) = setup_test_db().await;
    let repo = PostgresSettingsRepository::new(client.clone(), "integrations", "chirpstack");

    assert!(repo.load_settings().await.unwrap().is_none());

    execute(
        &client,
        r#"INSERT INTO system_settings (category, key, value) VALUES
            ('integrations', 'chirpstack',
             '{"chirpStackIntegrationEnabled": false, "topicPattern": "lora/+/up"}')"#,
    )
    .await;

    let settings = repo.load_settings().await.unwrap().unwrap();
    assert_eq!(
        settings,
        SystemSettings {
            chirp_stack_integration_enabled: false,
            topic_pattern: "lora/+/up".to_string(),
            description: String::new(),
        }
    );
}

#[tokio::test]
async fn test_malformed_settings_row_is_an_error() {
    let (_container, client) = setup_test_db().await;
    execute(
        &client,
        r#"INSERT INTO system_settings (category, key, value) VALUES
            ('integrations', 'chirpstack', '{"topicPattern": 42}')"#,
    )
    .await;

    let repo = PostgresSettingsRepository::new(client, "integrations", "chirpstack");
    assert!(repo.load_settings().await.is_err());
}

#[tokio::test]
async fn test_record_transaction_upserts_by_correlation_id() {
    let (_container, client) = setup_test_db().await;
    let repo = PostgresTelemetryTransactionRepository::new(client.clone());

    let mut transaction = TelemetryTransaction {
        id: xid::new().to_string(),
        tenant_id: "T1".to_string(),
        correlation_id: "tx1".to_string(),
        gateway_device_id: "gw-1".to_string(),
        total_logical_devices: 3,
        processed_devices: 1,
        status: TransactionStatus::Pending,
        started_at: Utc::now(),
        completed_at: None,
        error_message: None,
    };
    repo.record_transaction(&transaction).await.unwrap();

    transaction.processed_devices = 2;
    transaction.finish(
        TransactionStatus::Expired,
        Some("1 of 3 sub-messages never arrived".to_string()),
    );
    repo.record_transaction(&transaction).await.unwrap();

    let conn = client.get_connection().await.unwrap();
    let rows = conn
        .query(
            "SELECT status, processed_devices, completed_at IS NOT NULL, error_message
             FROM telemetry_transactions WHERE correlation_id = $1",
            &[&"tx1"],
        )
        .await
        .unwrap();

    assert_eq!(rows.len(), 1);
    let status: String = rows[0].get(0);
    let processed: i32 = rows[0].get(1);
    let completed: bool = rows[0].get(2);
    let error: Option<String> = rows[0].get(3);
    assert_eq!(status, "expired");
    assert_eq!(processed, 2);
    assert!(completed);
    assert_eq!(error.as_deref(), Some("1 of 3 sub-messages never arrived"));
}
