use common::postgres::PostgresConfig;
use common::telemetry::TelemetryConfig;
use config::{Config, ConfigError, Environment};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use telemetry_bridge::domain::{
    IdentityCacheConfig, RetryPolicy, SettingsCacheConfig, TransactionCoordinatorConfig,
};
use telemetry_bridge::mqtt::MqttSubscriberConfig;
use telemetry_bridge::nats::StreamPublisherConfig;
use telemetry_bridge::telemetry_bridge::TelemetryBridgeConfig;

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ServiceConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    // OpenTelemetry configuration
    #[serde(default = "default_otel_service_name")]
    pub otel_service_name: String,

    #[serde(default = "default_otel_endpoint")]
    pub otel_endpoint: String,

    #[serde(default)]
    pub otel_enabled: bool,

    #[serde(default = "default_otel_metrics_interval_secs")]
    pub otel_metrics_interval_secs: u64,

    // MQTT configuration
    /// Broker URL (`mqtt://host:port`)
    #[serde(default = "default_mqtt_broker_url")]
    pub mqtt_broker_url: String,

    #[serde(default = "default_mqtt_client_id")]
    pub mqtt_client_id: String,

    #[serde(default)]
    pub mqtt_username: Option<String>,

    #[serde(default)]
    pub mqtt_password: Option<String>,

    #[serde(default = "default_mqtt_keep_alive_secs")]
    pub mqtt_keep_alive_secs: u64,

    /// Persistent sessions let the broker queue QoS 1 messages while we are away
    #[serde(default)]
    pub mqtt_clean_session: bool,

    #[serde(default = "default_mqtt_reconnect_base_ms")]
    pub mqtt_reconnect_base_ms: u64,

    #[serde(default = "default_mqtt_reconnect_max_ms")]
    pub mqtt_reconnect_max_ms: u64,

    /// Failed connection attempts tolerated before the first session
    #[serde(default = "default_mqtt_startup_max_attempts")]
    pub mqtt_startup_max_attempts: u32,

    #[serde(default = "default_mqtt_max_in_flight")]
    pub mqtt_max_in_flight: usize,

    // NATS configuration
    #[serde(default = "default_nats_url")]
    pub nats_url: String,

    #[serde(default = "default_nats_stream_name")]
    pub nats_stream_name: String,

    #[serde(default = "default_nats_subject_prefix")]
    pub nats_subject_prefix: String,

    #[serde(default = "default_nats_max_messages")]
    pub nats_max_messages: i64,

    #[serde(default = "default_nats_max_bytes")]
    pub nats_max_bytes: i64,

    #[serde(default = "default_nats_max_age_secs")]
    pub nats_max_age_secs: u64,

    /// Raised to the coordinator timeout when shorter
    #[serde(default = "default_nats_duplicate_window_secs")]
    pub nats_duplicate_window_secs: u64,

    #[serde(default = "default_nats_publish_timeout_ms")]
    pub nats_publish_timeout_ms: u64,

    #[serde(default = "default_publish_max_attempts")]
    pub publish_max_attempts: u32,

    // PostgreSQL configuration
    #[serde(default = "default_postgres_host")]
    pub postgres_host: String,

    #[serde(default = "default_postgres_port")]
    pub postgres_port: u16,

    #[serde(default = "default_postgres_database")]
    pub postgres_database: String,

    #[serde(default = "default_postgres_username")]
    pub postgres_username: String,

    #[serde(default = "default_postgres_password")]
    pub postgres_password: String,

    #[serde(default = "default_postgres_max_pool_size")]
    pub postgres_max_pool_size: usize,

    // Identity and settings caches
    /// Transport tag a device row must carry to be mapped
    #[serde(default = "default_identity_protocol")]
    pub identity_protocol: String,

    #[serde(default = "default_identity_refresh_secs")]
    pub identity_refresh_secs: u64,

    #[serde(default = "default_source_timeout_secs")]
    pub identity_load_timeout_secs: u64,

    #[serde(default = "default_settings_refresh_secs")]
    pub settings_refresh_secs: u64,

    #[serde(default = "default_source_timeout_secs")]
    pub settings_load_timeout_secs: u64,

    #[serde(default = "default_settings_category")]
    pub settings_category: String,

    #[serde(default = "default_settings_key")]
    pub settings_key: String,

    // Transaction coordinator
    #[serde(default = "default_transaction_timeout_secs")]
    pub transaction_timeout_secs: u64,

    #[serde(default = "default_max_pending_transactions")]
    pub max_pending_transactions: usize,

    #[serde(default = "default_transaction_sweep_secs")]
    pub transaction_sweep_secs: u64,

    /// How long finished correlation ids are remembered
    #[serde(default = "default_transaction_retention_secs")]
    pub transaction_retention_secs: u64,

    /// Time pending groups get to complete on shutdown
    #[serde(default = "default_drain_grace_secs")]
    pub drain_grace_secs: u64,

    #[serde(default)]
    pub transaction_audit_enabled: bool,

    /// Startup timeout for initialization operations in seconds
    #[serde(default = "default_startup_timeout_secs")]
    pub startup_timeout_secs: u64,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_otel_service_name() -> String {
    "telemetry-bridge".to_string()
}

fn default_otel_endpoint() -> String {
    "http://localhost:4317".to_string()
}

fn default_otel_metrics_interval_secs() -> u64 {
    30
}

fn default_mqtt_broker_url() -> String {
    "mqtt://localhost:1883".to_string()
}

fn default_mqtt_client_id() -> String {
    "telemetry-bridge".to_string()
}

fn default_mqtt_keep_alive_secs() -> u64 {
    30
}

fn default_mqtt_reconnect_base_ms() -> u64 {
    500
}

fn default_mqtt_reconnect_max_ms() -> u64 {
    30_000
}

fn default_mqtt_startup_max_attempts() -> u32 {
    10
}

fn default_mqtt_max_in_flight() -> usize {
    256
}

fn default_nats_url() -> String {
    "nats://localhost:4222".to_string()
}

fn default_nats_stream_name() -> String {
    "TELEMETRY".to_string()
}

fn default_nats_subject_prefix() -> String {
    "telemetry".to_string()
}

fn default_nats_max_messages() -> i64 {
    10_000_000
}

fn default_nats_max_bytes() -> i64 {
    10 * 1024 * 1024 * 1024
}

fn default_nats_max_age_secs() -> u64 {
    7 * 24 * 60 * 60
}

fn default_nats_duplicate_window_secs() -> u64 {
    600
}

fn default_nats_publish_timeout_ms() -> u64 {
    5_000
}

fn default_publish_max_attempts() -> u32 {
    3
}

fn default_postgres_host() -> String {
    "localhost".to_string()
}

fn default_postgres_port() -> u16 {
    5432
}

fn default_postgres_database() -> String {
    "platform".to_string()
}

fn default_postgres_username() -> String {
    "bridge".to_string()
}

fn default_postgres_password() -> String {
    "bridge".to_string()
}

fn default_postgres_max_pool_size() -> usize {
    4
}

fn default_identity_protocol() -> String {
    "mqtt".to_string()
}

fn default_identity_refresh_secs() -> u64 {
    300
}

fn default_source_timeout_secs() -> u64 {
    10
}

fn default_settings_refresh_secs() -> u64 {
    300
}

fn default_settings_category() -> String {
    "integrations".to_string()
}

fn default_settings_key() -> String {
    "chirpstack".to_string()
}

fn default_transaction_timeout_secs() -> u64 {
    300
}

fn default_max_pending_transactions() -> usize {
    10_000
}

fn default_transaction_sweep_secs() -> u64 {
    5
}

fn default_transaction_retention_secs() -> u64 {
    600
}

fn default_drain_grace_secs() -> u64 {
    5
}

fn default_startup_timeout_secs() -> u64 {
    30
}

impl ServiceConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Config::builder()
            .add_source(Environment::with_prefix("TELEMETRY_BRIDGE"))
            .build()?
            .try_deserialize()
    }

    pub fn telemetry_config(&self) -> TelemetryConfig {
        TelemetryConfig {
            service_name: self.otel_service_name.clone(),
            otel_endpoint: self.otel_endpoint.clone(),
            otel_enabled: self.otel_enabled,
            log_level: self.log_level.clone(),
            metrics_export_interval: Duration::from_secs(self.otel_metrics_interval_secs),
        }
    }

    pub fn postgres_config(&self) -> PostgresConfig {
        PostgresConfig {
            host: self.postgres_host.clone(),
            port: self.postgres_port,
            database: self.postgres_database.clone(),
            username: self.postgres_username.clone(),
            password: self.postgres_password.clone(),
            max_pool_size: self.postgres_max_pool_size,
        }
    }

    pub fn bridge_config(&self) -> TelemetryBridgeConfig {
        let startup_timeout = Duration::from_secs(self.startup_timeout_secs);

        TelemetryBridgeConfig {
            mqtt: MqttSubscriberConfig {
                broker_url: self.mqtt_broker_url.clone(),
                client_id: self.mqtt_client_id.clone(),
                username: self.mqtt_username.clone(),
                password: self.mqtt_password.clone(),
                keep_alive: Duration::from_secs(self.mqtt_keep_alive_secs),
                clean_session: self.mqtt_clean_session,
                reconnect_base_delay: Duration::from_millis(self.mqtt_reconnect_base_ms),
                reconnect_max_delay: Duration::from_millis(self.mqtt_reconnect_max_ms),
                startup_max_attempts: self.mqtt_startup_max_attempts,
                max_in_flight: self.mqtt_max_in_flight,
                ..Default::default()
            },
            stream: StreamPublisherConfig {
                stream_name: self.nats_stream_name.clone(),
                subject_prefix: self.nats_subject_prefix.clone(),
                max_messages: self.nats_max_messages,
                max_bytes: self.nats_max_bytes,
                max_age: Duration::from_secs(self.nats_max_age_secs),
                duplicate_window: Duration::from_secs(self.nats_duplicate_window_secs),
                publish_timeout: Duration::from_millis(self.nats_publish_timeout_ms),
            },
            identity: IdentityCacheConfig {
                refresh_interval: Duration::from_secs(self.identity_refresh_secs),
                load_timeout: Duration::from_secs(self.identity_load_timeout_secs)
                    .min(startup_timeout),
            },
            settings: SettingsCacheConfig {
                refresh_interval: Duration::from_secs(self.settings_refresh_secs),
                load_timeout: Duration::from_secs(self.settings_load_timeout_secs)
                    .min(startup_timeout),
            },
            coordinator: TransactionCoordinatorConfig {
                group_timeout: Duration::from_secs(self.transaction_timeout_secs),
                max_pending_groups: self.max_pending_transactions,
                sweep_interval: Duration::from_secs(self.transaction_sweep_secs),
                retention_grace: Duration::from_secs(self.transaction_retention_secs),
                publish_retry: RetryPolicy {
                    max_attempts: self.publish_max_attempts,
                    ..Default::default()
                },
            },
            drain_grace: Duration::from_secs(self.drain_grace_secs),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    // Mutex to ensure tests run serially and don't interfere with each other
    static TEST_LOCK: Mutex<()> = Mutex::new(());

    const VARS: [&str; 4] = [
        "TELEMETRY_BRIDGE_LOG_LEVEL",
        "TELEMETRY_BRIDGE_MQTT_BROKER_URL",
        "TELEMETRY_BRIDGE_TRANSACTION_TIMEOUT_SECS",
        "TELEMETRY_BRIDGE_NATS_DUPLICATE_WINDOW_SECS",
    ];

    fn clear_env() {
        for var in VARS {
            // SAFETY: Test runs with mutex lock to prevent concurrent env access
            unsafe {
                std::env::remove_var(var);
            }
        }
    }

    #[test]
    fn test_default_config() {
        let _lock = TEST_LOCK.lock().unwrap();
        clear_env();

        let config = ServiceConfig::from_env().unwrap();
        assert_eq!(config.log_level, "info");
        assert_eq!(config.mqtt_broker_url, "mqtt://localhost:1883");
        assert!(!config.mqtt_clean_session);
        assert!(!config.transaction_audit_enabled);
        assert_eq!(
            config.telemetry_config().metrics_export_interval,
            Duration::from_secs(30)
        );

        let bridge = config.bridge_config();
        assert_eq!(bridge.coordinator.group_timeout, Duration::from_secs(300));
        assert_eq!(bridge.coordinator.publish_retry.max_attempts, 3);
        assert_eq!(bridge.stream.stream_name, "TELEMETRY");
        assert_eq!(bridge.mqtt.max_in_flight, 256);
    }

    #[test]
    fn test_custom_config() {
        let _lock = TEST_LOCK.lock().unwrap();

        // SAFETY: Test runs with mutex lock to prevent concurrent env access
        unsafe {
            std::env::set_var("TELEMETRY_BRIDGE_LOG_LEVEL", "debug");
            std::env::set_var("TELEMETRY_BRIDGE_MQTT_BROKER_URL", "mqtt://emqx:1883");
            std::env::set_var("TELEMETRY_BRIDGE_TRANSACTION_TIMEOUT_SECS", "900");
            std::env::set_var("TELEMETRY_BRIDGE_NATS_DUPLICATE_WINDOW_SECS", "120");
        }

        let config = ServiceConfig::from_env().unwrap();
        assert_eq!(config.log_level, "debug");

        let bridge = config.bridge_config();
        assert_eq!(bridge.mqtt.broker_url, "mqtt://emqx:1883");
        assert_eq!(bridge.coordinator.group_timeout, Duration::from_secs(900));
        assert_eq!(bridge.stream.duplicate_window, Duration::from_secs(120));

        clear_env();
    }
}
