mod config;

use bridge_runner::Runner;
use common::domain::TelemetryTransactionRepository;
use common::nats::NatsClient;
use common::postgres::{
    PostgresClient, PostgresDeviceMappingRepository, PostgresSettingsRepository,
    PostgresTelemetryTransactionRepository,
};
use common::telemetry::{init_telemetry, shutdown_telemetry, TelemetryProviders};
use crate::config::ServiceConfig;
use std::sync::Arc;
use std::time::Duration;
use telemetry_bridge::telemetry_bridge::{TelemetryBridge, TelemetryBridgeSources};
use tracing::{debug, error, info};

#[tokio::main]
async fn main() {
    let config = match ServiceConfig::from_env() {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Failed to load configuration: {}", e);
            std::process::exit(1);
        }
    };

    let telemetry_providers: Option<TelemetryProviders> =
        match init_telemetry(&config.telemetry_config()) {
            Ok(providers) => providers,
            Err(e) => {
                eprintln!("Failed to initialize telemetry: {}", e);
                std::process::exit(1);
            }
        };

    info!(
        otel_enabled = config.otel_enabled,
        otel_endpoint = %config.otel_endpoint,
        "Starting telemetry-bridge service"
    );
    debug!("Configuration: {:?}", config);

    let (sources, nats_client) = match initialize_shared_dependencies(&config).await {
        Ok(deps) => deps,
        Err(e) => {
            error!("Failed to initialize shared dependencies: {:#}", e);
            std::process::exit(1);
        }
    };

    let bridge = match TelemetryBridge::new(sources, config.bridge_config()).await {
        Ok(bridge) => bridge,
        Err(e) => {
            error!("Failed to initialize telemetry bridge: {:#}", e);
            std::process::exit(1);
        }
    };

    let mut runner = Runner::new();
    for (name, process) in bridge.into_runner_processes() {
        runner = runner.with_named_process(name, process);
    }

    runner = runner
        .with_closer(move || {
            Box::pin(async move {
                info!("Running cleanup tasks...");
                nats_client.close().await;

                // Flush pending traces and logs
                shutdown_telemetry(telemetry_providers);

                info!("Cleanup complete");
                Ok(())
            })
        })
        .with_closer_timeout(Duration::from_secs(10))
        .with_shutdown_timeout(Duration::from_secs(
            config.drain_grace_secs + config.startup_timeout_secs,
        ));

    runner.run().await;
}

async fn initialize_shared_dependencies(
    config: &ServiceConfig,
) -> anyhow::Result<(TelemetryBridgeSources, NatsClient)> {
    // Pool creation is lazy; an unreachable database only degrades the caches
    info!("Initializing PostgreSQL...");
    let postgres_client = PostgresClient::new(&config.postgres_config())?;

    let transaction_audit: Option<Arc<dyn TelemetryTransactionRepository>> =
        if config.transaction_audit_enabled {
            Some(Arc::new(PostgresTelemetryTransactionRepository::new(
                postgres_client.clone(),
            )))
        } else {
            None
        };

    info!("Initializing NATS...");
    let nats_client = NatsClient::connect(
        &config.nats_url,
        Duration::from_secs(config.startup_timeout_secs),
    )
    .await?;

    let sources = TelemetryBridgeSources {
        device_mappings: Arc::new(PostgresDeviceMappingRepository::new(
            postgres_client.clone(),
            config.identity_protocol.clone(),
        )),
        settings: Arc::new(PostgresSettingsRepository::new(
            postgres_client,
            config.settings_category.clone(),
            config.settings_key.clone(),
        )),
        transaction_audit,
        jetstream: nats_client.create_publisher_client(),
    };

    Ok((sources, nats_client))
}
