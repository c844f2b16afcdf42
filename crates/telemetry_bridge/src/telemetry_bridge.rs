use crate::domain::{
    BridgeMetrics, IdentityCache, IdentityCacheConfig, MessageHandler, SettingsCache,
    SettingsCacheConfig, TelemetryPipeline, TransactionCoordinator, TransactionCoordinatorConfig,
};
use crate::mqtt::{ConnectionState, MqttSubscriber, MqttSubscriberConfig};
use crate::nats::{StreamPublisher, StreamPublisherConfig};
use anyhow::Context;
use common::domain::{DeviceMappingSource, SettingsSource, TelemetryTransactionRepository};
use common::nats::JetStreamPublisher;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

pub type BridgeProcess = Box<
    dyn FnOnce(CancellationToken) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>>
        + Send,
>;

pub struct TelemetryBridgeConfig {
    pub mqtt: MqttSubscriberConfig,
    pub stream: StreamPublisherConfig,
    pub identity: IdentityCacheConfig,
    pub settings: SettingsCacheConfig,
    pub coordinator: TransactionCoordinatorConfig,
    /// Time pending groups get to complete once ingestion has stopped
    pub drain_grace: Duration,
}

/// External collaborators the bridge reads from and writes to
pub struct TelemetryBridgeSources {
    pub device_mappings: Arc<dyn DeviceMappingSource>,
    pub settings: Arc<dyn SettingsSource>,
    pub transaction_audit: Option<Arc<dyn TelemetryTransactionRepository>>,
    pub jetstream: Arc<dyn JetStreamPublisher>,
}

pub struct TelemetryBridge {
    identity: Arc<IdentityCache>,
    settings: Arc<SettingsCache>,
    coordinator: Arc<TransactionCoordinator>,
    subscriber: Arc<MqttSubscriber>,
    metrics: Arc<BridgeMetrics>,
    drain_grace: Duration,
}

impl TelemetryBridge {
    /// Prepare the destination stream and load both caches.
    ///
    /// Stream setup failure is fatal; cache load failures are not.
    pub async fn new(
        sources: TelemetryBridgeSources,
        config: TelemetryBridgeConfig,
    ) -> anyhow::Result<Self> {
        info!("initializing telemetry bridge");

        let stream_config = config
            .stream
            .covering_group_timeout(config.coordinator.group_timeout);
        let publisher = Arc::new(StreamPublisher::new(sources.jetstream, stream_config));
        publisher
            .ensure_destination()
            .await
            .context("failed to prepare destination stream")?;

        let identity = Arc::new(IdentityCache::new(sources.device_mappings, config.identity));
        identity.initialize().await;

        let settings = Arc::new(SettingsCache::new(sources.settings, config.settings));
        settings.initialize().await;

        let metrics = Arc::new(BridgeMetrics::new());
        let coordinator = Arc::new(TransactionCoordinator::new(
            publisher,
            sources.transaction_audit,
            Arc::clone(&metrics),
            config.coordinator,
        ));

        let pipeline: Arc<dyn MessageHandler> = Arc::new(TelemetryPipeline::new(
            Arc::clone(&identity),
            Arc::clone(&coordinator),
            Arc::clone(&metrics),
        ));
        let subscriber = Arc::new(MqttSubscriber::new(
            config.mqtt,
            pipeline,
            Arc::clone(&settings),
            Arc::clone(&metrics),
        ));

        info!(
            identities = identity.len(),
            chirpstack_enabled = settings.current().chirp_stack_integration_enabled,
            "telemetry bridge initialized"
        );

        Ok(Self {
            identity,
            settings,
            coordinator,
            subscriber,
            metrics,
            drain_grace: config.drain_grace,
        })
    }

    pub fn metrics(&self) -> Arc<BridgeMetrics> {
        Arc::clone(&self.metrics)
    }

    pub fn connection_state(&self) -> watch::Receiver<ConnectionState> {
        self.subscriber.state()
    }

    /// Long-lived processes, named for the runner.
    ///
    /// Ingestion drains its in-flight messages first and then gives pending
    /// transaction groups `drain_grace` before expiring them.
    pub fn into_runner_processes(self) -> Vec<(&'static str, BridgeProcess)> {
        vec![
            (
                "mqtt_ingestion",
                Box::new({
                    let subscriber = self.subscriber;
                    let coordinator = Arc::clone(&self.coordinator);
                    let metrics = Arc::clone(&self.metrics);
                    let drain_grace = self.drain_grace;
                    move |ctx| {
                        Box::pin(async move {
                            let result = subscriber.run(ctx).await;
                            let expired = coordinator.drain(drain_grace).await;
                            if expired > 0 {
                                warn!(expired, "transactions left incomplete at shutdown");
                            }
                            metrics.log_summary();
                            result.context("MQTT ingestion stopped")
                        })
                    }
                }),
            ),
            (
                "identity_refresh",
                Box::new({
                    let identity = self.identity;
                    move |ctx| {
                        Box::pin(async move {
                            identity.run_refresh_loop(ctx).await;
                            Ok(())
                        })
                    }
                }),
            ),
            (
                "settings_refresh",
                Box::new({
                    let settings = self.settings;
                    move |ctx| {
                        Box::pin(async move {
                            settings.run_refresh_loop(ctx).await;
                            Ok(())
                        })
                    }
                }),
            ),
            (
                "transaction_sweep",
                Box::new({
                    let coordinator = self.coordinator;
                    move |ctx| {
                        Box::pin(async move {
                            coordinator.run_sweep_loop(ctx).await;
                            Ok(())
                        })
                    }
                }),
            ),
        ]
    }
}
