use crate::domain::{
    BridgeMetrics, IdentityCache, SubmitOutcome, TelemetryValidator, TransactionCoordinator,
};
use async_trait::async_trait;
use common::domain::{DomainError, DomainResult, IngestionMessage};
use std::sync::Arc;
use tracing::{debug, Span};

/// Single consumer of inbound broker messages
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, message: IngestionMessage) -> DomainResult<()>;
}

/// Validator, identity resolution and coordinator chained together
pub struct TelemetryPipeline {
    validator: TelemetryValidator,
    identity: Arc<IdentityCache>,
    coordinator: Arc<TransactionCoordinator>,
    metrics: Arc<BridgeMetrics>,
}

impl TelemetryPipeline {
    pub fn new(
        identity: Arc<IdentityCache>,
        coordinator: Arc<TransactionCoordinator>,
        metrics: Arc<BridgeMetrics>,
    ) -> Self {
        Self {
            validator: TelemetryValidator::new(),
            identity,
            coordinator,
            metrics,
        }
    }
}

#[async_trait]
impl MessageHandler for TelemetryPipeline {
    async fn handle(&self, message: IngestionMessage) -> DomainResult<()> {
        self.metrics.record_received();

        let normalized = self.validator.parse(&message).inspect_err(|_| {
            self.metrics.record_validation_rejected();
        })?;

        let Some(mapping) = self.identity.lookup(&normalized.external_id) else {
            self.metrics.record_unresolved_identity();
            return Err(DomainError::UnresolvedIdentity(normalized.external_id));
        };

        let span = Span::current();
        span.record("tenant_id", mapping.tenant_id.as_str());
        span.record("device_id", mapping.platform_device_id.as_str());

        let resolved = normalized.resolve(mapping.tenant_id, mapping.platform_device_id);
        match self.coordinator.submit(resolved).await? {
            SubmitOutcome::Published => debug!("telemetry published"),
            SubmitOutcome::Completed { published } => {
                debug!(published, "telemetry group published")
            }
            outcome => debug!(?outcome, "telemetry accepted"),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{IdentityCacheConfig, TransactionCoordinatorConfig};
    use chrono::Utc;
    use common::domain::{
        DeviceMapping, MockDeviceMappingSource, MockTelemetryPublisher, ResolvedTelemetry,
    };

    async fn pipeline_with(
        publisher: MockTelemetryPublisher,
    ) -> (TelemetryPipeline, Arc<BridgeMetrics>) {
        let mut source = MockDeviceMappingSource::new();
        source.expect_load_device_mappings().returning(|| {
            Ok(vec![DeviceMapping {
                external_id: "aa:bb:cc".to_string(),
                tenant_id: "T1".to_string(),
                platform_device_id: "dev-1".to_string(),
                protocol: "mqtt".to_string(),
                display_name: "Boiler".to_string(),
            }])
        });
        let identity = Arc::new(IdentityCache::new(
            Arc::new(source),
            IdentityCacheConfig::default(),
        ));
        identity.initialize().await;

        let metrics = Arc::new(BridgeMetrics::new());
        let coordinator = Arc::new(TransactionCoordinator::new(
            Arc::new(publisher),
            None,
            Arc::clone(&metrics),
            TransactionCoordinatorConfig::default(),
        ));
        (
            TelemetryPipeline::new(identity, coordinator, Arc::clone(&metrics)),
            metrics,
        )
    }

    fn message(topic: &str, payload: &str) -> IngestionMessage {
        IngestionMessage {
            topic: topic.to_string(),
            raw_payload: payload.as_bytes().to_vec(),
            qos: 1,
            retained: false,
            received_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_resolved_singleton_published_with_tenant() {
        let mut publisher = MockTelemetryPublisher::new();
        publisher
            .expect_publish()
            .withf(|m: &ResolvedTelemetry| {
                m.tenant_id == "T1" && m.device_id == "dev-1" && m.payload["temp"] == 21.0
            })
            .times(1)
            .returning(|_| Ok(()));

        let (pipeline, metrics) = pipeline_with(publisher).await;
        pipeline
            .handle(message("devices/AA:BB:CC/telemetry", r#"{"temp": 21.0}"#))
            .await
            .unwrap();

        assert_eq!(metrics.snapshot().messages_received, 1);
        assert_eq!(metrics.snapshot().messages_published, 1);
    }

    #[tokio::test]
    async fn test_unresolved_device_dropped_and_counted() {
        let mut publisher = MockTelemetryPublisher::new();
        publisher.expect_publish().times(0);
        publisher.expect_publish_batch().times(0);

        let (pipeline, metrics) = pipeline_with(publisher).await;
        let result = pipeline
            .handle(message("devices/unknown/telemetry", r#"{"temp": 1}"#))
            .await;

        assert!(matches!(result, Err(DomainError::UnresolvedIdentity(id)) if id == "unknown"));
        assert_eq!(metrics.snapshot().unresolved_identity, 1);
    }

    #[tokio::test]
    async fn test_invalid_payload_counted_as_validation_reject() {
        let mut publisher = MockTelemetryPublisher::new();
        publisher.expect_publish().times(0);

        let (pipeline, metrics) = pipeline_with(publisher).await;
        let result = pipeline
            .handle(message("devices/aa:bb:cc/telemetry", "[1,2]"))
            .await;

        assert!(result.unwrap_err().is_validation());
        assert_eq!(metrics.snapshot().validation_rejected, 1);
        assert_eq!(metrics.snapshot().unresolved_identity, 0);
    }
}
