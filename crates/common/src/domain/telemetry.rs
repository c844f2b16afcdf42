use crate::domain::result::DomainResult;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

/// Message as received from the source broker, before any parsing
#[derive(Debug, Clone, PartialEq)]
pub struct IngestionMessage {
    pub topic: String,
    pub raw_payload: Vec<u8>,
    pub qos: u8,
    pub retained: bool,
    pub received_at: DateTime<Utc>,
}

/// Structurally validated telemetry, not yet tied to a tenant
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedTelemetry {
    /// Lowercased external identifier used for identity lookup
    pub external_id: String,
    pub gateway_id: Option<String>,
    pub correlation_id: Option<String>,
    pub sequence: Option<u32>,
    pub total: Option<u32>,
    pub timestamp: DateTime<Utc>,
    pub received_at: DateTime<Utc>,
    pub payload: serde_json::Map<String, serde_json::Value>,
}

/// Telemetry whose tenant and platform device are known.
///
/// This is the only shape the publisher accepts.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolvedTelemetry {
    pub tenant_id: String,
    pub device_id: String,
    pub external_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gateway_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sequence: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total: Option<u32>,
    pub timestamp: DateTime<Utc>,
    pub received_at: DateTime<Utc>,
    pub payload: serde_json::Map<String, serde_json::Value>,
}

impl NormalizedTelemetry {
    /// Attach tenant and platform identity
    pub fn resolve(self, tenant_id: String, device_id: String) -> ResolvedTelemetry {
        ResolvedTelemetry {
            tenant_id,
            device_id,
            external_id: self.external_id,
            gateway_id: self.gateway_id,
            correlation_id: self.correlation_id,
            sequence: self.sequence,
            total: self.total,
            timestamp: self.timestamp,
            received_at: self.received_at,
            payload: self.payload,
        }
    }
}

impl ResolvedTelemetry {
    /// Idempotency key used by the stream's duplicate window.
    ///
    /// Group members are keyed by correlation and sequence so redeliveries of
    /// the same sub-message collapse; singletons by device and timestamp.
    pub fn message_id(&self) -> String {
        match (&self.correlation_id, self.sequence) {
            (Some(correlation_id), Some(sequence)) => {
                format!("{}:{}:{}", self.tenant_id, correlation_id, sequence)
            }
            _ => format!(
                "{}:{}:{}",
                self.tenant_id,
                self.device_id,
                self.timestamp.timestamp_millis()
            ),
        }
    }
}

/// Outcome of one message within a batch publish
#[derive(Debug, Clone, PartialEq)]
pub struct PublishOutcome {
    pub message_id: String,
    pub error: Option<String>,
}

/// Per-message report of a batch publish
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatchPublishReport {
    pub outcomes: Vec<PublishOutcome>,
}

impl BatchPublishReport {
    pub fn succeeded(&self) -> usize {
        self.outcomes.iter().filter(|o| o.error.is_none()).count()
    }

    pub fn failed(&self) -> usize {
        self.outcomes.len() - self.succeeded()
    }

    pub fn is_complete_success(&self) -> bool {
        self.failed() == 0
    }
}

/// Trait for publishing resolved telemetry to the destination stream
///
/// Implementations should:
/// - Serialize the message
/// - Publish with the message id as the dedup key
/// - Return error if publish or acknowledgment fails
#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
#[async_trait]
pub trait TelemetryPublisher: Send + Sync {
    /// Publish a single message and await its acknowledgment
    async fn publish(&self, message: &ResolvedTelemetry) -> DomainResult<()>;

    /// Publish every message independently and report each outcome
    async fn publish_batch(&self, messages: &[ResolvedTelemetry]) -> BatchPublishReport;
}
