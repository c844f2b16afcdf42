use async_nats::header::NATS_MESSAGE_ID;
use async_nats::jetstream::stream::{Config as StreamConfig, RetentionPolicy, StorageType};
use async_nats::HeaderMap;
use async_trait::async_trait;
use common::domain::{
    BatchPublishReport, DomainError, DomainResult, PublishOutcome, ResolvedTelemetry,
    TelemetryPublisher,
};
use common::nats::{inject_trace_context, JetStreamPublisher};
use futures::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

#[derive(Debug, Clone)]
pub struct StreamPublisherConfig {
    pub stream_name: String,
    pub subject_prefix: String,
    pub max_messages: i64,
    pub max_bytes: i64,
    pub max_age: Duration,
    pub duplicate_window: Duration,
    pub publish_timeout: Duration,
}

impl Default for StreamPublisherConfig {
    fn default() -> Self {
        Self {
            stream_name: "TELEMETRY".to_string(),
            subject_prefix: "telemetry".to_string(),
            max_messages: 10_000_000,
            max_bytes: 10 * 1024 * 1024 * 1024,
            max_age: Duration::from_secs(7 * 24 * 60 * 60),
            duplicate_window: Duration::from_secs(600),
            publish_timeout: Duration::from_secs(5),
        }
    }
}

impl StreamPublisherConfig {
    /// Raise the duplicate window so it covers at least `group_timeout`.
    ///
    /// A group member redelivered just before its group expires must still
    /// be recognized by the stream.
    pub fn covering_group_timeout(mut self, group_timeout: Duration) -> Self {
        if self.duplicate_window < group_timeout {
            warn!(
                configured_secs = self.duplicate_window.as_secs(),
                raised_to_secs = group_timeout.as_secs(),
                "duplicate window shorter than transaction timeout, raising it"
            );
            self.duplicate_window = group_timeout;
        }
        self
    }

    fn stream_config(&self) -> StreamConfig {
        StreamConfig {
            name: self.stream_name.clone(),
            description: Some("Tenant-tagged device telemetry".to_string()),
            subjects: vec![format!("{}.>", self.subject_prefix)],
            storage: StorageType::File,
            retention: RetentionPolicy::Limits,
            max_messages: self.max_messages,
            max_bytes: self.max_bytes,
            max_age: self.max_age,
            duplicate_window: self.duplicate_window,
            ..Default::default()
        }
    }
}

/// Publishes resolved telemetry to a deduplicated JetStream stream as JSON
pub struct StreamPublisher {
    jetstream: Arc<dyn JetStreamPublisher>,
    config: StreamPublisherConfig,
}

impl StreamPublisher {
    pub fn new(jetstream: Arc<dyn JetStreamPublisher>, config: StreamPublisherConfig) -> Self {
        debug!(
            stream = %config.stream_name,
            subject_prefix = %config.subject_prefix,
            "initialized StreamPublisher"
        );
        Self { jetstream, config }
    }

    /// Create the stream unless it already exists. An existing stream is
    /// never modified.
    #[instrument(skip(self), fields(stream = %self.config.stream_name))]
    pub async fn ensure_destination(&self) -> DomainResult<()> {
        let exists = self
            .jetstream
            .stream_exists(&self.config.stream_name)
            .await
            .map_err(DomainError::RepositoryError)?;
        if exists {
            info!("stream already exists");
            return Ok(());
        }

        self.jetstream
            .create_stream(self.config.stream_config())
            .await
            .map_err(DomainError::RepositoryError)?;

        info!(
            subjects = %format!("{}.>", self.config.subject_prefix),
            duplicate_window_secs = self.config.duplicate_window.as_secs(),
            "created stream"
        );
        Ok(())
    }

    pub fn subject_for(&self, message: &ResolvedTelemetry) -> String {
        format!(
            "{}.{}.{}",
            self.config.subject_prefix,
            sanitize_token(&message.tenant_id),
            sanitize_token(&message.device_id)
        )
    }
}

/// Make a value safe to use as a single subject token
fn sanitize_token(value: &str) -> String {
    let token: String = value
        .chars()
        .map(|c| match c {
            '.' | '*' | '>' => '_',
            c if c.is_whitespace() => '_',
            c => c,
        })
        .collect();
    if token.is_empty() {
        "_".to_string()
    } else {
        token
    }
}

#[async_trait]
impl TelemetryPublisher for StreamPublisher {
    #[instrument(skip_all, fields(message_id = tracing::field::Empty, subject = tracing::field::Empty))]
    async fn publish(&self, message: &ResolvedTelemetry) -> DomainResult<()> {
        let message_id = message.message_id();
        let subject = self.subject_for(message);
        let span = tracing::Span::current();
        span.record("message_id", message_id.as_str());
        span.record("subject", subject.as_str());

        let payload = serde_json::to_vec(message).map_err(|e| {
            DomainError::InvalidPayload(format!("failed to serialize telemetry: {}", e))
        })?;

        let mut headers = HeaderMap::new();
        headers.insert(NATS_MESSAGE_ID, message_id.as_str());
        inject_trace_context(&mut headers);

        let publish = self
            .jetstream
            .publish_with_headers(subject, headers, payload.into());

        match tokio::time::timeout(self.config.publish_timeout, publish).await {
            Err(_) => Err(DomainError::Timeout(format!(
                "publish of {} not acknowledged within {:?}",
                message_id, self.config.publish_timeout
            ))),
            Ok(Err(e)) => Err(DomainError::PublishFailed(message_id, format!("{:#}", e))),
            Ok(Ok(duplicate)) => {
                if duplicate {
                    debug!("stream already held this message id");
                } else {
                    debug!("telemetry published");
                }
                Ok(())
            }
        }
    }

    async fn publish_batch(&self, messages: &[ResolvedTelemetry]) -> BatchPublishReport {
        let results = join_all(messages.iter().map(|message| self.publish(message))).await;

        let outcomes = messages
            .iter()
            .zip(results)
            .map(|(message, result)| PublishOutcome {
                message_id: message.message_id(),
                error: result.err().map(|e| e.to_string()),
            })
            .collect();

        BatchPublishReport { outcomes }
    }
}
