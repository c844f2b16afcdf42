use crate::nats::traits::JetStreamPublisher;
use anyhow::{Context, Result};
use async_nats::jetstream;
use async_nats::jetstream::context::{GetStreamError, GetStreamErrorKind};
use async_nats::jetstream::ErrorCode;
use async_nats::HeaderMap;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, instrument};

/// Upper bound for the client's internal reconnect delay
const MAX_RECONNECT_DELAY: Duration = Duration::from_secs(8);

pub struct NatsClient {
    client: async_nats::Client,
    jetstream: jetstream::Context,
}

impl NatsClient {
    pub async fn connect(url: &str, timeout: Duration) -> Result<Self> {
        info!(url = %url, timeout_ms = timeout.as_millis(), "Connecting to NATS");

        // The client reconnects on its own after the initial connection;
        // delays grow exponentially up to MAX_RECONNECT_DELAY
        let client = async_nats::ConnectOptions::new()
            .connection_timeout(timeout)
            .reconnect_delay_callback(reconnect_delay)
            .connect(url)
            .await
            .context("Failed to connect to NATS")?;

        let jetstream = jetstream::new(client.clone());

        info!("Successfully connected to NATS");
        Ok(Self { client, jetstream })
    }

    pub fn jetstream(&self) -> &jetstream::Context {
        &self.jetstream
    }

    /// Create a JetStreamPublisher trait object from this client
    pub fn create_publisher_client(&self) -> Arc<dyn JetStreamPublisher> {
        Arc::new(NatsJetStreamPublisher::new(self.jetstream.clone()))
    }

    /// Flush pending publishes and drop the connection
    pub async fn close(self) {
        info!("Closing NATS connection");
        if let Err(e) = self.client.flush().await {
            tracing::warn!(error = %e, "failed to flush NATS connection on close");
        }
    }
}

fn reconnect_delay(attempts: usize) -> Duration {
    let exponent = attempts.min(10) as u32;
    Duration::from_millis(100u64.saturating_mul(2u64.pow(exponent))).min(MAX_RECONNECT_DELAY)
}

fn is_stream_not_found(error: &GetStreamError) -> bool {
    matches!(
        error.kind(),
        GetStreamErrorKind::JetStream(e) if e.error_code() == ErrorCode::STREAM_NOT_FOUND
    )
}

/// Concrete implementation of JetStreamPublisher using async-nats
pub struct NatsJetStreamPublisher {
    context: jetstream::Context,
}

impl NatsJetStreamPublisher {
    pub fn new(context: jetstream::Context) -> Self {
        Self { context }
    }
}

#[async_trait]
impl JetStreamPublisher for NatsJetStreamPublisher {
    async fn stream_exists(&self, stream_name: &str) -> Result<bool> {
        match self.context.get_stream(stream_name).await {
            Ok(_) => Ok(true),
            Err(e) if is_stream_not_found(&e) => Ok(false),
            Err(e) => Err(anyhow::Error::new(e).context("Failed to look up stream")),
        }
    }

    async fn create_stream(&self, config: jetstream::stream::Config) -> Result<()> {
        self.context
            .create_stream(config)
            .await
            .context("Failed to create stream")?;
        Ok(())
    }

    #[instrument(skip(self, headers, payload), fields(subject = %subject, payload_size = payload.len()))]
    async fn publish_with_headers(
        &self,
        subject: String,
        headers: HeaderMap,
        payload: bytes::Bytes,
    ) -> Result<bool> {
        let ack = self
            .context
            .publish_with_headers(subject, headers, payload)
            .await
            .context("Failed to publish message to JetStream")?;

        let ack = ack
            .await
            .context("Failed to receive JetStream acknowledgment")?;
        Ok(ack.duplicate)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reconnect_delay_is_bounded() {
        assert_eq!(reconnect_delay(0), Duration::from_millis(100));
        assert_eq!(reconnect_delay(3), Duration::from_millis(800));
        assert_eq!(reconnect_delay(50), MAX_RECONNECT_DELAY);
    }
}
