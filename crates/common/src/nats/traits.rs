use anyhow::Result;
use async_nats::jetstream;
use async_nats::HeaderMap;
use async_trait::async_trait;

/// Trait for JetStream publisher operations
/// Abstracts the operations needed to create streams and publish messages
#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
#[async_trait]
pub trait JetStreamPublisher: Send + Sync {
    /// Whether a stream with this name exists.
    ///
    /// A missing stream is `Ok(false)`; transport and server failures are
    /// errors, so callers never mistake an outage for absence.
    async fn stream_exists(&self, stream_name: &str) -> Result<bool>;

    /// Create a new stream with the given configuration
    async fn create_stream(&self, config: jetstream::stream::Config) -> Result<()>;

    /// Publish a message with headers to a subject and await acknowledgment.
    ///
    /// Returns `true` when the stream reported the message as a duplicate.
    async fn publish_with_headers(
        &self,
        subject: String,
        headers: HeaderMap,
        payload: bytes::Bytes,
    ) -> Result<bool>;
}
