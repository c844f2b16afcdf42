use thiserror::Error;

pub type DomainResult<T> = Result<T, DomainError>;

#[derive(Error, Debug)]
pub enum DomainError {
    #[error("Invalid payload: {0}")]
    InvalidPayload(String),

    #[error("Missing device identifier on topic: {0}")]
    MissingDeviceId(String),

    #[error("Invalid topic: {0}")]
    InvalidTopic(String),

    #[error("Unresolved device identity: {0}")]
    UnresolvedIdentity(String),

    #[error("Transaction {0} coordination error: {1}")]
    CoordinationError(String, String),

    #[error("Transaction {0} expired with {1} of {2} sub-messages")]
    TransactionExpired(String, u32, u32),

    #[error("Publish failed for message {0}: {1}")]
    PublishFailed(String, String),

    #[error("Configuration source error: {0}")]
    ConfigurationSourceError(String),

    #[error("Broker connection error: {0}")]
    BrokerConnectionError(String),

    #[error("Invalid broker configuration: {0}")]
    InvalidBrokerConfig(String),

    #[error("Operation timed out: {0}")]
    Timeout(String),

    #[error("Repository error: {0}")]
    RepositoryError(#[from] anyhow::Error),
}

impl DomainError {
    /// Errors that come from malformed input and should never be retried
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            DomainError::InvalidPayload(_)
                | DomainError::MissingDeviceId(_)
                | DomainError::InvalidTopic(_)
        )
    }
}
