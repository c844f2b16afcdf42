use crate::domain::result::DomainResult;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::fmt;

/// Lifecycle status of a correlated multi-part transmission
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransactionStatus {
    Pending,
    Completed,
    Failed,
    Expired,
}

impl TransactionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionStatus::Pending => "pending",
            TransactionStatus::Completed => "completed",
            TransactionStatus::Failed => "failed",
            TransactionStatus::Expired => "expired",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, TransactionStatus::Pending)
    }
}

impl fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One gateway transmission made of `total_logical_devices` sub-messages
/// sharing a correlation id
#[derive(Debug, Clone, PartialEq)]
pub struct TelemetryTransaction {
    pub id: String,
    pub tenant_id: String,
    pub correlation_id: String,
    pub gateway_device_id: String,
    pub total_logical_devices: u32,
    pub processed_devices: u32,
    pub status: TransactionStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
}

impl TelemetryTransaction {
    pub fn missing_devices(&self) -> u32 {
        self.total_logical_devices
            .saturating_sub(self.processed_devices)
    }

    /// Move to a terminal status, stamping completion time
    pub fn finish(&mut self, status: TransactionStatus, error_message: Option<String>) {
        self.status = status;
        self.completed_at = Some(Utc::now());
        self.error_message = error_message;
    }
}

/// Write-only audit trail of transactions
/// Never read back on the ingestion path
#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
#[async_trait]
pub trait TelemetryTransactionRepository: Send + Sync {
    /// Insert or update the transaction keyed by correlation id
    async fn record_transaction(&self, transaction: &TelemetryTransaction) -> DomainResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_devices_and_finish() {
        let mut tx = TelemetryTransaction {
            id: "id-1".to_string(),
            tenant_id: "T1".to_string(),
            correlation_id: "tx1".to_string(),
            gateway_device_id: "gw".to_string(),
            total_logical_devices: 3,
            processed_devices: 2,
            status: TransactionStatus::Pending,
            started_at: Utc::now(),
            completed_at: None,
            error_message: None,
        };
        assert_eq!(tx.missing_devices(), 1);
        assert!(!tx.status.is_terminal());

        tx.finish(TransactionStatus::Expired, Some("timeout".to_string()));
        assert!(tx.status.is_terminal());
        assert!(tx.completed_at.is_some());
        assert_eq!(tx.status.to_string(), "expired");
    }
}
