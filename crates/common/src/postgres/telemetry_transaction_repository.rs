use crate::domain::{DomainError, DomainResult, TelemetryTransaction, TelemetryTransactionRepository};
use crate::postgres::PostgresClient;
use async_trait::async_trait;
use tracing::{debug, instrument};

/// PostgreSQL implementation of the transaction audit trail
#[derive(Clone)]
pub struct PostgresTelemetryTransactionRepository {
    client: PostgresClient,
}

impl PostgresTelemetryTransactionRepository {
    pub fn new(client: PostgresClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl TelemetryTransactionRepository for PostgresTelemetryTransactionRepository {
    #[instrument(skip(self, transaction), fields(correlation_id = %transaction.correlation_id, status = %transaction.status))]
    async fn record_transaction(&self, transaction: &TelemetryTransaction) -> DomainResult<()> {
        let conn = self
            .client
            .get_connection()
            .await
            .map_err(DomainError::RepositoryError)?;

        let total = transaction.total_logical_devices as i32;
        let processed = transaction.processed_devices as i32;

        conn.execute(
            "INSERT INTO telemetry_transactions
                (id, tenant_id, correlation_id, gateway_device_id, total_logical_devices,
                 processed_devices, status, started_at, completed_at, error_message)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
             ON CONFLICT (correlation_id) DO UPDATE SET
                processed_devices = EXCLUDED.processed_devices,
                status = EXCLUDED.status,
                completed_at = EXCLUDED.completed_at,
                error_message = EXCLUDED.error_message",
            &[
                &transaction.id,
                &transaction.tenant_id,
                &transaction.correlation_id,
                &transaction.gateway_device_id,
                &total,
                &processed,
                &transaction.status.as_str(),
                &transaction.started_at,
                &transaction.completed_at,
                &transaction.error_message,
            ],
        )
        .await
        .map_err(|e| DomainError::RepositoryError(e.into()))?;

        debug!("recorded telemetry transaction");
        Ok(())
    }
}
