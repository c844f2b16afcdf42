use crate::domain::{DomainError, DomainResult, SettingsSource, SystemSettings};
use crate::postgres::PostgresClient;
use anyhow::Context;
use async_trait::async_trait;
use tracing::{debug, instrument};

/// PostgreSQL implementation of SettingsSource.
///
/// Reads one JSONB row from `system_settings` selected by category and key.
#[derive(Clone)]
pub struct PostgresSettingsRepository {
    client: PostgresClient,
    category: String,
    key: String,
}

impl PostgresSettingsRepository {
    pub fn new(client: PostgresClient, category: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            client,
            category: category.into(),
            key: key.into(),
        }
    }
}

#[async_trait]
impl SettingsSource for PostgresSettingsRepository {
    #[instrument(skip(self), fields(category = %self.category, key = %self.key))]
    async fn load_settings(&self) -> DomainResult<Option<SystemSettings>> {
        let conn = self
            .client
            .get_connection()
            .await
            .map_err(DomainError::RepositoryError)?;

        let row = conn
            .query_opt(
                "SELECT value FROM system_settings WHERE category = $1 AND key = $2",
                &[&self.category, &self.key],
            )
            .await
            .map_err(|e| DomainError::RepositoryError(e.into()))?;

        match row {
            Some(row) => {
                let value: serde_json::Value = row.get(0);
                let settings = serde_json::from_value::<SystemSettings>(value)
                    .context("Malformed system settings value")
                    .map_err(DomainError::RepositoryError)?;
                debug!(
                    enabled = settings.chirp_stack_integration_enabled,
                    topic_pattern = %settings.topic_pattern,
                    "loaded system settings"
                );
                Ok(Some(settings))
            }
            None => {
                debug!("no system settings row configured");
                Ok(None)
            }
        }
    }
}
