use crate::domain::{DeviceMapping, DeviceMappingSource, DomainError, DomainResult};
use crate::postgres::PostgresClient;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

/// Active devices carrying a logical (external) identifier for one transport
const SELECT_DEVICE_MAPPINGS: &str = "SELECT logical_id, tenant_id::text, id::text, protocol, name
     FROM devices
     WHERE status = 'active' AND logical_id IS NOT NULL AND protocol = $1";

/// Device identity row as returned by the mapping query
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceMappingRow {
    pub logical_id: String,
    pub tenant_id: String,
    pub device_id: String,
    pub protocol: String,
    pub name: Option<String>,
}

/// Convert database DeviceMappingRow to domain DeviceMapping
impl From<DeviceMappingRow> for DeviceMapping {
    fn from(row: DeviceMappingRow) -> Self {
        DeviceMapping {
            external_id: DeviceMapping::normalize_external_id(&row.logical_id),
            tenant_id: row.tenant_id,
            display_name: row.name.unwrap_or_else(|| row.device_id.clone()),
            platform_device_id: row.device_id,
            protocol: row.protocol,
        }
    }
}

/// PostgreSQL implementation of DeviceMappingSource
#[derive(Clone)]
pub struct PostgresDeviceMappingRepository {
    client: PostgresClient,
    protocol: String,
}

impl PostgresDeviceMappingRepository {
    /// `protocol` is the transport tag devices must carry (e.g. "mqtt")
    pub fn new(client: PostgresClient, protocol: impl Into<String>) -> Self {
        Self {
            client,
            protocol: protocol.into(),
        }
    }
}

#[async_trait]
impl DeviceMappingSource for PostgresDeviceMappingRepository {
    #[instrument(skip(self), fields(protocol = %self.protocol))]
    async fn load_device_mappings(&self) -> DomainResult<Vec<DeviceMapping>> {
        let conn = self
            .client
            .get_connection()
            .await
            .map_err(DomainError::RepositoryError)?;

        let rows = conn
            .query(SELECT_DEVICE_MAPPINGS, &[&self.protocol])
            .await
            .map_err(|e| DomainError::RepositoryError(e.into()))?;

        let mappings: Vec<DeviceMapping> = rows
            .iter()
            .map(|row| {
                DeviceMappingRow {
                    logical_id: row.get(0),
                    tenant_id: row.get(1),
                    device_id: row.get(2),
                    protocol: row.get(3),
                    name: row.get(4),
                }
                .into()
            })
            .collect();

        debug!(count = mappings.len(), "loaded device mappings");
        Ok(mappings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_row_conversion_normalizes_external_id() {
        let row = DeviceMappingRow {
            logical_id: "AA:BB:CC".to_string(),
            tenant_id: "T1".to_string(),
            device_id: "dev-1".to_string(),
            protocol: "mqtt".to_string(),
            name: Some("Beacon 1".to_string()),
        };

        let mapping: DeviceMapping = row.into();
        assert_eq!(mapping.external_id, "aa:bb:cc");
        assert_eq!(mapping.platform_device_id, "dev-1");
        assert_eq!(mapping.display_name, "Beacon 1");
    }

    #[test]
    fn test_row_conversion_defaults_display_name() {
        let row = DeviceMappingRow {
            logical_id: "abc".to_string(),
            tenant_id: "T1".to_string(),
            device_id: "dev-2".to_string(),
            protocol: "mqtt".to_string(),
            name: None,
        };

        let mapping: DeviceMapping = row.into();
        assert_eq!(mapping.display_name, "dev-2");
    }
}
