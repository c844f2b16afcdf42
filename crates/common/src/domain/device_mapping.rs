use crate::domain::result::DomainResult;
use async_trait::async_trait;

/// Mapping from an external (broker-side) device identifier to a tenant-scoped
/// platform device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceMapping {
    /// Lowercased external identifier (DevEUI, MAC, ...)
    pub external_id: String,
    pub tenant_id: String,
    pub platform_device_id: String,
    pub protocol: String,
    pub display_name: String,
}

impl DeviceMapping {
    /// Normalize an external identifier for storage and lookup
    pub fn normalize_external_id(external_id: &str) -> String {
        external_id.trim().to_lowercase()
    }
}

/// Read-only source of device identity mappings
/// Infrastructure layer (e.g., postgres) implements this trait
#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
#[async_trait]
pub trait DeviceMappingSource: Send + Sync {
    /// Load the full current set of active device mappings
    async fn load_device_mappings(&self) -> DomainResult<Vec<DeviceMapping>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_external_id() {
        assert_eq!(DeviceMapping::normalize_external_id("AA:BB:CC"), "aa:bb:cc");
        assert_eq!(DeviceMapping::normalize_external_id("  ABC123 "), "abc123");
    }
}
