use crate::domain::result::DomainResult;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub const DEFAULT_CHIRPSTACK_TOPIC_PATTERN: &str = "application/+/device/+/event/up";

/// Integration toggles read from the configuration store
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemSettings {
    pub chirp_stack_integration_enabled: bool,
    pub topic_pattern: String,
    #[serde(default)]
    pub description: String,
}

impl Default for SystemSettings {
    fn default() -> Self {
        Self {
            chirp_stack_integration_enabled: true,
            topic_pattern: DEFAULT_CHIRPSTACK_TOPIC_PATTERN.to_string(),
            description: "ChirpStack uplink integration".to_string(),
        }
    }
}

/// Read-only source of system settings
#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
#[async_trait]
pub trait SettingsSource: Send + Sync {
    /// Load the settings row; `None` when no row is configured
    async fn load_settings(&self) -> DomainResult<Option<SystemSettings>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_settings_deserialize_camel_case() {
        let json = r#"{"chirpStackIntegrationEnabled": false, "topicPattern": "lora/+/up"}"#;
        let settings: SystemSettings = serde_json::from_str(json).unwrap();
        assert!(!settings.chirp_stack_integration_enabled);
        assert_eq!(settings.topic_pattern, "lora/+/up");
        assert_eq!(settings.description, "");
    }

    #[test]
    fn test_default_settings() {
        let settings = SystemSettings::default();
        assert!(settings.chirp_stack_integration_enabled);
        assert_eq!(settings.topic_pattern, DEFAULT_CHIRPSTACK_TOPIC_PATTERN);
    }
}
