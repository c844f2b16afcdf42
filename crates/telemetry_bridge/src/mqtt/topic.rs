use common::domain::SystemSettings;
use std::collections::BTreeSet;

/// Topic every device publishes its own telemetry on
pub const DEVICE_TELEMETRY_TOPIC: &str = "devices/+/telemetry";

/// Topic filters the subscriber should hold for the given settings.
///
/// The device topic is always present; the ChirpStack pattern only while the
/// integration is enabled and the pattern is non-empty.
pub fn subscription_topics(settings: &SystemSettings) -> BTreeSet<String> {
    let mut topics = BTreeSet::new();
    topics.insert(DEVICE_TELEMETRY_TOPIC.to_string());

    let pattern = settings.topic_pattern.trim();
    if settings.chirp_stack_integration_enabled && !pattern.is_empty() {
        topics.insert(pattern.to_string());
    }
    topics
}

/// Filters to add and to remove when moving from `current` to `desired`
pub fn subscription_changes(
    current: &BTreeSet<String>,
    desired: &BTreeSet<String>,
) -> (Vec<String>, Vec<String>) {
    let added = desired.difference(current).cloned().collect();
    let removed = current.difference(desired).cloned().collect();
    (added, removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::domain::DEFAULT_CHIRPSTACK_TOPIC_PATTERN;

    #[test]
    fn test_default_settings_subscribe_both_topics() {
        let topics = subscription_topics(&SystemSettings::default());
        assert_eq!(topics.len(), 2);
        assert!(topics.contains(DEVICE_TELEMETRY_TOPIC));
        assert!(topics.contains(DEFAULT_CHIRPSTACK_TOPIC_PATTERN));
    }

    #[test]
    fn test_disabled_integration_keeps_device_topic_only() {
        let settings = SystemSettings {
            chirp_stack_integration_enabled: false,
            ..SystemSettings::default()
        };
        let topics = subscription_topics(&settings);
        assert_eq!(topics.into_iter().collect::<Vec<_>>(), vec![DEVICE_TELEMETRY_TOPIC]);
    }

    #[test]
    fn test_empty_pattern_ignored() {
        let settings = SystemSettings {
            topic_pattern: "  ".to_string(),
            ..SystemSettings::default()
        };
        assert_eq!(subscription_topics(&settings).len(), 1);
    }

    #[test]
    fn test_subscription_changes_on_pattern_switch() {
        let current = subscription_topics(&SystemSettings::default());
        let desired = subscription_topics(&SystemSettings {
            topic_pattern: "lora/+/up".to_string(),
            ..SystemSettings::default()
        });

        let (added, removed) = subscription_changes(&current, &desired);
        assert_eq!(added, vec!["lora/+/up".to_string()]);
        assert_eq!(removed, vec![DEFAULT_CHIRPSTACK_TOPIC_PATTERN.to_string()]);
    }
}
