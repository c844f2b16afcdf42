mod connection_state;
mod subscriber;
mod topic;

pub use connection_state::ConnectionState;
pub use subscriber::{MqttSubscriber, MqttSubscriberConfig};
pub use topic::{subscription_changes, subscription_topics, DEVICE_TELEMETRY_TOPIC};
