pub mod domain;
pub mod mqtt;
pub mod nats;
pub mod telemetry_bridge;

pub use domain::*;
pub use mqtt::*;
pub use nats::*;
pub use telemetry_bridge::*;
