mod bridge_metrics;
mod identity_cache;
mod retry;
mod settings_cache;
mod telemetry_pipeline;
mod telemetry_validator;
mod transaction_coordinator;

pub use bridge_metrics::*;
pub use identity_cache::*;
pub use retry::*;
pub use settings_cache::*;
pub use telemetry_pipeline::*;
pub use telemetry_validator::*;
pub use transaction_coordinator::*;
