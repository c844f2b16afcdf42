mod device_mapping;
mod result;
mod system_settings;
mod telemetry;
mod telemetry_transaction;

pub use device_mapping::*;
pub use result::*;
pub use system_settings::*;
pub use telemetry::*;
pub use telemetry_transaction::*;
