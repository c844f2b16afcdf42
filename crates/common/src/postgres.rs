mod client;
mod config;
mod device_mapping_repository;
mod settings_repository;
mod telemetry_transaction_repository;

pub use client::*;
pub use config::*;
pub use device_mapping_repository::*;
pub use settings_repository::*;
pub use telemetry_transaction_repository::*;
