pub mod domain;
pub mod nats;
pub mod postgres;
pub mod telemetry;

// Re-export mocks when testing feature is enabled
#[cfg(any(test, feature = "testing"))]
pub use domain::MockDeviceMappingSource;
#[cfg(any(test, feature = "testing"))]
pub use domain::MockSettingsSource;
#[cfg(any(test, feature = "testing"))]
pub use domain::MockTelemetryPublisher;
#[cfg(any(test, feature = "testing"))]
pub use domain::MockTelemetryTransactionRepository;
#[cfg(any(test, feature = "testing"))]
pub use nats::MockJetStreamPublisher;
