//! Common test utilities

pub mod telemetry_mock;

pub use telemetry_mock::MockTelemetryServer;
