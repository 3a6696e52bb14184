//! Telemetry setup shared by the contention binaries and tests.

pub mod tracing;
