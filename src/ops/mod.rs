//! Operations.
//!
//! - `telemetry` - tracing subscriber setup for the binary

pub mod telemetry;

pub use telemetry::*;
