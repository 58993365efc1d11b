//! Operations.
//!
//! - `telemetry` - structured logging setup

pub mod telemetry;

pub use telemetry::*;
