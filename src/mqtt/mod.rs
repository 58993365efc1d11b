//! MQTT protocol types shared by the persistent-delivery pipeline.
//!
//! The codec itself lives in the session layer; only the pieces that travel
//! through the durable log are defined here.

pub mod protocol;

pub use protocol::*;
