//! quantum-persist CLI.
//!
//! Provides a single binary entry point for:
//! - `quantum-persist config check` - Validate configuration
//! - `quantum-persist publish` - Append a message to a client's persisted topic
//! - `quantum-persist inspect` - List persisted topics and committed offsets
//! - `quantum-persist clear` - Delete a client's persisted topic
//! - `quantum-persist simulate` - Replay a backlog through the processor

mod args;
pub mod commands;

pub use args::{
    ClearArgs, Cli, Commands, ConfigAction, ConfigArgs, InspectArgs, LogLocation, PublishArgs,
    QosLevel, SimulateArgs,
};
