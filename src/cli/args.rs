//! CLI argument definitions using clap.

use crate::mqtt::Qos;
use clap::{Args, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

/// quantum-persist - persisted delivery tooling for application clients.
#[derive(Parser)]
#[command(name = "quantum-persist")]
#[command(version)]
#[command(about = "Persistent delivery core for Quantum application clients")]
pub struct Cli {
    /// Log filter, e.g. `info` or `quantum_persist=debug`
    #[arg(long, global = true)]
    pub log_level: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Configuration tooling
    Config(ConfigArgs),

    /// Append a PUBLISH to a client's persisted topic
    Publish(PublishArgs),

    /// List persisted topics with record counts and committed offsets
    Inspect(InspectArgs),

    /// Delete a client's persisted topic
    Clear(ClearArgs),

    /// Replay a synthetic backlog through the processor with a lossy client
    Simulate(SimulateArgs),
}

// -----------------------------------------------------------------------------
// Config command
// -----------------------------------------------------------------------------

#[derive(Args)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub action: ConfigAction,
}

#[derive(Subcommand)]
pub enum ConfigAction {
    /// Load and validate a configuration file, apply QUANTUM_PERSIST_* overrides,
    /// then print the effective settings
    Check {
        /// Path to configuration file (TOML or JSON); defaults to
        /// $QUANTUM_PERSIST_CONFIG, then config/quantum-persist.toml
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
}

// -----------------------------------------------------------------------------
// Log commands
// -----------------------------------------------------------------------------

#[derive(Args)]
pub struct LogLocation {
    /// Directory of the file-backed log
    #[arg(long, default_value = "data/persisted")]
    pub data_dir: PathBuf,

    /// Prefix prepended to client ids to form topic names
    #[arg(long, default_value = "mqtt_broker_application_client_")]
    pub topic_prefix: String,
}

/// QoS level for persisted messages
#[derive(Clone, Copy, Debug, Default, ValueEnum)]
pub enum QosLevel {
    /// At most once (fire and forget)
    Qos0,
    /// At least once (acknowledged delivery)
    #[default]
    Qos1,
    /// Exactly once (assured delivery)
    Qos2,
}

impl From<QosLevel> for Qos {
    fn from(level: QosLevel) -> Self {
        match level {
            QosLevel::Qos0 => Qos::AtMostOnce,
            QosLevel::Qos1 => Qos::AtLeastOnce,
            QosLevel::Qos2 => Qos::ExactlyOnce,
        }
    }
}

#[derive(Args)]
pub struct PublishArgs {
    #[command(flatten)]
    pub location: LogLocation,

    /// Application client that owns the persisted topic
    #[arg(long)]
    pub client: String,

    /// MQTT topic carried by the PUBLISH
    #[arg(long)]
    pub topic: String,

    /// Packet identifier used when the message is delivered
    #[arg(long)]
    pub packet_id: u16,

    /// QoS level
    #[arg(long, value_enum, default_value = "qos1")]
    pub qos: QosLevel,

    /// Set retain flag on the message
    #[arg(long)]
    pub retain: bool,

    /// Message payload
    pub payload: String,
}

#[derive(Args)]
pub struct InspectArgs {
    #[command(flatten)]
    pub location: LogLocation,

    /// Only show the topic of this client
    #[arg(long)]
    pub client: Option<String>,
}

#[derive(Args)]
pub struct ClearArgs {
    #[command(flatten)]
    pub location: LogLocation,

    /// Application client whose persisted messages are dropped
    #[arg(long)]
    pub client: String,
}

// -----------------------------------------------------------------------------
// Simulate command
// -----------------------------------------------------------------------------

#[derive(Args)]
pub struct SimulateArgs {
    /// Number of persisted messages to replay
    #[arg(long, default_value_t = 100)]
    pub messages: u16,

    /// Ignore every Nth first delivery (0 acks everything)
    #[arg(long, default_value_t = 7)]
    pub drop_every: u32,

    /// Configuration file; built-in defaults are used when omitted. The
    /// QUANTUM_PERSIST_* overrides apply either way
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Pack processing timeout in milliseconds; overrides the configuration
    /// (250 without a configuration file)
    #[arg(long)]
    pub pack_timeout_ms: Option<u64>,

    /// Give up after this many seconds
    #[arg(long, default_value_t = 30)]
    pub deadline_secs: u64,
}
