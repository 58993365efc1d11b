//! quantum-persist - CLI entrypoint.
//!
//! Usage:
//!   quantum-persist config check --config config/quantum-persist.toml
//!   quantum-persist publish --client c1 --topic sensors/t1 --packet-id 1 21.5
//!   quantum-persist inspect [--client c1]
//!   quantum-persist clear --client c1
//!   quantum-persist simulate --messages 100 --drop-every 7

use anyhow::Result;
use clap::Parser;
use quantum_persist::cli::commands::{
    run_clear, run_config, run_inspect, run_publish, run_simulate,
};
use quantum_persist::cli::{Cli, Commands};
use quantum_persist::telemetry::init_tracing;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let log_handle = init_tracing(cli.log_level.as_deref())?;
    // An explicit --log-level wins over the configured one.
    let configurable = cli.log_level.is_none().then_some(&log_handle);

    match cli.command {
        Commands::Config(args) => run_config(args),
        Commands::Publish(args) => run_publish(args),
        Commands::Inspect(args) => run_inspect(args),
        Commands::Clear(args) => run_clear(args).await,
        Commands::Simulate(args) => run_simulate(args, configurable).await,
    }
}
