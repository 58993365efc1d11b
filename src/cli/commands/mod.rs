//! CLI command implementations.

mod clear;
mod config;
mod inspect;
mod publish;
mod simulate;

pub use clear::run_clear;
pub use config::run_config;
pub use inspect::run_inspect;
pub use publish::run_publish;
pub use simulate::{run_simulate, SimulationReport};

use crate::cli::args::LogLocation;
use crate::config::LogConfig;
use crate::log::FileLog;
use anyhow::{Context, Result};

fn open_file_log(location: &LogLocation) -> Result<FileLog> {
    FileLog::open(
        &location.data_dir,
        location.topic_prefix.clone(),
        LogConfig::default().max_poll_records,
    )
    .with_context(|| format!("unable to open log under {}", location.data_dir.display()))
}
