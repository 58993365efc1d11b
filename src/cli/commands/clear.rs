use super::open_file_log;
use crate::cli::args::ClearArgs;
use crate::log::{LogAdmin, LogProvider};
use anyhow::{Context, Result};

pub async fn run_clear(args: ClearArgs) -> Result<()> {
    let log = open_file_log(&args.location)?;
    let topic = log.topic_for(&args.client);
    log.delete_topic(&topic)
        .await
        .with_context(|| format!("unable to clear persisted messages for {}", args.client))?;
    println!("cleared {topic}");
    Ok(())
}
