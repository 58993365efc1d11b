//! Persisted topic inspection.

use super::open_file_log;
use crate::cli::args::InspectArgs;
use crate::log::LogProvider;
use anyhow::{Context, Result};

pub fn run_inspect(args: InspectArgs) -> Result<()> {
    let log = open_file_log(&args.location)?;
    let only = args.client.as_deref().map(|client| log.topic_for(client));
    let summaries = log.topics().context("unable to list persisted topics")?;
    let mut shown = 0;
    for summary in summaries {
        if only.as_ref().is_some_and(|topic| *topic != summary.topic) {
            continue;
        }
        let committed = summary.committed.unwrap_or(summary.first_offset.unwrap_or(0));
        let backlog = summary.end_offset.saturating_sub(committed);
        println!(
            "{:<48} records={:<6} first={:<8} end={:<8} committed={:<8} backlog={}",
            summary.topic,
            summary.records,
            summary
                .first_offset
                .map(|o| o.to_string())
                .unwrap_or_else(|| "-".into()),
            summary.end_offset,
            summary
                .committed
                .map(|o| o.to_string())
                .unwrap_or_else(|| "-".into()),
            backlog
        );
        shown += 1;
    }
    if shown == 0 {
        println!(
            "no persisted topics found under {}",
            args.location.data_dir.display()
        );
    }
    Ok(())
}
