use crate::cli::args::{ConfigAction, ConfigArgs};
use crate::config::{AckStrategyConfig, Config};
use anyhow::{Context, Result};

pub fn run_config(args: ConfigArgs) -> Result<()> {
    match args.action {
        ConfigAction::Check { config } => {
            let cfg = Config::load_from_env(config.as_deref())?;
            cfg.validate().context("invalid configuration")?;
            println!("{}", describe(&cfg));
            Ok(())
        }
    }
}

fn describe(cfg: &Config) -> String {
    let processing = &cfg.processing;
    let ack = match processing.ack_strategy {
        AckStrategyConfig::AllOrNothing => "all_or_nothing".to_string(),
        AckStrategyConfig::SkipFailedAfterRetries { max_retries } => {
            format!("skip_failed_after_retries(max_retries={max_retries})")
        }
        AckStrategyConfig::SkipAll => "skip_all".to_string(),
    };
    let mut out = String::new();
    out.push_str("configuration ok\n");
    out.push_str(&format!(
        "processing: poll_interval={}ms pack_timeout={}ms stop_timeout={}ms submit={:?} ack={}\n",
        processing.poll_interval_ms,
        processing.pack_processing_timeout_ms,
        processing.stop_processing_timeout_ms,
        processing.submit_strategy,
        ack
    ));
    out.push_str(&format!(
        "log: backend={:?} data_dir={} topic_prefix={} max_poll_records={}",
        cfg.log.backend,
        cfg.log.data_dir.display(),
        cfg.log.topic_prefix,
        cfg.log.max_poll_records
    ));
    if let Some(level) = &cfg.telemetry.log_level {
        out.push_str(&format!("\ntelemetry: log_level={level}"));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn describes_defaults() {
        let text = describe(&Config::default());
        assert!(text.contains("poll_interval=100ms"));
        assert!(text.contains("ack=all_or_nothing"));
        assert!(text.contains("backend=Memory"));
    }
}
