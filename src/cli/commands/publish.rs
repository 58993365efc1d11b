use super::open_file_log;
use crate::cli::args::PublishArgs;
use crate::mqtt::Qos;
use crate::persistence::PublishRecord;
use anyhow::{Context, Result};
use serde_json::json;

pub fn run_publish(args: PublishArgs) -> Result<()> {
    let log = open_file_log(&args.location)?;
    let qos: Qos = args.qos.into();
    let mut record = PublishRecord::new(args.packet_id, args.topic, qos, args.payload.into_bytes());
    record.retain = args.retain;
    let value = record.encode().context("encode publish record")?;
    let offset = log
        .append(&args.client, value)
        .with_context(|| format!("append for client {}", args.client))?;
    println!(
        "{}",
        json!({
            "client": args.client,
            "packet_id": record.packet_id,
            "qos": qos.bits(),
            "offset": offset,
        })
    );
    Ok(())
}
