//! Lossy-client replay.
//!
//! Seeds a backlog for one client, starts the processor against it and plays
//! a client that silently drops every Nth first delivery. The run ends once
//! the committed offset reaches the end of the backlog.

use crate::cli::args::SimulateArgs;
use crate::config::{Config, LogBackend};
use crate::log::{FileLog, LogAdmin, LogError, LogProvider, MemoryLog};
use crate::mqtt::{PacketId, Qos};
use crate::ops::telemetry::{set_log_level, LogHandle};
use crate::persistence::{
    AtomicProcessorCounter, ClientSession, PersistenceProcessor, PublishRecord, SessionHandle,
};
use anyhow::{bail, Context, Result};
use bytes::Bytes;
use serde::Serialize;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

const SIM_CLIENT: &str = "simulated-client";
const SIM_PACK_TIMEOUT_MS: u64 = 250;

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct SimulationReport {
    pub messages: u64,
    pub deliveries: u64,
    pub dropped: u64,
    pub redeliveries: u64,
    pub committed_offset: Option<u64>,
    pub end_offset: u64,
    pub completed: bool,
    pub elapsed_ms: u64,
}

/// Log backends the simulator can seed and observe.
trait SimulatedLog: LogProvider + LogAdmin + Clone {
    fn seed(&self, client_id: &str, value: Bytes) -> Result<u64, LogError>;
    fn committed(&self, client_id: &str) -> Result<Option<u64>, LogError>;
}

impl SimulatedLog for MemoryLog {
    fn seed(&self, client_id: &str, value: Bytes) -> Result<u64, LogError> {
        Ok(self.append(client_id, value))
    }

    fn committed(&self, client_id: &str) -> Result<Option<u64>, LogError> {
        Ok(self.committed_offset(client_id))
    }
}

impl SimulatedLog for FileLog {
    fn seed(&self, client_id: &str, value: Bytes) -> Result<u64, LogError> {
        self.append(client_id, value)
    }

    fn committed(&self, client_id: &str) -> Result<Option<u64>, LogError> {
        self.committed_offset(client_id)
    }
}

pub async fn run_simulate(args: SimulateArgs, log_handle: Option<&LogHandle>) -> Result<()> {
    let mut config = match &args.config {
        Some(path) => Config::load_from_env(Some(path))?,
        None => {
            let mut config = Config::default();
            config.processing.pack_processing_timeout_ms = SIM_PACK_TIMEOUT_MS;
            config.apply_env_overrides()?;
            config
        }
    };
    if let Some(ms) = args.pack_timeout_ms {
        config.processing.pack_processing_timeout_ms = ms;
    }
    config.validate()?;
    if let (Some(handle), Some(level)) = (log_handle, config.telemetry.log_level.as_deref()) {
        set_log_level(handle, level)?;
    }
    if args.messages == 0 {
        bail!("--messages must be > 0");
    }

    let report = match config.log.backend {
        LogBackend::Memory => simulate(MemoryLog::from_config(&config.log), &config, &args).await?,
        LogBackend::File => {
            let log = FileLog::from_config(&config.log)
                .with_context(|| format!("unable to open {}", config.log.data_dir.display()))?;
            simulate(log, &config, &args).await?
        }
    };
    println!("{}", serde_json::to_string_pretty(&report)?);
    if !report.completed {
        bail!(
            "backlog not committed within {}s (committed={:?}, end={})",
            args.deadline_secs,
            report.committed_offset,
            report.end_offset
        );
    }
    Ok(())
}

async fn simulate<L: SimulatedLog>(
    log: L,
    config: &Config,
    args: &SimulateArgs,
) -> Result<SimulationReport> {
    let mut last_offset = 0;
    for packet_id in 1..=args.messages {
        let payload = format!("simulated payload {packet_id}");
        let record = PublishRecord::new(packet_id, format!("sim/{packet_id}"), Qos::AtLeastOnce, payload);
        last_offset = log.seed(SIM_CLIENT, record.encode()?)?;
    }
    let end_offset = last_offset + 1;

    let deliveries = Arc::new(AtomicU64::new(0));
    let (tx, mut rx) = mpsc::unbounded_channel::<PacketId>();
    let delivered = deliveries.clone();
    let delivery = move |_: &dyn ClientSession, packet_id: PacketId, _: &str, _: Qos, _: &Bytes| {
        delivered.fetch_add(1, Ordering::Relaxed);
        let _ = tx.send(packet_id);
    };
    let counter = Arc::new(AtomicProcessorCounter::new());
    let processor = Arc::new(PersistenceProcessor::new(
        log.clone(),
        delivery,
        config.processing.clone(),
        counter.clone(),
    ));

    let drop_every = args.drop_every;
    let acker = processor.clone();
    let dropped = Arc::new(AtomicU64::new(0));
    let dropped_by_client = dropped.clone();
    let client = tokio::spawn(async move {
        let mut seen = HashSet::new();
        let mut first_deliveries = 0u32;
        while let Some(packet_id) = rx.recv().await {
            if seen.insert(packet_id) {
                first_deliveries += 1;
                if drop_every > 0 && first_deliveries % drop_every == 0 {
                    dropped_by_client.fetch_add(1, Ordering::Relaxed);
                    continue;
                }
            }
            acker.acknowledge_delivery(SIM_CLIENT, packet_id);
        }
    });

    let started = Instant::now();
    let session = Arc::new(SessionHandle::new(SIM_CLIENT));
    processor.start_processing(session.clone());
    let deadline = started + Duration::from_secs(args.deadline_secs);
    let mut committed = log.committed(SIM_CLIENT)?;
    while committed.map_or(true, |offset| offset < end_offset) && Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(20)).await;
        committed = log.committed(SIM_CLIENT)?;
    }
    session.disconnect();
    processor.stop_processing(SIM_CLIENT).await;
    client.abort();

    let delivered = deliveries.load(Ordering::Relaxed);
    let messages = u64::from(args.messages);
    Ok(SimulationReport {
        messages,
        deliveries: delivered,
        dropped: dropped.load(Ordering::Relaxed),
        redeliveries: delivered.saturating_sub(messages),
        committed_offset: committed,
        end_offset,
        completed: committed.is_some_and(|offset| offset >= end_offset),
        elapsed_ms: started.elapsed().as_millis() as u64,
    })
}
