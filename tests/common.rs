//! Common test harness utilities for integration tests.
//!
//! This module provides helpers for:
//! - Recording deliveries made by the processor
//! - Seeding client topics with encoded PUBLISH records
//! - Building processors with short test timeouts

// Not all test files use all helpers; silence dead_code warnings for unused exports.
#![allow(dead_code)]

use bytes::Bytes;
use parking_lot::Mutex;
use quantum_persist::config::{AckStrategyConfig, ProcessingConfig, SubmitStrategyKind};
use quantum_persist::log::{LogAdmin, LogProvider, MemoryLog};
use quantum_persist::mqtt::{PacketId, Qos};
use quantum_persist::persistence::{
    AtomicProcessorCounter, ClientSession, PersistenceProcessor, PublishDelivery, PublishRecord,
};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivered {
    pub client_id: String,
    pub packet_id: PacketId,
    pub topic: String,
    pub qos: Qos,
    pub payload: Bytes,
}

/// Publish path that records every delivery instead of writing to a socket.
#[derive(Debug, Clone, Default)]
pub struct RecordingDelivery {
    sent: Arc<Mutex<Vec<Delivered>>>,
}

impl RecordingDelivery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn count(&self) -> usize {
        self.sent.lock().len()
    }

    pub fn packet_ids(&self) -> Vec<PacketId> {
        self.sent.lock().iter().map(|d| d.packet_id).collect()
    }

    pub fn deliveries(&self) -> Vec<Delivered> {
        self.sent.lock().clone()
    }

    pub fn times_delivered(&self, packet_id: PacketId) -> usize {
        self.sent
            .lock()
            .iter()
            .filter(|d| d.packet_id == packet_id)
            .count()
    }

    /// Wait until at least `count` deliveries were recorded.
    pub async fn wait_for(&self, count: usize) -> bool {
        wait_until(Duration::from_secs(5), || self.count() >= count).await
    }
}

impl PublishDelivery for RecordingDelivery {
    fn deliver(
        &self,
        session: &dyn ClientSession,
        packet_id: PacketId,
        topic: &str,
        qos: Qos,
        payload: &Bytes,
    ) {
        self.sent.lock().push(Delivered {
            client_id: session.client_id().to_string(),
            packet_id,
            topic: topic.to_string(),
            qos,
            payload: payload.clone(),
        });
    }
}

pub type TestProcessor<L = MemoryLog> = PersistenceProcessor<L, RecordingDelivery>;

/// Processing settings with timings small enough for tests.
pub fn settings(pack_timeout_ms: u64) -> ProcessingConfig {
    ProcessingConfig {
        poll_interval_ms: 10,
        pack_processing_timeout_ms: pack_timeout_ms,
        stop_processing_timeout_ms: 1_000,
        submit_strategy: SubmitStrategyKind::Burst,
        ack_strategy: AckStrategyConfig::AllOrNothing,
    }
}

pub fn memory_log() -> MemoryLog {
    MemoryLog::new("app_client_", 500)
}

pub fn record(packet_id: PacketId, qos: Qos) -> Bytes {
    PublishRecord::new(
        packet_id,
        format!("devices/{packet_id}"),
        qos,
        format!("payload-{packet_id}").into_bytes(),
    )
    .encode()
    .expect("encode record")
}

/// Append a QoS 1 PUBLISH for `client_id`, returning its offset.
pub fn publish(log: &MemoryLog, client_id: &str, packet_id: PacketId) -> u64 {
    log.append(client_id, record(packet_id, Qos::AtLeastOnce))
}

pub fn processor<L>(
    log: L,
    delivery: &RecordingDelivery,
    settings: ProcessingConfig,
) -> (Arc<TestProcessor<L>>, Arc<AtomicProcessorCounter>)
where
    L: LogProvider + LogAdmin,
{
    let counter = Arc::new(AtomicProcessorCounter::new());
    let processor = Arc::new(PersistenceProcessor::new(
        log,
        delivery.clone(),
        settings,
        counter.clone(),
    ));
    (processor, counter)
}

/// Poll `condition` every few milliseconds until it holds or `timeout` passes.
pub async fn wait_until(timeout: Duration, condition: impl Fn() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
