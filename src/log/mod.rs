//! Durable per-client log seen through the consumer interface the delivery
//! pipeline needs.
//!
//! Every client with a persistent session owns one topic with a single
//! partition. Records are addressed by offset and the committed offset is the
//! only progress marker that survives a restart:
//! - `memory` - in-process log used by tests and the simulator
//! - `file` - JSON-lines log with durable committed offsets

pub mod file;
pub mod memory;

pub use file::FileLog;
pub use memory::MemoryLog;

use bytes::Bytes;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;

/// The only partition of a client topic.
pub const CLIENT_PARTITION: u32 = 0;

/// One record read from a client partition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    pub partition: u32,
    pub offset: u64,
    pub value: Bytes,
}

#[derive(Debug, Error)]
pub enum LogError {
    #[error("topic {0} not found")]
    TopicNotFound(String),
    #[error("no partition assigned to consumer of {0}")]
    PartitionNotAssigned(String),
    #[error("unknown partition {partition} for topic {topic}")]
    UnknownPartition { topic: String, partition: u32 },
    #[error("consumer for {0} is closed")]
    Closed(String),
    #[error("offset {offset} out of range for {topic} (end {end})")]
    OffsetOutOfRange { topic: String, offset: u64, end: u64 },
    #[error("log io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("log codec error: {0}")]
    Codec(#[from] serde_json::Error),
}

/// Consumer bound to one client partition with manually controlled offsets.
pub trait LogConsumer: Send + 'static {
    fn topic(&self) -> &str;

    fn assign_partition(&mut self, partition: u32) -> Result<(), LogError>;

    /// Wait at most `timeout` for records past the current position. An empty
    /// batch is a normal outcome.
    fn poll(
        &mut self,
        timeout: Duration,
    ) -> impl Future<Output = Result<Vec<LogRecord>, LogError>> + Send;

    /// Commit `offset` as the next offset to read for `partition`.
    fn commit(
        &mut self,
        partition: u32,
        offset: u64,
    ) -> impl Future<Output = Result<(), LogError>> + Send;

    /// Commit everything returned by `poll` so far.
    fn commit_consumed(&mut self) -> impl Future<Output = Result<(), LogError>> + Send;

    fn unsubscribe_and_close(&mut self) -> impl Future<Output = ()> + Send;
}

/// Creates per-client consumers.
pub trait LogProvider: Send + Sync + 'static {
    type Consumer: LogConsumer;

    fn topic_for(&self, client_id: &str) -> String;

    fn create_consumer(
        &self,
        client_id: &str,
    ) -> impl Future<Output = Result<Self::Consumer, LogError>> + Send;
}

/// Administrative operations on client topics.
pub trait LogAdmin: Send + Sync + 'static {
    fn delete_topic(&self, topic: &str) -> impl Future<Output = Result<(), LogError>> + Send;
}

pub(crate) fn client_topic(prefix: &str, client_id: &str) -> String {
    format!("{prefix}{client_id}")
}
