//! In-process partitioned log.
//!
//! Committed offsets live in the shared topic state, so a consumer created
//! after another one closed resumes from the last commit exactly like a
//! reconnecting client would against the durable log.

use super::{client_topic, LogAdmin, LogConsumer, LogError, LogProvider, LogRecord, CLIENT_PARTITION};
use crate::config::LogConfig;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tracing::debug;

#[derive(Debug, Default)]
struct TopicLog {
    start_offset: u64,
    records: Vec<Bytes>,
    committed: Option<u64>,
    commits: u64,
}

impl TopicLog {
    fn end_offset(&self) -> u64 {
        self.start_offset + self.records.len() as u64
    }
}

#[derive(Debug, Default)]
struct TopicState {
    log: Mutex<TopicLog>,
    appended: Notify,
    deleted: AtomicBool,
}

#[derive(Debug)]
struct MemoryLogInner {
    topic_prefix: String,
    max_poll_records: usize,
    topics: Mutex<HashMap<String, Arc<TopicState>>>,
}

/// Shared handle to an in-memory log; clones observe the same topics.
#[derive(Debug, Clone)]
pub struct MemoryLog {
    inner: Arc<MemoryLogInner>,
}

impl MemoryLog {
    pub fn new(topic_prefix: impl Into<String>, max_poll_records: usize) -> Self {
        Self {
            inner: Arc::new(MemoryLogInner {
                topic_prefix: topic_prefix.into(),
                max_poll_records: max_poll_records.max(1),
                topics: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn from_config(config: &LogConfig) -> Self {
        Self::new(config.topic_prefix.clone(), config.max_poll_records)
    }

    fn topic_state(&self, topic: &str) -> Arc<TopicState> {
        self.inner
            .topics
            .lock()
            .entry(topic.to_string())
            .or_default()
            .clone()
    }

    /// Create the client topic with its first record at `start_offset`.
    /// Has no effect on a topic that already holds records.
    pub fn create_topic(&self, client_id: &str, start_offset: u64) {
        let state = self.topic_state(&self.topic_for(client_id));
        let mut log = state.log.lock();
        if log.records.is_empty() {
            log.start_offset = start_offset;
        }
    }

    /// Append a record to the client partition, returning its offset.
    pub fn append(&self, client_id: &str, value: impl Into<Bytes>) -> u64 {
        let state = self.topic_state(&self.topic_for(client_id));
        let offset = {
            let mut log = state.log.lock();
            let offset = log.end_offset();
            log.records.push(value.into());
            offset
        };
        state.appended.notify_waiters();
        offset
    }

    pub fn committed_offset(&self, client_id: &str) -> Option<u64> {
        let topic = self.topic_for(client_id);
        let topics = self.inner.topics.lock();
        topics.get(&topic).and_then(|state| state.log.lock().committed)
    }

    /// Number of commits issued against the client partition.
    pub fn commit_count(&self, client_id: &str) -> u64 {
        let topic = self.topic_for(client_id);
        let topics = self.inner.topics.lock();
        topics
            .get(&topic)
            .map(|state| state.log.lock().commits)
            .unwrap_or(0)
    }

    pub fn end_offset(&self, client_id: &str) -> Option<u64> {
        let topic = self.topic_for(client_id);
        let topics = self.inner.topics.lock();
        topics.get(&topic).map(|state| state.log.lock().end_offset())
    }

    pub fn has_topic(&self, client_id: &str) -> bool {
        self.inner
            .topics
            .lock()
            .contains_key(&self.topic_for(client_id))
    }
}

impl LogProvider for MemoryLog {
    type Consumer = MemoryConsumer;

    fn topic_for(&self, client_id: &str) -> String {
        client_topic(&self.inner.topic_prefix, client_id)
    }

    async fn create_consumer(&self, client_id: &str) -> Result<MemoryConsumer, LogError> {
        let topic = self.topic_for(client_id);
        let state = self.topic_state(&topic);
        let position = {
            let log = state.log.lock();
            log.committed.unwrap_or(log.start_offset)
        };
        debug!(topic = %topic, position, "memory consumer created");
        Ok(MemoryConsumer {
            topic,
            state,
            max_poll_records: self.inner.max_poll_records,
            assigned: None,
            position,
            closed: false,
        })
    }
}

impl LogAdmin for MemoryLog {
    async fn delete_topic(&self, topic: &str) -> Result<(), LogError> {
        let removed = self.inner.topics.lock().remove(topic);
        match removed {
            Some(state) => {
                state.deleted.store(true, Ordering::SeqCst);
                state.appended.notify_waiters();
                Ok(())
            }
            None => Err(LogError::TopicNotFound(topic.to_string())),
        }
    }
}

/// Consumer over one [`MemoryLog`] topic.
#[derive(Debug)]
pub struct MemoryConsumer {
    topic: String,
    state: Arc<TopicState>,
    max_poll_records: usize,
    assigned: Option<u32>,
    position: u64,
    closed: bool,
}

impl MemoryConsumer {
    pub fn position(&self) -> u64 {
        self.position
    }

    fn ensure_open(&self) -> Result<(), LogError> {
        if self.closed {
            return Err(LogError::Closed(self.topic.clone()));
        }
        if self.state.deleted.load(Ordering::SeqCst) {
            return Err(LogError::TopicNotFound(self.topic.clone()));
        }
        Ok(())
    }

    fn read_available(&mut self) -> Vec<LogRecord> {
        let log = self.state.log.lock();
        if self.position < log.start_offset {
            self.position = log.start_offset;
        }
        let from = (self.position - log.start_offset) as usize;
        let records: Vec<LogRecord> = log
            .records
            .iter()
            .enumerate()
            .skip(from)
            .take(self.max_poll_records)
            .map(|(idx, value)| LogRecord {
                partition: CLIENT_PARTITION,
                offset: log.start_offset + idx as u64,
                value: value.clone(),
            })
            .collect();
        if let Some(last) = records.last() {
            self.position = last.offset + 1;
        }
        records
    }
}

impl LogConsumer for MemoryConsumer {
    fn topic(&self) -> &str {
        &self.topic
    }

    fn assign_partition(&mut self, partition: u32) -> Result<(), LogError> {
        self.ensure_open()?;
        if partition != CLIENT_PARTITION {
            return Err(LogError::UnknownPartition {
                topic: self.topic.clone(),
                partition,
            });
        }
        self.assigned = Some(partition);
        Ok(())
    }

    async fn poll(&mut self, timeout: Duration) -> Result<Vec<LogRecord>, LogError> {
        self.ensure_open()?;
        if self.assigned.is_none() {
            return Err(LogError::PartitionNotAssigned(self.topic.clone()));
        }
        let state = self.state.clone();
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let appended = state.appended.notified();
            tokio::pin!(appended);
            appended.as_mut().enable();
            self.ensure_open()?;
            let records = self.read_available();
            if !records.is_empty() {
                return Ok(records);
            }
            if tokio::time::timeout_at(deadline, appended).await.is_err() {
                return Ok(Vec::new());
            }
        }
    }

    async fn commit(&mut self, partition: u32, offset: u64) -> Result<(), LogError> {
        self.ensure_open()?;
        if partition != CLIENT_PARTITION {
            return Err(LogError::UnknownPartition {
                topic: self.topic.clone(),
                partition,
            });
        }
        let mut log = self.state.log.lock();
        let end = log.end_offset();
        if offset > end {
            return Err(LogError::OffsetOutOfRange {
                topic: self.topic.clone(),
                offset,
                end,
            });
        }
        log.committed = Some(offset);
        log.commits += 1;
        Ok(())
    }

    async fn commit_consumed(&mut self) -> Result<(), LogError> {
        let position = self.position;
        self.commit(CLIENT_PARTITION, position).await
    }

    async fn unsubscribe_and_close(&mut self) {
        self.assigned = None;
        self.closed = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn poll_returns_records_from_committed_offset() {
        let log = MemoryLog::new("app_", 10);
        for idx in 0..4u8 {
            log.append("c1", vec![idx]);
        }
        let mut consumer = log.create_consumer("c1").await.unwrap();
        consumer.assign_partition(CLIENT_PARTITION).unwrap();
        let batch = consumer.poll(Duration::from_millis(10)).await.unwrap();
        assert_eq!(batch.len(), 4);
        consumer.commit(CLIENT_PARTITION, 2).await.unwrap();
        consumer.unsubscribe_and_close().await;

        let mut resumed = log.create_consumer("c1").await.unwrap();
        resumed.assign_partition(CLIENT_PARTITION).unwrap();
        let batch = resumed.poll(Duration::from_millis(10)).await.unwrap();
        let offsets: Vec<u64> = batch.iter().map(|r| r.offset).collect();
        assert_eq!(offsets, vec![2, 3]);
        assert_eq!(log.committed_offset("c1"), Some(2));
    }

    #[tokio::test]
    async fn poll_without_assignment_is_rejected() {
        let log = MemoryLog::new("app_", 10);
        let mut consumer = log.create_consumer("c1").await.unwrap();
        let err = consumer.poll(Duration::from_millis(1)).await.unwrap_err();
        assert!(matches!(err, LogError::PartitionNotAssigned(_)));
        assert!(consumer.assign_partition(3).is_err());
    }

    #[tokio::test]
    async fn poll_wakes_on_append() {
        let log = MemoryLog::new("app_", 10);
        let mut consumer = log.create_consumer("c1").await.unwrap();
        consumer.assign_partition(CLIENT_PARTITION).unwrap();
        let writer = log.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            writer.append("c1", Bytes::from_static(b"late"));
        });
        let batch = consumer.poll(Duration::from_secs(5)).await.unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].value, Bytes::from_static(b"late"));
    }

    #[tokio::test]
    async fn respects_start_offset_and_poll_limit() {
        let log = MemoryLog::new("app_", 2);
        log.create_topic("c1", 100);
        for idx in 0..3u8 {
            log.append("c1", vec![idx]);
        }
        let mut consumer = log.create_consumer("c1").await.unwrap();
        consumer.assign_partition(CLIENT_PARTITION).unwrap();
        let first = consumer.poll(Duration::from_millis(1)).await.unwrap();
        assert_eq!(first.iter().map(|r| r.offset).collect::<Vec<_>>(), vec![100, 101]);
        consumer.commit_consumed().await.unwrap();
        assert_eq!(log.committed_offset("c1"), Some(102));
        let err = consumer.commit(CLIENT_PARTITION, 500).await.unwrap_err();
        assert!(matches!(err, LogError::OffsetOutOfRange { .. }));
    }

    #[tokio::test]
    async fn delete_topic_drops_records() {
        let log = MemoryLog::new("app_", 10);
        log.append("c1", vec![1]);
        let topic = log.topic_for("c1");
        log.delete_topic(&topic).await.unwrap();
        assert!(!log.has_topic("c1"));
        assert!(matches!(
            log.delete_topic(&topic).await,
            Err(LogError::TopicNotFound(_))
        ));
    }
}
