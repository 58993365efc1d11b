//! File-backed client log.
//!
//! Layout under the data directory, one directory per topic:
//!
//! ```text
//! <data_dir>/<escaped topic>/records.jsonl   one JSON record per line
//! <data_dir>/<escaped topic>/committed.json  {"offset": <next offset to read>}
//! ```
//!
//! Commits are written to a temporary file and renamed into place so a crash
//! never leaves a torn committed offset behind. A torn record line at the end
//! of `records.jsonl` is ignored by readers and cut off by the next append.

use super::{client_topic, LogAdmin, LogConsumer, LogError, LogProvider, LogRecord, CLIENT_PARTITION};
use crate::config::LogConfig;
use bytes::Bytes;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io::{SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tracing::{debug, warn};

const RECORDS_FILE: &str = "records.jsonl";
const COMMITTED_FILE: &str = "committed.json";
const POLL_STEP: Duration = Duration::from_millis(50);

#[derive(Debug, Serialize, Deserialize)]
struct StoredRecord {
    offset: u64,
    value: Bytes,
}

#[derive(Debug, Serialize, Deserialize)]
struct CommittedOffset {
    offset: u64,
}

/// Per-topic summary used by `quantum-persist inspect`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicSummary {
    pub topic: String,
    pub records: u64,
    pub first_offset: Option<u64>,
    pub end_offset: u64,
    pub committed: Option<u64>,
}

#[derive(Debug)]
struct FileLogInner {
    base: PathBuf,
    topic_prefix: String,
    max_poll_records: usize,
    next_offsets: Mutex<HashMap<String, u64>>,
}

#[derive(Debug, Clone)]
pub struct FileLog {
    inner: Arc<FileLogInner>,
}

impl FileLog {
    pub fn open(
        base: impl AsRef<Path>,
        topic_prefix: impl Into<String>,
        max_poll_records: usize,
    ) -> Result<Self, LogError> {
        let base = base.as_ref().to_path_buf();
        fs::create_dir_all(&base)?;
        Ok(Self {
            inner: Arc::new(FileLogInner {
                base,
                topic_prefix: topic_prefix.into(),
                max_poll_records: max_poll_records.max(1),
                next_offsets: Mutex::new(HashMap::new()),
            }),
        })
    }

    pub fn from_config(config: &LogConfig) -> Result<Self, LogError> {
        Self::open(
            &config.data_dir,
            config.topic_prefix.clone(),
            config.max_poll_records,
        )
    }

    pub fn base(&self) -> &Path {
        &self.inner.base
    }

    fn topic_dir(&self, topic: &str) -> PathBuf {
        self.inner.base.join(escape_topic(topic))
    }

    /// Append a record to the client partition, returning its offset.
    ///
    /// The first append to a topic rescans its records and truncates a torn
    /// trailing line left by an interrupted write.
    pub fn append(&self, client_id: &str, value: impl Into<Bytes>) -> Result<u64, LogError> {
        let topic = self.topic_for(client_id);
        let dir = self.topic_dir(&topic);
        fs::create_dir_all(&dir)?;
        let path = dir.join(RECORDS_FILE);
        let mut next_offsets = self.inner.next_offsets.lock();
        let offset = match next_offsets.get(&topic) {
            Some(offset) => *offset,
            None => {
                let scan = scan_records(&path)?;
                truncate_torn_tail(&path, &scan)?;
                scan.records.last().map(|r| r.offset + 1).unwrap_or(0)
            }
        };
        let line = serde_json::to_string(&StoredRecord {
            offset,
            value: value.into(),
        })?;
        match write_line(&path, &line) {
            Ok(()) => {
                next_offsets.insert(topic, offset + 1);
                Ok(offset)
            }
            Err(err) => {
                // Force a rescan so a partially written line is cut off first.
                next_offsets.remove(&topic);
                Err(err)
            }
        }
    }

    pub fn committed_offset(&self, client_id: &str) -> Result<Option<u64>, LogError> {
        read_committed(&self.topic_dir(&self.topic_for(client_id)))
    }

    /// Summaries of every topic under the data directory, sorted by name.
    pub fn topics(&self) -> Result<Vec<TopicSummary>, LogError> {
        let mut summaries = Vec::new();
        for entry in fs::read_dir(&self.inner.base)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let Some(topic) = entry.file_name().to_str().and_then(unescape_topic) else {
                warn!(path = %entry.path().display(), "skipping unrecognised topic directory");
                continue;
            };
            let records = scan_records(&entry.path().join(RECORDS_FILE))?.records;
            summaries.push(TopicSummary {
                topic,
                records: records.len() as u64,
                first_offset: records.first().map(|r| r.offset),
                end_offset: records.last().map(|r| r.offset + 1).unwrap_or(0),
                committed: read_committed(&entry.path())?,
            });
        }
        summaries.sort_by(|a, b| a.topic.cmp(&b.topic));
        Ok(summaries)
    }
}

impl LogProvider for FileLog {
    type Consumer = FileConsumer;

    fn topic_for(&self, client_id: &str) -> String {
        client_topic(&self.inner.topic_prefix, client_id)
    }

    async fn create_consumer(&self, client_id: &str) -> Result<FileConsumer, LogError> {
        let topic = self.topic_for(client_id);
        let dir = self.topic_dir(&topic);
        tokio::fs::create_dir_all(&dir).await?;
        let position = read_committed(&dir)?.unwrap_or(0);
        debug!(topic = %topic, position, "file consumer created");
        Ok(FileConsumer {
            topic,
            dir,
            max_poll_records: self.inner.max_poll_records,
            assigned: None,
            position,
            read_pos: 0,
            closed: false,
        })
    }
}

impl LogAdmin for FileLog {
    async fn delete_topic(&self, topic: &str) -> Result<(), LogError> {
        let dir = self.topic_dir(topic);
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => {
                self.inner.next_offsets.lock().remove(topic);
                Ok(())
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                Err(LogError::TopicNotFound(topic.to_string()))
            }
            Err(err) => Err(err.into()),
        }
    }
}

/// Consumer over one [`FileLog`] topic directory.
#[derive(Debug)]
pub struct FileConsumer {
    topic: String,
    dir: PathBuf,
    max_poll_records: usize,
    assigned: Option<u32>,
    /// Next offset handed out by `poll`.
    position: u64,
    /// Byte offset in `records.jsonl` of the first line not yet parsed.
    read_pos: u64,
    closed: bool,
}

impl FileConsumer {
    fn ensure_open(&self) -> Result<(), LogError> {
        if self.closed {
            return Err(LogError::Closed(self.topic.clone()));
        }
        if !self.dir.exists() {
            return Err(LogError::TopicNotFound(self.topic.clone()));
        }
        Ok(())
    }

    async fn read_available(&mut self) -> Result<Vec<LogRecord>, LogError> {
        let path = self.dir.join(RECORDS_FILE);
        let mut file = match tokio::fs::File::open(&path).await {
            Ok(file) => file,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };
        if file.metadata().await?.len() < self.read_pos {
            // Shorter than what was already parsed: the topic was recreated.
            self.read_pos = 0;
        }
        file.seek(SeekFrom::Start(self.read_pos)).await?;
        let mut data = Vec::new();
        file.read_to_end(&mut data).await?;

        let mut records = Vec::new();
        for line in data.split_inclusive(|b| *b == b'\n') {
            if records.len() >= self.max_poll_records {
                break;
            }
            // A trailing line without a newline is still being written.
            if line.last() != Some(&b'\n') {
                break;
            }
            if line.len() <= 1 {
                self.read_pos += line.len() as u64;
                continue;
            }
            let stored: StoredRecord = serde_json::from_slice(line)?;
            self.read_pos += line.len() as u64;
            if stored.offset < self.position {
                continue;
            }
            records.push(LogRecord {
                partition: CLIENT_PARTITION,
                offset: stored.offset,
                value: stored.value,
            });
        }
        if let Some(last) = records.last() {
            self.position = last.offset + 1;
        }
        Ok(records)
    }
}

impl LogConsumer for FileConsumer {
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
        if self.assigned.is_none() {
            return Err(LogError::PartitionNotAssigned(self.topic.clone()));
        }
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            self.ensure_open()?;
            let records = self.read_available().await?;
            let now = tokio::time::Instant::now();
            if !records.is_empty() || now >= deadline {
                return Ok(records);
            }
            tokio::time::sleep(POLL_STEP.min(deadline - now)).await;
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
        let body = serde_json::to_vec(&CommittedOffset { offset })?;
        let tmp = self.dir.join(format!("{COMMITTED_FILE}.tmp"));
        tokio::fs::write(&tmp, body).await?;
        tokio::fs::rename(&tmp, self.dir.join(COMMITTED_FILE)).await?;
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

#[derive(Debug, Default)]
struct RecordScan {
    records: Vec<StoredRecord>,
    /// Length of the prefix made of newline-terminated lines.
    complete_len: u64,
    file_len: u64,
}

/// Parse every complete line of a records file. A trailing line without a
/// newline is left out.
fn scan_records(path: &Path) -> Result<RecordScan, LogError> {
    let data = match fs::read(path) {
        Ok(data) => data,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(RecordScan::default()),
        Err(err) => return Err(err.into()),
    };
    let mut scan = RecordScan {
        file_len: data.len() as u64,
        ..RecordScan::default()
    };
    for line in data.split_inclusive(|b| *b == b'\n') {
        if line.last() != Some(&b'\n') {
            break;
        }
        scan.complete_len += line.len() as u64;
        if line.len() > 1 {
            scan.records.push(serde_json::from_slice(line)?);
        }
    }
    Ok(scan)
}

fn truncate_torn_tail(path: &Path, scan: &RecordScan) -> Result<(), LogError> {
    if scan.file_len > scan.complete_len {
        warn!(
            path = %path.display(),
            torn_bytes = scan.file_len - scan.complete_len,
            "truncating torn record line"
        );
        OpenOptions::new()
            .write(true)
            .open(path)?
            .set_len(scan.complete_len)?;
    }
    Ok(())
}

fn write_line(path: &Path, line: &str) -> Result<(), LogError> {
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    file.write_all(line.as_bytes())?;
    file.write_all(b"\n")?;
    file.sync_data()?;
    Ok(())
}

fn read_committed(dir: &Path) -> Result<Option<u64>, LogError> {
    match fs::read(dir.join(COMMITTED_FILE)) {
        Ok(data) => {
            let committed: CommittedOffset = serde_json::from_slice(&data)?;
            Ok(Some(committed.offset))
        }
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err.into()),
    }
}

/// Map a topic name onto a single path component; bytes outside
/// `[A-Za-z0-9._-]` become `%XX`.
fn escape_topic(topic: &str) -> String {
    let mut out = String::with_capacity(topic.len());
    for byte in topic.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'.' | b'_' | b'-' => out.push(byte as char),
            other => out.push_str(&format!("%{other:02X}")),
        }
    }
    out
}

fn unescape_topic(name: &str) -> Option<String> {
    let bytes = name.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut idx = 0;
    while idx < bytes.len() {
        if bytes[idx] == b'%' {
            let hex = name.get(idx + 1..idx + 3)?;
            out.push(u8::from_str_radix(hex, 16).ok()?);
            idx += 3;
        } else {
            out.push(bytes[idx]);
            idx += 1;
        }
    }
    String::from_utf8(out).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn topic_names_escape_to_single_component() {
        let escaped = escape_topic("app_client/with space%");
        assert_eq!(escaped, "app_client%2Fwith%20space%25");
        assert_eq!(unescape_topic(&escaped).as_deref(), Some("app_client/with space%"));
    }

    #[tokio::test]
    async fn committed_offset_survives_reopen() {
        let dir = tempdir().unwrap();
        let log = FileLog::open(dir.path(), "app_", 100).unwrap();
        for idx in 0..3u8 {
            assert_eq!(log.append("dev-1", vec![idx]).unwrap(), idx as u64);
        }
        let mut consumer = log.create_consumer("dev-1").await.unwrap();
        consumer.assign_partition(CLIENT_PARTITION).unwrap();
        let batch = consumer.poll(Duration::from_millis(10)).await.unwrap();
        assert_eq!(batch.len(), 3);
        consumer.commit(CLIENT_PARTITION, 2).await.unwrap();
        consumer.unsubscribe_and_close().await;

        let reopened = FileLog::open(dir.path(), "app_", 100).unwrap();
        assert_eq!(reopened.committed_offset("dev-1").unwrap(), Some(2));
        assert_eq!(reopened.append("dev-1", vec![9]).unwrap(), 3);
        let mut consumer = reopened.create_consumer("dev-1").await.unwrap();
        consumer.assign_partition(CLIENT_PARTITION).unwrap();
        let batch = consumer.poll(Duration::from_millis(10)).await.unwrap();
        assert_eq!(batch.iter().map(|r| r.offset).collect::<Vec<_>>(), vec![2, 3]);
    }

    #[tokio::test]
    async fn topics_report_counts_and_delete_removes_directory() {
        let dir = tempdir().unwrap();
        let log = FileLog::open(dir.path(), "app_", 100).unwrap();
        log.append("a", b"x".to_vec()).unwrap();
        log.append("a", b"y".to_vec()).unwrap();
        log.append("b/1", b"z".to_vec()).unwrap();
        let topics = log.topics().unwrap();
        assert_eq!(topics.len(), 2);
        assert_eq!(topics[0].topic, "app_a");
        assert_eq!(topics[0].records, 2);
        assert_eq!(topics[1].topic, "app_b/1");
        assert_eq!(topics[1].committed, None);

        log.delete_topic("app_a").await.unwrap();
        assert_eq!(log.topics().unwrap().len(), 1);
        assert!(matches!(
            log.delete_topic("app_a").await,
            Err(LogError::TopicNotFound(_))
        ));
    }

    #[tokio::test]
    async fn torn_tail_is_ignored_then_cut_off_by_append() {
        let dir = tempdir().unwrap();
        let log = FileLog::open(dir.path(), "app_", 100).unwrap();
        log.append("dev-1", b"a".to_vec()).unwrap();
        let path = dir.path().join("app_dev-1").join(RECORDS_FILE);
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(br#"{"offset":1,"val"#).unwrap();
        drop(file);

        let reopened = FileLog::open(dir.path(), "app_", 100).unwrap();
        let topics = reopened.topics().unwrap();
        assert_eq!(topics[0].records, 1);
        assert_eq!(topics[0].end_offset, 1);

        assert_eq!(reopened.append("dev-1", b"b".to_vec()).unwrap(), 1);
        let mut consumer = reopened.create_consumer("dev-1").await.unwrap();
        consumer.assign_partition(CLIENT_PARTITION).unwrap();
        let batch = consumer.poll(Duration::from_millis(10)).await.unwrap();
        assert_eq!(batch.iter().map(|r| r.offset).collect::<Vec<_>>(), vec![0, 1]);
        assert_eq!(batch[1].value, Bytes::from_static(b"b"));
        assert_eq!(reopened.topics().unwrap()[0].records, 2);
    }

    #[tokio::test]
    async fn poll_resumes_from_last_parsed_line() {
        let dir = tempdir().unwrap();
        let log = FileLog::open(dir.path(), "app_", 100).unwrap();
        log.append("dev-1", b"a".to_vec()).unwrap();
        let mut consumer = log.create_consumer("dev-1").await.unwrap();
        consumer.assign_partition(CLIENT_PARTITION).unwrap();
        assert_eq!(consumer.poll(Duration::from_millis(10)).await.unwrap().len(), 1);
        let path = dir.path().join("app_dev-1").join(RECORDS_FILE);
        assert_eq!(consumer.read_pos, fs::metadata(&path).unwrap().len());

        log.append("dev-1", b"b".to_vec()).unwrap();
        let batch = consumer.poll(Duration::from_millis(10)).await.unwrap();
        assert_eq!(batch.iter().map(|r| r.offset).collect::<Vec<_>>(), vec![1]);
        assert_eq!(consumer.read_pos, fs::metadata(&path).unwrap().len());
        assert!(consumer.poll(Duration::from_millis(10)).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn empty_topic_polls_empty_until_timeout() {
        let dir = tempdir().unwrap();
        let log = FileLog::open(dir.path(), "app_", 100).unwrap();
        let mut consumer = log.create_consumer("idle").await.unwrap();
        consumer.assign_partition(CLIENT_PARTITION).unwrap();
        let batch = consumer.poll(Duration::from_millis(20)).await.unwrap();
        assert!(batch.is_empty());
    }
}
