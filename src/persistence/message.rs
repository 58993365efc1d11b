use crate::log::LogRecord;
use crate::mqtt::{PacketId, Qos};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tracing::error;

/// Body of a persisted PUBLISH as written to a client topic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishRecord {
    pub packet_id: PacketId,
    pub topic: String,
    pub qos: Qos,
    pub payload: Vec<u8>,
    #[serde(default)]
    pub retain: bool,
}

impl PublishRecord {
    pub fn new(packet_id: PacketId, topic: impl Into<String>, qos: Qos, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            packet_id,
            topic: topic.into(),
            qos,
            payload: payload.into(),
            retain: false,
        }
    }

    pub fn encode(&self) -> Result<Bytes, serde_json::Error> {
        serde_json::to_vec(self).map(Bytes::from)
    }

    pub fn decode(value: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(value)
    }
}

/// A decoded record waiting for acknowledgement, tagged with its log offset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingMessage {
    pub packet_id: PacketId,
    pub topic: String,
    pub qos: Qos,
    pub payload: Bytes,
    pub retain: bool,
    pub offset: u64,
}

impl PendingMessage {
    pub fn from_record(record: &LogRecord) -> Result<Self, serde_json::Error> {
        let publish = PublishRecord::decode(&record.value)?;
        Ok(Self {
            packet_id: publish.packet_id,
            topic: publish.topic,
            qos: publish.qos,
            payload: Bytes::from(publish.payload),
            retain: publish.retain,
            offset: record.offset,
        })
    }
}

/// One polled batch after decoding.
///
/// `max_offset` covers every polled record, including the ones that failed to
/// decode, so retiring the batch moves the partition past them.
#[derive(Debug, Clone, Default)]
pub struct DecodedBatch {
    pub messages: Vec<PendingMessage>,
    pub max_offset: u64,
    pub undecodable: usize,
}

impl DecodedBatch {
    pub fn decode(client_id: &str, records: &[LogRecord]) -> Self {
        let mut batch = DecodedBatch {
            messages: Vec::with_capacity(records.len()),
            max_offset: records.iter().map(|r| r.offset).max().unwrap_or(0),
            undecodable: 0,
        };
        for record in records {
            match PendingMessage::from_record(record) {
                Ok(msg) => batch.messages.push(msg),
                Err(err) => {
                    batch.undecodable += 1;
                    error!(
                        client_id,
                        offset = record.offset,
                        error = %err,
                        "dropping undecodable persisted record"
                    );
                }
            }
        }
        batch
    }
}
