//! Submission of a pack to the client.

use super::context::ProcessingContext;
use super::message::{DecodedBatch, PendingMessage};
use crate::config::SubmitStrategyKind;
use crate::mqtt::PacketId;
use std::collections::HashMap;
use tokio::time::Instant;
use tracing::{trace, warn};

/// Working set of one polled batch.
///
/// The working set only ever shrinks (through [`SubmitStrategy::update`]) and
/// always stays in log order. `max_offset` belongs to the original batch and is
/// what [`SubmitStrategy::retire`] commits past.
#[derive(Debug)]
pub struct SubmitStrategy {
    kind: SubmitStrategyKind,
    working: Vec<PendingMessage>,
    max_offset: u64,
}

impl SubmitStrategy {
    pub fn new(kind: SubmitStrategyKind) -> Self {
        Self {
            kind,
            working: Vec::new(),
            max_offset: 0,
        }
    }

    /// Establish the working set for a freshly polled batch.
    pub fn init(&mut self, batch: DecodedBatch) {
        let mut messages = batch.messages;
        messages.sort_by_key(|m| m.offset);
        self.working = messages;
        self.max_offset = batch.max_offset;
    }

    pub fn pending(&self) -> &[PendingMessage] {
        &self.working
    }

    pub fn len(&self) -> usize {
        self.working.len()
    }

    pub fn is_empty(&self) -> bool {
        self.working.is_empty()
    }

    pub fn max_offset(&self) -> u64 {
        self.max_offset
    }

    /// Push the working set through `deliver` in log order and return how many
    /// messages were handed over. `deliver` returning false stops the round.
    ///
    /// QoS 0 messages never get a PUBACK, so they count as acked once delivered.
    pub async fn process<F>(&self, ctx: &ProcessingContext, deadline: Instant, mut deliver: F) -> usize
    where
        F: FnMut(&PendingMessage) -> bool + Send,
    {
        let mut submitted = 0;
        for message in &self.working {
            if !ctx.is_tracked(message.packet_id) {
                warn!(
                    packet_id = message.packet_id,
                    offset = message.offset,
                    "skipping message not tracked by the processing context"
                );
                continue;
            }
            if !deliver(message) {
                trace!(submitted, "submission interrupted");
                break;
            }
            submitted += 1;
            trace!(packet_id = message.packet_id, offset = message.offset, "submitted");
            if !message.qos.expects_ack() {
                ctx.on_success(message.packet_id);
            }
            if self.kind == SubmitStrategyKind::Sequential
                && !ctx.await_packet(message.packet_id, deadline).await
            {
                trace!(packet_id = message.packet_id, "sequential submission halted");
                break;
            }
        }
        submitted
    }

    /// Shrink the working set to `reprocess`, keeping log order.
    pub fn update(&mut self, reprocess: &HashMap<PacketId, PendingMessage>) {
        self.working.retain(|m| reprocess.contains_key(&m.packet_id));
    }

    /// Finish the batch, yielding the offset to commit.
    pub fn retire(self) -> u64 {
        self.max_offset + 1
    }
}
