//! Commit-or-retry decisions.

use super::context::ProcessingContext;
use super::message::PendingMessage;
use crate::config::AckStrategyConfig;
use crate::mqtt::PacketId;
use std::collections::HashMap;
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessingDecision {
    /// Retire the batch and commit past it.
    Commit,
    /// Resubmit exactly these messages in a new round.
    Retry {
        reprocess: HashMap<PacketId, PendingMessage>,
    },
}

/// Policy instance for one polled batch. The round counter is never carried
/// over to the next batch.
#[derive(Debug)]
pub struct AckStrategy {
    client_id: String,
    policy: AckStrategyConfig,
    retries: u32,
}

impl AckStrategy {
    pub fn new(client_id: impl Into<String>, policy: AckStrategyConfig) -> Self {
        Self {
            client_id: client_id.into(),
            policy,
            retries: 0,
        }
    }

    pub fn analyze(&mut self, ctx: &ProcessingContext) -> ProcessingDecision {
        let unacked = ctx.unacked();
        if unacked.is_empty() {
            return ProcessingDecision::Commit;
        }
        match self.policy {
            AckStrategyConfig::AllOrNothing => self.retry(unacked),
            AckStrategyConfig::SkipFailedAfterRetries { max_retries } => {
                if self.retries < max_retries {
                    self.retry(unacked)
                } else {
                    self.skip(&unacked, "retries exhausted");
                    ProcessingDecision::Commit
                }
            }
            AckStrategyConfig::SkipAll => {
                self.skip(&unacked, "skip_all policy");
                ProcessingDecision::Commit
            }
        }
    }

    fn retry(&mut self, unacked: Vec<PendingMessage>) -> ProcessingDecision {
        self.retries += 1;
        debug!(
            client_id = %self.client_id,
            round = self.retries,
            unacked = unacked.len(),
            "retrying unacknowledged messages"
        );
        ProcessingDecision::Retry {
            reprocess: unacked.into_iter().map(|m| (m.packet_id, m)).collect(),
        }
    }

    fn skip(&self, unacked: &[PendingMessage], reason: &str) {
        for message in unacked {
            warn!(
                client_id = %self.client_id,
                packet_id = message.packet_id,
                offset = message.offset,
                topic = %message.topic,
                reason,
                rounds = self.retries,
                "skipping unacknowledged persisted message"
            );
        }
    }
}
