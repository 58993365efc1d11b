//! Per-client persisted delivery.
//!
//! Each persisted application client gets one worker task. The worker polls
//! the client's partition, submits the batch, waits (bounded) for PUBACKs,
//! and lets the [`AckStrategy`] decide whether to commit `max_offset + 1` or
//! resubmit the unacknowledged subset. Nothing past an unacknowledged record
//! is committed unless the policy explicitly skips it.

use super::ack::{AckStrategy, ProcessingDecision};
use super::context::ProcessingContext;
use super::counter::ProcessorCounter;
use super::delivery::{ClientSession, PublishDelivery};
use super::message::{DecodedBatch, PendingMessage};
use super::state::{ClientDeliveryState, Registration};
use super::submit::SubmitStrategy;
use crate::config::ProcessingConfig;
use crate::log::{LogAdmin, LogConsumer, LogError, LogProvider, CLIENT_PARTITION};
use crate::mqtt::PacketId;
use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

struct Shared<L, D> {
    log: L,
    delivery: D,
    settings: ProcessingConfig,
    state: ClientDeliveryState,
}

pub struct PersistenceProcessor<L, D>
where
    L: LogProvider + LogAdmin,
    D: PublishDelivery,
{
    shared: Arc<Shared<L, D>>,
    counter: Arc<dyn ProcessorCounter>,
}

impl<L, D> PersistenceProcessor<L, D>
where
    L: LogProvider + LogAdmin,
    D: PublishDelivery,
{
    pub fn new(
        log: L,
        delivery: D,
        settings: ProcessingConfig,
        counter: Arc<dyn ProcessorCounter>,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                log,
                delivery,
                settings,
                state: ClientDeliveryState::new(),
            }),
            counter,
        }
    }

    pub fn settings(&self) -> &ProcessingConfig {
        &self.shared.settings
    }

    pub fn log(&self) -> &L {
        &self.shared.log
    }

    /// Spawn the delivery worker for `session` unless one is already running.
    /// Must be called from within a tokio runtime.
    pub fn start_processing(&self, session: Arc<dyn ClientSession>) -> Registration {
        let client_id = session.client_id().to_string();
        let shared = self.shared.clone();
        let registration = self.shared.state.register(&client_id, |worker_id, cancel| {
            let worker = Worker {
                shared,
                client_id: client_id.clone(),
                session,
                worker_id,
                cancel,
            };
            tokio::spawn(worker.run())
        });
        match registration {
            Registration::Started => {
                info!(client_id = %client_id, "persisted delivery started");
                if let Err(err) = self.counter.increment() {
                    warn!(client_id = %client_id, "processor counter increment failed: {err:?}");
                }
            }
            Registration::Replaced => {
                info!(client_id = %client_id, "persisted delivery restarted after worker exit");
            }
            Registration::AlreadyRunning => {
                debug!(client_id = %client_id, "persisted delivery already running");
            }
        }
        registration
    }

    /// Record a PUBACK for the client's in-flight pack. Returns false for a
    /// stale ack (no active pack, unknown or already resolved identifier).
    pub fn acknowledge_delivery(&self, client_id: &str, packet_id: PacketId) -> bool {
        match self.shared.state.context(client_id) {
            Some(ctx) => {
                let accepted = ctx.on_success(packet_id);
                if accepted {
                    trace!(client_id, packet_id, "delivery acknowledged");
                } else {
                    debug!(client_id, packet_id, "ack does not match a pending packet");
                }
                accepted
            }
            None => {
                warn!(client_id, packet_id, "stale ack: no processing context");
                false
            }
        }
    }

    /// Cancel the client's worker and wait up to the stop grace period for it
    /// to release the consumer. The registry entry is removed either way; a
    /// worker still running after the grace period is detached and closes its
    /// consumer on its own.
    pub async fn stop_processing(&self, client_id: &str) {
        let Some((worker_id, handle)) = self.shared.state.begin_stop(client_id) else {
            debug!(client_id, "stop requested without an active worker");
            return;
        };
        if let Some(handle) = handle {
            let grace = self.shared.settings.stop_processing_timeout();
            match tokio::time::timeout(grace, handle).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) if err.is_cancelled() => {}
                Ok(Err(err)) => {
                    warn!(client_id, "persisted delivery worker failed: {err:?}");
                }
                Err(_) => {
                    warn!(
                        client_id,
                        grace_ms = grace.as_millis() as u64,
                        "worker did not stop within grace period; detaching"
                    );
                }
            }
        }
        if self.shared.state.remove(client_id, worker_id) {
            if let Err(err) = self.counter.decrement() {
                warn!(client_id, "processor counter decrement failed: {err:?}");
            }
            info!(client_id, "persisted delivery stopped");
        }
    }

    /// Drop every persisted record of the client by deleting its topic.
    pub async fn clear_persisted_messages(&self, client_id: &str) -> Result<()> {
        let topic = self.shared.log.topic_for(client_id);
        self.shared
            .log
            .delete_topic(&topic)
            .await
            .with_context(|| format!("failed to clear persisted messages for {client_id}"))?;
        info!(client_id, topic = %topic, "persisted messages cleared");
        Ok(())
    }

    /// Cancel and abort every worker without waiting.
    pub fn shutdown(&self) {
        let drained = self.shared.state.drain();
        for _ in 0..drained {
            if let Err(err) = self.counter.decrement() {
                warn!("processor counter decrement failed: {err:?}");
            }
        }
        if drained > 0 {
            info!(workers = drained, "persistence processor shut down");
        }
    }

    pub fn active_workers(&self) -> usize {
        self.shared.state.len()
    }

    pub fn is_processing(&self, client_id: &str) -> bool {
        self.shared.state.contains(client_id)
    }

    pub fn topic_for(&self, client_id: &str) -> String {
        self.shared.log.topic_for(client_id)
    }
}

impl<L, D> Drop for PersistenceProcessor<L, D>
where
    L: LogProvider + LogAdmin,
    D: PublishDelivery,
{
    fn drop(&mut self) {
        self.shutdown();
    }
}

struct Worker<L, D> {
    shared: Arc<Shared<L, D>>,
    client_id: String,
    session: Arc<dyn ClientSession>,
    worker_id: u64,
    cancel: CancellationToken,
}

impl<L, D> Worker<L, D>
where
    L: LogProvider + LogAdmin,
    D: PublishDelivery,
{
    fn is_active(&self) -> bool {
        !self.cancel.is_cancelled() && self.session.is_connected()
    }

    async fn run(self) {
        debug!(client_id = %self.client_id, worker_id = self.worker_id, "worker running");
        let Some(mut consumer) = self.open_consumer().await else {
            self.release_context();
            debug!(client_id = %self.client_id, "worker exited before opening a consumer");
            return;
        };
        while self.is_active() {
            let outcome = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                outcome = self.process_next_batch(&mut consumer) => outcome,
            };
            if let Err(err) = outcome {
                if !self.is_active() {
                    break;
                }
                warn!(client_id = %self.client_id, "persisted delivery failed, backing off: {err:?}");
                self.backoff().await;
            }
        }
        self.release_context();
        consumer.unsubscribe_and_close().await;
        info!(client_id = %self.client_id, worker_id = self.worker_id, "worker released consumer");
    }

    async fn open_consumer(&self) -> Option<L::Consumer> {
        while self.is_active() {
            match self.try_open_consumer().await {
                Ok(consumer) => return Some(consumer),
                Err(err) => {
                    warn!(client_id = %self.client_id, "unable to open consumer: {err}");
                    self.backoff().await;
                }
            }
        }
        None
    }

    async fn try_open_consumer(&self) -> Result<L::Consumer, LogError> {
        let mut consumer = self.shared.log.create_consumer(&self.client_id).await?;
        if let Err(err) = consumer.assign_partition(CLIENT_PARTITION) {
            consumer.unsubscribe_and_close().await;
            return Err(err);
        }
        Ok(consumer)
    }

    async fn backoff(&self) {
        tokio::select! {
            _ = self.cancel.cancelled() => {}
            _ = tokio::time::sleep(self.shared.settings.poll_interval()) => {}
        }
    }

    fn release_context(&self) {
        if let Some(ctx) = self.shared.state.take_context(&self.client_id, self.worker_id) {
            ctx.cleanup();
        }
    }

    fn deliver(&self, message: &PendingMessage) -> bool {
        if !self.session.is_connected() {
            return false;
        }
        self.shared.delivery.deliver(
            self.session.as_ref(),
            message.packet_id,
            &message.topic,
            message.qos,
            &message.payload,
        );
        true
    }

    /// Poll one batch and drive it to a commit, or until the worker stops.
    async fn process_next_batch(&self, consumer: &mut L::Consumer) -> Result<()> {
        let settings = &self.shared.settings;
        let records = consumer
            .poll(settings.poll_interval())
            .await
            .with_context(|| format!("poll failed on {}", consumer.topic()))?;
        if records.is_empty() {
            return Ok(());
        }
        let batch = DecodedBatch::decode(&self.client_id, &records);
        debug!(
            client_id = %self.client_id,
            records = records.len(),
            max_offset = batch.max_offset,
            "polled persisted batch"
        );
        let mut submit = SubmitStrategy::new(settings.submit_strategy);
        submit.init(batch);
        if submit.is_empty() {
            let offset = submit.retire();
            consumer
                .commit(CLIENT_PARTITION, offset)
                .await
                .context("commit of undecodable batch failed")?;
            return Ok(());
        }

        let mut ack = AckStrategy::new(self.client_id.clone(), settings.ack_strategy);
        while self.is_active() {
            let ctx = Arc::new(ProcessingContext::new(submit.pending().iter().cloned()));
            if !self
                .shared
                .state
                .set_context(&self.client_id, self.worker_id, ctx.clone())
            {
                debug!(client_id = %self.client_id, "worker deregistered; abandoning batch");
                return Ok(());
            }
            let deadline = Instant::now() + settings.pack_processing_timeout();
            let submitted = submit
                .process(&ctx, deadline, |message| self.deliver(message))
                .await;
            let resolved = if self.is_active() {
                ctx.await_resolution(deadline).await
            } else {
                ctx.expire_pending();
                false
            };
            trace!(client_id = %self.client_id, submitted, resolved, "round finished");
            let decision = ack.analyze(&ctx);
            ctx.cleanup();
            self.shared
                .state
                .clear_context(&self.client_id, self.worker_id, &ctx);

            match decision {
                ProcessingDecision::Commit => {
                    if !self.session.is_connected() {
                        debug!(client_id = %self.client_id, "client gone; batch left uncommitted");
                        return Ok(());
                    }
                    let max_offset = submit.max_offset();
                    let offset = submit.retire();
                    consumer
                        .commit(CLIENT_PARTITION, offset)
                        .await
                        .with_context(|| format!("commit of offset {offset} failed"))?;
                    debug!(client_id = %self.client_id, max_offset, offset, "batch committed");
                    return Ok(());
                }
                ProcessingDecision::Retry { reprocess } => submit.update(&reprocess),
            }
        }
        Ok(())
    }
}
