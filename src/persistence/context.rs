//! Per-round acknowledgement bookkeeping.
//!
//! A `ProcessingContext` tracks one pack from submission until the
//! commit-or-retry decision. Acks may arrive from any task and in any order;
//! completion is tracked by packet identifier only.

use super::message::PendingMessage;
use crate::mqtt::PacketId;
use parking_lot::Mutex;
use std::collections::HashMap;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{trace, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketState {
    Pending,
    Acked,
    Failed,
}

#[derive(Debug)]
struct TrackedPacket {
    message: PendingMessage,
    state: PacketState,
}

#[derive(Debug, Default)]
struct PackState {
    packets: HashMap<PacketId, TrackedPacket>,
    pending: usize,
    closed: bool,
}

#[derive(Debug)]
pub struct ProcessingContext {
    pack: Mutex<PackState>,
    changed: Notify,
}

impl ProcessingContext {
    /// Track every message as Pending. A packet identifier seen twice is
    /// tracked once and both messages share its outcome.
    pub fn new(messages: impl IntoIterator<Item = PendingMessage>) -> Self {
        let mut pack = PackState::default();
        for message in messages {
            let packet_id = message.packet_id;
            if pack.packets.contains_key(&packet_id) {
                warn!(packet_id, offset = message.offset, "duplicate packet id in pack");
                continue;
            }
            pack.packets.insert(
                packet_id,
                TrackedPacket {
                    message,
                    state: PacketState::Pending,
                },
            );
            pack.pending += 1;
        }
        Self {
            pack: Mutex::new(pack),
            changed: Notify::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.pack.lock().packets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pack.lock().packets.is_empty()
    }

    pub fn is_tracked(&self, packet_id: PacketId) -> bool {
        self.pack.lock().packets.contains_key(&packet_id)
    }

    pub fn state(&self, packet_id: PacketId) -> Option<PacketState> {
        self.pack.lock().packets.get(&packet_id).map(|p| p.state)
    }

    /// True once no packet is Pending.
    pub fn is_resolved(&self) -> bool {
        self.pack.lock().pending == 0
    }

    pub fn is_closed(&self) -> bool {
        self.pack.lock().closed
    }

    /// Mark `packet_id` acked. Returns false for unknown, already resolved or
    /// post-cleanup acks, which leave the context untouched.
    pub fn on_success(&self, packet_id: PacketId) -> bool {
        let completed = {
            let mut pack = self.pack.lock();
            if pack.closed {
                trace!(packet_id, "ack after cleanup ignored");
                return false;
            }
            match pack.packets.get_mut(&packet_id) {
                Some(packet) if packet.state == PacketState::Pending => {
                    packet.state = PacketState::Acked;
                }
                Some(_) => return false,
                None => {
                    trace!(packet_id, "ack for untracked packet ignored");
                    return false;
                }
            }
            pack.pending -= 1;
            pack.pending == 0
        };
        if completed {
            trace!("pack fully acknowledged");
        }
        self.changed.notify_waiters();
        true
    }

    /// Wait until every packet is resolved or `deadline` passes. On timeout the
    /// remaining Pending packets become Failed. Returns true when nothing failed.
    pub async fn await_resolution(&self, deadline: Instant) -> bool {
        loop {
            let changed = self.changed.notified();
            tokio::pin!(changed);
            changed.as_mut().enable();
            {
                let pack = self.pack.lock();
                if pack.pending == 0 {
                    return !pack.packets.values().any(|p| p.state == PacketState::Failed);
                }
                if pack.closed {
                    return false;
                }
            }
            if tokio::time::timeout_at(deadline, changed).await.is_err() {
                return self.expire_pending() == 0 && self.failed_count() == 0;
            }
        }
    }

    /// Wait until `packet_id` leaves Pending or `deadline` passes. Returns true
    /// if it was acked.
    pub async fn await_packet(&self, packet_id: PacketId, deadline: Instant) -> bool {
        loop {
            let changed = self.changed.notified();
            tokio::pin!(changed);
            changed.as_mut().enable();
            match self.state(packet_id) {
                Some(PacketState::Pending) if !self.is_closed() => {}
                Some(PacketState::Acked) => return true,
                _ => return false,
            }
            if tokio::time::timeout_at(deadline, changed).await.is_err() {
                return self.state(packet_id) == Some(PacketState::Acked);
            }
        }
    }

    /// Turn every Pending packet into Failed, returning how many changed.
    pub fn expire_pending(&self) -> usize {
        let expired = {
            let mut pack = self.pack.lock();
            let mut expired = 0;
            for packet in pack.packets.values_mut() {
                if packet.state == PacketState::Pending {
                    packet.state = PacketState::Failed;
                    expired += 1;
                }
            }
            pack.pending = 0;
            expired
        };
        if expired > 0 {
            self.changed.notify_waiters();
        }
        expired
    }

    fn failed_count(&self) -> usize {
        self.pack
            .lock()
            .packets
            .values()
            .filter(|p| p.state == PacketState::Failed)
            .count()
    }

    /// Acked packet identifiers in log order.
    pub fn acked_ids(&self) -> Vec<PacketId> {
        let pack = self.pack.lock();
        let mut acked: Vec<&TrackedPacket> = pack
            .packets
            .values()
            .filter(|p| p.state == PacketState::Acked)
            .collect();
        acked.sort_by_key(|p| p.message.offset);
        acked.iter().map(|p| p.message.packet_id).collect()
    }

    /// Every message not acked (Pending or Failed), in log order.
    pub fn unacked(&self) -> Vec<PendingMessage> {
        let pack = self.pack.lock();
        let mut unacked: Vec<PendingMessage> = pack
            .packets
            .values()
            .filter(|p| p.state != PacketState::Acked)
            .map(|p| p.message.clone())
            .collect();
        unacked.sort_by_key(|m| m.offset);
        unacked
    }

    /// Close the context once the decision is taken. Later acks are dropped and
    /// any remaining waiter is released.
    pub fn cleanup(&self) {
        let already_closed = {
            let mut pack = self.pack.lock();
            std::mem::replace(&mut pack.closed, true)
        };
        if already_closed {
            warn!("processing context cleaned up twice");
        }
        self.changed.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mqtt::Qos;
    use bytes::Bytes;
    use std::sync::Arc;
    use std::time::Duration;

    fn message(packet_id: PacketId, offset: u64) -> PendingMessage {
        PendingMessage {
            packet_id,
            topic: "t".into(),
            qos: Qos::AtLeastOnce,
            payload: Bytes::new(),
            retain: false,
            offset,
        }
    }

    #[test]
    fn on_success_is_idempotent() {
        let ctx = ProcessingContext::new(vec![message(1, 10), message(2, 11)]);
        assert!(ctx.on_success(1));
        assert!(!ctx.on_success(1));
        assert!(!ctx.on_success(99));
        assert_eq!(ctx.state(1), Some(PacketState::Acked));
        assert!(!ctx.is_resolved());
        assert!(ctx.on_success(2));
        assert!(ctx.is_resolved());
        assert_eq!(ctx.acked_ids(), vec![1, 2]);
    }

    #[tokio::test(start_paused = true)]
    async fn await_times_out_and_fails_pending() {
        let ctx = ProcessingContext::new(vec![message(1, 10), message(2, 11), message(3, 12)]);
        ctx.on_success(3);
        ctx.on_success(1);
        let deadline = Instant::now() + Duration::from_secs(5);
        assert!(!ctx.await_resolution(deadline).await);
        assert_eq!(ctx.state(2), Some(PacketState::Failed));
        let unacked: Vec<PacketId> = ctx.unacked().iter().map(|m| m.packet_id).collect();
        assert_eq!(unacked, vec![2]);
    }

    #[tokio::test]
    async fn final_ack_wakes_waiter_before_deadline() {
        let ctx = Arc::new(ProcessingContext::new(vec![message(5, 1), message(6, 2)]));
        let acker = ctx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            acker.on_success(6);
            acker.on_success(5);
        });
        let started = std::time::Instant::now();
        let deadline = Instant::now() + Duration::from_secs(30);
        assert!(ctx.await_resolution(deadline).await);
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn await_packet_reports_individual_ack() {
        let ctx = Arc::new(ProcessingContext::new(vec![message(1, 1), message(2, 2)]));
        let acker = ctx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            acker.on_success(1);
        });
        let deadline = Instant::now() + Duration::from_secs(1);
        assert!(ctx.await_packet(1, deadline).await);
        assert!(!ctx.await_packet(2, deadline).await);
        assert_eq!(ctx.state(2), Some(PacketState::Pending));
    }

    #[test]
    fn acks_after_cleanup_are_dropped() {
        let ctx = ProcessingContext::new(vec![message(1, 1)]);
        ctx.expire_pending();
        ctx.cleanup();
        assert!(!ctx.on_success(1));
        assert_eq!(ctx.state(1), Some(PacketState::Failed));
        assert!(ctx.is_closed());
    }

    #[test]
    fn duplicate_packet_ids_collapse() {
        let ctx = ProcessingContext::new(vec![message(1, 1), message(1, 2)]);
        assert_eq!(ctx.len(), 1);
        assert!(ctx.on_success(1));
        assert!(ctx.is_resolved());
    }
}
