//! Seams towards the broker: client sessions and the publish path.

use crate::mqtt::{PacketId, Qos};
use bytes::Bytes;
use std::sync::atomic::{AtomicU8, Ordering};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Connected,
    Disconnected,
}

impl ConnectionState {
    fn from_bits(bits: u8) -> Self {
        match bits {
            0 => ConnectionState::Connecting,
            1 => ConnectionState::Connected,
            _ => ConnectionState::Disconnected,
        }
    }

    fn bits(self) -> u8 {
        match self {
            ConnectionState::Connecting => 0,
            ConnectionState::Connected => 1,
            ConnectionState::Disconnected => 2,
        }
    }
}

/// A connected application client as seen by the persistence core.
pub trait ClientSession: Send + Sync + 'static {
    fn client_id(&self) -> &str;

    fn connection_state(&self) -> ConnectionState;

    fn is_connected(&self) -> bool {
        self.connection_state() == ConnectionState::Connected
    }
}

/// Session backed by an atomic state flag, flipped by the connection owner.
#[derive(Debug)]
pub struct SessionHandle {
    client_id: String,
    state: AtomicU8,
}

impl SessionHandle {
    pub fn new(client_id: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            state: AtomicU8::new(ConnectionState::Connected.bits()),
        }
    }

    pub fn set_state(&self, state: ConnectionState) {
        self.state.store(state.bits(), Ordering::SeqCst);
    }

    pub fn disconnect(&self) {
        self.set_state(ConnectionState::Disconnected);
    }
}

impl ClientSession for SessionHandle {
    fn client_id(&self) -> &str {
        &self.client_id
    }

    fn connection_state(&self) -> ConnectionState {
        ConnectionState::from_bits(self.state.load(Ordering::SeqCst))
    }
}

/// Outbound PUBLISH path. Fire-and-forget: the PUBACK comes back through
/// `PersistenceProcessor::acknowledge_delivery`.
pub trait PublishDelivery: Send + Sync + 'static {
    fn deliver(
        &self,
        session: &dyn ClientSession,
        packet_id: PacketId,
        topic: &str,
        qos: Qos,
        payload: &Bytes,
    );
}

impl<F> PublishDelivery for F
where
    F: Fn(&dyn ClientSession, PacketId, &str, Qos, &Bytes) + Send + Sync + 'static,
{
    fn deliver(
        &self,
        session: &dyn ClientSession,
        packet_id: PacketId,
        topic: &str,
        qos: Qos,
        payload: &Bytes,
    ) {
        self(session, packet_id, topic, qos, payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::Arc;

    #[test]
    fn session_state_transitions() {
        let session = SessionHandle::new("c1");
        assert!(session.is_connected());
        session.set_state(ConnectionState::Connecting);
        assert_eq!(session.connection_state(), ConnectionState::Connecting);
        session.disconnect();
        assert!(!session.is_connected());
    }

    #[test]
    fn closures_act_as_delivery() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let delivery = move |session: &dyn ClientSession, id: PacketId, topic: &str, _: Qos, _: &Bytes| {
            sink.lock().push((session.client_id().to_string(), id, topic.to_string()));
        };
        let session = SessionHandle::new("c1");
        delivery.deliver(&session, 4, "a/b", Qos::AtLeastOnce, &Bytes::new());
        assert_eq!(seen.lock().as_slice(), &[("c1".to_string(), 4, "a/b".to_string())]);
    }
}
