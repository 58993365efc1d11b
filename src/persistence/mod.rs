//! Persistent delivery for application clients.
//!
//! Messages for a persisted client are appended to a per-client topic in the
//! durable log while the client is away. Once it connects,
//! [`PersistenceProcessor::start_processing`] spawns a worker that replays the
//! topic in packs, tracks PUBACKs in a [`ProcessingContext`] and advances the
//! committed offset only past acknowledged (or deliberately skipped) records.
//!
//! The pieces:
//! - `message`: record body and decoded batches.
//! - `context`: per-round ack tracking with a bounded wait.
//! - `submit`: burst or sequential submission, working set and retirement.
//! - `ack`: commit-or-retry policies.
//! - `state`: the worker/context registry.
//! - `delivery`: session and publish seams.
//! - `counter`: active-worker gauge.
//! - `processor`: the public entry point and the worker loop.

pub mod ack;
pub mod context;
pub mod counter;
pub mod delivery;
pub mod message;
pub mod processor;
pub mod state;
pub mod submit;

pub use ack::{AckStrategy, ProcessingDecision};
pub use context::{PacketState, ProcessingContext};
pub use counter::{AtomicProcessorCounter, ProcessorCounter};
pub use delivery::{ClientSession, ConnectionState, PublishDelivery, SessionHandle};
pub use message::{DecodedBatch, PendingMessage, PublishRecord};
pub use processor::PersistenceProcessor;
pub use state::{ClientDeliveryState, Registration};
pub use submit::SubmitStrategy;
