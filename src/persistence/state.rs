//! Registry of per-client workers and their in-flight contexts.
//!
//! One map entry per client holds both the worker and its active
//! [`ProcessingContext`]. Every mutation made on behalf of a worker is checked
//! against the worker id stored in the entry, so a worker that lost its entry
//! (stopped or replaced) can no longer publish a context.

use super::context::ProcessingContext;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

#[derive(Debug)]
struct ClientDelivery {
    worker_id: u64,
    cancel: CancellationToken,
    handle: Option<JoinHandle<()>>,
    context: Option<Arc<ProcessingContext>>,
}

impl ClientDelivery {
    fn is_live(&self) -> bool {
        !self.cancel.is_cancelled()
            && self
                .handle
                .as_ref()
                .map(|handle| !handle.is_finished())
                .unwrap_or(false)
    }

    /// Cancel the worker and let it wind down on its own.
    fn detach(self) -> Option<JoinHandle<()>> {
        self.cancel.cancel();
        if let Some(ctx) = self.context {
            ctx.cleanup();
        }
        self.handle
    }

    fn abort(self) {
        if let Some(handle) = self.detach() {
            handle.abort();
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Registration {
    /// No entry existed; a worker was spawned.
    Started,
    /// A live worker already serves the client; nothing was spawned.
    AlreadyRunning,
    /// A finished or cancelled worker was replaced by a new one.
    Replaced,
}

#[derive(Debug, Default)]
pub struct ClientDeliveryState {
    clients: DashMap<String, ClientDelivery>,
    next_worker_id: AtomicU64,
}

impl ClientDeliveryState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a worker for `client_id` unless a live one exists. `spawn`
    /// receives the new worker id and cancellation token.
    pub fn register<F>(&self, client_id: &str, spawn: F) -> Registration
    where
        F: FnOnce(u64, CancellationToken) -> JoinHandle<()>,
    {
        let worker_id = self.next_worker_id.fetch_add(1, Ordering::Relaxed) + 1;
        let cancel = CancellationToken::new();
        match self.clients.entry(client_id.to_string()) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().is_live() {
                    return Registration::AlreadyRunning;
                }
                let handle = spawn(worker_id, cancel.clone());
                let previous = occupied.insert(ClientDelivery {
                    worker_id,
                    cancel,
                    handle: Some(handle),
                    context: None,
                });
                // A cancelled worker may still be closing its consumer.
                drop(previous.detach());
                Registration::Replaced
            }
            Entry::Vacant(vacant) => {
                let handle = spawn(worker_id, cancel.clone());
                vacant.insert(ClientDelivery {
                    worker_id,
                    cancel,
                    handle: Some(handle),
                    context: None,
                });
                Registration::Started
            }
        }
    }

    /// Publish `ctx` as the active context of `worker_id`. Fails once the
    /// worker no longer owns the entry.
    pub fn set_context(&self, client_id: &str, worker_id: u64, ctx: Arc<ProcessingContext>) -> bool {
        match self.clients.get_mut(client_id) {
            Some(mut entry) if entry.worker_id == worker_id && !entry.cancel.is_cancelled() => {
                entry.context = Some(ctx);
                true
            }
            _ => false,
        }
    }

    /// Drop the active context if it is still `ctx`.
    pub fn clear_context(&self, client_id: &str, worker_id: u64, ctx: &Arc<ProcessingContext>) {
        if let Some(mut entry) = self.clients.get_mut(client_id) {
            let current = entry
                .context
                .as_ref()
                .map(|active| Arc::ptr_eq(active, ctx))
                .unwrap_or(false);
            if entry.worker_id == worker_id && current {
                entry.context = None;
            }
        }
    }

    pub fn take_context(&self, client_id: &str, worker_id: u64) -> Option<Arc<ProcessingContext>> {
        let mut entry = self.clients.get_mut(client_id)?;
        if entry.worker_id != worker_id {
            return None;
        }
        entry.context.take()
    }

    pub fn context(&self, client_id: &str) -> Option<Arc<ProcessingContext>> {
        self.clients
            .get(client_id)
            .and_then(|entry| entry.context.clone())
    }

    /// Cancel the worker and hand its join handle to the caller. The entry
    /// stays until [`ClientDeliveryState::remove`].
    pub fn begin_stop(&self, client_id: &str) -> Option<(u64, Option<JoinHandle<()>>)> {
        let mut entry = self.clients.get_mut(client_id)?;
        entry.cancel.cancel();
        Some((entry.worker_id, entry.handle.take()))
    }

    /// Remove the entry if it still belongs to `worker_id`.
    pub fn remove(&self, client_id: &str, worker_id: u64) -> bool {
        match self
            .clients
            .remove_if(client_id, |_, entry| entry.worker_id == worker_id)
        {
            Some((_, entry)) => {
                if let Some(ctx) = entry.context {
                    ctx.cleanup();
                }
                true
            }
            None => false,
        }
    }

    /// Cancel and abort every worker, returning how many entries were dropped.
    pub fn drain(&self) -> usize {
        let clients: Vec<String> = self.clients.iter().map(|e| e.key().clone()).collect();
        let mut drained = 0;
        for client_id in clients {
            if let Some((_, entry)) = self.clients.remove(&client_id) {
                entry.abort();
                drained += 1;
            }
        }
        drained
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    pub fn contains(&self, client_id: &str) -> bool {
        self.clients.contains_key(client_id)
    }
}
