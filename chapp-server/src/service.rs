//! Request-style entry points.
//!
//! Everything that mutates messages goes through [`ChatService`], whether it
//! arrives on a WebSocket session or from an HTTP handler: the store decides,
//! and on success the broadcaster tells every connected client.
//!
//! A rejected request (`NotFound`, `Forbidden`, `Invalid`, backend failure)
//! is never broadcast. A broadcast that cannot be encoded after a successful
//! write is logged; the write stands.

use std::collections::HashMap;
use std::sync::Arc;

use crate::broadcast::{BroadcastReport, BroadcastStats, Broadcaster};
use crate::protocol::{DeleteRequest, EditRequest, Message, ServerEvent};
use crate::registry::ConnectionRegistry;
use crate::store::{MessageStore, StoreError};

/// Store + broadcaster, shared by every session and request handler.
pub struct ChatService {
    store: MessageStore,
    broadcaster: Broadcaster,
}

impl ChatService {
    /// Service over `store`, broadcasting to `registry`.
    pub fn new(store: MessageStore, registry: Arc<ConnectionRegistry>) -> Self {
        Self {
            store,
            broadcaster: Broadcaster::new(registry),
        }
    }

    /// Service over an in-memory store with its own registry.
    pub fn in_memory() -> Self {
        Self::new(MessageStore::in_memory(), Arc::new(ConnectionRegistry::new()))
    }

    /// Underlying message store.
    pub fn store(&self) -> &MessageStore {
        &self.store
    }

    /// Connections that receive broadcasts.
    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        self.broadcaster.registry()
    }

    /// Snapshot of broadcast counters.
    pub fn broadcast_stats(&self) -> BroadcastStats {
        self.broadcaster.stats()
    }

    /// Store a new message and broadcast it with its assigned id.
    pub fn create(&self, msg: Message) -> Result<Message, StoreError> {
        let stored = self.store.create(msg)?;
        self.publish(ServerEvent::created(stored.clone()));
        Ok(stored)
    }

    /// Most recent messages, up to the configured cap.
    pub fn list(&self) -> Result<HashMap<String, Message>, StoreError> {
        self.store.list_recent()
    }

    /// Most recent messages, at most `limit` and never more than the cap.
    pub fn list_with_limit(&self, limit: usize) -> Result<HashMap<String, Message>, StoreError> {
        self.store.list(limit.min(self.store.config().list_limit))
    }

    /// Change a message's content; broadcasts `{msgId, content}`.
    pub fn edit(&self, req: EditRequest) -> Result<(), StoreError> {
        self.store.edit(&req.msg_id, &req.author, &req.content)?;
        self.publish(ServerEvent::edited(req.msg_id, req.content));
        Ok(())
    }

    /// Remove a message; broadcasts `{msgId}`.
    pub fn delete(&self, req: DeleteRequest) -> Result<(), StoreError> {
        self.store.delete(&req.msg_id, &req.author)?;
        self.publish(ServerEvent::deleted(req.msg_id));
        Ok(())
    }

    /// See [`MessageStore::reconcile`].
    pub fn reconcile(&self) -> Result<usize, StoreError> {
        self.store.reconcile()
    }

    /// Flush the backend. Connections are left to their sessions.
    pub fn shutdown(&self) -> Result<(), StoreError> {
        log::info!(
            "Flushing {} backend ({} connections open)",
            self.store.backend().name(),
            self.registry().len()
        );
        self.store.flush()
    }

    fn publish(&self, event: ServerEvent) -> Option<BroadcastReport> {
        match self.broadcaster.broadcast(&event) {
            Ok(report) => Some(report),
            Err(e) => {
                log::error!("Failed to broadcast {}: {e}", event.kind().as_str());
                None
            }
        }
    }
}
