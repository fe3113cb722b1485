//! Message store: per-message records plus an index list.
//!
//! Layout in the backend:
//! ```text
//! message_<id>   → JSON record {id, author, content, time}
//! messagesList   → [newest id, ..., oldest id]
//! ```
//!
//! Consistency contract between the two:
//! - create writes the record, then pushes the id (one call via
//!   [`KvBackend::set_and_push`]; atomic on the bundled backends).
//! - delete removes the record, then the id. Between the two calls, or after
//!   a backend fault, the index may name a record that no longer exists.
//!   Listing skips such ids and [`MessageStore::reconcile`] drops them.
//! - edit rewrites the record only; index order is creation order.
//!
//! The author check on edit/delete and the write that follows are separate
//! backend calls. Two racing deletes of one id end with one `NotFound`.

use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

use crate::protocol::Message;
use crate::storage::{BackendError, KvBackend, MemoryBackend};

/// Key prefix for message records.
pub const MESSAGE_PREFIX: &str = "message_";

/// Key of the index list.
pub const INDEX_KEY: &str = "messagesList";

/// Number of messages returned by a default listing.
pub const DEFAULT_LIST_LIMIT: usize = 50;

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Cap applied by [`MessageStore::list_recent`]
    pub list_limit: usize,
    /// Longest accepted message content, in bytes
    pub max_content_len: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            list_limit: DEFAULT_LIST_LIMIT,
            max_content_len: 4096,
        }
    }
}

/// Store errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("Message not found: {0}")]
    NotFound(String),
    #[error("Author '{author}' may not modify message {id}")]
    Forbidden { id: String, author: String },
    #[error("Invalid message: {0}")]
    Invalid(String),
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Backend error: {0}")]
    Backend(#[from] BackendError),
}

/// Message store over any [`KvBackend`].
#[derive(Clone)]
pub struct MessageStore {
    backend: Arc<dyn KvBackend>,
    config: StoreConfig,
}

impl MessageStore {
    /// Store with the default configuration.
    pub fn new(backend: Arc<dyn KvBackend>) -> Self {
        Self::with_config(backend, StoreConfig::default())
    }

    /// Store with explicit limits.
    pub fn with_config(backend: Arc<dyn KvBackend>, config: StoreConfig) -> Self {
        Self { backend, config }
    }

    /// Store over a fresh [`MemoryBackend`].
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryBackend::new()))
    }

    /// Active configuration.
    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// Underlying key-value backend.
    pub fn backend(&self) -> &Arc<dyn KvBackend> {
        &self.backend
    }

    /// Backend key for a message id.
    pub fn message_key(id: &str) -> String {
        format!("{MESSAGE_PREFIX}{id}")
    }

    /// Persist a new message under a fresh id.
    ///
    /// Any id the caller put on `msg` is replaced. Ids are UUID v4; a
    /// collision would overwrite an existing record and is not checked for.
    pub fn create(&self, mut msg: Message) -> Result<Message, StoreError> {
        self.validate_new(&msg)?;

        msg.id = Uuid::new_v4().to_string();
        let json = encode_record(&msg)?;
        let key = Self::message_key(&msg.id);

        self.backend.set_and_push(&key, &json, INDEX_KEY, &msg.id)?;

        log::debug!("Stored message {} by {}", msg.id, msg.author);
        Ok(msg)
    }

    /// Read one message.
    pub fn get(&self, id: &str) -> Result<Message, StoreError> {
        let raw = self
            .backend
            .get(&Self::message_key(id))?
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        decode_record(id, &raw)
    }

    /// Up to `limit` most recent messages keyed by id.
    ///
    /// Ids whose record is missing or unreadable are logged and skipped, so
    /// the map can hold fewer than `limit` entries even when more exist.
    pub fn list(&self, limit: usize) -> Result<HashMap<String, Message>, StoreError> {
        Ok(self
            .list_ordered(limit)?
            .into_iter()
            .map(|msg| (msg.id.clone(), msg))
            .collect())
    }

    /// [`list`](Self::list) capped at the configured limit.
    pub fn list_recent(&self) -> Result<HashMap<String, Message>, StoreError> {
        self.list(self.config.list_limit)
    }

    /// Same records as [`list`](Self::list), newest first.
    pub fn list_ordered(&self, limit: usize) -> Result<Vec<Message>, StoreError> {
        if limit == 0 {
            return Ok(Vec::new());
        }

        // Limits past i64::MAX cannot be expressed as a range end; clamp.
        let stop = i64::try_from(limit).unwrap_or(i64::MAX) - 1;
        let ids = self.backend.lrange(INDEX_KEY, 0, stop)?;
        let mut messages = Vec::with_capacity(ids.len());

        for id in ids {
            match self.backend.get(&Self::message_key(&id)) {
                Ok(Some(raw)) => match decode_record(&id, &raw) {
                    Ok(msg) => messages.push(msg),
                    Err(e) => log::warn!("Skipping message {id}: {e}"),
                },
                Ok(None) => log::warn!("Skipping message {id}: indexed but no record"),
                Err(e) => log::warn!("Skipping message {id}: {e}"),
            }
        }

        Ok(messages)
    }

    /// Replace the content of a message owned by `author`.
    ///
    /// The index list is not touched.
    pub fn edit(&self, id: &str, author: &str, content: &str) -> Result<Message, StoreError> {
        self.validate_content(content)?;

        let mut msg = self.load_owned(id, author, "edit")?;
        msg.content = content.to_string();
        self.backend
            .set(&Self::message_key(id), &encode_record(&msg)?)?;

        log::debug!("Edited message {id}");
        Ok(msg)
    }

    /// Delete a message owned by `author`.
    ///
    /// Removes every occurrence of the id from the index.
    pub fn delete(&self, id: &str, author: &str) -> Result<(), StoreError> {
        self.load_owned(id, author, "delete")?;

        self.backend.del(&Self::message_key(id))?;
        let removed = self.backend.lrem(INDEX_KEY, 0, id)?;
        if removed != 1 {
            log::warn!("Index held {removed} entries for deleted message {id}");
        }

        log::debug!("Deleted message {id}");
        Ok(())
    }

    /// Drop index entries whose record no longer exists.
    ///
    /// Returns how many distinct ids were removed. Records that exist but do
    /// not decode are kept; they are a data problem, not a dangling entry.
    pub fn reconcile(&self) -> Result<usize, StoreError> {
        let ids = self.backend.lrange(INDEX_KEY, 0, -1)?;
        let mut removed = 0;
        let mut seen = std::collections::HashSet::new();

        for id in ids {
            if !seen.insert(id.clone()) {
                continue;
            }
            if self.backend.get(&Self::message_key(&id))?.is_none() {
                self.backend.lrem(INDEX_KEY, 0, &id)?;
                removed += 1;
            }
        }

        if removed > 0 {
            log::info!("Reconciled index: removed {removed} dangling ids");
        }
        Ok(removed)
    }

    /// Flush the backend.
    pub fn flush(&self) -> Result<(), StoreError> {
        self.backend.flush()?;
        Ok(())
    }

    fn load_owned(&self, id: &str, author: &str, action: &str) -> Result<Message, StoreError> {
        let msg = self.get(id).map_err(|e| {
            log::warn!("Cannot {action} message {id}: {e}");
            e
        })?;

        if msg.author != author {
            log::warn!("Refusing {action} of message {id} by '{author}'");
            return Err(StoreError::Forbidden {
                id: id.to_string(),
                author: author.to_string(),
            });
        }
        Ok(msg)
    }

    fn validate_new(&self, msg: &Message) -> Result<(), StoreError> {
        if msg.author.trim().is_empty() {
            return Err(StoreError::Invalid("author is empty".into()));
        }
        self.validate_content(&msg.content)
    }

    fn validate_content(&self, content: &str) -> Result<(), StoreError> {
        if content.len() > self.config.max_content_len {
            return Err(StoreError::Invalid(format!(
                "content is {} bytes, limit is {}",
                content.len(),
                self.config.max_content_len
            )));
        }
        Ok(())
    }
}

fn encode_record(msg: &Message) -> Result<String, StoreError> {
    serde_json::to_string(msg).map_err(|e| StoreError::Serialization(e.to_string()))
}

/// Records written before ids were embedded carry an empty id; the key wins.
fn decode_record(id: &str, raw: &str) -> Result<Message, StoreError> {
    let mut msg: Message =
        serde_json::from_str(raw).map_err(|e| StoreError::Serialization(e.to_string()))?;
    msg.id = id.to_string();
    Ok(msg)
}
