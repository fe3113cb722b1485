//! Key-value backends for the message store.
//!
//! The store only needs six Redis-style operations:
//! ```text
//! SET key value          GET key            DEL key
//! LPUSH list value       LRANGE list a b    LREM list count value
//! ```
//! plus `set_and_push`, which writes a record and pushes its index entry.
//! Backends that can commit both in one step override it; the default
//! issues the two calls in order and compensates if the second fails.
//!
//! ```text
//! ┌──────────────┐      ┌───────────────┐
//! │ MessageStore │ ───► │ dyn KvBackend │
//! └──────────────┘      └───────┬───────┘
//!                               │
//!                  ┌────────────┴────────────┐
//!                  ▼                         ▼
//!          ┌───────────────┐        ┌────────────────┐
//!          │ MemoryBackend │        │ RocksBackend   │
//!          │ (HashMap)     │        │ (records/lists)│
//!          └───────────────┘        └────────────────┘
//! ```

pub mod memory;
pub mod rocks;

use std::collections::VecDeque;

pub use memory::MemoryBackend;
pub use rocks::{RocksBackend, RocksConfig};

/// Errors raised by a key-value backend.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BackendError {
    #[error("Database error: {0}")]
    Database(String),
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Compression error: {0}")]
    Compression(String),
    #[error("Backend unavailable: {0}")]
    Unavailable(String),
}

impl From<rocksdb::Error> for BackendError {
    fn from(e: rocksdb::Error) -> Self {
        BackendError::Database(e.to_string())
    }
}

/// Redis-style key-value operations required by the message store.
///
/// Implementations must be safe to call from many tasks at once. Every call
/// blocks the caller until the backend answers; no deadline is applied.
pub trait KvBackend: Send + Sync {
    /// Short name for logs.
    fn name(&self) -> &'static str;

    fn set(&self, key: &str, value: &str) -> Result<(), BackendError>;

    fn get(&self, key: &str) -> Result<Option<String>, BackendError>;

    /// Returns whether the key existed.
    fn del(&self, key: &str) -> Result<bool, BackendError>;

    /// Push to the head of `list`. Returns the new length.
    fn lpush(&self, list: &str, value: &str) -> Result<usize, BackendError>;

    /// Inclusive range; negative indices count from the tail (`-1` is last).
    fn lrange(&self, list: &str, start: i64, stop: i64) -> Result<Vec<String>, BackendError>;

    /// Remove occurrences of `value`: `count > 0` from the head, `count < 0`
    /// from the tail, `count == 0` all of them. Returns how many were removed.
    fn lrem(&self, list: &str, count: i64, value: &str) -> Result<usize, BackendError>;

    /// Write `key = value` and push `item` onto `list`.
    ///
    /// The default is two calls. If the push fails after the write landed,
    /// the record is deleted again so it does not leak; if that delete fails
    /// too the orphan is logged and left behind.
    fn set_and_push(
        &self,
        key: &str,
        value: &str,
        list: &str,
        item: &str,
    ) -> Result<(), BackendError> {
        self.set(key, value)?;
        if let Err(e) = self.lpush(list, item) {
            log::error!("Index push for {key} failed on {}: {e}", self.name());
            if let Err(cleanup) = self.del(key) {
                log::error!("Orphan record {key} left behind: {cleanup}");
            }
            return Err(e);
        }
        Ok(())
    }

    /// Make prior writes durable. In-memory backends have nothing to do.
    fn flush(&self) -> Result<(), BackendError> {
        Ok(())
    }
}

/// Resolve a Redis-style inclusive `[start, stop]` against a list length.
///
/// Returns `None` when the range selects nothing.
pub(crate) fn resolve_range(len: usize, start: i64, stop: i64) -> Option<(usize, usize)> {
    if len == 0 {
        return None;
    }
    let len_i = len as i64;
    let start = if start < 0 { (len_i + start).max(0) } else { start };
    let stop = if stop < 0 { len_i + stop } else { stop.min(len_i - 1) };
    if start > stop || start >= len_i || stop < 0 {
        return None;
    }
    Some((start as usize, stop as usize))
}

/// Apply `LREM` semantics to an in-memory list.
pub(crate) fn remove_matches(list: &mut VecDeque<String>, count: i64, value: &str) -> usize {
    let limit = if count == 0 { usize::MAX } else { count.unsigned_abs() as usize };
    let mut removed = 0;

    if count >= 0 {
        let mut i = 0;
        while i < list.len() && removed < limit {
            if list[i] == value {
                list.remove(i);
                removed += 1;
            } else {
                i += 1;
            }
        }
    } else {
        let mut i = list.len();
        while i > 0 && removed < limit {
            i -= 1;
            if list[i] == value {
                list.remove(i);
                removed += 1;
            }
        }
    }

    removed
}
