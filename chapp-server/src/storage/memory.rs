//! In-memory backend.
//!
//! Values and lists live behind one mutex, so `set_and_push` commits the
//! record and its index entry together. Nothing survives a restart.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};

use super::{remove_matches, resolve_range, BackendError, KvBackend};

#[derive(Debug, Default)]
struct MemoryState {
    values: HashMap<String, String>,
    lists: HashMap<String, VecDeque<String>>,
}

/// Process-local key-value backend.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    state: Mutex<MemoryState>,
}

impl MemoryBackend {
    /// Create an empty backend.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of plain keys stored (lists excluded).
    pub fn key_count(&self) -> usize {
        self.lock().values.len()
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        // Every mutation is a single collection call; a poisoned lock still
        // guards consistent maps.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl KvBackend for MemoryBackend {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn set(&self, key: &str, value: &str) -> Result<(), BackendError> {
        self.lock().values.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Option<String>, BackendError> {
        Ok(self.lock().values.get(key).cloned())
    }

    fn del(&self, key: &str) -> Result<bool, BackendError> {
        Ok(self.lock().values.remove(key).is_some())
    }

    fn lpush(&self, list: &str, value: &str) -> Result<usize, BackendError> {
        let mut state = self.lock();
        let entries = state.lists.entry(list.to_string()).or_default();
        entries.push_front(value.to_string());
        Ok(entries.len())
    }

    fn lrange(&self, list: &str, start: i64, stop: i64) -> Result<Vec<String>, BackendError> {
        let state = self.lock();
        let Some(entries) = state.lists.get(list) else {
            return Ok(Vec::new());
        };
        Ok(match resolve_range(entries.len(), start, stop) {
            Some((from, to)) => entries.range(from..=to).cloned().collect(),
            None => Vec::new(),
        })
    }

    fn lrem(&self, list: &str, count: i64, value: &str) -> Result<usize, BackendError> {
        let mut state = self.lock();
        let Some(entries) = state.lists.get_mut(list) else {
            return Ok(0);
        };
        let removed = remove_matches(entries, count, value);
        if entries.is_empty() {
            state.lists.remove(list);
        }
        Ok(removed)
    }

    fn set_and_push(
        &self,
        key: &str,
        value: &str,
        list: &str,
        item: &str,
    ) -> Result<(), BackendError> {
        let mut state = self.lock();
        state.values.insert(key.to_string(), value.to_string());
        state
            .lists
            .entry(list.to_string())
            .or_default()
            .push_front(item.to_string());
        Ok(())
    }
}
