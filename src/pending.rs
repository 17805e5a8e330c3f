//! Correlation table for calls awaiting a reply across a protocol boundary.
//!
//! Each entry owns a single-fire [`oneshot`] completion slot. Removing the
//! entry from the map is the only way to reach its slot, so an id is resolved
//! at most once: whichever of reply, timeout, or teardown removes it first
//! wins, and every later attempt is a no-op.

use std::collections::HashMap;

use tokio::sync::{oneshot, Mutex};

use crate::{AppError, Result};

#[derive(Debug)]
struct Entry<T, M> {
    meta: M,
    slot: oneshot::Sender<T>,
}

/// Pending calls keyed by correlation id.
///
/// `T` is the completion value delivered to the waiter, `M` is caller-defined
/// metadata kept alongside the entry (e.g. the owning session id).
#[derive(Debug)]
pub struct PendingCalls<T, M = ()> {
    entries: Mutex<HashMap<String, Entry<T, M>>>,
}

impl<T, M> Default for PendingCalls<T, M> {
    fn default() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }
}

impl<T, M> PendingCalls<T, M> {
    /// Create an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a call and return the receiver its waiter awaits.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Protocol` if `id` is already pending.
    pub async fn register(&self, id: impl Into<String>, meta: M) -> Result<oneshot::Receiver<T>> {
        let id = id.into();
        let mut entries = self.entries.lock().await;
        if entries.contains_key(&id) {
            return Err(AppError::Protocol(format!(
                "correlation id {id} is already pending"
            )));
        }
        let (slot, rx) = oneshot::channel();
        entries.insert(id, Entry { meta, slot });
        Ok(rx)
    }

    /// Resolve `id` with `value`.
    ///
    /// Returns `false` when the id is unknown or was already resolved. A
    /// waiter that has gone away still counts as resolved.
    pub async fn complete(&self, id: &str, value: T) -> bool {
        let entry = self.entries.lock().await.remove(id);
        match entry {
            Some(entry) => {
                let _ = entry.slot.send(value);
                true
            }
            None => false,
        }
    }

    /// Remove `id` without firing its slot and return its metadata.
    ///
    /// Used by a waiter that gave up (timeout, cancellation).
    pub async fn remove(&self, id: &str) -> Option<M> {
        self.entries.lock().await.remove(id).map(|e| e.meta)
    }

    /// Resolve every entry whose metadata matches `pred`, producing each
    /// completion value from the entry's metadata. Returns the resolved count.
    pub async fn complete_where<P, F>(&self, pred: P, value: F) -> usize
    where
        P: Fn(&M) -> bool,
        F: Fn(&M) -> T,
    {
        let drained: Vec<Entry<T, M>> = {
            let mut entries = self.entries.lock().await;
            let ids: Vec<String> = entries
                .iter()
                .filter(|(_, e)| pred(&e.meta))
                .map(|(id, _)| id.clone())
                .collect();
            ids.iter().filter_map(|id| entries.remove(id)).collect()
        };
        let count = drained.len();
        for entry in drained {
            let v = value(&entry.meta);
            let _ = entry.slot.send(v);
        }
        count
    }

    /// Resolve every entry. Returns the resolved count.
    pub async fn fail_all<F>(&self, value: F) -> usize
    where
        F: Fn(&M) -> T,
    {
        self.complete_where(|_| true, value).await
    }

    /// Number of pending entries.
    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    /// Whether no entries are pending.
    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }
}
