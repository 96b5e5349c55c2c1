//! Local durable cache of in-flight edits
//!
//! Every edit is written here before any network activity, so a crash or a
//! reload never loses more than the keystroke in progress. Entries are keyed
//! by `(user, document)` and removed once the remote store has confirmed the
//! write. Storage failures are logged and swallowed: losing the safety net is
//! preferable to breaking the editor.

use crate::storage::{autosave_key, KeyValueStorage};
use crate::{DocId, UserId};
use serde_json::Value;
use std::sync::Arc;

/// Per-document crash-recovery snapshots
#[derive(Clone)]
pub struct LocalCache {
    storage: Arc<dyn KeyValueStorage>,
}

impl LocalCache {
    /// Create a cache on top of a storage medium
    pub fn new(storage: Arc<dyn KeyValueStorage>) -> Self {
        Self { storage }
    }

    /// Store the latest snapshot of a document.
    ///
    /// Never fails from the caller's point of view.
    pub fn write(&self, user: &UserId, document_id: &DocId, payload: &Value) {
        let key = autosave_key(user, document_id);
        let json = match serde_json::to_string(payload) {
            Ok(json) => json,
            Err(e) => {
                tracing::warn!(%key, "Failed to serialize autosave snapshot: {}", e);
                return;
            }
        };

        if let Err(e) = self.storage.set_item(&key, &json) {
            tracing::warn!(%key, "Failed to write autosave snapshot: {}", e);
        }
    }

    /// Read back the last snapshot written for a document
    pub fn read(&self, user: &UserId, document_id: &DocId) -> Option<Value> {
        let key = autosave_key(user, document_id);
        match self.storage.get_item(&key) {
            Ok(Some(json)) => match serde_json::from_str(&json) {
                Ok(value) => Some(value),
                Err(e) => {
                    tracing::warn!(%key, "Discarding unreadable autosave snapshot: {}", e);
                    None
                }
            },
            Ok(None) => None,
            Err(e) => {
                tracing::warn!(%key, "Failed to read autosave snapshot: {}", e);
                None
            }
        }
    }

    /// Whether a snapshot exists for a document
    pub fn has_recovery(&self, user: &UserId, document_id: &DocId) -> bool {
        self.read(user, document_id).is_some()
    }

    /// Remove the snapshot of a document
    pub fn clear(&self, user: &UserId, document_id: &DocId) {
        let key = autosave_key(user, document_id);
        if let Err(e) = self.storage.remove_item(&key) {
            tracing::warn!(%key, "Failed to clear autosave snapshot: {}", e);
        }
    }

    /// Remove the snapshot only if it still holds `payload`.
    ///
    /// Returns true if the entry was removed. An edit that arrived while the
    /// confirmed write was in flight keeps its snapshot.
    pub fn clear_if_matches(&self, user: &UserId, document_id: &DocId, payload: &Value) -> bool {
        match self.read(user, document_id) {
            Some(current) if &current == payload => {
                self.clear(user, document_id);
                true
            }
            _ => false,
        }
    }
}
