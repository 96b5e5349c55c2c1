//! Durable write queue
//!
//! Writes that could not reach the remote store are parked here until the
//! next flush. The queue holds at most one item per `(collection, document)`:
//! enqueuing a newer write for the same document replaces the older one, so
//! stale intermediate states are never replayed.
//!
//! The in-memory copy is authoritative for the running session and is
//! written through to `writeQueue:{userId}` after every mutation. When the
//! storage medium fails the queue keeps working in memory and the failure is
//! reported to the caller, who decides whether to log it.

use crate::storage::{queue_key, KeyValueStorage};
use crate::{DocId, QueueKey, Result, UserId};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

/// Kind of remote write a queue item replays
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WriteOperation {
    Create,
    Update,
    Delete,
}

impl Default for WriteOperation {
    fn default() -> Self {
        WriteOperation::Update
    }
}

/// A pending remote write.
///
/// On disk each item is a JSON object
/// `{ collection, id, data, operation, timestamp }`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct QueueItem {
    pub collection: String,
    #[serde(rename = "id")]
    pub document_id: DocId,
    #[serde(rename = "data", default)]
    pub payload: Value,
    #[serde(default)]
    pub operation: WriteOperation,
    #[serde(rename = "timestamp", default)]
    pub enqueued_at_millis: i64,
}

impl QueueItem {
    /// Create an item stamped with the current time
    pub fn new(
        collection: impl Into<String>,
        document_id: impl Into<DocId>,
        payload: Value,
        operation: WriteOperation,
    ) -> Self {
        Self {
            collection: collection.into(),
            document_id: document_id.into(),
            payload,
            operation,
            enqueued_at_millis: chrono::Utc::now().timestamp_millis(),
        }
    }

    /// An update of `document_id` carrying `payload`
    pub fn update(collection: impl Into<String>, document_id: impl Into<DocId>, payload: Value) -> Self {
        Self::new(collection, document_id, payload, WriteOperation::Update)
    }

    /// A deletion of `document_id`
    pub fn delete(collection: impl Into<String>, document_id: impl Into<DocId>) -> Self {
        Self::new(collection, document_id, Value::Null, WriteOperation::Delete)
    }

    /// The deduplication key of this item
    pub fn key(&self) -> QueueKey {
        QueueKey {
            collection: self.collection.clone(),
            document_id: self.document_id.clone(),
        }
    }

    fn has_key(&self, key: &QueueKey) -> bool {
        self.collection == key.collection && self.document_id == key.document_id
    }

    /// Items without a collection or id cannot address a remote document
    pub fn is_valid(&self) -> bool {
        !self.collection.is_empty() && !self.document_id.is_empty()
    }
}

/// Per-user ordered, deduplicated queue of pending writes
pub struct WriteQueue {
    storage: Arc<dyn KeyValueStorage>,
    /// Loaded lazily per user; every read-modify-write happens under this lock
    queues: Mutex<HashMap<UserId, Vec<QueueItem>>>,
}

impl WriteQueue {
    /// Create a queue persisted in `storage`
    pub fn new(storage: Arc<dyn KeyValueStorage>) -> Self {
        Self {
            storage,
            queues: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<UserId, Vec<QueueItem>>> {
        // A panic while holding the lock leaves the map structurally intact
        self.queues.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn load(&self, user: &UserId) -> Vec<QueueItem> {
        let key = queue_key(user);
        match self.storage.get_item(&key) {
            Ok(Some(json)) => match serde_json::from_str(&json) {
                Ok(items) => items,
                Err(e) => {
                    tracing::warn!(%key, "Discarding unreadable write queue: {}", e);
                    Vec::new()
                }
            },
            Ok(None) => Vec::new(),
            Err(e) => {
                tracing::warn!(%key, "Failed to read write queue: {}", e);
                Vec::new()
            }
        }
    }

    fn persist(&self, user: &UserId, items: &[QueueItem]) -> Result<()> {
        let key = queue_key(user);
        if items.is_empty() {
            self.storage.remove_item(&key)
        } else {
            let json = serde_json::to_string(items)?;
            self.storage.set_item(&key, &json)
        }
    }

    /// Run `f` on the user's queue inside the critical section.
    /// When `f` reports a change the queue is written through to storage.
    fn mutate<T>(
        &self,
        user: &UserId,
        f: impl FnOnce(&mut Vec<QueueItem>) -> (T, bool),
    ) -> Result<T> {
        let mut queues = self.lock();
        if !queues.contains_key(user) {
            let loaded = self.load(user);
            queues.insert(user.clone(), loaded);
        }
        let items = queues.entry(user.clone()).or_default();

        let (result, changed) = f(items);
        if changed {
            self.persist(user, items)?;
        }
        Ok(result)
    }

    fn read<T>(&self, user: &UserId, f: impl FnOnce(&[QueueItem]) -> T) -> T {
        let mut queues = self.lock();
        if !queues.contains_key(user) {
            let loaded = self.load(user);
            queues.insert(user.clone(), loaded);
        }
        f(queues.get(user).map(Vec::as_slice).unwrap_or(&[]))
    }

    /// Add an item, replacing any queued item for the same document.
    ///
    /// The in-memory queue is updated even when persisting fails.
    pub fn enqueue(&self, user: &UserId, item: QueueItem) -> Result<()> {
        self.mutate(user, |items| {
            items.retain(|existing| !(existing.collection == item.collection
                && existing.document_id == item.document_id));
            items.push(item);
            ((), true)
        })
    }

    /// All queued items in insertion order
    pub fn peek_all(&self, user: &UserId) -> Vec<QueueItem> {
        self.read(user, |items| items.to_vec())
    }

    /// Queued item for a document, if any
    pub fn get(&self, user: &UserId, key: &QueueKey) -> Option<QueueItem> {
        self.read(user, |items| items.iter().find(|item| item.has_key(key)).cloned())
    }

    /// Remove the items with the given keys
    pub fn remove(&self, user: &UserId, keys: &[QueueKey]) -> Result<()> {
        self.mutate(user, |items| {
            let before = items.len();
            items.retain(|item| !keys.iter().any(|key| item.has_key(key)));
            ((), items.len() != before)
        })
    }

    /// Remove items that were successfully replayed.
    ///
    /// An item is only removed if the queue still holds exactly the flushed
    /// version; an item superseded while the flush was running stays queued.
    /// Returns the number of removed items.
    pub fn remove_flushed(&self, user: &UserId, flushed: &[QueueItem]) -> Result<usize> {
        self.mutate(user, |items| {
            let before = items.len();
            items.retain(|item| !flushed.contains(item));
            let removed = before - items.len();
            (removed, removed > 0)
        })
    }

    /// Drop every queued item and the durable record
    pub fn clear(&self, user: &UserId) -> Result<()> {
        let mut queues = self.lock();
        queues.insert(user.clone(), Vec::new());
        self.storage.remove_item(&queue_key(user))
    }

    /// Number of queued items
    pub fn len(&self, user: &UserId) -> usize {
        self.read(user, |items| items.len())
    }

    /// Whether nothing is waiting to be synced
    pub fn is_empty(&self, user: &UserId) -> bool {
        self.len(user) == 0
    }
}
