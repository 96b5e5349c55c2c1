//! Debounced save pipeline.
//!
//! Turns a rapid stream of edits to one document into:
//!
//! 1. an immediate local-cache snapshot on every edit, and
//! 2. a single remote write once the document has been quiet for the
//!    configured debounce period (trailing edge).
//!
//! Each `(user, collection, document)` has at most one pending timer. A new
//! edit aborts the pending timer and starts another carrying the latest
//! payload, so only the last edit of a burst is ever sent. A payload that is
//! byte-identical to the last one attempted for the same key is not sent
//! again.

use crate::context::{SaveOutcome, SyncContext};
use crate::remote::RemoteStore;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use store::{DocId, QueueItem, UserId, WriteOperation};
use tokio::task::AbortHandle;

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
struct EditKey {
    user: UserId,
    collection: String,
    document_id: DocId,
}

impl EditKey {
    fn new(user: &UserId, collection: &str, document_id: &DocId) -> Self {
        Self {
            user: user.clone(),
            collection: collection.to_string(),
            document_id: document_id.clone(),
        }
    }
}

struct PendingWrite {
    generation: u64,
    handle: AbortHandle,
}

type TimerMap = Arc<Mutex<HashMap<EditKey, PendingWrite>>>;
type AttemptMap = Arc<Mutex<HashMap<EditKey, String>>>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn addresses_document(collection: &str, document_id: &DocId) -> bool {
    !collection.is_empty() && !document_id.is_empty()
}

/// Record `payload` as the latest attempt for `key`.
///
/// Returns false when it is identical to the previous attempt.
fn claim_attempt(attempts: &Mutex<HashMap<EditKey, String>>, key: &EditKey, payload: &Value) -> bool {
    let serialized = payload.to_string();
    let mut attempts = lock(attempts);
    if attempts.get(key) == Some(&serialized) {
        return false;
    }
    attempts.insert(key.clone(), serialized);
    true
}

/// Debounced save pipeline
pub struct SavePipeline<R> {
    ctx: Arc<SyncContext<R>>,
    timers: TimerMap,
    last_attempted: AttemptMap,
    generation: AtomicU64,
}

impl<R: RemoteStore + 'static> SavePipeline<R> {
    pub(crate) fn new(ctx: Arc<SyncContext<R>>) -> Self {
        Self {
            ctx,
            timers: Arc::new(Mutex::new(HashMap::new())),
            last_attempted: Arc::new(Mutex::new(HashMap::new())),
            generation: AtomicU64::new(0),
        }
    }

    /// Handle an edit.
    ///
    /// The payload reaches the local cache before this returns; the remote
    /// write is scheduled for the end of the quiet period. Must be called
    /// from within a tokio runtime.
    pub fn on_edit(&self, user: &UserId, collection: &str, document_id: &DocId, payload: Value) {
        self.ctx.cache.write(user, document_id, &payload);

        if !addresses_document(collection, document_id) {
            tracing::debug!(%user, collection, document = %document_id, "No remote document to save to");
            return;
        }
        if !self.ctx.config.enabled {
            return;
        }

        let key = EditKey::new(user, collection, document_id);
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let quiet_period = self.ctx.config.debounce();

        // Hold the map while spawning so the task cannot look for its entry
        // before it has been inserted
        let mut timers = lock(&self.timers);

        let task = {
            let ctx = self.ctx.clone();
            let timers = self.timers.clone();
            let attempts = self.last_attempted.clone();
            let key = key.clone();
            tokio::spawn(async move {
                tokio::time::sleep(quiet_period).await;

                {
                    let mut pending_writes = lock(&timers);
                    match pending_writes.get(&key) {
                        Some(pending) if pending.generation == generation => {
                            pending_writes.remove(&key);
                        }
                        // Superseded or abandoned
                        _ => return,
                    }
                }

                if !claim_attempt(&attempts, &key, &payload) {
                    tracing::debug!(
                        user = %key.user,
                        document = %key.document_id,
                        "Payload unchanged since last attempt, skipping remote write"
                    );
                    return;
                }

                let item = QueueItem::new(
                    key.collection.clone(),
                    key.document_id.clone(),
                    payload,
                    WriteOperation::Update,
                );
                ctx.save(&key.user, item).await;
            })
        };

        if let Some(previous) = timers.insert(
            key,
            PendingWrite {
                generation,
                handle: task.abort_handle(),
            },
        ) {
            previous.handle.abort();
        }
    }

    /// Save now, bypassing the debounce.
    ///
    /// Any pending debounced write for the document is cancelled since this
    /// payload supersedes it.
    pub async fn save_immediately(
        &self,
        user: &UserId,
        collection: &str,
        document_id: &DocId,
        payload: Value,
    ) -> SaveOutcome {
        self.save_now(user, collection, document_id, payload, WriteOperation::Update)
            .await
    }

    pub(crate) async fn save_now(
        &self,
        user: &UserId,
        collection: &str,
        document_id: &DocId,
        payload: Value,
        operation: WriteOperation,
    ) -> SaveOutcome {
        let key = EditKey::new(user, collection, document_id);
        self.cancel(&key);

        self.ctx.cache.write(user, document_id, &payload);
        if !addresses_document(collection, document_id) {
            return SaveOutcome::Invalid;
        }
        if !self.ctx.config.enabled {
            return SaveOutcome::Disabled;
        }

        lock(&self.last_attempted).insert(key, payload.to_string());
        let item = QueueItem::new(collection, document_id.clone(), payload, operation);
        self.ctx.save(user, item).await
    }

    /// Delete a document, queueing the deletion when it cannot be delivered
    pub(crate) async fn delete(&self, user: &UserId, collection: &str, document_id: &DocId) -> SaveOutcome {
        let key = EditKey::new(user, collection, document_id);
        self.cancel(&key);
        lock(&self.last_attempted).remove(&key);
        self.ctx.cache.clear(user, document_id);

        if !addresses_document(collection, document_id) {
            return SaveOutcome::Invalid;
        }
        if !self.ctx.config.enabled {
            return SaveOutcome::Disabled;
        }
        self.ctx.save(user, QueueItem::delete(collection, document_id.clone())).await
    }

    fn cancel(&self, key: &EditKey) {
        if let Some(pending) = lock(&self.timers).remove(key) {
            pending.handle.abort();
        }
    }

    /// Abandon every pending debounced write of `user`.
    ///
    /// Their payloads are still in the local cache.
    pub fn abandon_user(&self, user: &UserId) {
        let mut timers = lock(&self.timers);
        let before = timers.len();
        timers.retain(|key, pending| {
            if &key.user == user {
                pending.handle.abort();
                false
            } else {
                true
            }
        });
        let abandoned = before - timers.len();
        drop(timers);

        lock(&self.last_attempted).retain(|key, _| &key.user != user);
        if abandoned > 0 {
            tracing::info!(%user, abandoned, "Abandoned pending autosaves");
        }
    }

    /// Number of debounced writes waiting for their quiet period
    pub fn pending_count(&self) -> usize {
        lock(&self.timers).len()
    }
}

impl<R> Drop for SavePipeline<R> {
    fn drop(&mut self) {
        for (_, pending) in lock(&self.timers).drain() {
            pending.handle.abort();
        }
    }
}
