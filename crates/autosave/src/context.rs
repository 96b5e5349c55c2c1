//! State shared by the save pipeline and the flush reconciler, and the
//! single remote-write attempt both of them are built on.

use crate::connectivity::ConnectivitySource;
use crate::error::{SyncError, SyncResult};
use crate::identity::IdentityProvider;
use crate::remote::{DocumentPath, RemoteStore, WriteMode};
use crate::status::SyncStatusBroadcaster;
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use store::{
    AutosaveConfig, DocId, KeyValueStorage, LastSyncStore, LocalCache, QueueItem, UserId,
    WriteOperation, WriteQueue,
};

/// Result of saving one document
#[derive(Debug)]
pub enum SaveOutcome {
    /// The remote store confirmed the write
    Synced,
    /// The write could not be delivered and waits in the write queue
    Queued(SyncError),
    /// Remote autosave is disabled; only the local cache was written
    Disabled,
    /// The collection or document id is empty, so there is no remote
    /// document to write; only the local cache was touched
    Invalid,
}

impl SaveOutcome {
    pub fn is_synced(&self) -> bool {
        matches!(self, SaveOutcome::Synced)
    }

    pub fn is_queued(&self) -> bool {
        matches!(self, SaveOutcome::Queued(_))
    }
}

pub(crate) struct SyncContext<R> {
    pub config: AutosaveConfig,
    pub cache: LocalCache,
    pub queue: WriteQueue,
    pub last_sync: LastSyncStore,
    pub status: SyncStatusBroadcaster,
    pub remote: Arc<R>,
    pub connectivity: Arc<dyn ConnectivitySource>,
    pub identity: Arc<dyn IdentityProvider>,
}

impl<R: RemoteStore> SyncContext<R> {
    pub fn new(
        config: AutosaveConfig,
        storage: Arc<dyn KeyValueStorage>,
        remote: Arc<R>,
        connectivity: Arc<dyn ConnectivitySource>,
        identity: Arc<dyn IdentityProvider>,
    ) -> Self {
        let status = SyncStatusBroadcaster::new(connectivity.is_online());
        Self {
            config,
            cache: LocalCache::new(storage.clone()),
            queue: WriteQueue::new(storage.clone()),
            last_sync: LastSyncStore::new(storage),
            status,
            remote,
            connectivity,
            identity,
        }
    }

    pub fn is_current_user(&self, user: &UserId) -> bool {
        self.identity.current_user_id().as_ref() == Some(user)
    }

    /// Point the status at `user`'s queue and last sync time
    pub fn rescope_status(&self, user: Option<&UserId>) {
        match user {
            Some(user) => {
                self.status.set_last_sync_time(self.last_sync.load(user));
                self.status.set_unsynced_changes(!self.queue.is_empty(user));
            }
            None => {
                self.status.set_last_sync_time(None);
                self.status.set_unsynced_changes(false);
            }
        }
    }

    /// Recompute `has_unsynced_changes` if `user` is the one on screen
    pub fn refresh_unsynced(&self, user: &UserId) {
        if self.is_current_user(user) {
            self.status.set_unsynced_changes(!self.queue.is_empty(user));
        }
    }

    /// Record a confirmed write for `user`
    pub fn record_sync(&self, user: &UserId) {
        if self.is_current_user(user) {
            let at = self.status.mark_synced();
            self.last_sync.record(user, at);
        } else {
            self.last_sync.record(user, chrono::Utc::now());
        }
    }

    fn stamped(&self, payload: &Value) -> Value {
        let mut body = payload.clone();
        if self.config.stamp_updated_at {
            if let Some(fields) = body.as_object_mut() {
                fields.insert(
                    "updatedAt".to_string(),
                    Value::from(chrono::Utc::now().timestamp_millis()),
                );
            }
        }
        body
    }

    async fn bounded<F>(&self, request: F) -> SyncResult<()>
    where
        F: Future<Output = Result<(), crate::error::RemoteError>>,
    {
        match self.config.write_timeout() {
            Some(limit) => match tokio::time::timeout(limit, request).await {
                Ok(result) => result.map_err(SyncError::from),
                Err(_) => Err(SyncError::Timeout(limit)),
            },
            None => request.await.map_err(SyncError::from),
        }
    }

    /// Deliver one write to the remote store.
    ///
    /// Offline is a definite failure and skips the network entirely.
    pub async fn push(&self, user: &UserId, item: &QueueItem) -> SyncResult<()> {
        if !item.is_valid() {
            return Err(SyncError::InvalidItem(item.key().to_string()));
        }
        if !self.connectivity.is_online() {
            return Err(SyncError::Offline);
        }

        let path = DocumentPath::new(user, &item.collection, &item.document_id);
        match item.operation {
            WriteOperation::Create | WriteOperation::Update => {
                let body = self.stamped(&item.payload);
                self.bounded(self.remote.write_document(&path, &body, WriteMode::Merge))
                    .await
            }
            WriteOperation::Delete => self.bounded(self.remote.delete_document(&path)).await,
        }
    }

    /// Attempt a write and fall back to the queue on failure.
    ///
    /// The document is marked as syncing for the duration of the attempt.
    pub async fn save(&self, user: &UserId, item: QueueItem) -> SaveOutcome {
        let document_id: DocId = item.document_id.clone();
        self.status.begin_syncing(&document_id);

        let outcome = match self.push(user, &item).await {
            Ok(()) => {
                if item.operation == WriteOperation::Delete {
                    self.cache.clear(user, &document_id);
                } else {
                    self.cache.clear_if_matches(user, &document_id, &item.payload);
                }
                // A confirmed write makes any older queued version obsolete
                if let Some(queued) = self.queue.get(user, &item.key()) {
                    if queued.enqueued_at_millis <= item.enqueued_at_millis {
                        if let Err(e) = self.queue.remove(user, &[item.key()]) {
                            tracing::warn!(%user, "Failed to update write queue: {}", e);
                        }
                    }
                }
                self.record_sync(user);
                self.refresh_unsynced(user);
                tracing::debug!(%user, key = %item.key(), "Saved to remote store");
                SaveOutcome::Synced
            }
            Err(e) => {
                tracing::info!(%user, key = %item.key(), "Saving offline: {}", e);
                if let Err(store_err) = self.queue.enqueue(user, item) {
                    tracing::warn!(%user, "Failed to persist write queue: {}", store_err);
                }
                if self.is_current_user(user) {
                    self.status.set_unsynced_changes(true);
                }
                SaveOutcome::Queued(e)
            }
        };

        self.status.end_syncing(&document_id);
        outcome
    }
}
