//! Autosave engine.
//!
//! `AutosaveEngine` is what views talk to. It owns the save pipeline and the
//! flush reconciler, and two background listeners:
//!
//! - connectivity: going online flushes the current user's queue, going
//!   offline updates the status;
//! - identity: a sign-in or sign-out abandons the previous user's pending
//!   debounced writes and re-scopes the status to the new user.

use crate::connectivity::{ConnectivityEvent, ConnectivityMonitor, ConnectivitySource};
use crate::context::{SaveOutcome, SyncContext};
use crate::error::{RemoteError, SyncError, SyncResult};
use crate::identity::IdentityProvider;
use crate::pipeline::SavePipeline;
use crate::reconciler::{FlushOutcome, FlushReconciler};
use crate::remote::{DocumentPath, RemoteStore};
use crate::status::SyncStatus;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::sync::{Arc, Mutex};
use store::{AutosaveConfig, DocId, KeyValueStorage, UserId, WriteOperation};
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// What a view gets when it mounts a document
#[derive(Debug)]
pub struct MountResult {
    /// The document as stored remotely, if it exists and was reachable
    pub document: Option<Value>,
    /// Locally cached edits to restore when the remote document is missing
    /// or unreachable
    pub recovered: Option<Value>,
    /// Result of the flush triggered by the mount
    pub flush: FlushOutcome,
}

/// Offline sync summary for a user
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct SyncSummary {
    pub queue_length: usize,
    pub last_sync_time: Option<DateTime<Utc>>,
    pub is_online: bool,
}

/// Offline-first autosave engine
pub struct AutosaveEngine<R> {
    ctx: Arc<SyncContext<R>>,
    pipeline: Arc<SavePipeline<R>>,
    reconciler: Arc<FlushReconciler<R>>,
    listeners: Mutex<Vec<JoinHandle<()>>>,
}

impl<R: RemoteStore + 'static> AutosaveEngine<R> {
    /// Create an engine. Call [`start`](Self::start) to begin reacting to
    /// connectivity and identity changes.
    pub fn new(
        config: AutosaveConfig,
        storage: Arc<dyn KeyValueStorage>,
        remote: Arc<R>,
        connectivity: Arc<dyn ConnectivitySource>,
        identity: Arc<dyn IdentityProvider>,
    ) -> Self {
        let ctx = Arc::new(SyncContext::new(config, storage, remote, connectivity, identity));
        ctx.rescope_status(ctx.identity.current_user_id().as_ref());

        Self {
            pipeline: Arc::new(SavePipeline::new(ctx.clone())),
            reconciler: Arc::new(FlushReconciler::new(ctx.clone())),
            ctx,
            listeners: Mutex::new(Vec::new()),
        }
    }

    /// Spawn the connectivity and identity listeners.
    ///
    /// Calling it again restarts them.
    pub fn start(&self) {
        let mut listeners = self.listeners.lock().unwrap_or_else(|e| e.into_inner());
        for handle in listeners.drain(..) {
            handle.abort();
        }
        listeners.push(self.spawn_connectivity_listener());
        listeners.push(self.spawn_identity_listener());
        tracing::debug!("Autosave engine started");
    }

    fn spawn_connectivity_listener(&self) -> JoinHandle<()> {
        let ctx = self.ctx.clone();
        let reconciler = self.reconciler.clone();
        let mut monitor = ConnectivityMonitor::new(ctx.connectivity.as_ref());
        ctx.status.set_online(monitor.is_online());

        tokio::spawn(async move {
            while let Some(event) = monitor.next_event().await {
                let user = ctx.identity.current_user_id();
                match event {
                    ConnectivityEvent::Online => {
                        ctx.status.set_online(true);
                        if let Some(user) = user {
                            let reconciler = reconciler.clone();
                            tokio::spawn(async move {
                                reconciler.flush_opportunistic(&user).await;
                            });
                        }
                    }
                    ConnectivityEvent::Offline => {
                        ctx.status.set_online(false);
                        if let Some(user) = user {
                            ctx.refresh_unsynced(&user);
                        }
                    }
                }
            }
        })
    }

    fn spawn_identity_listener(&self) -> JoinHandle<()> {
        let ctx = self.ctx.clone();
        let pipeline = self.pipeline.clone();
        let reconciler = self.reconciler.clone();
        let mut rx = ctx.identity.subscribe();
        let mut previous = rx.borrow_and_update().clone();

        tokio::spawn(async move {
            while rx.changed().await.is_ok() {
                let current = rx.borrow_and_update().clone();
                if current == previous {
                    continue;
                }

                if let Some(prev) = previous.as_ref() {
                    pipeline.abandon_user(prev);
                }
                ctx.rescope_status(current.as_ref());
                tracing::info!(
                    from = ?previous.as_ref().map(UserId::as_str),
                    to = ?current.as_ref().map(UserId::as_str),
                    "Sync scope changed"
                );

                if let Some(user) = current.clone() {
                    if ctx.connectivity.is_online() {
                        let reconciler = reconciler.clone();
                        tokio::spawn(async move {
                            reconciler.flush_opportunistic(&user).await;
                        });
                    }
                }
                previous = current;
            }
        })
    }

    /// Record an edit. The cache is written before this returns; the remote
    /// write follows after the debounce period.
    pub fn on_edit(&self, user: &UserId, collection: &str, document_id: &DocId, payload: Value) {
        self.pipeline.on_edit(user, collection, document_id, payload);
    }

    /// Save now without waiting for the debounce period
    pub async fn save_immediately(
        &self,
        user: &UserId,
        collection: &str,
        document_id: &DocId,
        payload: Value,
    ) -> SaveOutcome {
        self.pipeline
            .save_immediately(user, collection, document_id, payload)
            .await
    }

    /// Create a document under a freshly generated id
    pub async fn create_document(
        &self,
        user: &UserId,
        collection: &str,
        payload: Value,
    ) -> (DocId, SaveOutcome) {
        let document_id = DocId::generate();
        let outcome = self
            .pipeline
            .save_now(user, collection, &document_id, payload, WriteOperation::Create)
            .await;
        (document_id, outcome)
    }

    /// Delete a document, queueing the deletion while offline
    pub async fn delete_document(&self, user: &UserId, collection: &str, document_id: &DocId) -> SaveOutcome {
        self.pipeline.delete(user, collection, document_id).await
    }

    /// Write the local cache only.
    ///
    /// For moments when there is no time for a network round trip, such as
    /// the app being hidden or closed.
    pub fn persist_snapshot(&self, user: &UserId, document_id: &DocId, payload: &Value) {
        self.ctx.cache.write(user, document_id, payload);
    }

    /// Prepare a document view: flush pending writes and look for edits to
    /// recover
    pub async fn mount(&self, user: &UserId, collection: &str, document_id: &DocId) -> MountResult {
        let flush = self.reconciler.flush_opportunistic(user).await;

        let document = if self.ctx.connectivity.is_online() {
            let path = DocumentPath::new(user, collection, document_id);
            let read = self.ctx.remote.read_document(&path);
            let read = match self.ctx.config.write_timeout() {
                Some(limit) => tokio::time::timeout(limit, read)
                    .await
                    .unwrap_or_else(|_| Err(RemoteError::Unavailable("read timed out".into()))),
                None => read.await,
            };
            match read {
                Ok(document) => document,
                Err(e) => {
                    tracing::warn!(%user, %path, "Failed to read document: {}", e);
                    None
                }
            }
        } else {
            None
        };

        let recovered = match document {
            Some(_) => None,
            None => self.ctx.cache.read(user, document_id),
        };
        if recovered.is_some() {
            tracing::info!(%user, document = %document_id, "Recovered unsaved edits");
        }

        MountResult {
            document,
            recovered,
            flush,
        }
    }

    /// Watch a remote document
    pub fn watch_document(
        &self,
        user: &UserId,
        collection: &str,
        document_id: &DocId,
    ) -> watch::Receiver<Option<Value>> {
        self.ctx
            .remote
            .subscribe_document(&DocumentPath::new(user, collection, document_id))
    }

    /// Replay `user`'s queue now
    pub async fn flush_queue(&self, user: &UserId) -> FlushOutcome {
        self.reconciler.flush(user).await
    }

    /// "Sync now" for the signed-in user
    pub async fn force_sync(&self) -> SyncResult<FlushOutcome> {
        let user = self.ctx.identity.current_user_id().ok_or(SyncError::NotSignedIn)?;
        if !self.ctx.connectivity.is_online() {
            return Err(SyncError::Offline);
        }
        Ok(self.reconciler.flush(&user).await)
    }

    pub fn has_unsynced_changes(&self, user: &UserId) -> bool {
        !self.ctx.queue.is_empty(user)
    }

    pub fn queue_length(&self, user: &UserId) -> usize {
        self.ctx.queue.len(user)
    }

    pub fn last_sync_time(&self, user: &UserId) -> Option<DateTime<Utc>> {
        self.ctx.last_sync.load(user)
    }

    /// Offline sync summary for `user`
    pub fn summary(&self, user: &UserId) -> SyncSummary {
        SyncSummary {
            queue_length: self.queue_length(user),
            last_sync_time: self.last_sync_time(user),
            is_online: self.ctx.connectivity.is_online(),
        }
    }

    /// Cached payload for a document, if any
    pub fn local_snapshot(&self, user: &UserId, document_id: &DocId) -> Option<Value> {
        self.ctx.cache.read(user, document_id)
    }

    /// Current sync status
    pub fn status(&self) -> SyncStatus {
        self.ctx.status.snapshot()
    }

    /// Observe sync status changes
    pub fn subscribe_status(&self) -> watch::Receiver<SyncStatus> {
        self.ctx.status.subscribe()
    }

    /// Debounced writes waiting for their quiet period
    pub fn pending_writes(&self) -> usize {
        self.pipeline.pending_count()
    }

    pub fn pipeline(&self) -> &SavePipeline<R> {
        &self.pipeline
    }

    pub fn reconciler(&self) -> &FlushReconciler<R> {
        &self.reconciler
    }
}

impl<R> Drop for AutosaveEngine<R> {
    fn drop(&mut self) {
        let listeners = self.listeners.get_mut().unwrap_or_else(|e| e.into_inner());
        for handle in listeners.drain(..) {
            handle.abort();
        }
    }
}
