//! Remote document store abstraction.
//!
//! The hosted document database is an external collaborator. This module
//! defines the `RemoteStore` trait the sync core talks to and an in-memory
//! implementation, `MemoryRemoteStore`, used by tests and by the local
//! harness binary.
//!
//! Documents live at `users/{userId}/{collection}/{documentId}` and are
//! updated with field-level merge semantics: fields present in the payload
//! overwrite, fields absent from it are left untouched.

use crate::error::RemoteError;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, RwLock};
use std::time::Duration;
use store::{DocId, UserId};
use tokio::sync::watch;

/// Location of a document in the remote store
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct DocumentPath {
    pub user: UserId,
    pub collection: String,
    pub document_id: DocId,
}

impl DocumentPath {
    pub fn new(user: &UserId, collection: &str, document_id: &DocId) -> Self {
        Self {
            user: user.clone(),
            collection: collection.to_string(),
            document_id: document_id.clone(),
        }
    }
}

impl fmt::Display for DocumentPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "users/{}/{}/{}",
            self.user, self.collection, self.document_id
        )
    }
}

/// How a write combines with the stored document
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WriteMode {
    /// Overwrite the given top-level fields, keep the others
    Merge,
    /// Replace the whole document
    Replace,
}

/// Remote document store.
///
/// Implement this trait to connect the sync core to a hosted backend.
#[trait_variant::make(Send)]
pub trait RemoteStore: Send + Sync {
    /// Write a document.
    async fn write_document(
        &self,
        path: &DocumentPath,
        payload: &Value,
        mode: WriteMode,
    ) -> Result<(), RemoteError>;

    /// Delete a document. Deleting a missing document succeeds.
    async fn delete_document(&self, path: &DocumentPath) -> Result<(), RemoteError>;

    /// Read a document, `None` if it does not exist.
    async fn read_document(&self, path: &DocumentPath) -> Result<Option<Value>, RemoteError>;

    /// Watch a document. The receiver sees the current value immediately
    /// and every later change; dropping it unsubscribes.
    fn subscribe_document(&self, path: &DocumentPath) -> watch::Receiver<Option<Value>>;
}

/// Merge `patch` into `target` field by field.
///
/// Non-object values replace the target wholesale.
pub fn merge_fields(target: &mut Value, patch: &Value) {
    match (target.as_object_mut(), patch.as_object()) {
        (Some(target_fields), Some(patch_fields)) => {
            for (field, value) in patch_fields {
                target_fields.insert(field.clone(), value.clone());
            }
        }
        _ => *target = patch.clone(),
    }
}

/// Kind of request recorded by [`MemoryRemoteStore`]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RequestKind {
    Write,
    Delete,
}

/// A request that reached the in-memory store
#[derive(Clone, Debug, PartialEq)]
pub struct RecordedRequest {
    pub kind: RequestKind,
    pub path: DocumentPath,
    pub payload: Value,
    pub accepted: bool,
}

/// In-memory remote store.
///
/// Behaves like the hosted backend for everything the sync core relies on:
/// merge writes, deletes, reads and change subscriptions. Failures and
/// latency can be injected per path or globally, and every request is
/// recorded so tests can count network round trips.
#[derive(Default)]
pub struct MemoryRemoteStore {
    documents: RwLock<HashMap<DocumentPath, Value>>,
    watchers: Mutex<HashMap<DocumentPath, watch::Sender<Option<Value>>>>,
    failing_paths: Mutex<HashSet<DocumentPath>>,
    reject_all: AtomicBool,
    latency: Mutex<Option<Duration>>,
    requests: Mutex<Vec<RecordedRequest>>,
}

impl MemoryRemoteStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject every request for `path` until [`heal_path`](Self::heal_path)
    pub fn fail_path(&self, path: DocumentPath) {
        self.failing_paths.lock().unwrap().insert(path);
    }

    /// Stop rejecting requests for `path`
    pub fn heal_path(&self, path: &DocumentPath) {
        self.failing_paths.lock().unwrap().remove(path);
    }

    /// Reject (or stop rejecting) every request
    pub fn set_reject_all(&self, reject: bool) {
        self.reject_all.store(reject, Ordering::SeqCst);
    }

    /// Delay every request by `latency`
    pub fn set_latency(&self, latency: Option<Duration>) {
        *self.latency.lock().unwrap() = latency;
    }

    /// Current stored value of a document
    pub fn document(&self, path: &DocumentPath) -> Option<Value> {
        self.documents.read().unwrap().get(path).cloned()
    }

    /// Seed a document without recording a request
    pub fn insert_document(&self, path: DocumentPath, value: Value) {
        self.documents.write().unwrap().insert(path.clone(), value.clone());
        self.notify(&path, Some(value));
    }

    /// Number of stored documents
    pub fn document_count(&self) -> usize {
        self.documents.read().unwrap().len()
    }

    /// Every request received so far, in arrival order
    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.requests.lock().unwrap().clone()
    }

    /// Requests received for one path
    pub fn requests_for(&self, path: &DocumentPath) -> Vec<RecordedRequest> {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .filter(|r| &r.path == path)
            .cloned()
            .collect()
    }

    /// Total number of requests received
    pub fn request_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    async fn simulate_latency(&self) {
        let latency = *self.latency.lock().unwrap();
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
    }

    fn check_path(&self, path: &DocumentPath) -> Result<(), RemoteError> {
        if self.reject_all.load(Ordering::SeqCst) {
            return Err(RemoteError::Unavailable("remote store unreachable".to_string()));
        }
        if self.failing_paths.lock().unwrap().contains(path) {
            return Err(RemoteError::Rejected(path.to_string()));
        }
        Ok(())
    }

    fn record(&self, kind: RequestKind, path: &DocumentPath, payload: &Value, accepted: bool) {
        self.requests.lock().unwrap().push(RecordedRequest {
            kind,
            path: path.clone(),
            payload: payload.clone(),
            accepted,
        });
    }

    fn notify(&self, path: &DocumentPath, value: Option<Value>) {
        if let Some(sender) = self.watchers.lock().unwrap().get(path) {
            sender.send_replace(value);
        }
    }
}

impl RemoteStore for MemoryRemoteStore {
    async fn write_document(
        &self,
        path: &DocumentPath,
        payload: &Value,
        mode: WriteMode,
    ) -> Result<(), RemoteError> {
        self.simulate_latency().await;

        if let Err(e) = self.check_path(path) {
            self.record(RequestKind::Write, path, payload, false);
            return Err(e);
        }
        self.record(RequestKind::Write, path, payload, true);

        let updated = {
            let mut documents = self.documents.write().unwrap();
            let stored = documents.entry(path.clone()).or_insert_with(|| Value::Object(Default::default()));
            match mode {
                WriteMode::Merge => merge_fields(stored, payload),
                WriteMode::Replace => *stored = payload.clone(),
            }
            stored.clone()
        };
        self.notify(path, Some(updated));
        Ok(())
    }

    async fn delete_document(&self, path: &DocumentPath) -> Result<(), RemoteError> {
        self.simulate_latency().await;

        if let Err(e) = self.check_path(path) {
            self.record(RequestKind::Delete, path, &Value::Null, false);
            return Err(e);
        }
        self.record(RequestKind::Delete, path, &Value::Null, true);

        self.documents.write().unwrap().remove(path);
        self.notify(path, None);
        Ok(())
    }

    async fn read_document(&self, path: &DocumentPath) -> Result<Option<Value>, RemoteError> {
        self.simulate_latency().await;
        if self.reject_all.load(Ordering::SeqCst) {
            return Err(RemoteError::Unavailable("remote store unreachable".to_string()));
        }
        Ok(self.document(path))
    }

    fn subscribe_document(&self, path: &DocumentPath) -> watch::Receiver<Option<Value>> {
        let current = self.document(path);
        let mut watchers = self.watchers.lock().unwrap();
        watchers
            .entry(path.clone())
            .or_insert_with(|| watch::channel(current).0)
            .subscribe()
    }
}
