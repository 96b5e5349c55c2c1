//! Subcommand implementations

use crate::state::LocalStorage;
use anyhow::Result;
use autosave::{
    AutosaveEngine, DocId, DocumentPath, LocalIdentity, ManualConnectivity, MemoryRemoteStore, UserId,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use store::{AppSettings, LastSyncStore, MemoryStorage, QueueItem, SettingsManager, WriteQueue};

/// Everything stored locally for one user
#[derive(Debug, Serialize)]
pub struct InspectReport {
    pub user: UserId,
    pub queue: Vec<QueueItem>,
    pub cached_documents: Vec<String>,
    pub last_sync_time: Option<DateTime<Utc>>,
}

pub fn inspect(storage: &LocalStorage, user: &UserId) -> Result<InspectReport> {
    let shared = storage.shared();
    Ok(InspectReport {
        user: user.clone(),
        queue: WriteQueue::new(shared.clone()).peek_all(user),
        cached_documents: storage.cached_documents(user)?,
        last_sync_time: LastSyncStore::new(shared).load(user),
    })
}

/// Drop every pending write of `user`. Returns how many were dropped.
pub fn clear_queue(storage: &LocalStorage, user: &UserId) -> Result<usize> {
    let queue = WriteQueue::new(storage.shared());
    let dropped = queue.len(user);
    queue.clear(user)?;
    tracing::info!(%user, dropped, "Cleared write queue");
    Ok(dropped)
}

pub struct SettingsChange {
    pub reset: bool,
    pub enabled: Option<bool>,
    pub debounce_ms: Option<u64>,
    pub write_timeout_ms: Option<u64>,
    pub flush_min_interval_ms: Option<u64>,
}

impl SettingsChange {
    fn is_empty(&self) -> bool {
        !self.reset
            && self.enabled.is_none()
            && self.debounce_ms.is_none()
            && self.write_timeout_ms.is_none()
            && self.flush_min_interval_ms.is_none()
    }
}

pub fn settings(manager: &mut SettingsManager, change: SettingsChange) -> Result<AppSettings> {
    if change.is_empty() {
        return Ok(manager.get().clone());
    }
    if change.reset {
        manager.reset()?;
    }

    let mut updated = manager.get().clone();
    if let Some(enabled) = change.enabled {
        updated.autosave.enabled = enabled;
    }
    if let Some(ms) = change.debounce_ms {
        updated.autosave = updated.autosave.with_debounce_ms(ms);
    }
    if let Some(ms) = change.write_timeout_ms {
        updated.autosave = updated.autosave.with_write_timeout_ms(ms);
    }
    if let Some(ms) = change.flush_min_interval_ms {
        updated.autosave = updated.autosave.with_flush_min_interval_ms(ms);
    }
    manager.update(updated)?;
    tracing::info!(path = %manager.settings_path().display(), "Settings saved");
    Ok(manager.get().clone())
}

/// Walk through an offline edit and its reconciliation against an
/// in-memory remote store
pub async fn demo(settings: &AppSettings, user: &UserId, document_id: &DocId) -> Result<()> {
    let remote = Arc::new(MemoryRemoteStore::new());
    let connectivity = Arc::new(ManualConnectivity::new(true));
    let engine = AutosaveEngine::new(
        settings.autosave.clone(),
        Arc::new(MemoryStorage::new()),
        remote.clone(),
        connectivity.clone(),
        Arc::new(LocalIdentity::signed_in(user.clone())),
    );
    engine.start();

    let mut status_rx = engine.subscribe_status();
    let status_log = tokio::spawn(async move {
        while status_rx.changed().await.is_ok() {
            let status = status_rx.borrow_and_update().clone();
            tracing::debug!(label = status.label(), syncing = status.syncing_document_ids.len(), "Status");
        }
    });

    let quiet = settings.autosave.debounce() + Duration::from_millis(100);
    let path = DocumentPath::new(user, "notes", document_id);

    println!("1. online edit");
    engine.on_edit(user, "notes", document_id, json!({"title": "x"}));
    tokio::time::sleep(quiet).await;
    println!("   remote: {}", describe(remote.document(&path)));
    println!("   status: {}", engine.status().label());

    println!("2. going offline and editing");
    connectivity.set_online(false);
    engine.on_edit(user, "notes", document_id, json!({"title": "y"}));
    tokio::time::sleep(quiet).await;
    println!("   cache:  {}", describe(engine.local_snapshot(user, document_id)));
    println!("   queue:  {} item(s)", engine.queue_length(user));
    println!("   status: {}", engine.status().label());

    println!("3. back online");
    connectivity.set_online(true);
    tokio::time::sleep(Duration::from_millis(100)).await;
    println!("   remote: {}", describe(remote.document(&path)));
    println!("   queue:  {} item(s)", engine.queue_length(user));
    println!("   status: {}", engine.status().label());

    let summary = engine.summary(user);
    println!("{}", serde_json::to_string_pretty(&summary)?);

    status_log.abort();
    Ok(())
}

fn describe(value: Option<serde_json::Value>) -> String {
    value.map_or_else(|| "(none)".to_string(), |v| v.to_string())
}
