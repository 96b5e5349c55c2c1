//! Sync status broadcasting.
//!
//! `SyncStatusBroadcaster` is the single source of truth for sync
//! indicators. The pipeline and the reconciler mutate it through a small set
//! of entry points; any number of observers hold a read-only
//! `watch::Receiver<SyncStatus>` and are notified on every mutation.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use store::DocId;
use tokio::sync::watch;

/// Observable sync state
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct SyncStatus {
    /// True iff `syncing_document_ids` is non-empty
    pub is_syncing: bool,
    /// Time of the last confirmed remote write
    pub last_sync_time: Option<DateTime<Utc>>,
    /// Platform connectivity as last reported
    pub is_online: bool,
    /// Documents with a remote write in flight
    pub syncing_document_ids: HashSet<DocId>,
    /// True iff the current user's write queue is non-empty
    pub has_unsynced_changes: bool,
}

impl SyncStatus {
    fn new(is_online: bool) -> Self {
        Self {
            is_syncing: false,
            last_sync_time: None,
            is_online,
            syncing_document_ids: HashSet::new(),
            has_unsynced_changes: false,
        }
    }

    /// Short label for a status affordance
    pub fn label(&self) -> &'static str {
        if !self.is_online {
            "Offline"
        } else if self.is_syncing {
            "Syncing…"
        } else if self.has_unsynced_changes {
            "Unsynced changes"
        } else {
            "Synced"
        }
    }

    /// Whether an indicator deserves attention
    pub fn should_show(&self) -> bool {
        !self.is_online || self.is_syncing || self.has_unsynced_changes
    }

    /// Seconds since the last sync, relative to `now`
    pub fn time_since_sync(&self, now: DateTime<Utc>) -> Option<u64> {
        self.last_sync_time
            .map(|at| (now - at).num_seconds().max(0) as u64)
    }

    /// Format time since sync for display
    pub fn formatted_time_since_sync(&self, now: DateTime<Utc>) -> Option<String> {
        self.time_since_sync(now).map(|seconds| {
            if seconds < 60 {
                format!("{}s ago", seconds)
            } else if seconds < 3600 {
                format!("{}m ago", seconds / 60)
            } else if seconds < 86400 {
                format!("{}h ago", seconds / 3600)
            } else {
                format!("{}d ago", seconds / 86400)
            }
        })
    }
}

/// Shared, observable sync status.
///
/// Cloning yields another handle to the same state.
#[derive(Clone)]
pub struct SyncStatusBroadcaster {
    tx: Arc<watch::Sender<SyncStatus>>,
    /// In-flight attempts per document; the same document may be written by
    /// the pipeline and the reconciler at once
    in_flight: Arc<Mutex<HashMap<DocId, usize>>>,
}

impl SyncStatusBroadcaster {
    pub fn new(is_online: bool) -> Self {
        Self {
            tx: Arc::new(watch::channel(SyncStatus::new(is_online)).0),
            in_flight: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Current status
    pub fn snapshot(&self) -> SyncStatus {
        self.tx.borrow().clone()
    }

    /// Observe status changes
    pub fn subscribe(&self) -> watch::Receiver<SyncStatus> {
        self.tx.subscribe()
    }

    /// A remote write for `document_id` started
    pub fn begin_syncing(&self, document_id: &DocId) {
        let mut in_flight = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
        *in_flight.entry(document_id.clone()).or_insert(0) += 1;

        self.tx.send_modify(|status| {
            status.syncing_document_ids.insert(document_id.clone());
            status.is_syncing = true;
        });
    }

    /// A remote write for `document_id` finished, successfully or not
    pub fn end_syncing(&self, document_id: &DocId) {
        let mut in_flight = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
        let still_running = match in_flight.get_mut(document_id) {
            Some(count) if *count > 1 => {
                *count -= 1;
                true
            }
            Some(_) => {
                in_flight.remove(document_id);
                false
            }
            None => false,
        };

        self.tx.send_modify(|status| {
            if !still_running {
                status.syncing_document_ids.remove(document_id);
            }
            status.is_syncing = !status.syncing_document_ids.is_empty();
        });
    }

    /// Record the platform's connectivity
    pub fn set_online(&self, is_online: bool) {
        self.tx.send_modify(|status| status.is_online = is_online);
    }

    /// Record a confirmed remote write; returns the recorded time
    pub fn mark_synced(&self) -> DateTime<Utc> {
        let now = Utc::now();
        self.tx.send_modify(|status| status.last_sync_time = Some(now));
        now
    }

    /// Reflect whether the current user's queue holds pending writes
    pub fn set_unsynced_changes(&self, has_unsynced_changes: bool) {
        self.tx
            .send_modify(|status| status.has_unsynced_changes = has_unsynced_changes);
    }

    /// Restore the last sync time when the signed-in user changes
    pub fn set_last_sync_time(&self, last_sync_time: Option<DateTime<Utc>>) {
        self.tx.send_modify(|status| status.last_sync_time = last_sync_time);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_initial_status() {
        let broadcaster = SyncStatusBroadcaster::new(true);
        let status = broadcaster.snapshot();
        assert!(status.is_online);
        assert!(!status.is_syncing);
        assert!(!status.has_unsynced_changes);
        assert!(status.last_sync_time.is_none());
        assert_eq!(status.label(), "Synced");
        assert!(!status.should_show());
    }

    #[test]
    fn test_syncing_coalesces_across_documents() {
        let broadcaster = SyncStatusBroadcaster::new(true);
        let a = DocId::from("a");
        let b = DocId::from("b");

        broadcaster.begin_syncing(&a);
        broadcaster.begin_syncing(&b);
        assert!(broadcaster.snapshot().is_syncing);
        assert_eq!(broadcaster.snapshot().label(), "Syncing…");

        broadcaster.end_syncing(&a);
        assert!(broadcaster.snapshot().is_syncing);

        broadcaster.end_syncing(&b);
        let status = broadcaster.snapshot();
        assert!(!status.is_syncing);
        assert!(status.syncing_document_ids.is_empty());
    }

    #[test]
    fn test_overlapping_attempts_on_same_document() {
        let broadcaster = SyncStatusBroadcaster::new(true);
        let a = DocId::from("a");

        broadcaster.begin_syncing(&a);
        broadcaster.begin_syncing(&a);
        broadcaster.end_syncing(&a);
        assert!(broadcaster.snapshot().syncing_document_ids.contains(&a));

        broadcaster.end_syncing(&a);
        assert!(!broadcaster.snapshot().is_syncing);

        // Unbalanced end is harmless
        broadcaster.end_syncing(&a);
        assert!(!broadcaster.snapshot().is_syncing);
    }

    #[test]
    fn test_labels() {
        let broadcaster = SyncStatusBroadcaster::new(true);
        broadcaster.set_unsynced_changes(true);
        assert_eq!(broadcaster.snapshot().label(), "Unsynced changes");

        broadcaster.set_online(false);
        assert_eq!(broadcaster.snapshot().label(), "Offline");
        assert!(broadcaster.snapshot().should_show());
    }

    #[test]
    fn test_mark_synced() {
        let broadcaster = SyncStatusBroadcaster::new(true);
        let at = broadcaster.mark_synced();
        assert_eq!(broadcaster.snapshot().last_sync_time, Some(at));

        broadcaster.set_last_sync_time(None);
        assert!(broadcaster.snapshot().last_sync_time.is_none());
    }

    #[tokio::test]
    async fn test_every_mutation_notifies() {
        let broadcaster = SyncStatusBroadcaster::new(true);
        let mut rx = broadcaster.subscribe();
        rx.borrow_and_update();

        // Even a mutation that leaves the value unchanged notifies
        broadcaster.set_online(true);
        assert!(rx.has_changed().unwrap());
        rx.borrow_and_update();

        broadcaster.begin_syncing(&DocId::from("a"));
        rx.changed().await.unwrap();
        assert!(rx.borrow_and_update().is_syncing);
    }

    #[test]
    fn test_formatted_time_since_sync() {
        let broadcaster = SyncStatusBroadcaster::new(true);
        let at = broadcaster.mark_synced();
        let status = broadcaster.snapshot();

        assert_eq!(status.formatted_time_since_sync(at + Duration::seconds(5)).as_deref(), Some("5s ago"));
        assert_eq!(status.formatted_time_since_sync(at + Duration::minutes(3)).as_deref(), Some("3m ago"));
        assert_eq!(status.formatted_time_since_sync(at + Duration::hours(2)).as_deref(), Some("2h ago"));
        assert_eq!(status.formatted_time_since_sync(at + Duration::days(4)).as_deref(), Some("4d ago"));
    }
}
