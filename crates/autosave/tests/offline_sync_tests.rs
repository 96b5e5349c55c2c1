//! End-to-end tests for offline editing and reconnection.
//!
//! Every test runs on a paused tokio clock, so debounce periods and remote
//! latency elapse instantly and deterministically.

use autosave::{
    AutosaveConfig, AutosaveEngine, DocId, DocumentPath, FlushOutcome, LocalIdentity,
    ManualConnectivity, MemoryRemoteStore, SaveOutcome, SyncError, UserId,
};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use store::{FileStorage, KeyValueStorage, MemoryStorage, QueueItem, WriteOperation, WriteQueue};
use tempfile::TempDir;

struct Harness {
    storage: Arc<MemoryStorage>,
    remote: Arc<MemoryRemoteStore>,
    connectivity: Arc<ManualConnectivity>,
    identity: Arc<LocalIdentity>,
    engine: AutosaveEngine<MemoryRemoteStore>,
}

impl Harness {
    fn new() -> Self {
        Self::with_config(AutosaveConfig::default().without_updated_at())
    }

    fn with_config(config: AutosaveConfig) -> Self {
        Self::with_storage(config, Arc::new(MemoryStorage::new()))
    }

    fn with_storage(config: AutosaveConfig, storage: Arc<MemoryStorage>) -> Self {
        let remote = Arc::new(MemoryRemoteStore::new());
        let connectivity = Arc::new(ManualConnectivity::new(true));
        let identity = Arc::new(LocalIdentity::signed_in("u1"));
        let engine = AutosaveEngine::new(
            config,
            storage.clone(),
            remote.clone(),
            connectivity.clone(),
            identity.clone(),
        );
        engine.start();
        Self {
            storage,
            remote,
            connectivity,
            identity,
            engine,
        }
    }

    async fn go_offline(&self) {
        self.connectivity.set_online(false);
        settle().await;
    }

    async fn go_online(&self) {
        self.connectivity.set_online(true);
        settle().await;
    }

    fn cached(&self, doc: &str) -> Option<Value> {
        self.engine.local_snapshot(&u1(), &DocId::from(doc))
    }
}

fn u1() -> UserId {
    UserId::from("u1")
}

fn note_path(doc: &str) -> DocumentPath {
    DocumentPath::new(&u1(), "notes", &DocId::from(doc))
}

/// Let spawned listeners and flushes run
async fn settle() {
    tokio::time::sleep(Duration::from_millis(10)).await;
}

/// Wait out the default debounce period
async fn quiet_period() {
    tokio::time::sleep(Duration::from_millis(350)).await;
}

// =============================================================================
// Debounced saves
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_burst_of_edits_sends_one_write_with_last_payload() {
    let h = Harness::new();
    let doc = DocId::from("noteA");

    for i in 0..10 {
        h.engine.on_edit(&u1(), "notes", &doc, json!({"title": format!("v{}", i)}));
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    quiet_period().await;

    let requests = h.remote.requests_for(&note_path("noteA"));
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].payload, json!({"title": "v9"}));
}

#[tokio::test(start_paused = true)]
async fn test_cache_holds_latest_edit_before_remote_write() {
    let h = Harness::new();
    let doc = DocId::from("noteA");

    h.engine.on_edit(&u1(), "notes", &doc, json!({"title": "a"}));
    assert_eq!(h.cached("noteA"), Some(json!({"title": "a"})));

    h.engine.on_edit(&u1(), "notes", &doc, json!({"title": "ab"}));
    assert_eq!(h.cached("noteA"), Some(json!({"title": "ab"})));
    assert_eq!(h.remote.request_count(), 0);
    assert_eq!(h.engine.pending_writes(), 1);

    quiet_period().await;
    // Confirmed, so the safety net is no longer needed
    assert!(h.cached("noteA").is_none());
    assert_eq!(h.remote.document(&note_path("noteA")), Some(json!({"title": "ab"})));
}

#[tokio::test(start_paused = true)]
async fn test_identical_edits_send_at_most_one_write() {
    let h = Harness::new();
    let doc = DocId::from("noteA");
    let payload = json!({"title": "same"});

    h.engine.on_edit(&u1(), "notes", &doc, payload.clone());
    assert_eq!(h.cached("noteA"), Some(payload.clone()));
    quiet_period().await;

    h.engine.on_edit(&u1(), "notes", &doc, payload.clone());
    assert_eq!(h.cached("noteA"), Some(payload.clone()));
    quiet_period().await;

    assert_eq!(h.remote.request_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_documents_are_debounced_independently() {
    let h = Harness::new();

    h.engine.on_edit(&u1(), "notes", &DocId::from("a"), json!({"n": 1}));
    h.engine.on_edit(&u1(), "notes", &DocId::from("b"), json!({"n": 2}));
    h.engine.on_edit(&u1(), "todos", &DocId::from("a"), json!({"n": 3}));
    assert_eq!(h.engine.pending_writes(), 3);

    quiet_period().await;
    assert_eq!(h.remote.request_count(), 3);
    assert_eq!(h.remote.document_count(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_merge_write_keeps_other_remote_fields() {
    let h = Harness::new();
    h.remote
        .insert_document(note_path("noteA"), json!({"title": "x", "pinned": true}));

    h.engine
        .save_immediately(&u1(), "notes", &DocId::from("noteA"), json!({"title": "y"}))
        .await;

    assert_eq!(
        h.remote.document(&note_path("noteA")),
        Some(json!({"title": "y", "pinned": true}))
    );
}

// =============================================================================
// Offline queueing and reconciliation
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_offline_edit_is_flushed_on_reconnect() {
    let h = Harness::new();
    let doc = DocId::from("noteA");
    h.engine.persist_snapshot(&u1(), &doc, &json!({"title": "x"}));

    h.go_offline().await;
    h.engine.on_edit(&u1(), "notes", &doc, json!({"title": "y"}));
    assert_eq!(h.cached("noteA"), Some(json!({"title": "y"})));

    quiet_period().await;
    // Offline: no network round trip, the write waits in the queue
    assert_eq!(h.remote.request_count(), 0);
    let queued = WriteQueue::new(h.storage.clone()).peek_all(&u1());
    assert_eq!(queued.len(), 1);
    assert_eq!(queued[0].collection, "notes");
    assert_eq!(queued[0].document_id, doc);
    assert_eq!(queued[0].payload, json!({"title": "y"}));
    assert_eq!(queued[0].operation, WriteOperation::Update);
    assert!(h.engine.status().has_unsynced_changes);
    assert!(h.engine.status().last_sync_time.is_none());

    h.go_online().await;

    assert_eq!(h.remote.document(&note_path("noteA")), Some(json!({"title": "y"})));
    assert_eq!(h.engine.queue_length(&u1()), 0);
    assert!(h.storage.get_item("writeQueue:u1").unwrap().is_none());
    assert!(h.cached("noteA").is_none());

    let status = h.engine.status();
    assert!(status.last_sync_time.is_some());
    assert!(!status.has_unsynced_changes);
    assert!(!status.is_syncing);
    assert!(h.storage.get_item("lastSync:u1").unwrap().is_some());
}

#[tokio::test(start_paused = true)]
async fn test_queue_keeps_latest_write_per_document() {
    let h = Harness::new();
    let doc = DocId::from("noteA");
    h.go_offline().await;

    h.engine
        .save_immediately(&u1(), "notes", &doc, json!({"title": "first"}))
        .await;
    h.engine
        .save_immediately(&u1(), "notes", &doc, json!({"title": "second"}))
        .await;

    assert_eq!(h.engine.queue_length(&u1()), 1);

    h.go_online().await;
    let requests = h.remote.requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].payload, json!({"title": "second"}));
}

#[tokio::test(start_paused = true)]
async fn test_flush_twice_is_noop() {
    let h = Harness::new();
    h.go_offline().await;
    for doc in ["a", "b"] {
        h.engine
            .save_immediately(&u1(), "notes", &DocId::from(doc), json!({"doc": doc}))
            .await;
    }
    assert!(h.engine.status().has_unsynced_changes);

    // Reconnecting flushes everything
    h.go_online().await;
    assert_eq!(h.remote.request_count(), 2);
    assert_eq!(h.engine.queue_length(&u1()), 0);
    assert!(!h.engine.status().has_unsynced_changes);

    let again = h.engine.flush_queue(&u1()).await;
    assert!(matches!(again, FlushOutcome::Empty));
    assert_eq!(h.remote.request_count(), 2);
    assert!(!h.engine.status().has_unsynced_changes);
}

#[tokio::test(start_paused = true)]
async fn test_partial_flush_keeps_only_failed_item() {
    let h = Harness::new();
    h.go_offline().await;
    for doc in ["a", "b", "c"] {
        h.engine
            .save_immediately(&u1(), "notes", &DocId::from(doc), json!({"doc": doc}))
            .await;
    }
    h.remote.fail_path(note_path("b"));

    h.go_online().await;

    // A retry before the path heals changes nothing
    let retry = h.engine.reconciler().flush(&u1()).await;
    assert_eq!(retry.report().map(|r| r.remaining), Some(1));
    let remaining: Vec<QueueItem> = WriteQueue::new(h.storage.clone()).peek_all(&u1());
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].document_id, DocId::from("b"));
    assert!(h.engine.status().has_unsynced_changes);
    assert!(h.remote.document(&note_path("a")).is_some());
    assert!(h.remote.document(&note_path("c")).is_some());

    h.remote.heal_path(&note_path("b"));
    let outcome = h.engine.force_sync().await.unwrap();
    assert!(outcome.report().unwrap().is_complete());
    assert!(!h.engine.status().has_unsynced_changes);
}

#[tokio::test(start_paused = true)]
async fn test_stuck_remote_write_times_out() {
    let h = Harness::with_config(
        AutosaveConfig::default()
            .without_updated_at()
            .with_write_timeout_ms(2_000),
    );
    h.remote.set_latency(Some(Duration::from_secs(60)));

    h.engine
        .on_edit(&u1(), "notes", &DocId::from("noteA"), json!({"title": "x"}));
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert!(h.engine.status().is_syncing);

    tokio::time::sleep(Duration::from_secs(3)).await;
    let status = h.engine.status();
    assert!(!status.is_syncing);
    assert!(status.has_unsynced_changes);
    assert_eq!(h.engine.queue_length(&u1()), 1);
}

#[tokio::test(start_paused = true)]
async fn test_rejected_write_is_queued() {
    let h = Harness::new();
    h.remote.set_reject_all(true);

    let outcome = h
        .engine
        .save_immediately(&u1(), "notes", &DocId::from("noteA"), json!({"title": "x"}))
        .await;

    match outcome {
        SaveOutcome::Queued(err) => assert!(err.is_transient()),
        other => panic!("expected queued outcome, got {:?}", other),
    }
    assert_eq!(h.engine.queue_length(&u1()), 1);
    assert_eq!(h.cached("noteA"), Some(json!({"title": "x"})));
}

#[tokio::test(start_paused = true)]
async fn test_status_is_syncing_while_write_in_flight() {
    let h = Harness::new();
    h.remote.set_latency(Some(Duration::from_secs(1)));
    let mut rx = h.engine.subscribe_status();

    h.engine
        .on_edit(&u1(), "notes", &DocId::from("noteA"), json!({"title": "x"}));
    quiet_period().await;

    let status = rx.borrow_and_update().clone();
    assert!(status.is_syncing);
    assert!(status.syncing_document_ids.contains(&DocId::from("noteA")));

    tokio::time::sleep(Duration::from_secs(1)).await;
    assert!(!h.engine.status().is_syncing);
}

// =============================================================================
// Identity changes
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_sign_out_abandons_pending_writes() {
    let h = Harness::new();

    h.engine
        .on_edit(&u1(), "notes", &DocId::from("noteA"), json!({"title": "x"}));
    h.identity.sign_out();
    settle().await;
    quiet_period().await;

    assert_eq!(h.remote.request_count(), 0);
    assert_eq!(h.engine.pending_writes(), 0);
    // Still recoverable after signing back in
    assert_eq!(h.cached("noteA"), Some(json!({"title": "x"})));
}

#[tokio::test(start_paused = true)]
async fn test_queues_are_scoped_per_user() {
    let h = Harness::new();
    let u2 = UserId::from("u2");
    h.go_offline().await;

    h.engine
        .save_immediately(&u1(), "notes", &DocId::from("noteA"), json!({"owner": "u1"}))
        .await;
    assert!(h.engine.status().has_unsynced_changes);

    h.identity.sign_in("u2");
    settle().await;

    // The new user starts with a clean status
    assert!(!h.engine.status().has_unsynced_changes);
    assert_eq!(h.engine.queue_length(&u2), 0);
    assert_eq!(h.engine.queue_length(&u1()), 1);

    h.go_online().await;
    // Only the signed-in user's queue is flushed
    assert_eq!(h.remote.request_count(), 0);

    h.identity.sign_in("u1");
    settle().await;
    assert_eq!(h.remote.document(&note_path("noteA")), Some(json!({"owner": "u1"})));
    assert_eq!(h.engine.queue_length(&u1()), 0);
}

#[tokio::test(start_paused = true)]
async fn test_in_flight_save_stays_with_previous_user() {
    let h = Harness::new();
    let u2 = UserId::from("u2");
    h.remote.set_latency(Some(Duration::from_secs(1)));
    h.remote.set_reject_all(true);

    // The write is already on the wire when u2 signs in
    let u1_id = u1();
    let note_a = DocId::from("noteA");
    let (outcome, _) = tokio::join!(
        h.engine
            .save_immediately(&u1_id, "notes", &note_a, json!({"owner": "u1"})),
        async {
            tokio::time::sleep(Duration::from_millis(100)).await;
            h.identity.sign_in("u2");
        }
    );
    settle().await;

    assert!(outcome.is_queued());
    assert_eq!(h.engine.queue_length(&u1()), 1);
    assert_eq!(h.engine.queue_length(&u2), 0);
    // u1's failure does not leak into u2's status
    assert!(!h.engine.status().has_unsynced_changes);
    assert!(!h.engine.status().is_syncing);
}

// =============================================================================
// Mount, create and delete
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_mount_flushes_queue_and_recovers_draft() {
    let storage = Arc::new(MemoryStorage::new());
    let queue = WriteQueue::new(storage.clone());
    queue
        .enqueue(&u1(), QueueItem::update("notes", "old", json!({"title": "queued"})))
        .unwrap();

    let h = Harness::with_storage(AutosaveConfig::default().without_updated_at(), storage);
    h.engine
        .persist_snapshot(&u1(), &DocId::from("draft"), &json!({"title": "draft"}));

    let mounted = h.engine.mount(&u1(), "notes", &DocId::from("draft")).await;

    assert_eq!(mounted.flush.report().map(|r| r.synced), Some(1));
    assert_eq!(mounted.recovered, Some(json!({"title": "draft"})));
    assert_eq!(h.remote.document(&note_path("old")), Some(json!({"title": "queued"})));
}

#[tokio::test(start_paused = true)]
async fn test_create_then_delete_while_offline() {
    let h = Harness::new();
    h.go_offline().await;

    let (id, outcome) = h
        .engine
        .create_document(&u1(), "todos", json!({"text": "milk"}))
        .await;
    assert!(matches!(outcome, SaveOutcome::Queued(SyncError::Offline)));

    let queued = WriteQueue::new(h.storage.clone()).peek_all(&u1());
    assert_eq!(queued[0].operation, WriteOperation::Create);

    h.engine.delete_document(&u1(), "todos", &id).await;
    let queued = WriteQueue::new(h.storage.clone()).peek_all(&u1());
    assert_eq!(queued.len(), 1);
    assert_eq!(queued[0].operation, WriteOperation::Delete);

    h.go_online().await;
    assert_eq!(h.remote.document_count(), 0);
    assert_eq!(h.engine.queue_length(&u1()), 0);
}

// =============================================================================
// Storage failures and restarts
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_storage_failure_does_not_break_editing() {
    let storage = Arc::new(MemoryStorage::new());
    let h = Harness::with_storage(AutosaveConfig::default().without_updated_at(), storage.clone());
    h.go_offline().await;
    storage.set_available(false);

    h.engine
        .on_edit(&u1(), "notes", &DocId::from("noteA"), json!({"title": "x"}));
    quiet_period().await;

    // The queue keeps working in memory for the session
    assert_eq!(h.engine.queue_length(&u1()), 1);
    assert!(h.engine.status().has_unsynced_changes);

    h.go_online().await;
    assert_eq!(h.remote.document(&note_path("noteA")), Some(json!({"title": "x"})));
    assert!(!h.engine.status().has_unsynced_changes);
}

#[tokio::test(start_paused = true)]
async fn test_queue_survives_restart_on_file_storage() {
    let dir = TempDir::new().unwrap();
    let remote = Arc::new(MemoryRemoteStore::new());
    let config = AutosaveConfig::default().without_updated_at();

    {
        let engine = AutosaveEngine::new(
            config.clone(),
            Arc::new(FileStorage::open(dir.path()).unwrap()),
            remote.clone(),
            Arc::new(ManualConnectivity::new(false)),
            Arc::new(LocalIdentity::signed_in("u1")),
        );
        engine
            .save_immediately(&u1(), "notes", &DocId::from("noteA"), json!({"title": "x"}))
            .await;
        assert_eq!(engine.queue_length(&u1()), 1);
    }

    let engine = AutosaveEngine::new(
        config,
        Arc::new(FileStorage::open(dir.path()).unwrap()),
        remote.clone(),
        Arc::new(ManualConnectivity::new(true)),
        Arc::new(LocalIdentity::signed_in("u1")),
    );
    assert!(engine.status().has_unsynced_changes);
    assert_eq!(engine.local_snapshot(&u1(), &DocId::from("noteA")), Some(json!({"title": "x"})));

    let outcome = engine.force_sync().await.unwrap();
    assert_eq!(outcome.report().unwrap().synced, 1);
    assert_eq!(remote.document(&note_path("noteA")), Some(json!({"title": "x"})));
    assert!(engine.local_snapshot(&u1(), &DocId::from("noteA")).is_none());
}
