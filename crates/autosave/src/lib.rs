//! Offline-first autosave for user documents.
//!
//! Every edit is written to a local cache at once and sent to the remote
//! document store after a short quiet period. Writes that cannot be
//! delivered wait in a durable per-user queue and are replayed when the
//! network comes back.
//!
//! # Modules
//!
//! - `engine`: `AutosaveEngine`, the entry point for views
//! - `pipeline`: debounced save pipeline
//! - `reconciler`: queue flush reconciler
//! - `status`: observable sync status
//! - `connectivity`: online/offline signal and transition events
//! - `identity`: signed-in user signal
//! - `remote`: remote document store trait and in-memory store
//! - `error`: error types
//!
//! # Example
//!
//! ```no_run
//! use autosave::{AutosaveEngine, LocalIdentity, ManualConnectivity, MemoryRemoteStore};
//! use autosave::{AutosaveConfig, DocId, UserId};
//! use std::sync::Arc;
//! use store::MemoryStorage;
//!
//! # async fn run() {
//! let engine = AutosaveEngine::new(
//!     AutosaveConfig::default(),
//!     Arc::new(MemoryStorage::new()),
//!     Arc::new(MemoryRemoteStore::new()),
//!     Arc::new(ManualConnectivity::new(true)),
//!     Arc::new(LocalIdentity::signed_in("u1")),
//! );
//! engine.start();
//!
//! let user = UserId::from("u1");
//! engine.on_edit(&user, "notes", &DocId::from("noteA"), serde_json::json!({"title": "x"}));
//! # }
//! ```

mod connectivity;
mod context;
mod engine;
mod error;
mod identity;
mod pipeline;
mod reconciler;
mod remote;
mod status;

pub use connectivity::{ConnectivityEvent, ConnectivityMonitor, ConnectivitySource, ManualConnectivity};
pub use context::SaveOutcome;
pub use engine::{AutosaveEngine, MountResult, SyncSummary};
pub use error::{RemoteError, SyncError, SyncResult};
pub use identity::{IdentityProvider, LocalIdentity};
pub use pipeline::SavePipeline;
pub use reconciler::{FlushFailure, FlushOutcome, FlushReconciler, FlushReport};
pub use remote::{
    merge_fields, DocumentPath, MemoryRemoteStore, RecordedRequest, RemoteStore, RequestKind,
    WriteMode,
};
pub use status::{SyncStatus, SyncStatusBroadcaster};

pub use store::{AutosaveConfig, DocId, UserId};
