//! Store - Local persistence for offline-first autosave
//!
//! This crate owns everything that lives on the device: the key/value
//! storage medium, the per-document crash-recovery cache, the durable write
//! queue, the last-sync record, and the persisted settings.

mod autosave;
mod error;
mod ids;
mod last_sync;
mod queue;
mod settings;
pub mod storage;

pub use autosave::*;
pub use error::*;
pub use ids::*;
pub use last_sync::*;
pub use queue::*;
pub use settings::*;
pub use storage::{FileStorage, KeyValueStorage, MemoryStorage};
