//! Persisted timestamp of each user's last successful sync

use crate::storage::{last_sync_key, KeyValueStorage};
use crate::UserId;
use chrono::{DateTime, Utc};
use std::sync::Arc;

/// Reads and writes `lastSync:{userId}` as an epoch-millis string
#[derive(Clone)]
pub struct LastSyncStore {
    storage: Arc<dyn KeyValueStorage>,
}

impl LastSyncStore {
    pub fn new(storage: Arc<dyn KeyValueStorage>) -> Self {
        Self { storage }
    }

    /// Record a successful sync at `at`
    pub fn record(&self, user: &UserId, at: DateTime<Utc>) {
        let key = last_sync_key(user);
        if let Err(e) = self
            .storage
            .set_item(&key, &at.timestamp_millis().to_string())
        {
            tracing::warn!(%key, "Failed to record last sync time: {}", e);
        }
    }

    /// Load the last recorded sync time, if any
    pub fn load(&self, user: &UserId) -> Option<DateTime<Utc>> {
        let key = last_sync_key(user);
        let raw = match self.storage.get_item(&key) {
            Ok(raw) => raw?,
            Err(e) => {
                tracing::warn!(%key, "Failed to read last sync time: {}", e);
                return None;
            }
        };

        raw.trim()
            .parse::<i64>()
            .ok()
            .and_then(DateTime::from_timestamp_millis)
    }
}
