//! Queue flush reconciler.
//!
//! Replays a user's write queue against the remote store once the network
//! is back, when a view mounts, or on an explicit "sync now". Items are sent
//! one at a time in queue order. There is no transaction across items: the
//! ones that succeed leave the queue, the ones that fail stay in place for
//! the next flush.

use crate::context::SyncContext;
use crate::error::SyncError;
use crate::remote::RemoteStore;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use store::{QueueItem, QueueKey, UserId, WriteOperation};
use tokio::time::Instant;

/// One queued write that could not be delivered
#[derive(Debug)]
pub struct FlushFailure {
    pub key: QueueKey,
    pub error: SyncError,
}

/// Summary of one flush
#[derive(Debug, Default)]
pub struct FlushReport {
    /// Items taken from the queue snapshot
    pub attempted: usize,
    /// Items confirmed by the remote store
    pub synced: usize,
    /// Invalid items discarded without a remote call
    pub dropped: usize,
    /// Items still queued afterwards
    pub remaining: usize,
    pub failures: Vec<FlushFailure>,
}

impl FlushReport {
    pub fn is_complete(&self) -> bool {
        self.remaining == 0
    }
}

/// What a flush request did
#[derive(Debug)]
pub enum FlushOutcome {
    /// The queue was replayed
    Completed(FlushReport),
    /// Nothing was queued
    Empty,
    /// Another flush for the same user is running
    AlreadyRunning,
    /// The client is offline; nothing was attempted
    Offline,
    /// An opportunistic flush ran too recently
    Throttled,
}

impl FlushOutcome {
    pub fn report(&self) -> Option<&FlushReport> {
        match self {
            FlushOutcome::Completed(report) => Some(report),
            _ => None,
        }
    }
}

/// Releases the per-user flush slot when the flush ends, even if the flush
/// future is dropped midway
struct FlushSlot<'a> {
    in_flight: &'a Mutex<HashSet<UserId>>,
    user: UserId,
}

impl Drop for FlushSlot<'_> {
    fn drop(&mut self) {
        lock(self.in_flight).remove(&self.user);
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Queue flush reconciler
pub struct FlushReconciler<R> {
    ctx: Arc<SyncContext<R>>,
    in_flight: Mutex<HashSet<UserId>>,
    last_flush: Mutex<HashMap<UserId, Instant>>,
}

impl<R: RemoteStore> FlushReconciler<R> {
    pub(crate) fn new(ctx: Arc<SyncContext<R>>) -> Self {
        Self {
            ctx,
            in_flight: Mutex::new(HashSet::new()),
            last_flush: Mutex::new(HashMap::new()),
        }
    }

    /// Whether a flush for `user` is running
    pub fn is_flushing(&self, user: &UserId) -> bool {
        lock(&self.in_flight).contains(user)
    }

    fn acquire(&self, user: &UserId) -> Option<FlushSlot<'_>> {
        let mut in_flight = lock(&self.in_flight);
        if !in_flight.insert(user.clone()) {
            return None;
        }
        Some(FlushSlot {
            in_flight: &self.in_flight,
            user: user.clone(),
        })
    }

    /// Flush triggered by a connectivity change or a view mount.
    ///
    /// Honors `flush_min_interval_ms` between flushes of the same user.
    pub async fn flush_opportunistic(&self, user: &UserId) -> FlushOutcome {
        if let Some(min_interval) = self.ctx.config.flush_min_interval() {
            let last_flush = lock(&self.last_flush).get(user).copied();
            if let Some(at) = last_flush {
                if at.elapsed() < min_interval {
                    tracing::debug!(%user, "Skipping flush, last one was {:?} ago", at.elapsed());
                    return FlushOutcome::Throttled;
                }
            }
        }
        self.flush(user).await
    }

    /// Replay `user`'s queue now
    pub async fn flush(&self, user: &UserId) -> FlushOutcome {
        let Some(_slot) = self.acquire(user) else {
            tracing::debug!(%user, "Flush already in progress");
            return FlushOutcome::AlreadyRunning;
        };

        let items = self.ctx.queue.peek_all(user);
        if items.is_empty() {
            self.ctx.refresh_unsynced(user);
            return FlushOutcome::Empty;
        }
        if !self.ctx.connectivity.is_online() {
            self.ctx.refresh_unsynced(user);
            return FlushOutcome::Offline;
        }

        lock(&self.last_flush).insert(user.clone(), Instant::now());
        tracing::info!(%user, items = items.len(), "Flushing write queue");

        let mut report = FlushReport {
            attempted: items.len(),
            ..Default::default()
        };
        let mut flushed: Vec<QueueItem> = Vec::with_capacity(items.len());

        for item in items {
            if !item.is_valid() {
                tracing::warn!(%user, key = %item.key(), "Dropping invalid queue item");
                report.dropped += 1;
                flushed.push(item);
                continue;
            }

            self.ctx.status.begin_syncing(&item.document_id);
            let result = self.ctx.push(user, &item).await;
            self.ctx.status.end_syncing(&item.document_id);

            match result {
                Ok(()) => {
                    if item.operation == WriteOperation::Delete {
                        self.ctx.cache.clear(user, &item.document_id);
                    } else {
                        self.ctx.cache.clear_if_matches(user, &item.document_id, &item.payload);
                    }
                    report.synced += 1;
                    flushed.push(item);
                }
                Err(error) => {
                    tracing::warn!(%user, key = %item.key(), "Queued write failed: {}", error);
                    report.failures.push(FlushFailure {
                        key: item.key(),
                        error,
                    });
                }
            }
        }

        if let Err(e) = self.ctx.queue.remove_flushed(user, &flushed) {
            tracing::warn!(%user, "Failed to persist write queue: {}", e);
        }
        report.remaining = self.ctx.queue.len(user);

        if report.remaining == 0 {
            if let Err(e) = self.ctx.queue.clear(user) {
                tracing::warn!(%user, "Failed to clear write queue record: {}", e);
            }
        }
        if report.synced > 0 || report.remaining == 0 {
            self.ctx.record_sync(user);
        }
        self.ctx.refresh_unsynced(user);

        tracing::info!(
            %user,
            synced = report.synced,
            dropped = report.dropped,
            failed = report.failures.len(),
            remaining = report.remaining,
            "Write queue flushed"
        );
        FlushOutcome::Completed(report)
    }
}
