//! Per-task advisory locks shared by the replicate matcher and the task
//! update dispatcher.
//!
//! Entries are created on first use through the map's entry API, so two
//! callers racing on a fresh key always get the same mutex. Idle entries
//! older than the TTL are swept; an entry whose mutex is still referenced
//! (held or about to be) is never removed.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio::time::Instant;
use tracing::debug;

struct LockEntry {
    lock: Arc<Mutex<()>>,
    touched: Instant,
}

/// Keyed table of lazily created task locks.
pub struct TaskLocks {
    entries: DashMap<String, LockEntry>,
    ttl: Duration,
}

impl TaskLocks {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
        }
    }

    /// The lock for `chain_task_id`, created if absent.
    pub fn get(&self, chain_task_id: &str) -> Arc<Mutex<()>> {
        let mut entry = self
            .entries
            .entry(chain_task_id.to_owned())
            .or_insert_with(|| LockEntry {
                lock: Arc::new(Mutex::new(())),
                touched: Instant::now(),
            });
        entry.touched = Instant::now();
        Arc::clone(&entry.lock)
    }

    /// Wait for the lock of `chain_task_id`.
    pub async fn lock(&self, chain_task_id: &str) -> OwnedMutexGuard<()> {
        self.get(chain_task_id).lock_owned().await
    }

    /// Take the lock of `chain_task_id` if nobody holds it.
    pub fn try_lock(&self, chain_task_id: &str) -> Option<OwnedMutexGuard<()>> {
        self.get(chain_task_id).try_lock_owned().ok()
    }

    /// Drop idle entries untouched for longer than the TTL. Returns how many.
    pub fn prune_expired(&self) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, entry| {
            Arc::strong_count(&entry.lock) > 1 || entry.touched.elapsed() < self.ttl
        });
        let pruned = before.saturating_sub(self.entries.len());
        if pruned > 0 {
            debug!(pruned, remaining = self.entries.len(), "Pruned expired task locks");
        }
        pruned
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
