//! Priority queue of pending task update requests.
//!
//! More advanced statuses are served first; within a status, the sooner
//! contribution deadline wins. A task id is queued at most once at a time.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashSet};
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::error::QueueError;
use crate::task::{Task, TaskStatus};

/// A request waiting in the queue, keyed by the task snapshot it was
/// published with.
#[derive(Debug, Clone)]
pub struct QueuedRequest {
    pub chain_task_id: String,
    pub status: TaskStatus,
    pub contribution_deadline: DateTime<Utc>,
    seq: u64,
    enqueued_at: Instant,
}

impl PartialEq for QueuedRequest {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for QueuedRequest {}

impl PartialOrd for QueuedRequest {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedRequest {
    // BinaryHeap pops the greatest entry.
    fn cmp(&self, other: &Self) -> Ordering {
        self.status
            .cmp(&other.status)
            .then_with(|| other.contribution_deadline.cmp(&self.contribution_deadline))
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

#[derive(Default)]
struct Inner {
    heap: BinaryHeap<QueuedRequest>,
    pending: HashSet<String>,
    next_seq: u64,
}

/// Deduplicating priority queue with an async `take`.
pub struct UpdateQueue {
    inner: Mutex<Inner>,
    notify: Notify,
    ttl: Duration,
}

impl UpdateQueue {
    /// Entries older than `ttl` are dropped by [`UpdateQueue::prune_expired`].
    pub fn new(ttl: Duration) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            notify: Notify::new(),
            ttl,
        }
    }

    /// Queue a request for `task`. False if one is already pending.
    pub fn offer(&self, task: &Task) -> Result<bool, QueueError> {
        let mut inner = self.inner.lock().map_err(|_| QueueError::Poisoned)?;
        if !inner.pending.insert(task.chain_task_id.clone()) {
            return Ok(false);
        }
        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.heap.push(QueuedRequest {
            chain_task_id: task.chain_task_id.clone(),
            status: task.current_status,
            contribution_deadline: task.contribution_deadline,
            seq,
            enqueued_at: Instant::now(),
        });
        drop(inner);
        self.notify.notify_one();
        Ok(true)
    }

    pub fn contains(&self, chain_task_id: &str) -> bool {
        self.inner
            .lock()
            .map(|inner| inner.pending.contains(chain_task_id))
            .unwrap_or(false)
    }

    /// Pop the highest-priority request without waiting.
    pub fn try_take(&self) -> Option<QueuedRequest> {
        let mut inner = self.inner.lock().ok()?;
        let request = inner.heap.pop()?;
        inner.pending.remove(&request.chain_task_id);
        Some(request)
    }

    /// Wait for the highest-priority request.
    pub async fn take(&self) -> QueuedRequest {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // Register before checking so an offer in between is not missed.
            notified.as_mut().enable();
            if let Some(request) = self.try_take() {
                return request;
            }
            notified.await;
        }
    }

    /// Drop requests queued for longer than the TTL. Returns how many.
    pub fn prune_expired(&self) -> usize {
        let Ok(mut inner) = self.inner.lock() else {
            return 0;
        };
        let ttl = self.ttl;
        let before = inner.heap.len();
        let mut expired = Vec::new();
        inner.heap.retain(|request| {
            let keep = request.enqueued_at.elapsed() < ttl;
            if !keep {
                expired.push(request.chain_task_id.clone());
            }
            keep
        });
        for chain_task_id in &expired {
            inner.pending.remove(chain_task_id);
        }
        before - inner.heap.len()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().map(|inner| inner.heap.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    fn task(id: &str, status: TaskStatus, deadline_secs: i64) -> Task {
        Task::new("0xdeal", 0, id, 1, Duration::from_secs(60))
            .unwrap()
            .with_status(status)
            .with_contribution_deadline(Utc::now() + chrono::Duration::seconds(deadline_secs))
    }

    #[test]
    fn status_desc_then_deadline_asc() {
        let queue = UpdateQueue::new(Duration::from_secs(60));
        queue.offer(&task("A", TaskStatus::Running, 10)).unwrap();
        queue.offer(&task("B", TaskStatus::ConsensusReached, 5)).unwrap();
        queue.offer(&task("C", TaskStatus::Running, 1)).unwrap();

        let order: Vec<_> = std::iter::from_fn(|| queue.try_take())
            .map(|r| r.chain_task_id)
            .collect();
        assert_eq!(order, vec!["B", "C", "A"]);
    }

    #[test]
    fn equal_keys_keep_publish_order() {
        let queue = UpdateQueue::new(Duration::from_secs(60));
        let deadline = Utc::now();
        for id in ["first", "second", "third"] {
            queue
                .offer(&task(id, TaskStatus::Running, 0).with_contribution_deadline(deadline))
                .unwrap();
        }
        let order: Vec<_> = std::iter::from_fn(|| queue.try_take())
            .map(|r| r.chain_task_id)
            .collect();
        assert_eq!(order, vec!["first", "second", "third"]);
    }

    #[test]
    fn pending_id_is_offered_once() {
        let queue = UpdateQueue::new(Duration::from_secs(60));
        let t = task("A", TaskStatus::Running, 10);
        assert_eq!(queue.offer(&t), Ok(true));
        assert_eq!(queue.offer(&t), Ok(false));
        assert!(queue.contains("A"));
        assert_eq!(queue.len(), 1);

        queue.try_take().unwrap();
        assert!(!queue.contains("A"));
        assert_eq!(queue.offer(&t), Ok(true));
    }

    #[test]
    fn poisoned_queue_reports_an_error() {
        let queue = Arc::new(UpdateQueue::new(Duration::from_secs(60)));
        let holder = Arc::clone(&queue);
        let _ = std::thread::spawn(move || {
            let _inner = holder.inner.lock().unwrap();
            panic!("worker died holding the queue");
        })
        .join();

        assert_eq!(
            queue.offer(&task("A", TaskStatus::Running, 10)),
            Err(QueueError::Poisoned)
        );
    }

    #[tokio::test]
    async fn take_waits_for_offer() {
        let queue = Arc::new(UpdateQueue::new(Duration::from_secs(60)));
        let waiter = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.take().await })
        };
        tokio::task::yield_now().await;
        queue.offer(&task("A", TaskStatus::Running, 10)).unwrap();

        let request = tokio::time::timeout(Duration::from_secs(5), waiter)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(request.chain_task_id, "A");
        assert!(queue.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn expired_requests_are_pruned() {
        let queue = UpdateQueue::new(Duration::from_secs(10));
        queue.offer(&task("old", TaskStatus::Running, 10)).unwrap();
        tokio::time::advance(Duration::from_secs(6)).await;
        queue.offer(&task("new", TaskStatus::Running, 10)).unwrap();
        tokio::time::advance(Duration::from_secs(5)).await;

        assert_eq!(queue.prune_expired(), 1);
        assert!(!queue.contains("old"));
        assert!(queue.contains("new"));
    }
}
