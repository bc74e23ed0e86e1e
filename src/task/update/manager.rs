//! Task update request manager.
//!
//! Requests are deduplicated and prioritized by [`UpdateQueue`], then drained
//! by a fixed pool of routines. Each routine takes the per-task lock before
//! calling the consumer, so one task is updated by at most one routine at a
//! time while different tasks progress in parallel.

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::queue::UpdateQueue;
use crate::config::SchedulerConfig;
use crate::lock::TaskLocks;
use crate::store::TaskStore;

/// Applies status transitions for a task.
#[async_trait]
pub trait TaskUpdateRequestConsumer: Send + Sync {
    async fn on_task_update_request(&self, chain_task_id: &str);
}

/// Accepts requests to re-evaluate a task.
#[async_trait]
pub trait TaskUpdatePublisher: Send + Sync {
    /// True once the request is queued, not once it is applied.
    async fn publish_request(&self, chain_task_id: &str) -> bool;
}

/// Releases a routine slot when the routine ends, however it ends.
struct RoutineSlot<'a>(&'a AtomicUsize);

impl Drop for RoutineSlot<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Dispatches task update requests to the registered consumer.
pub struct TaskUpdateRequestManager {
    tasks: Arc<dyn TaskStore>,
    queue: UpdateQueue,
    locks: Arc<TaskLocks>,
    consumer: OnceLock<Arc<dyn TaskUpdateRequestConsumer>>,
    pool_size: usize,
    active_routines: AtomicUsize,
    cancel: CancellationToken,
}

impl TaskUpdateRequestManager {
    pub fn new(
        tasks: Arc<dyn TaskStore>,
        locks: Arc<TaskLocks>,
        config: &SchedulerConfig,
        cancel: CancellationToken,
    ) -> Arc<Self> {
        Arc::new(Self {
            tasks,
            queue: UpdateQueue::new(config.longest_task_timeout),
            locks,
            consumer: OnceLock::new(),
            pool_size: config.update_pool_size,
            active_routines: AtomicUsize::new(0),
            cancel,
        })
    }

    /// Queue a request to re-evaluate `chain_task_id`.
    ///
    /// False for an empty id, an id already pending, or an unknown task.
    pub async fn publish_request(&self, chain_task_id: &str) -> bool {
        if chain_task_id.is_empty() {
            return false;
        }
        if self.queue.contains(chain_task_id) {
            warn!(chain_task_id = %chain_task_id, "Request already published");
            return false;
        }
        let task = match self.tasks.get_task(chain_task_id).await {
            Ok(Some(task)) => task,
            Ok(None) => {
                warn!(chain_task_id = %chain_task_id, "No such task");
                return false;
            }
            Err(e) => {
                error!(chain_task_id = %chain_task_id, error = %e, "Failed to read task");
                return false;
            }
        };
        match self.queue.offer(&task) {
            Ok(true) => {}
            Ok(false) => {
                warn!(chain_task_id = %chain_task_id, "Request already published");
                return false;
            }
            Err(e) => {
                error!(chain_task_id = %chain_task_id, error = %e, "Failed to queue request");
                return false;
            }
        }
        info!(
            chain_task_id = %chain_task_id,
            queue_size = self.queue.len(),
            "Published task update request"
        );
        true
    }

    /// Register the consumer. Only the first registration is kept.
    pub fn set_request_consumer(&self, consumer: Arc<dyn TaskUpdateRequestConsumer>) -> bool {
        if self.consumer.set(consumer).is_err() {
            warn!("Task update request consumer already set");
            return false;
        }
        true
    }

    /// Top up the pool of routines draining the queue.
    ///
    /// Does nothing until a consumer is registered, so requests accumulate.
    pub fn consume_and_notify(self: &Arc<Self>) {
        if self.consumer.get().is_none() {
            warn!(
                queue_size = self.queue.len(),
                "Waiting for consumer before consuming"
            );
            return;
        }
        if self.cancel.is_cancelled() {
            return;
        }
        let missing = self.pool_size.saturating_sub(self.active_routines());
        for _ in 0..missing {
            let manager = Arc::clone(self);
            // Count the routine before it is scheduled so the next top-up
            // does not start it twice.
            manager.active_routines.fetch_add(1, Ordering::SeqCst);
            tokio::spawn(async move {
                manager.run_routine().await;
            });
        }
    }

    async fn run_routine(&self) {
        // Slot reserved by `consume_and_notify`.
        let _slot = RoutineSlot(&self.active_routines);
        let Some(consumer) = self.consumer.get().cloned() else {
            return;
        };
        debug!(queue_size = self.queue.len(), "Task update routine started");

        loop {
            let request = tokio::select! {
                biased;
                () = self.cancel.cancelled() => break,
                request = self.queue.take() => request,
            };
            let chain_task_id = request.chain_task_id;
            info!(
                chain_task_id = %chain_task_id,
                status = %request.status,
                "Selected task"
            );

            let _guard = self.locks.lock(&chain_task_id).await;
            let outcome = AssertUnwindSafe(consumer.on_task_update_request(&chain_task_id))
                .catch_unwind()
                .await;
            if outcome.is_err() {
                error!(chain_task_id = %chain_task_id, "Task update consumer panicked");
            }
        }

        debug!("Task update routine stopped");
    }

    /// Start the periodic driver topping up routines and sweeping expired
    /// lock and queue entries. Stops on cancellation.
    pub fn spawn(
        self: &Arc<Self>,
        consume_interval: Duration,
        sweep_interval: Duration,
    ) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let mut consume = tokio::time::interval(consume_interval);
            let mut sweep = tokio::time::interval(sweep_interval);
            loop {
                tokio::select! {
                    biased;
                    () = manager.cancel.cancelled() => break,
                    _ = consume.tick() => manager.consume_and_notify(),
                    _ = sweep.tick() => manager.sweep(),
                }
            }
            info!("Task update driver stopped");
        })
    }

    /// Drop expired lock and queue entries.
    pub fn sweep(&self) {
        let locks = self.locks.prune_expired();
        let requests = self.queue.prune_expired();
        if locks > 0 || requests > 0 {
            info!(locks, requests, "Swept expired task update entries");
        }
    }

    /// Stop the driver and every routine. In-flight updates finish; pending
    /// requests stay queued.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    pub fn active_routines(&self) -> usize {
        self.active_routines.load(Ordering::SeqCst)
    }

    pub fn queue_size(&self) -> usize {
        self.queue.len()
    }

    pub fn locks(&self) -> &Arc<TaskLocks> {
        &self.locks
    }
}

#[async_trait]
impl TaskUpdatePublisher for TaskUpdateRequestManager {
    async fn publish_request(&self, chain_task_id: &str) -> bool {
        TaskUpdateRequestManager::publish_request(self, chain_task_id).await
    }
}
