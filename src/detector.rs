//! Periodic detectors noticing tasks whose update was missed.
//!
//! Detectors never change a task themselves; they publish a task update
//! request and let the dispatcher apply whatever transition is due.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::chain::{ChainReader, ChainTaskStatus};
use crate::error::Error;
use crate::store::TaskStore;
use crate::task::{TaskStatus, TaskUpdatePublisher};

/// A periodic check publishing update requests for stalled tasks.
#[async_trait]
pub trait Detector: Send + Sync {
    fn name(&self) -> &'static str;

    /// Run one detection pass. Returns how many tasks were published.
    async fn detect(&self) -> Result<usize, Error>;
}

/// INITIALIZING tasks already initialized on-chain.
pub struct InitializedTaskDetector {
    tasks: Arc<dyn TaskStore>,
    chain: Arc<dyn ChainReader>,
    publisher: Arc<dyn TaskUpdatePublisher>,
}

impl InitializedTaskDetector {
    pub fn new(
        tasks: Arc<dyn TaskStore>,
        chain: Arc<dyn ChainReader>,
        publisher: Arc<dyn TaskUpdatePublisher>,
    ) -> Self {
        Self {
            tasks,
            chain,
            publisher,
        }
    }
}

#[async_trait]
impl Detector for InitializedTaskDetector {
    fn name(&self) -> &'static str {
        "initialized-task"
    }

    async fn detect(&self) -> Result<usize, Error> {
        let mut published = 0;
        for task in self
            .tasks
            .find_by_current_status(&[TaskStatus::Initializing])
            .await?
        {
            let initialized = self
                .chain
                .get_chain_task(&task.chain_task_id)
                .await?
                .is_some_and(|t| t.status != ChainTaskStatus::Unset);
            if initialized {
                info!(
                    chain_task_id = %task.chain_task_id,
                    is = %TaskStatus::Initializing,
                    should = %TaskStatus::Initialized,
                    "Detected confirmed missing update"
                );
                if self.publisher.publish_request(&task.chain_task_id).await {
                    published += 1;
                }
            }
        }
        Ok(published)
    }
}

/// FINALIZING tasks already completed on-chain.
pub struct FinalizedTaskDetector {
    tasks: Arc<dyn TaskStore>,
    chain: Arc<dyn ChainReader>,
    publisher: Arc<dyn TaskUpdatePublisher>,
}

impl FinalizedTaskDetector {
    pub fn new(
        tasks: Arc<dyn TaskStore>,
        chain: Arc<dyn ChainReader>,
        publisher: Arc<dyn TaskUpdatePublisher>,
    ) -> Self {
        Self {
            tasks,
            chain,
            publisher,
        }
    }
}

#[async_trait]
impl Detector for FinalizedTaskDetector {
    fn name(&self) -> &'static str {
        "finalized-task"
    }

    async fn detect(&self) -> Result<usize, Error> {
        let mut published = 0;
        for task in self
            .tasks
            .find_by_current_status(&[TaskStatus::Finalizing])
            .await?
        {
            let completed = self
                .chain
                .get_chain_task(&task.chain_task_id)
                .await?
                .is_some_and(|t| t.status == ChainTaskStatus::Completed);
            if completed {
                info!(
                    chain_task_id = %task.chain_task_id,
                    is = %TaskStatus::Finalizing,
                    should = %TaskStatus::Finalized,
                    "Detected confirmed missing update"
                );
                if self.publisher.publish_request(&task.chain_task_id).await {
                    published += 1;
                }
            }
        }
        Ok(published)
    }
}

/// RECEIVED and RESULT_UPLOADED tasks waiting for their next transaction.
pub struct UnstartedTxDetector {
    tasks: Arc<dyn TaskStore>,
    publisher: Arc<dyn TaskUpdatePublisher>,
}

impl UnstartedTxDetector {
    pub fn new(tasks: Arc<dyn TaskStore>, publisher: Arc<dyn TaskUpdatePublisher>) -> Self {
        Self { tasks, publisher }
    }
}

#[async_trait]
impl Detector for UnstartedTxDetector {
    fn name(&self) -> &'static str {
        "unstarted-tx"
    }

    async fn detect(&self) -> Result<usize, Error> {
        let mut published = 0;
        for (is, should) in [
            (TaskStatus::ResultUploaded, TaskStatus::Finalizing),
            (TaskStatus::Received, TaskStatus::Initializing),
        ] {
            for task in self.tasks.find_by_current_status(&[is]).await? {
                info!(
                    chain_task_id = %task.chain_task_id,
                    is = %is,
                    should = %should,
                    "Detected confirmed missing update"
                );
                if self.publisher.publish_request(&task.chain_task_id).await {
                    published += 1;
                }
            }
        }
        Ok(published)
    }
}

/// Non-terminal tasks past their final deadline.
pub struct FinalDeadlineTaskDetector {
    tasks: Arc<dyn TaskStore>,
    publisher: Arc<dyn TaskUpdatePublisher>,
}

impl FinalDeadlineTaskDetector {
    pub fn new(tasks: Arc<dyn TaskStore>, publisher: Arc<dyn TaskUpdatePublisher>) -> Self {
        Self { tasks, publisher }
    }
}

const NON_TERMINAL_STATUSES: [TaskStatus; 12] = [
    TaskStatus::Received,
    TaskStatus::Initializing,
    TaskStatus::Initialized,
    TaskStatus::Running,
    TaskStatus::ConsensusReached,
    TaskStatus::ContributionTimeout,
    TaskStatus::Revealing,
    TaskStatus::ResultUploadRequested,
    TaskStatus::ResultUploading,
    TaskStatus::ResultUploaded,
    TaskStatus::Finalizing,
    TaskStatus::Finalized,
];

#[async_trait]
impl Detector for FinalDeadlineTaskDetector {
    fn name(&self) -> &'static str {
        "final-deadline"
    }

    async fn detect(&self) -> Result<usize, Error> {
        let mut published = 0;
        for task in self
            .tasks
            .find_by_current_status(&NON_TERMINAL_STATUSES)
            .await?
        {
            if task.is_final_deadline_reached() {
                info!(
                    chain_task_id = %task.chain_task_id,
                    status = %task.current_status,
                    "Task passed its final deadline"
                );
                if self.publisher.publish_request(&task.chain_task_id).await {
                    published += 1;
                }
            }
        }
        Ok(published)
    }
}

/// Run a detector every `interval` until cancelled.
pub fn spawn_detector(
    detector: Arc<dyn Detector>,
    interval: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            match detector.detect().await {
                Ok(0) => debug!(detector = detector.name(), "Nothing detected"),
                Ok(published) => debug!(detector = detector.name(), published, "Detection done"),
                Err(e) => warn!(detector = detector.name(), error = %e, "Detection failed"),
            }
        }
        debug!(detector = detector.name(), "Detector stopped");
    })
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use chrono::Utc;

    use super::*;
    use crate::chain::{ChainTask, MemoryChain};
    use crate::store::MemoryStore;
    use crate::task::Task;

    #[derive(Default)]
    struct RecordingPublisher {
        published: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl TaskUpdatePublisher for RecordingPublisher {
        async fn publish_request(&self, chain_task_id: &str) -> bool {
            self.published.lock().unwrap().push(chain_task_id.to_string());
            true
        }
    }

    fn task(id: &str, status: TaskStatus) -> Task {
        Task::new("0xdeal", 0, id, 1, Duration::from_secs(60))
            .unwrap()
            .with_status(status)
    }

    fn chain_task(id: &str, status: ChainTaskStatus) -> ChainTask {
        ChainTask {
            chain_task_id: id.into(),
            status,
            winner_counter: 0,
            consensus_value: String::new(),
            revealing_block_number: 0,
            contribution_deadline: Utc::now(),
            final_deadline: Utc::now(),
        }
    }

    #[tokio::test]
    async fn initialized_detector_checks_chain() {
        let store = Arc::new(MemoryStore::new());
        let chain = Arc::new(MemoryChain::new());
        let publisher = Arc::new(RecordingPublisher::default());
        store.insert_task(&task("0xa", TaskStatus::Initializing)).await.unwrap();
        store.insert_task(&task("0xb", TaskStatus::Initializing)).await.unwrap();
        store.insert_task(&task("0xc", TaskStatus::Running)).await.unwrap();
        chain.set_task(chain_task("0xa", ChainTaskStatus::Active));
        chain.set_task(chain_task("0xb", ChainTaskStatus::Unset));
        chain.set_task(chain_task("0xc", ChainTaskStatus::Active));

        let detector = InitializedTaskDetector::new(store, chain, publisher.clone());
        assert_eq!(detector.detect().await.unwrap(), 1);
        assert_eq!(*publisher.published.lock().unwrap(), vec!["0xa"]);
    }

    #[tokio::test]
    async fn finalized_detector_requires_completed_chain_task() {
        let store = Arc::new(MemoryStore::new());
        let chain = Arc::new(MemoryChain::new());
        let publisher = Arc::new(RecordingPublisher::default());
        store.insert_task(&task("0xa", TaskStatus::Finalizing)).await.unwrap();
        store.insert_task(&task("0xb", TaskStatus::Finalizing)).await.unwrap();
        chain.set_task(chain_task("0xa", ChainTaskStatus::Revealing));
        chain.set_task(chain_task("0xb", ChainTaskStatus::Completed));

        let detector = FinalizedTaskDetector::new(store, chain, publisher.clone());
        assert_eq!(detector.detect().await.unwrap(), 1);
        assert_eq!(*publisher.published.lock().unwrap(), vec!["0xb"]);
    }

    #[tokio::test]
    async fn unstarted_tx_detector_publishes_uploaded_then_received() {
        let store = Arc::new(MemoryStore::new());
        let publisher = Arc::new(RecordingPublisher::default());
        store.insert_task(&task("0xa", TaskStatus::Received)).await.unwrap();
        store.insert_task(&task("0xb", TaskStatus::ResultUploaded)).await.unwrap();
        store.insert_task(&task("0xc", TaskStatus::Running)).await.unwrap();

        let detector = UnstartedTxDetector::new(store, publisher.clone());
        assert_eq!(detector.detect().await.unwrap(), 2);
        assert_eq!(*publisher.published.lock().unwrap(), vec!["0xb", "0xa"]);
    }

    #[tokio::test]
    async fn final_deadline_detector_skips_terminal_tasks() {
        let store = Arc::new(MemoryStore::new());
        let publisher = Arc::new(RecordingPublisher::default());
        let past = Utc::now() - chrono::Duration::seconds(1);
        store
            .insert_task(&task("0xa", TaskStatus::Running).with_final_deadline(past))
            .await
            .unwrap();
        store
            .insert_task(&task("0xb", TaskStatus::Completed).with_final_deadline(past))
            .await
            .unwrap();
        store.insert_task(&task("0xc", TaskStatus::Running)).await.unwrap();

        let detector = FinalDeadlineTaskDetector::new(store, publisher.clone());
        assert_eq!(detector.detect().await.unwrap(), 1);
        assert_eq!(*publisher.published.lock().unwrap(), vec!["0xa"]);
    }

    #[tokio::test(start_paused = true)]
    async fn spawned_detector_runs_until_cancelled() {
        let store = Arc::new(MemoryStore::new());
        let publisher = Arc::new(RecordingPublisher::default());
        store.insert_task(&task("0xa", TaskStatus::Received)).await.unwrap();
        let cancel = CancellationToken::new();

        let handle = spawn_detector(
            Arc::new(UnstartedTxDetector::new(store, publisher.clone())),
            Duration::from_secs(30),
            cancel.clone(),
        );
        tokio::time::sleep(Duration::from_secs(65)).await;
        cancel.cancel();
        handle.await.unwrap();

        assert_eq!(publisher.published.lock().unwrap().len(), 3);
    }
}
