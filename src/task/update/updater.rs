//! Task status transitions, applied one at a time per task by the
//! dispatcher.
//!
//! Each request applies at most one transition, saves it against the version
//! it read and publishes the task again so the next transition, if any, is
//! evaluated in turn.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, error, info, warn};

use super::manager::{TaskUpdatePublisher, TaskUpdateRequestConsumer};
use crate::chain::{ChainReader, ChainTask, ChainTaskStatus};
use crate::consensus::ConsensusService;
use crate::error::{Error, StoreError};
use crate::replicate::{ReplicateStatus, ReplicateStatusUpdate, ReplicatesList};
use crate::store::{ReplicateStore, TaskStore};
use crate::task::{EMPTY_ENCLAVE_CHALLENGE, Task, TaskStatus};
use crate::worker::WorkerRegistry;

/// Consumer applying observable task transitions.
pub struct TaskUpdater {
    tasks: Arc<dyn TaskStore>,
    replicates: Arc<dyn ReplicateStore>,
    workers: Arc<dyn WorkerRegistry>,
    chain: Arc<dyn ChainReader>,
    consensus: ConsensusService,
    publisher: Arc<dyn TaskUpdatePublisher>,
}

impl TaskUpdater {
    pub fn new(
        tasks: Arc<dyn TaskStore>,
        replicates: Arc<dyn ReplicateStore>,
        workers: Arc<dyn WorkerRegistry>,
        chain: Arc<dyn ChainReader>,
        publisher: Arc<dyn TaskUpdatePublisher>,
    ) -> Self {
        Self {
            consensus: ConsensusService::new(Arc::clone(&chain)),
            tasks,
            replicates,
            workers,
            chain,
            publisher,
        }
    }

    /// Apply the next transition of the task, if any. Returns the saved task.
    pub async fn update_task(&self, chain_task_id: &str) -> Result<Option<Task>, Error> {
        let Some(mut task) = self.tasks.get_task(chain_task_id).await? else {
            warn!(chain_task_id = %chain_task_id, "No such task to update");
            return Ok(None);
        };
        let from = task.current_status;

        if !from.is_terminal() && task.is_final_deadline_reached() {
            task.change_status(TaskStatus::Failed);
            return self.save(task, from).await.map(Some);
        }

        let changed = match from {
            TaskStatus::Received | TaskStatus::Initializing => self.initialize(&mut task).await?,
            TaskStatus::Initialized | TaskStatus::Running => self.contribute(&mut task).await?,
            TaskStatus::ConsensusReached => self.start_reveal(&mut task).await?,
            TaskStatus::Revealing => self.request_upload(&mut task).await?,
            TaskStatus::ResultUploadRequested | TaskStatus::ResultUploading => {
                self.track_upload(&mut task).await?
            }
            TaskStatus::ResultUploaded | TaskStatus::Finalizing | TaskStatus::Finalized => {
                self.finalize(&mut task).await?
            }
            TaskStatus::ContributionTimeout | TaskStatus::Completed | TaskStatus::Failed => false,
        };

        if !changed {
            debug!(chain_task_id = %chain_task_id, status = %from, "No transition to apply");
            return Ok(None);
        }
        self.save(task, from).await.map(Some)
    }

    async fn save(&self, task: Task, from: TaskStatus) -> Result<Task, Error> {
        let saved = self.tasks.save_task(&task).await?;
        info!(
            chain_task_id = %saved.chain_task_id,
            from = %from,
            to = %saved.current_status,
            "Task status updated"
        );
        if matches!(
            saved.current_status,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::ContributionTimeout
        ) {
            self.release_workers(&saved.chain_task_id).await;
        }
        Ok(saved)
    }

    /// Free the computing slot every participant holds for a finished task.
    /// The transition is already saved, so failures are only logged.
    async fn release_workers(&self, chain_task_id: &str) {
        let list = match self.replicates.get_replicates_list(chain_task_id).await {
            Ok(Some(list)) => list,
            Ok(None) => return,
            Err(e) => {
                warn!(chain_task_id = %chain_task_id, error = %e, "Cannot release workers");
                return;
            }
        };
        for replicate in &list.replicates {
            match self
                .workers
                .remove_computed_chain_task_id(&replicate.wallet_address, chain_task_id)
                .await
            {
                Ok(()) => {}
                Err(StoreError::NotFound { .. }) => {
                    debug!(wallet = %replicate.wallet_address, "Worker gone, nothing to release");
                }
                Err(e) => {
                    warn!(
                        chain_task_id = %chain_task_id,
                        wallet = %replicate.wallet_address,
                        error = %e,
                        "Failed to release worker slot"
                    );
                }
            }
        }
    }

    async fn chain_task(&self, chain_task_id: &str) -> Result<Option<ChainTask>, Error> {
        Ok(self.chain.get_chain_task(chain_task_id).await?)
    }

    async fn replicates_list(&self, chain_task_id: &str) -> Result<ReplicatesList, Error> {
        Ok(self
            .replicates
            .get_replicates_list(chain_task_id)
            .await?
            .unwrap_or_else(|| ReplicatesList::new(chain_task_id)))
    }

    /// RECEIVED -> INITIALIZING -> INITIALIZED once the task exists on-chain.
    async fn initialize(&self, task: &mut Task) -> Result<bool, Error> {
        let on_chain = self
            .chain_task(&task.chain_task_id)
            .await?
            .is_some_and(|t| t.status != ChainTaskStatus::Unset);
        if !on_chain {
            return Ok(false);
        }

        if task.current_status == TaskStatus::Received {
            task.change_status(TaskStatus::Initializing);
            return Ok(true);
        }

        match self
            .replicates
            .create_replicates_list(&task.chain_task_id)
            .await
        {
            Ok(_) | Err(StoreError::Duplicate { .. }) => {}
            Err(e) => return Err(e.into()),
        }
        if !task.is_tee_task() && !task.has_enclave_challenge() {
            task.enclave_challenge = EMPTY_ENCLAVE_CHALLENGE.to_string();
        }
        task.change_status(TaskStatus::Initialized);
        Ok(true)
    }

    /// INITIALIZED -> RUNNING -> CONSENSUS_REACHED, or CONTRIBUTION_TIMEOUT.
    async fn contribute(&self, task: &mut Task) -> Result<bool, Error> {
        let list = self.replicates_list(&task.chain_task_id).await?;

        if self.consensus.is_consensus_reached(&list).await {
            if task.current_status == TaskStatus::Initialized {
                task.change_status(TaskStatus::Running);
                return Ok(true);
            }
            if let Some(chain_task) = self.chain_task(&task.chain_task_id).await? {
                task.consensus = Some(chain_task.consensus_value);
                task.consensus_reached_block_number = chain_task.revealing_block_number;
            }
            task.change_status(TaskStatus::ConsensusReached);
            return Ok(true);
        }

        if task.is_contribution_deadline_reached() {
            task.change_status(TaskStatus::ContributionTimeout);
            return Ok(true);
        }

        let started = list.replicates.iter().any(|r| {
            r.last_relevant_status()
                .is_some_and(|s| s >= ReplicateStatus::Contributing && s < ReplicateStatus::Completed)
        });
        if task.current_status == TaskStatus::Initialized && started {
            task.change_status(TaskStatus::Running);
            return Ok(true);
        }
        Ok(false)
    }

    /// CONSENSUS_REACHED -> REVEALING once a replicate revealed.
    async fn start_reveal(&self, task: &mut Task) -> Result<bool, Error> {
        let list = self.replicates_list(&task.chain_task_id).await?;
        if list.nb_containing_status(&[ReplicateStatus::Revealed]) == 0 {
            return Ok(false);
        }
        task.change_status(TaskStatus::Revealing);
        Ok(true)
    }

    /// REVEALING -> RESULT_UPLOAD_REQUESTED, picking the uploader among
    /// revealed replicates.
    async fn request_upload(&self, task: &mut Task) -> Result<bool, Error> {
        let list = self.replicates_list(&task.chain_task_id).await?;

        // A previous attempt may have picked the uploader and then lost the
        // task save to a conflict.
        let already_requested = list
            .replicates
            .iter()
            .find(|r| r.last_relevant_status() == Some(ReplicateStatus::ResultUploadRequested))
            .map(|r| r.wallet_address.clone());
        let uploader = match already_requested {
            Some(uploader) => uploader,
            None => {
                let Some(uploader) = list
                    .random_replicate_with_revealed_status()
                    .map(|r| r.wallet_address.clone())
                else {
                    return Ok(false);
                };
                self.replicates
                    .update_replicate_status(
                        &task.chain_task_id,
                        &uploader,
                        ReplicateStatusUpdate::pool_manager_request(
                            ReplicateStatus::ResultUploadRequested,
                        ),
                    )
                    .await?;
                uploader
            }
        };
        info!(chain_task_id = %task.chain_task_id, wallet = %uploader, "Result upload requested");
        task.uploading_worker_wallet_address = Some(uploader);
        task.change_status(TaskStatus::ResultUploadRequested);
        Ok(true)
    }

    /// RESULT_UPLOAD_REQUESTED -> RESULT_UPLOADING -> RESULT_UPLOADED.
    async fn track_upload(&self, task: &mut Task) -> Result<bool, Error> {
        let list = self.replicates_list(&task.chain_task_id).await?;

        if let Some(uploaded) = list.replicate_with_result_uploaded_status() {
            task.result_link = uploaded.result_link.clone();
            task.change_status(TaskStatus::ResultUploaded);
            return Ok(true);
        }

        let uploading = task
            .uploading_worker_wallet_address
            .as_deref()
            .and_then(|wallet| list.replicate_of_worker(wallet))
            .is_some_and(|r| r.current_status == ReplicateStatus::ResultUploading);
        if task.current_status == TaskStatus::ResultUploadRequested && uploading {
            task.change_status(TaskStatus::ResultUploading);
            return Ok(true);
        }
        Ok(false)
    }

    /// RESULT_UPLOADED -> FINALIZING -> FINALIZED -> COMPLETED once the chain
    /// task is completed.
    async fn finalize(&self, task: &mut Task) -> Result<bool, Error> {
        let completed = self
            .chain_task(&task.chain_task_id)
            .await?
            .is_some_and(|t| t.status == ChainTaskStatus::Completed);
        if !completed {
            return Ok(false);
        }
        let next = match task.current_status {
            TaskStatus::ResultUploaded => TaskStatus::Finalizing,
            TaskStatus::Finalizing => TaskStatus::Finalized,
            _ => TaskStatus::Completed,
        };
        task.change_status(next);
        Ok(true)
    }
}

#[async_trait]
impl TaskUpdateRequestConsumer for TaskUpdater {
    async fn on_task_update_request(&self, chain_task_id: &str) {
        match self.update_task(chain_task_id).await {
            Ok(Some(_)) => {
                self.publisher.publish_request(chain_task_id).await;
            }
            Ok(None) => {}
            Err(Error::Store(e)) if e.is_conflict() => {
                warn!(chain_task_id = %chain_task_id, error = %e, "Task changed while updating, retrying");
                self.publisher.publish_request(chain_task_id).await;
            }
            Err(e) => {
                error!(chain_task_id = %chain_task_id, error = %e, "Failed to update task");
            }
        }
    }
}
