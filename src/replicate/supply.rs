//! Replicate supply: hands tasks to workers asking for work.
//!
//! Admission into a task runs under that task's lock, taken without
//! waiting. Two workers racing for the last open slot of a task cannot both
//! see it open; the loser moves on to the next candidate task.

use std::sync::Arc;

use tracing::{debug, error, info, warn};

use crate::chain::{AuthorizationSigner, ChainReader, WorkerpoolAuthorization};
use crate::config::SchedulerConfig;
use crate::consensus::{ConsensusService, needs_more_contributions};
use crate::error::{Error, StoreError};
use crate::lock::TaskLocks;
use crate::store::{ReplicateStore, TaskStore};
use crate::task::Task;
use crate::worker::WorkerRegistry;

/// Matches workers with tasks needing replicates.
pub struct ReplicateSupply {
    tasks: Arc<dyn TaskStore>,
    replicates: Arc<dyn ReplicateStore>,
    workers: Arc<dyn WorkerRegistry>,
    signer: Arc<dyn AuthorizationSigner>,
    consensus: ConsensusService,
    locks: Arc<TaskLocks>,
    max_attempts: u32,
}

impl ReplicateSupply {
    pub fn new(
        tasks: Arc<dyn TaskStore>,
        replicates: Arc<dyn ReplicateStore>,
        workers: Arc<dyn WorkerRegistry>,
        chain: Arc<dyn ChainReader>,
        signer: Arc<dyn AuthorizationSigner>,
        locks: Arc<TaskLocks>,
        config: &SchedulerConfig,
    ) -> Self {
        Self {
            tasks,
            replicates,
            workers,
            signer,
            consensus: ConsensusService::new(chain),
            locks,
            max_attempts: config.admission_max_attempts,
        }
    }

    /// Find a task for the worker and admit it, returning the signed
    /// authorization to contribute.
    ///
    /// `None` when the worker cannot take work (at capacity, not synced,
    /// short on gas, unknown) or when no task will have it.
    pub async fn find_authorization(
        &self,
        worker_last_block: u64,
        wallet_address: &str,
    ) -> Result<Option<WorkerpoolAuthorization>, Error> {
        if !self.workers.can_accept_more_works(wallet_address).await? {
            debug!(wallet = %wallet_address, "Worker cannot accept more works");
            return Ok(None);
        }
        if worker_last_block == 0 {
            debug!(wallet = %wallet_address, "Worker is not synchronized");
            return Ok(None);
        }
        if !self.workers.has_enough_gas(wallet_address).await? {
            debug!(wallet = %wallet_address, "Worker does not have enough gas");
            return Ok(None);
        }
        let Some(worker) = self.workers.get_worker(wallet_address).await? else {
            return Ok(None);
        };

        let mut scanned: Vec<String> = Vec::new();
        loop {
            let Some(task) = self
                .tasks
                .prioritized_initialized_or_running_task(!worker.tee_enabled, &scanned)
                .await?
            else {
                debug!(wallet = %wallet_address, scanned = scanned.len(), "No task available");
                return Ok(None);
            };
            scanned.push(task.chain_task_id.clone());

            if self.admit_with_retry(&task, wallet_address).await {
                info!(
                    chain_task_id = %task.chain_task_id,
                    wallet = %wallet_address,
                    "Worker admitted into task"
                );
                return Ok(Some(self.signer.create_authorization(
                    wallet_address,
                    &task.chain_task_id,
                    &task.enclave_challenge,
                )));
            }
        }
    }

    /// Admission, retried while the replicate list keeps changing under it.
    async fn admit_with_retry(&self, task: &Task, wallet_address: &str) -> bool {
        for attempt in 1..=self.max_attempts {
            match self.accept_or_reject(task, wallet_address).await {
                Ok(accepted) => return accepted,
                Err(Error::Store(e)) if e.is_conflict() => {
                    warn!(
                        chain_task_id = %task.chain_task_id,
                        wallet = %wallet_address,
                        attempt,
                        "Replicate list changed during admission"
                    );
                }
                Err(e) => {
                    error!(
                        chain_task_id = %task.chain_task_id,
                        wallet = %wallet_address,
                        error = %e,
                        "Admission failed"
                    );
                    return false;
                }
            }
        }
        warn!(
            chain_task_id = %task.chain_task_id,
            wallet = %wallet_address,
            attempts = self.max_attempts,
            "Giving up admission after repeated conflicts"
        );
        false
    }

    /// Try to create a replicate of `task` for the worker.
    pub async fn accept_or_reject(&self, task: &Task, wallet_address: &str) -> Result<bool, Error> {
        let chain_task_id = task.chain_task_id.as_str();

        if !self.workers.is_allowed_to_join(wallet_address).await? {
            warn!(wallet = %wallet_address, "Worker not allowed to join, removing it");
            self.workers.delete_worker(wallet_address).await?;
            return Ok(false);
        }
        if !task.has_enclave_challenge() {
            debug!(chain_task_id = %chain_task_id, "Task has no enclave challenge yet");
            return Ok(false);
        }
        let Some(list) = self.replicates.get_replicates_list(chain_task_id).await? else {
            error!(chain_task_id = %chain_task_id, "Initialized task without replicates list");
            return Ok(false);
        };
        if list.has_worker_already_participated(wallet_address) {
            debug!(chain_task_id = %chain_task_id, wallet = %wallet_address, "Worker already participated");
            return Ok(false);
        }

        let Some(_guard) = self.locks.try_lock(chain_task_id) else {
            debug!(chain_task_id = %chain_task_id, "Task is being looked at by another worker");
            return Ok(false);
        };

        // Re-read under the lock; the copy above may predate another admission.
        let Some(list) = self.replicates.get_replicates_list(chain_task_id).await? else {
            return Ok(false);
        };
        if list.has_worker_already_participated(wallet_address)
            || !needs_more_contributions(&list.replicates, task.trust)
            || self.consensus.is_consensus_reached(&list).await
        {
            return Ok(false);
        }

        match self.replicates.add_new_replicate(&list, wallet_address).await {
            Ok(_) => {}
            Err(StoreError::Duplicate { .. }) => return Ok(false),
            Err(e) => return Err(e.into()),
        }
        if let Err(e) = self
            .workers
            .add_chain_task_id(wallet_address, chain_task_id)
            .await
        {
            error!(
                chain_task_id = %chain_task_id,
                wallet = %wallet_address,
                error = %e,
                "Failed to record admission, removing replicate"
            );
            self.rollback_replicate(chain_task_id, wallet_address).await;
            return Err(e.into());
        }
        Ok(true)
    }

    async fn rollback_replicate(&self, chain_task_id: &str, wallet_address: &str) {
        if let Err(e) = self
            .replicates
            .remove_replicate(chain_task_id, wallet_address)
            .await
        {
            error!(
                chain_task_id = %chain_task_id,
                wallet = %wallet_address,
                error = %e,
                "Orphan replicate left behind"
            );
        }
    }
}
