//! Shared wiring for integration tests: in-memory backends plus the
//! dispatcher, matcher and recovery engine built on top of them.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use chrono::{Duration as ChronoDuration, Utc};
use tokio_util::sync::CancellationToken;

use workerpool_core::chain::{
    ChainContribution, ChainContributionStatus, ChainTask, ChainTaskStatus, LocalSigner,
    MemoryChain,
};
use workerpool_core::config::SchedulerConfig;
use workerpool_core::lock::TaskLocks;
use workerpool_core::replicate::{
    ReplicateRecovery, ReplicateStatus, ReplicateStatusUpdate, ReplicateSupply,
};
use workerpool_core::store::{MemoryStore, ReplicateStore, TaskStore};
use workerpool_core::task::{EMPTY_ENCLAVE_CHALLENGE, Task, TaskStatus, TaskUpdateRequestManager};
use workerpool_core::worker::{MemoryWorkerRegistry, Worker, WorkerRegistry};

/// Maximum time any test is allowed to wait before we consider it hung.
pub const TEST_TIMEOUT: Duration = Duration::from_secs(5);

pub struct Pool {
    pub store: Arc<MemoryStore>,
    pub chain: Arc<MemoryChain>,
    pub registry: Arc<MemoryWorkerRegistry>,
    pub locks: Arc<TaskLocks>,
    pub manager: Arc<TaskUpdateRequestManager>,
    pub supply: ReplicateSupply,
    pub recovery: ReplicateRecovery,
}

impl Pool {
    pub fn new(config: SchedulerConfig) -> Self {
        let store = Arc::new(MemoryStore::new());
        let chain = Arc::new(MemoryChain::new());
        let registry = Arc::new(MemoryWorkerRegistry::new());
        let signer = Arc::new(LocalSigner::new("integration-key"));
        let locks = Arc::new(TaskLocks::new(config.longest_task_timeout));
        let manager = TaskUpdateRequestManager::new(
            store.clone(),
            locks.clone(),
            &config,
            CancellationToken::new(),
        );
        let supply = ReplicateSupply::new(
            store.clone(),
            store.clone(),
            registry.clone(),
            chain.clone(),
            signer.clone(),
            locks.clone(),
            &config,
        );
        let recovery = ReplicateRecovery::new(
            store.clone(),
            store.clone(),
            registry.clone(),
            chain.clone(),
            chain.clone(),
            signer,
            manager.clone(),
        );
        Self {
            store,
            chain,
            registry,
            locks,
            manager,
            supply,
            recovery,
        }
    }

    pub fn with_pool_size(pool_size: usize) -> Self {
        Self::new(SchedulerConfig {
            update_pool_size: pool_size,
            ..SchedulerConfig::default()
        })
    }

    /// Insert a task in the given status and return it as stored.
    pub async fn add_task(&self, chain_task_id: &str, status: TaskStatus) -> Task {
        let task = Task::new("0xdeal", 0, chain_task_id, 1, Duration::from_secs(60))
            .unwrap()
            .with_status(status);
        self.store.insert_task(&task).await.unwrap()
    }

    /// Insert a task ready to hand out replicates.
    pub async fn add_open_task(&self, chain_task_id: &str, trust: u32) -> Task {
        let task = Task::new("0xdeal", 0, chain_task_id, trust, Duration::from_secs(60))
            .unwrap()
            .with_status(TaskStatus::Initialized)
            .with_enclave_challenge(EMPTY_ENCLAVE_CHALLENGE);
        let task = self.store.insert_task(&task).await.unwrap();
        self.store.create_replicates_list(chain_task_id).await.unwrap();
        task
    }

    pub fn add_worker(&self, wallet_address: &str) {
        self.registry
            .add_worker(Worker::new(wallet_address, 4).with_gas_balance(u64::MAX))
            .unwrap();
    }

    /// Give the worker a replicate of the task that walked through `statuses`.
    pub async fn add_replicate(
        &self,
        chain_task_id: &str,
        wallet_address: &str,
        statuses: &[ReplicateStatus],
    ) {
        if self
            .store
            .get_replicates_list(chain_task_id)
            .await
            .unwrap()
            .is_none()
        {
            self.store.create_replicates_list(chain_task_id).await.unwrap();
        }
        let list = self
            .store
            .get_replicates_list(chain_task_id)
            .await
            .unwrap()
            .unwrap();
        self.store
            .add_new_replicate(&list, wallet_address)
            .await
            .unwrap();
        for status in statuses {
            self.store
                .update_replicate_status(
                    chain_task_id,
                    wallet_address,
                    ReplicateStatusUpdate::worker_request(*status),
                )
                .await
                .unwrap();
        }
        self.registry
            .add_chain_task_id(wallet_address, chain_task_id)
            .await
            .unwrap();
    }

    pub fn set_chain_task(&self, chain_task_id: &str, status: ChainTaskStatus) {
        let now = Utc::now();
        self.chain.set_task(ChainTask {
            chain_task_id: chain_task_id.to_string(),
            status,
            winner_counter: 0,
            consensus_value: String::new(),
            revealing_block_number: 0,
            contribution_deadline: now + ChronoDuration::hours(1),
            final_deadline: now + ChronoDuration::hours(5),
        });
    }

    pub fn set_contribution(
        &self,
        chain_task_id: &str,
        wallet_address: &str,
        status: ChainContributionStatus,
        result_hash: &str,
    ) {
        self.chain.set_contribution(
            chain_task_id,
            wallet_address,
            ChainContribution {
                status,
                result_hash: result_hash.to_string(),
                result_seal: String::new(),
                enclave_challenge: EMPTY_ENCLAVE_CHALLENGE.to_string(),
            },
        );
    }
}

/// Poll `check` until it holds or [`TEST_TIMEOUT`] elapses.
pub async fn eventually<F>(mut check: F)
where
    F: FnMut() -> bool,
{
    tokio::time::timeout(TEST_TIMEOUT, async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not met in time");
}
