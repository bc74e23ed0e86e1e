//! Replicate recovery: works out what a returning worker missed.
//!
//! The worker's replicate is compared with the chain. When the chain shows
//! progress the replicate never reported, the replicate is repaired from the
//! chain and the task is published for re-evaluation.

use std::sync::Arc;

use tracing::info;

use crate::chain::{AuthorizationSigner, ChainReader, ResultRepository};
use crate::consensus::ConsensusService;
use crate::error::Error;
use crate::notification::{
    TaskAbortCause, TaskNotification, TaskNotificationExtra, TaskNotificationType,
};
use crate::replicate::{Replicate, ReplicateStatus, ReplicateStatusDetails, ReplicateStatusUpdate};
use crate::store::{ReplicateStore, TaskStore};
use crate::task::{Task, TaskStatus, TaskUpdatePublisher};
use crate::worker::WorkerRegistry;

/// Rebuilds missed notifications for returning workers.
pub struct ReplicateRecovery {
    tasks: Arc<dyn TaskStore>,
    replicates: Arc<dyn ReplicateStore>,
    workers: Arc<dyn WorkerRegistry>,
    chain: Arc<dyn ChainReader>,
    results: Arc<dyn ResultRepository>,
    signer: Arc<dyn AuthorizationSigner>,
    consensus: ConsensusService,
    publisher: Arc<dyn TaskUpdatePublisher>,
}

impl ReplicateRecovery {
    pub fn new(
        tasks: Arc<dyn TaskStore>,
        replicates: Arc<dyn ReplicateStore>,
        workers: Arc<dyn WorkerRegistry>,
        chain: Arc<dyn ChainReader>,
        results: Arc<dyn ResultRepository>,
        signer: Arc<dyn AuthorizationSigner>,
        publisher: Arc<dyn TaskUpdatePublisher>,
    ) -> Self {
        Self {
            consensus: ConsensusService::new(Arc::clone(&chain)),
            tasks,
            replicates,
            workers,
            chain,
            results,
            signer,
            publisher,
        }
    }

    /// Notifications for every recoverable task the worker took part in.
    ///
    /// Each notified replicate gets a `RECOVERING` entry in its history.
    pub async fn get_missed_task_notifications(
        &self,
        block_number: u64,
        wallet_address: &str,
    ) -> Result<Vec<TaskNotification>, Error> {
        let chain_task_ids = self.workers.chain_task_ids(wallet_address).await?;
        let tasks = self.tasks.get_tasks(&chain_task_ids).await?;
        let mut notifications = Vec::new();

        for task in tasks {
            let chain_task_id = task.chain_task_id.as_str();
            let Some(replicate) = self
                .replicates
                .get_replicate(chain_task_id, wallet_address)
                .await?
            else {
                continue;
            };
            if !replicate.is_recoverable() {
                continue;
            }
            let Some(notification_type) = self
                .get_task_notification_type(&task, &replicate, block_number)
                .await?
            else {
                continue;
            };

            let extra = self.notification_extra(&task, notification_type, wallet_address);
            self.replicates
                .update_replicate_status(
                    chain_task_id,
                    wallet_address,
                    ReplicateStatusUpdate::pool_manager_request(ReplicateStatus::Recovering),
                )
                .await?;
            info!(
                chain_task_id = %chain_task_id,
                wallet = %wallet_address,
                notification = %notification_type,
                "Recovered missed notification"
            );
            notifications.push(TaskNotification::for_worker(
                chain_task_id,
                wallet_address,
                notification_type,
                extra,
            ));
        }

        Ok(notifications)
    }

    /// What the worker holding `replicate` should do next for `task`.
    pub async fn get_task_notification_type(
        &self,
        task: &Task,
        replicate: &Replicate,
        block_number: u64,
    ) -> Result<Option<TaskNotificationType>, Error> {
        // Nothing to tell a worker that has not started or cannot start yet.
        if replicate.status_update_list.is_empty()
            || (task.is_tee_task() && !task.has_enclave_challenge())
        {
            return Ok(None);
        }
        if task.in_contribution_phase() {
            return self
                .recover_in_contribution_phase(task, replicate, block_number)
                .await;
        }
        if task.current_status == TaskStatus::ContributionTimeout
            || (task.current_status == TaskStatus::ConsensusReached
                && !replicate.contains_contributed_status())
        {
            return Ok(Some(TaskNotificationType::PleaseAbort));
        }
        if task.in_reveal_phase() {
            return self
                .recover_in_reveal_phase(task, replicate, block_number)
                .await;
        }
        if task.in_result_upload_phase() {
            return self.recover_in_result_upload_phase(task, replicate).await;
        }
        if task.in_completion_phase() {
            return self.recover_if_revealed(replicate).await;
        }
        Ok(None)
    }

    async fn recover_in_contribution_phase(
        &self,
        task: &Task,
        replicate: &Replicate,
        block_number: u64,
    ) -> Result<Option<TaskNotificationType>, Error> {
        let chain_task_id = task.chain_task_id.as_str();
        let wallet_address = replicate.wallet_address.as_str();
        let Some(last) = replicate.last_relevant_status() else {
            return Ok(None);
        };

        if replicate.is_before_status(ReplicateStatus::Contributing) {
            return Ok(Some(TaskNotificationType::PleaseContribute));
        }
        if last == ReplicateStatus::Contributing {
            let contribution = self
                .chain
                .get_chain_contribution(chain_task_id, wallet_address)
                .await?
                .filter(|c| c.is_contributed());
            let Some(contribution) = contribution else {
                return Ok(Some(TaskNotificationType::PleaseContribute));
            };
            let details = ReplicateStatusDetails {
                result_hash: Some(contribution.result_hash),
                ..ReplicateStatusDetails::with_block_number(block_number)
            };
            self.repair(chain_task_id, wallet_address, ReplicateStatus::Contributed, details)
                .await?;
        }

        let Some(last) = self.latest_relevant_status(chain_task_id, wallet_address).await? else {
            return Ok(None);
        };
        if last != ReplicateStatus::Contributed {
            return Ok(None);
        }
        let Some(list) = self.replicates.get_replicates_list(chain_task_id).await? else {
            return Ok(None);
        };
        if !self.consensus.is_consensus_reached(&list).await {
            return Ok(Some(TaskNotificationType::PleaseWait));
        }
        self.publisher.publish_request(chain_task_id).await;
        Ok(Some(TaskNotificationType::PleaseReveal))
    }

    async fn recover_in_reveal_phase(
        &self,
        task: &Task,
        replicate: &Replicate,
        block_number: u64,
    ) -> Result<Option<TaskNotificationType>, Error> {
        let chain_task_id = task.chain_task_id.as_str();
        let wallet_address = replicate.wallet_address.as_str();
        let Some(last) = replicate.last_relevant_status() else {
            return Ok(None);
        };

        if last == ReplicateStatus::Contributed {
            return Ok(Some(TaskNotificationType::PleaseReveal));
        }
        if last == ReplicateStatus::Revealing {
            let revealed = self
                .chain
                .get_chain_contribution(chain_task_id, wallet_address)
                .await?
                .is_some_and(|c| c.is_revealed());
            if !revealed {
                return Ok(Some(TaskNotificationType::PleaseReveal));
            }
            self.repair(
                chain_task_id,
                wallet_address,
                ReplicateStatus::Revealed,
                ReplicateStatusDetails::with_block_number(block_number),
            )
            .await?;
        }

        match self.latest_relevant_status(chain_task_id, wallet_address).await? {
            Some(ReplicateStatus::Revealed) => Ok(Some(TaskNotificationType::PleaseWait)),
            Some(ReplicateStatus::ResultUploadRequested) => {
                Ok(Some(TaskNotificationType::PleaseUpload))
            }
            _ => Ok(None),
        }
    }

    async fn recover_in_result_upload_phase(
        &self,
        task: &Task,
        replicate: &Replicate,
    ) -> Result<Option<TaskNotificationType>, Error> {
        let chain_task_id = task.chain_task_id.as_str();
        let wallet_address = replicate.wallet_address.as_str();

        match replicate.last_relevant_status() {
            Some(ReplicateStatus::ResultUploadRequested) => {
                Ok(Some(TaskNotificationType::PleaseUpload))
            }
            Some(ReplicateStatus::ResultUploading) => {
                if !self.results.is_result_uploaded(chain_task_id).await {
                    return Ok(Some(TaskNotificationType::PleaseUpload));
                }
                self.repair(
                    chain_task_id,
                    wallet_address,
                    ReplicateStatus::ResultUploaded,
                    ReplicateStatusDetails::default(),
                )
                .await?;
                Ok(Some(TaskNotificationType::PleaseWait))
            }
            Some(ReplicateStatus::ResultUploaded) => Ok(Some(TaskNotificationType::PleaseWait)),
            _ => Ok(None),
        }
    }

    async fn recover_if_revealed(
        &self,
        replicate: &Replicate,
    ) -> Result<Option<TaskNotificationType>, Error> {
        // The task may have moved on since the caller read it.
        let Some(task) = self.tasks.get_task(&replicate.chain_task_id).await? else {
            return Ok(None);
        };
        if !replicate.contains_revealed_status() {
            return Ok(None);
        }
        if task.current_status == TaskStatus::Completed {
            return Ok(Some(TaskNotificationType::PleaseComplete));
        }
        Ok(Some(TaskNotificationType::PleaseWait))
    }

    /// Record a status the chain proves the replicate reached and let the
    /// task catch up.
    async fn repair(
        &self,
        chain_task_id: &str,
        wallet_address: &str,
        status: ReplicateStatus,
        details: ReplicateStatusDetails,
    ) -> Result<(), Error> {
        info!(
            chain_task_id = %chain_task_id,
            wallet = %wallet_address,
            status = %status,
            "Detected confirmed missing update"
        );
        let update = ReplicateStatusUpdate::pool_manager_request(status).with_details(details);
        self.replicates
            .update_replicate_status(chain_task_id, wallet_address, update)
            .await?;
        self.publisher.publish_request(chain_task_id).await;
        Ok(())
    }

    async fn latest_relevant_status(
        &self,
        chain_task_id: &str,
        wallet_address: &str,
    ) -> Result<Option<ReplicateStatus>, Error> {
        Ok(self
            .replicates
            .get_replicate(chain_task_id, wallet_address)
            .await?
            .and_then(|r| r.last_relevant_status()))
    }

    fn notification_extra(
        &self,
        task: &Task,
        notification_type: TaskNotificationType,
        wallet_address: &str,
    ) -> TaskNotificationExtra {
        match notification_type {
            TaskNotificationType::PleaseContribute => TaskNotificationExtra {
                workerpool_authorization: Some(self.signer.create_authorization(
                    wallet_address,
                    &task.chain_task_id,
                    &task.enclave_challenge,
                )),
                ..Default::default()
            },
            TaskNotificationType::PleaseReveal => TaskNotificationExtra {
                block_number: Some(task.consensus_reached_block_number),
                ..Default::default()
            },
            TaskNotificationType::PleaseAbort => TaskNotificationExtra {
                task_abort_cause: Some(abort_cause(task.current_status)),
                ..Default::default()
            },
            _ => TaskNotificationExtra::default(),
        }
    }
}

fn abort_cause(status: TaskStatus) -> TaskAbortCause {
    match status {
        TaskStatus::ConsensusReached => TaskAbortCause::ConsensusReached,
        TaskStatus::ContributionTimeout => TaskAbortCause::ContributionTimeout,
        _ => TaskAbortCause::Unknown,
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::time::Duration;

    use async_trait::async_trait;

    use super::*;
    use crate::chain::{ChainContribution, ChainContributionStatus, LocalSigner, MemoryChain};
    use crate::store::MemoryStore;
    use crate::task::EMPTY_ENCLAVE_CHALLENGE;
    use crate::worker::{MemoryWorkerRegistry, Worker};

    const CHAIN_TASK_ID: &str = "0xtask";
    const WALLET: &str = "0xworker";

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

    struct Fixture {
        store: Arc<MemoryStore>,
        chain: Arc<MemoryChain>,
        publisher: Arc<RecordingPublisher>,
        recovery: ReplicateRecovery,
    }

    /// A task in `task_status` with one replicate walked through `statuses`.
    async fn fixture(task_status: TaskStatus, statuses: &[ReplicateStatus]) -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let chain = Arc::new(MemoryChain::new());
        let publisher = Arc::new(RecordingPublisher::default());
        let registry = Arc::new(MemoryWorkerRegistry::new());
        registry.add_worker(Worker::new(WALLET, 2)).unwrap();
        registry.add_chain_task_id(WALLET, CHAIN_TASK_ID).await.unwrap();

        let task = Task::new("0xdeal", 0, CHAIN_TASK_ID, 1, Duration::from_secs(60))
            .unwrap()
            .with_status(task_status)
            .with_enclave_challenge(EMPTY_ENCLAVE_CHALLENGE);
        store.insert_task(&task).await.unwrap();
        let list = store.create_replicates_list(CHAIN_TASK_ID).await.unwrap();
        store.add_new_replicate(&list, WALLET).await.unwrap();
        for status in statuses {
            store
                .update_replicate_status(
                    CHAIN_TASK_ID,
                    WALLET,
                    ReplicateStatusUpdate::worker_request(*status),
                )
                .await
                .unwrap();
        }

        let recovery = ReplicateRecovery::new(
            store.clone(),
            store.clone(),
            registry,
            chain.clone(),
            chain.clone(),
            Arc::new(LocalSigner::new("secret")),
            publisher.clone(),
        );
        Fixture {
            store,
            chain,
            publisher,
            recovery,
        }
    }

    impl Fixture {
        async fn notification_type(&self) -> Option<TaskNotificationType> {
            let task = self.store.get_task(CHAIN_TASK_ID).await.unwrap().unwrap();
            let replicate = self.replicate().await;
            self.recovery
                .get_task_notification_type(&task, &replicate, 10)
                .await
                .unwrap()
        }

        async fn replicate(&self) -> Replicate {
            self.store
                .get_replicate(CHAIN_TASK_ID, WALLET)
                .await
                .unwrap()
                .unwrap()
        }

        fn set_contribution(&self, status: ChainContributionStatus) {
            self.chain.set_contribution(
                CHAIN_TASK_ID,
                WALLET,
                ChainContribution {
                    status,
                    result_hash: "0xhash".into(),
                    result_seal: "0xseal".into(),
                    enclave_challenge: String::new(),
                },
            );
        }
    }

    #[tokio::test]
    async fn created_replicate_is_asked_to_contribute() {
        let f = fixture(TaskStatus::Running, &[]).await;
        assert_eq!(
            f.notification_type().await,
            Some(TaskNotificationType::PleaseContribute)
        );
    }

    #[tokio::test]
    async fn contributing_without_chain_proof_contributes_again() {
        let f = fixture(TaskStatus::Running, &[ReplicateStatus::Contributing]).await;
        assert_eq!(
            f.notification_type().await,
            Some(TaskNotificationType::PleaseContribute)
        );
        assert_eq!(f.replicate().await.current_status, ReplicateStatus::Contributing);
    }

    #[tokio::test]
    async fn confirmed_contribution_is_repaired_then_waits() {
        let f = fixture(TaskStatus::Running, &[ReplicateStatus::Contributing]).await;
        f.set_contribution(ChainContributionStatus::Contributed);

        assert_eq!(
            f.notification_type().await,
            Some(TaskNotificationType::PleaseWait)
        );
        let replicate = f.replicate().await;
        assert_eq!(replicate.current_status, ReplicateStatus::Contributed);
        assert_eq!(replicate.contribution_hash.as_deref(), Some("0xhash"));
        assert_eq!(*f.publisher.published.lock().unwrap(), vec![CHAIN_TASK_ID]);
    }

    #[tokio::test]
    async fn confirmed_reveal_is_repaired_idempotently() {
        let f = fixture(
            TaskStatus::Revealing,
            &[
                ReplicateStatus::Contributing,
                ReplicateStatus::Contributed,
                ReplicateStatus::Revealing,
            ],
        )
        .await;
        f.set_contribution(ChainContributionStatus::Proved);

        assert_eq!(
            f.notification_type().await,
            Some(TaskNotificationType::PleaseWait)
        );
        let history_len = f.replicate().await.status_update_list.len();
        assert_eq!(f.replicate().await.current_status, ReplicateStatus::Revealed);

        assert_eq!(
            f.notification_type().await,
            Some(TaskNotificationType::PleaseWait)
        );
        assert_eq!(f.replicate().await.status_update_list.len(), history_len);
        assert_eq!(f.publisher.published.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn upload_confirmed_by_result_repository() {
        let f = fixture(
            TaskStatus::ResultUploading,
            &[
                ReplicateStatus::Revealed,
                ReplicateStatus::ResultUploadRequested,
                ReplicateStatus::ResultUploading,
            ],
        )
        .await;
        assert_eq!(
            f.notification_type().await,
            Some(TaskNotificationType::PleaseUpload)
        );

        f.chain.mark_result_uploaded(CHAIN_TASK_ID);
        assert_eq!(
            f.notification_type().await,
            Some(TaskNotificationType::PleaseWait)
        );
        assert_eq!(
            f.replicate().await.current_status,
            ReplicateStatus::ResultUploaded
        );
    }

    #[tokio::test]
    async fn completion_requires_revealed_replicate() {
        let f = fixture(TaskStatus::Completed, &[ReplicateStatus::Revealed]).await;
        assert_eq!(
            f.notification_type().await,
            Some(TaskNotificationType::PleaseComplete)
        );

        let f = fixture(TaskStatus::Finalizing, &[ReplicateStatus::Revealed]).await;
        assert_eq!(
            f.notification_type().await,
            Some(TaskNotificationType::PleaseWait)
        );

        let f = fixture(TaskStatus::Completed, &[ReplicateStatus::Contributed]).await;
        assert_eq!(f.notification_type().await, None);
    }

    #[tokio::test]
    async fn consensus_without_contribution_aborts() {
        let f = fixture(TaskStatus::ConsensusReached, &[ReplicateStatus::Contributing]).await;
        let notifications = f
            .recovery
            .get_missed_task_notifications(10, WALLET)
            .await
            .unwrap();
        assert_eq!(notifications.len(), 1);
        assert_eq!(
            notifications[0].task_notification_type,
            TaskNotificationType::PleaseAbort
        );
        assert_eq!(
            notifications[0].task_notification_extra.task_abort_cause,
            Some(TaskAbortCause::ConsensusReached)
        );
    }

    #[tokio::test]
    async fn missed_notifications_mark_recovering() {
        let f = fixture(TaskStatus::Running, &[]).await;
        let notifications = f
            .recovery
            .get_missed_task_notifications(10, WALLET)
            .await
            .unwrap();

        assert_eq!(notifications.len(), 1);
        let notification = &notifications[0];
        assert_eq!(notification.workers_address, vec![WALLET.to_string()]);
        let authorization = notification
            .task_notification_extra
            .workerpool_authorization
            .as_ref()
            .unwrap();
        assert_eq!(authorization.chain_task_id, CHAIN_TASK_ID);

        let replicate = f.replicate().await;
        assert_eq!(replicate.current_status, ReplicateStatus::Recovering);
        assert_eq!(replicate.last_relevant_status(), Some(ReplicateStatus::Created));
    }

    #[tokio::test]
    async fn replicate_without_history_gets_nothing() {
        let f = fixture(TaskStatus::ContributionTimeout, &[]).await;
        let task = f.store.get_task(CHAIN_TASK_ID).await.unwrap().unwrap();
        let mut replicate = f.replicate().await;
        replicate.status_update_list.clear();

        let notification_type = f
            .recovery
            .get_task_notification_type(&task, &replicate, 10)
            .await
            .unwrap();
        assert_eq!(notification_type, None);
    }

    #[tokio::test]
    async fn tee_task_without_challenge_gets_nothing() {
        let f = fixture(TaskStatus::ContributionTimeout, &[ReplicateStatus::Contributing]).await;
        let mut task = f.store.get_task(CHAIN_TASK_ID).await.unwrap().unwrap();
        task.tee = true;
        task.enclave_challenge.clear();

        let notification_type = f
            .recovery
            .get_task_notification_type(&task, &f.replicate().await, 10)
            .await
            .unwrap();
        assert_eq!(notification_type, None);

        task.enclave_challenge = "0xenclave".into();
        let notification_type = f
            .recovery
            .get_task_notification_type(&task, &f.replicate().await, 10)
            .await
            .unwrap();
        assert_eq!(notification_type, Some(TaskNotificationType::PleaseAbort));
    }

    #[tokio::test]
    async fn terminal_replicates_are_not_recovered() {
        let f = fixture(TaskStatus::Running, &[ReplicateStatus::Failed]).await;
        let notifications = f
            .recovery
            .get_missed_task_notifications(10, WALLET)
            .await
            .unwrap();
        assert!(notifications.is_empty());
        assert_eq!(f.replicate().await.current_status, ReplicateStatus::Failed);
    }
}
