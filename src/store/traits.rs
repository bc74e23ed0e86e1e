//! Persistence traits.
//!
//! Writes are checked against the `version` the caller read; a stale write
//! fails with [`StoreError::Conflict`] and leaves the stored entity untouched.

use async_trait::async_trait;

use crate::error::StoreError;
use crate::replicate::{Replicate, ReplicateStatusUpdate, ReplicatesList};
use crate::task::{Task, TaskStatus};

/// Task persistence.
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Store a new task. Fails with `Duplicate` if the chain task id is taken.
    async fn insert_task(&self, task: &Task) -> Result<Task, StoreError>;

    async fn get_task(&self, chain_task_id: &str) -> Result<Option<Task>, StoreError>;

    /// Tasks for the given ids; unknown ids are skipped.
    async fn get_tasks(&self, chain_task_ids: &[String]) -> Result<Vec<Task>, StoreError>;

    async fn find_by_current_status(
        &self,
        statuses: &[TaskStatus],
    ) -> Result<Vec<Task>, StoreError>;

    /// Highest-priority `INITIALIZED` or `RUNNING` task outside `excluded`.
    ///
    /// Ordered by status descending, then contribution deadline ascending.
    async fn prioritized_initialized_or_running_task(
        &self,
        exclude_tee: bool,
        excluded: &[String],
    ) -> Result<Option<Task>, StoreError>;

    /// Persist a modified task. Returns the stored copy with its new version.
    async fn save_task(&self, task: &Task) -> Result<Task, StoreError>;
}

/// Replicate persistence.
#[async_trait]
pub trait ReplicateStore: Send + Sync {
    /// Create the empty replicate list of a task.
    async fn create_replicates_list(
        &self,
        chain_task_id: &str,
    ) -> Result<ReplicatesList, StoreError>;

    async fn get_replicates_list(
        &self,
        chain_task_id: &str,
    ) -> Result<Option<ReplicatesList>, StoreError>;

    async fn get_replicate(
        &self,
        chain_task_id: &str,
        wallet_address: &str,
    ) -> Result<Option<Replicate>, StoreError>;

    /// Append a new replicate for `wallet_address` to the list read as `list`.
    ///
    /// Fails with `Conflict` if the list changed since it was read and with
    /// `Duplicate` if the worker already has a replicate for the task.
    async fn add_new_replicate(
        &self,
        list: &ReplicatesList,
        wallet_address: &str,
    ) -> Result<ReplicatesList, StoreError>;

    /// Append a status update to a replicate's history.
    ///
    /// Returns `None` if the replicate does not exist.
    async fn update_replicate_status(
        &self,
        chain_task_id: &str,
        wallet_address: &str,
        update: ReplicateStatusUpdate,
    ) -> Result<Option<Replicate>, StoreError>;

    /// Drop the worker's replicate. False if there was none.
    async fn remove_replicate(
        &self,
        chain_task_id: &str,
        wallet_address: &str,
    ) -> Result<bool, StoreError>;
}
