//! In-memory task and replicate store.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;

use super::traits::{ReplicateStore, TaskStore};
use crate::error::StoreError;
use crate::replicate::{Replicate, ReplicateStatusUpdate, ReplicatesList};
use crate::task::{Task, TaskStatus};

fn poisoned<E>(_: E) -> StoreError {
    StoreError::Backend("lock poisoned".to_string())
}

/// In-memory store for tasks and replicates.
///
/// This implementation is not suitable for production use as data is lost
/// when the process exits.
#[derive(Debug, Default)]
pub struct MemoryStore {
    tasks: RwLock<HashMap<String, Task>>,
    replicates: RwLock<HashMap<String, ReplicatesList>>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TaskStore for MemoryStore {
    async fn insert_task(&self, task: &Task) -> Result<Task, StoreError> {
        let mut tasks = self.tasks.write().map_err(poisoned)?;
        if tasks.contains_key(&task.chain_task_id) {
            return Err(StoreError::Duplicate {
                entity: "task".to_string(),
                id: task.chain_task_id.clone(),
            });
        }
        tasks.insert(task.chain_task_id.clone(), task.clone());
        Ok(task.clone())
    }

    async fn get_task(&self, chain_task_id: &str) -> Result<Option<Task>, StoreError> {
        let tasks = self.tasks.read().map_err(poisoned)?;
        Ok(tasks.get(chain_task_id).cloned())
    }

    async fn get_tasks(&self, chain_task_ids: &[String]) -> Result<Vec<Task>, StoreError> {
        let tasks = self.tasks.read().map_err(poisoned)?;
        Ok(chain_task_ids
            .iter()
            .filter_map(|id| tasks.get(id).cloned())
            .collect())
    }

    async fn find_by_current_status(
        &self,
        statuses: &[TaskStatus],
    ) -> Result<Vec<Task>, StoreError> {
        let tasks = self.tasks.read().map_err(poisoned)?;
        Ok(tasks
            .values()
            .filter(|t| statuses.contains(&t.current_status))
            .cloned()
            .collect())
    }

    async fn prioritized_initialized_or_running_task(
        &self,
        exclude_tee: bool,
        excluded: &[String],
    ) -> Result<Option<Task>, StoreError> {
        let tasks = self.tasks.read().map_err(poisoned)?;
        Ok(tasks
            .values()
            .filter(|t| {
                matches!(
                    t.current_status,
                    TaskStatus::Initialized | TaskStatus::Running
                )
            })
            .filter(|t| !(exclude_tee && t.is_tee_task()))
            .filter(|t| !excluded.contains(&t.chain_task_id))
            .min_by(|a, b| {
                b.current_status
                    .cmp(&a.current_status)
                    .then(a.contribution_deadline.cmp(&b.contribution_deadline))
            })
            .cloned())
    }

    async fn save_task(&self, task: &Task) -> Result<Task, StoreError> {
        let mut tasks = self.tasks.write().map_err(poisoned)?;
        let stored = tasks
            .get_mut(&task.chain_task_id)
            .ok_or_else(|| StoreError::not_found("task", &task.chain_task_id))?;
        if stored.version != task.version {
            return Err(StoreError::Conflict {
                entity: "task".to_string(),
                id: task.chain_task_id.clone(),
                expected: task.version,
                found: stored.version,
            });
        }
        let mut saved = task.clone();
        saved.version += 1;
        *stored = saved.clone();
        Ok(saved)
    }
}

#[async_trait]
impl ReplicateStore for MemoryStore {
    async fn create_replicates_list(
        &self,
        chain_task_id: &str,
    ) -> Result<ReplicatesList, StoreError> {
        let mut lists = self.replicates.write().map_err(poisoned)?;
        if lists.contains_key(chain_task_id) {
            return Err(StoreError::Duplicate {
                entity: "replicates_list".to_string(),
                id: chain_task_id.to_string(),
            });
        }
        let list = ReplicatesList::new(chain_task_id);
        lists.insert(chain_task_id.to_string(), list.clone());
        Ok(list)
    }

    async fn get_replicates_list(
        &self,
        chain_task_id: &str,
    ) -> Result<Option<ReplicatesList>, StoreError> {
        let lists = self.replicates.read().map_err(poisoned)?;
        Ok(lists.get(chain_task_id).cloned())
    }

    async fn get_replicate(
        &self,
        chain_task_id: &str,
        wallet_address: &str,
    ) -> Result<Option<Replicate>, StoreError> {
        let lists = self.replicates.read().map_err(poisoned)?;
        Ok(lists
            .get(chain_task_id)
            .and_then(|l| l.replicate_of_worker(wallet_address))
            .cloned())
    }

    async fn add_new_replicate(
        &self,
        list: &ReplicatesList,
        wallet_address: &str,
    ) -> Result<ReplicatesList, StoreError> {
        let mut lists = self.replicates.write().map_err(poisoned)?;
        let stored = lists
            .get_mut(&list.chain_task_id)
            .ok_or_else(|| StoreError::not_found("replicates_list", &list.chain_task_id))?;
        if stored.version != list.version {
            return Err(StoreError::Conflict {
                entity: "replicates_list".to_string(),
                id: list.chain_task_id.clone(),
                expected: list.version,
                found: stored.version,
            });
        }
        if stored.has_worker_already_participated(wallet_address) {
            return Err(StoreError::Duplicate {
                entity: "replicate".to_string(),
                id: format!("{}/{}", list.chain_task_id, wallet_address),
            });
        }
        stored
            .replicates
            .push(Replicate::new(wallet_address, &list.chain_task_id));
        stored.version += 1;
        Ok(stored.clone())
    }

    async fn update_replicate_status(
        &self,
        chain_task_id: &str,
        wallet_address: &str,
        update: ReplicateStatusUpdate,
    ) -> Result<Option<Replicate>, StoreError> {
        let mut lists = self.replicates.write().map_err(poisoned)?;
        let Some(list) = lists.get_mut(chain_task_id) else {
            return Ok(None);
        };
        let Some(replicate) = list.replicate_of_worker_mut(wallet_address) else {
            return Ok(None);
        };
        replicate.update_status(update);
        let updated = replicate.clone();
        list.version += 1;
        Ok(Some(updated))
    }

    async fn remove_replicate(
        &self,
        chain_task_id: &str,
        wallet_address: &str,
    ) -> Result<bool, StoreError> {
        let mut lists = self.replicates.write().map_err(poisoned)?;
        let Some(list) = lists.get_mut(chain_task_id) else {
            return Ok(false);
        };
        let before = list.replicates.len();
        list.replicates.retain(|r| r.wallet_address != wallet_address);
        if list.replicates.len() == before {
            return Ok(false);
        }
        list.version += 1;
        Ok(true)
    }
}
