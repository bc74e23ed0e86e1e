//! Worker registry: who the workers are, what they can run and what they
//! are currently running.

pub mod registry;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::StoreError;

pub use registry::MemoryWorkerRegistry;

/// A worker known to the pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Worker {
    pub wallet_address: String,
    pub name: String,
    /// Maximum number of tasks computed at once.
    pub max_nb_tasks: usize,
    pub tee_enabled: bool,
    /// Native balance available to pay for contribution transactions.
    pub gas_balance: u64,
    pub last_alive_date: DateTime<Utc>,
    /// Every task the worker was ever admitted into.
    pub participating_chain_task_ids: Vec<String>,
    /// Tasks the worker is still computing.
    pub computing_chain_task_ids: Vec<String>,
}

impl Worker {
    pub fn new(wallet_address: impl Into<String>, max_nb_tasks: usize) -> Self {
        let wallet_address = wallet_address.into();
        Self {
            name: wallet_address.clone(),
            wallet_address,
            max_nb_tasks,
            tee_enabled: false,
            gas_balance: 0,
            last_alive_date: Utc::now(),
            participating_chain_task_ids: Vec::new(),
            computing_chain_task_ids: Vec::new(),
        }
    }

    /// Builder: TEE capability.
    pub fn with_tee_enabled(mut self, tee_enabled: bool) -> Self {
        self.tee_enabled = tee_enabled;
        self
    }

    /// Builder: gas balance.
    pub fn with_gas_balance(mut self, gas_balance: u64) -> Self {
        self.gas_balance = gas_balance;
        self
    }

    pub fn has_free_slot(&self) -> bool {
        self.computing_chain_task_ids.len() < self.max_nb_tasks
    }
}

/// Worker bookkeeping consumed by the replicate matcher and recovery.
#[async_trait]
pub trait WorkerRegistry: Send + Sync {
    async fn get_worker(&self, wallet_address: &str) -> Result<Option<Worker>, StoreError>;

    /// False for unknown workers and workers already at capacity.
    async fn can_accept_more_works(&self, wallet_address: &str) -> Result<bool, StoreError>;

    /// Whether the worker passes the pool's admission policy.
    async fn is_allowed_to_join(&self, wallet_address: &str) -> Result<bool, StoreError>;

    async fn has_enough_gas(&self, wallet_address: &str) -> Result<bool, StoreError>;

    async fn delete_worker(&self, wallet_address: &str) -> Result<Option<Worker>, StoreError>;

    /// Record that the worker was admitted into a task.
    async fn add_chain_task_id(
        &self,
        wallet_address: &str,
        chain_task_id: &str,
    ) -> Result<(), StoreError>;

    /// Free the computing slot held for a task.
    async fn remove_computed_chain_task_id(
        &self,
        wallet_address: &str,
        chain_task_id: &str,
    ) -> Result<(), StoreError>;

    /// Every task the worker participates or participated in.
    async fn chain_task_ids(&self, wallet_address: &str) -> Result<Vec<String>, StoreError>;
}
