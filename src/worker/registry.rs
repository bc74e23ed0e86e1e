//! In-memory worker registry.

use std::collections::{HashMap, HashSet};
use std::sync::RwLock;

use async_trait::async_trait;
use tracing::info;

use super::{Worker, WorkerRegistry};
use crate::error::StoreError;

/// Minimum balance, in wei, to afford a contribute-reveal round.
pub const DEFAULT_MIN_GAS_BALANCE: u64 = 10_000_000_000_000_000;

/// Worker registry held in memory.
pub struct MemoryWorkerRegistry {
    workers: RwLock<HashMap<String, Worker>>,
    /// Wallets allowed to join; empty means everyone is.
    whitelist: HashSet<String>,
    min_gas_balance: u64,
}

impl MemoryWorkerRegistry {
    pub fn new() -> Self {
        Self {
            workers: RwLock::new(HashMap::new()),
            whitelist: HashSet::new(),
            min_gas_balance: DEFAULT_MIN_GAS_BALANCE,
        }
    }

    /// Builder: restrict admission to these wallets.
    pub fn with_whitelist<I, S>(mut self, wallets: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.whitelist = wallets.into_iter().map(Into::into).collect();
        self
    }

    /// Builder: minimum gas balance.
    pub fn with_min_gas_balance(mut self, min_gas_balance: u64) -> Self {
        self.min_gas_balance = min_gas_balance;
        self
    }

    /// Register or replace a worker.
    pub fn add_worker(&self, worker: Worker) -> Result<(), StoreError> {
        let mut workers = self
            .workers
            .write()
            .map_err(|e| StoreError::Backend(format!("lock poisoned: {e}")))?;
        info!(wallet = %worker.wallet_address, tee = worker.tee_enabled, "Worker registered");
        workers.insert(worker.wallet_address.clone(), worker);
        Ok(())
    }

    fn with_worker_mut<T>(
        &self,
        wallet_address: &str,
        f: impl FnOnce(&mut Worker) -> T,
    ) -> Result<T, StoreError> {
        let mut workers = self
            .workers
            .write()
            .map_err(|e| StoreError::Backend(format!("lock poisoned: {e}")))?;
        let worker = workers
            .get_mut(wallet_address)
            .ok_or_else(|| StoreError::not_found("worker", wallet_address))?;
        Ok(f(worker))
    }
}

impl Default for MemoryWorkerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl WorkerRegistry for MemoryWorkerRegistry {
    async fn get_worker(&self, wallet_address: &str) -> Result<Option<Worker>, StoreError> {
        let workers = self
            .workers
            .read()
            .map_err(|e| StoreError::Backend(format!("lock poisoned: {e}")))?;
        Ok(workers.get(wallet_address).cloned())
    }

    async fn can_accept_more_works(&self, wallet_address: &str) -> Result<bool, StoreError> {
        Ok(self
            .get_worker(wallet_address)
            .await?
            .is_some_and(|w| w.has_free_slot()))
    }

    async fn is_allowed_to_join(&self, wallet_address: &str) -> Result<bool, StoreError> {
        Ok(self.whitelist.is_empty() || self.whitelist.contains(wallet_address))
    }

    async fn has_enough_gas(&self, wallet_address: &str) -> Result<bool, StoreError> {
        Ok(self
            .get_worker(wallet_address)
            .await?
            .is_some_and(|w| w.gas_balance >= self.min_gas_balance))
    }

    async fn delete_worker(&self, wallet_address: &str) -> Result<Option<Worker>, StoreError> {
        let mut workers = self
            .workers
            .write()
            .map_err(|e| StoreError::Backend(format!("lock poisoned: {e}")))?;
        let removed = workers.remove(wallet_address);
        if removed.is_some() {
            info!(wallet = %wallet_address, "Worker removed");
        }
        Ok(removed)
    }

    async fn add_chain_task_id(
        &self,
        wallet_address: &str,
        chain_task_id: &str,
    ) -> Result<(), StoreError> {
        self.with_worker_mut(wallet_address, |worker| {
            for ids in [
                &mut worker.participating_chain_task_ids,
                &mut worker.computing_chain_task_ids,
            ] {
                if !ids.iter().any(|id| id == chain_task_id) {
                    ids.push(chain_task_id.to_owned());
                }
            }
        })
    }

    async fn remove_computed_chain_task_id(
        &self,
        wallet_address: &str,
        chain_task_id: &str,
    ) -> Result<(), StoreError> {
        self.with_worker_mut(wallet_address, |worker| {
            worker.computing_chain_task_ids.retain(|id| id != chain_task_id);
        })
    }

    async fn chain_task_ids(&self, wallet_address: &str) -> Result<Vec<String>, StoreError> {
        Ok(self
            .get_worker(wallet_address)
            .await?
            .map(|w| w.participating_chain_task_ids)
            .unwrap_or_default())
    }
}
