//! Blockchain collaborators: read-only chain state, result storage and
//! authorization signing.
//!
//! The scheduler never writes to the chain; it only compares on-chain facts
//! with its own bookkeeping.

pub mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ChainError;

pub use memory::{LocalSigner, MemoryChain};

/// On-chain status of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChainTaskStatus {
    Unset,
    Active,
    Revealing,
    Completed,
    Failed,
}

/// On-chain view of a task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainTask {
    pub chain_task_id: String,
    pub status: ChainTaskStatus,
    /// Number of contributions that matched the consensus value.
    pub winner_counter: u32,
    /// Consensus result hash, empty until consensus.
    pub consensus_value: String,
    /// Block at which the task entered the reveal stage, 0 before.
    pub revealing_block_number: u64,
    pub contribution_deadline: DateTime<Utc>,
    pub final_deadline: DateTime<Utc>,
}

/// On-chain status of a worker's contribution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChainContributionStatus {
    Unset,
    Contributed,
    /// Revealed.
    Proved,
    Rejected,
}

/// On-chain view of one worker's contribution to a task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainContribution {
    pub status: ChainContributionStatus,
    pub result_hash: String,
    pub result_seal: String,
    pub enclave_challenge: String,
}

impl ChainContribution {
    pub fn is_contributed(&self) -> bool {
        matches!(
            self.status,
            ChainContributionStatus::Contributed | ChainContributionStatus::Proved
        )
    }

    pub fn is_revealed(&self) -> bool {
        self.status == ChainContributionStatus::Proved
    }
}

/// Signed capability letting one worker act on one task on-chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerpoolAuthorization {
    pub worker_wallet: String,
    pub chain_task_id: String,
    pub enclave_challenge: String,
    pub signature: String,
}

/// Read access to authoritative chain state.
#[async_trait]
pub trait ChainReader: Send + Sync {
    async fn get_chain_task(&self, chain_task_id: &str) -> Result<Option<ChainTask>, ChainError>;

    async fn get_chain_contribution(
        &self,
        chain_task_id: &str,
        wallet_address: &str,
    ) -> Result<Option<ChainContribution>, ChainError>;
}

/// Where workers push computed results.
#[async_trait]
pub trait ResultRepository: Send + Sync {
    async fn is_result_uploaded(&self, chain_task_id: &str) -> bool;
}

/// Produces workerpool authorizations.
pub trait AuthorizationSigner: Send + Sync {
    fn create_authorization(
        &self,
        wallet_address: &str,
        chain_task_id: &str,
        enclave_challenge: &str,
    ) -> WorkerpoolAuthorization;
}
