//! Consensus evaluation over a task's replicates.

use std::sync::Arc;

use tracing::warn;

use crate::chain::{ChainReader, ChainTask, ChainTaskStatus};
use crate::replicate::{Replicate, ReplicatesList};

/// Whether a task still needs replicates to reach its trust target.
///
/// Replicates in a dead status (error, worker lost) do not count. A trust of
/// zero is treated as one.
pub fn needs_more_contributions(replicates: &[Replicate], trust: u32) -> bool {
    let trust = trust.max(1) as usize;
    let alive = replicates
        .iter()
        .filter(|r| !r.current_status.is_dead())
        .count();
    alive < trust
}

/// Whether the off-chain replicates agree with an on-chain consensus.
///
/// The chain task must be revealing, and at least as many replicates as the
/// chain counted winners must have contributed the consensus value.
pub fn consensus_reached_on(chain_task: &ChainTask, list: &ReplicatesList) -> bool {
    chain_task.status == ChainTaskStatus::Revealing
        && list.nb_valid_contributed_winners(&chain_task.consensus_value)
            >= chain_task.winner_counter as usize
}

/// Checks consensus against the chain.
#[derive(Clone)]
pub struct ConsensusService {
    chain: Arc<dyn ChainReader>,
}

impl ConsensusService {
    pub fn new(chain: Arc<dyn ChainReader>) -> Self {
        Self { chain }
    }

    /// Unknown chain tasks and chain read failures count as "not reached".
    pub async fn is_consensus_reached(&self, list: &ReplicatesList) -> bool {
        match self.chain.get_chain_task(&list.chain_task_id).await {
            Ok(Some(chain_task)) => consensus_reached_on(&chain_task, list),
            Ok(None) => false,
            Err(e) => {
                warn!(chain_task_id = %list.chain_task_id, error = %e, "Failed to read chain task");
                false
            }
        }
    }
}
