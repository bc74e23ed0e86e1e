//! In-memory chain view and development signer.
//!
//! Used by the local node and by tests. Not suitable for production: the
//! chain state is whatever was put here, and signatures are keyed digests
//! rather than wallet signatures.

use std::collections::HashSet;

use async_trait::async_trait;
use dashmap::DashMap;
use sha2::{Digest, Sha256};

use super::{
    AuthorizationSigner, ChainContribution, ChainReader, ChainTask, ResultRepository,
    WorkerpoolAuthorization,
};
use crate::error::ChainError;

/// Chain state held in memory.
#[derive(Debug, Default)]
pub struct MemoryChain {
    tasks: DashMap<String, ChainTask>,
    contributions: DashMap<(String, String), ChainContribution>,
    uploaded_results: std::sync::RwLock<HashSet<String>>,
}

impl MemoryChain {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_task(&self, task: ChainTask) {
        self.tasks.insert(task.chain_task_id.clone(), task);
    }

    pub fn set_contribution(
        &self,
        chain_task_id: &str,
        wallet_address: &str,
        contribution: ChainContribution,
    ) {
        self.contributions.insert(
            (chain_task_id.to_owned(), wallet_address.to_owned()),
            contribution,
        );
    }

    pub fn mark_result_uploaded(&self, chain_task_id: &str) {
        if let Ok(mut uploaded) = self.uploaded_results.write() {
            uploaded.insert(chain_task_id.to_owned());
        }
    }
}

#[async_trait]
impl ChainReader for MemoryChain {
    async fn get_chain_task(&self, chain_task_id: &str) -> Result<Option<ChainTask>, ChainError> {
        Ok(self.tasks.get(chain_task_id).map(|t| t.clone()))
    }

    async fn get_chain_contribution(
        &self,
        chain_task_id: &str,
        wallet_address: &str,
    ) -> Result<Option<ChainContribution>, ChainError> {
        Ok(self
            .contributions
            .get(&(chain_task_id.to_owned(), wallet_address.to_owned()))
            .map(|c| c.clone()))
    }
}

#[async_trait]
impl ResultRepository for MemoryChain {
    async fn is_result_uploaded(&self, chain_task_id: &str) -> bool {
        self.uploaded_results
            .read()
            .map(|uploaded| uploaded.contains(chain_task_id))
            .unwrap_or(false)
    }
}

/// Signs authorizations with a keyed SHA-256 digest.
pub struct LocalSigner {
    key: Vec<u8>,
}

impl LocalSigner {
    pub fn new(key: impl Into<Vec<u8>>) -> Self {
        Self { key: key.into() }
    }
}

impl AuthorizationSigner for LocalSigner {
    fn create_authorization(
        &self,
        wallet_address: &str,
        chain_task_id: &str,
        enclave_challenge: &str,
    ) -> WorkerpoolAuthorization {
        let mut hasher = Sha256::new();
        // Each field is length-prefixed so shifting bytes between fields
        // changes the digest.
        for field in [
            self.key.as_slice(),
            wallet_address.as_bytes(),
            chain_task_id.as_bytes(),
            enclave_challenge.as_bytes(),
        ] {
            hasher.update((field.len() as u64).to_be_bytes());
            hasher.update(field);
        }
        WorkerpoolAuthorization {
            worker_wallet: wallet_address.to_owned(),
            chain_task_id: chain_task_id.to_owned(),
            enclave_challenge: enclave_challenge.to_owned(),
            signature: format!("0x{}", hex::encode(hasher.finalize())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::{ChainContributionStatus, ChainTaskStatus};

    #[tokio::test]
    async fn reads_back_state() {
        let chain = MemoryChain::new();
        assert!(chain.get_chain_task("0xtask").await.unwrap().is_none());

        chain.set_task(ChainTask {
            chain_task_id: "0xtask".into(),
            status: ChainTaskStatus::Revealing,
            winner_counter: 1,
            consensus_value: "0xhash".into(),
            revealing_block_number: 0,
            contribution_deadline: chrono::Utc::now(),
            final_deadline: chrono::Utc::now(),
        });
        chain.set_contribution(
            "0xtask",
            "0xworker",
            ChainContribution {
                status: ChainContributionStatus::Contributed,
                result_hash: "0xhash".into(),
                result_seal: String::new(),
                enclave_challenge: String::new(),
            },
        );
        chain.mark_result_uploaded("0xtask");

        let task = chain.get_chain_task("0xtask").await.unwrap().unwrap();
        assert_eq!(task.status, ChainTaskStatus::Revealing);
        let contribution = chain
            .get_chain_contribution("0xtask", "0xworker")
            .await
            .unwrap()
            .unwrap();
        assert!(contribution.is_contributed());
        assert!(chain.is_result_uploaded("0xtask").await);
        assert!(!chain.is_result_uploaded("0xother").await);
    }

    #[test]
    fn field_boundaries_are_part_of_the_signature() {
        let signer = LocalSigner::new("key");
        let a = signer.create_authorization("0xab", "c", "0xchallenge");
        let b = signer.create_authorization("0xa", "bc", "0xchallenge");
        assert_ne!(a.signature, b.signature);

        let c = signer.create_authorization("0xworker", "0xtask", "0xchallenge");
        let d = LocalSigner::new("key0xworker").create_authorization("", "0xtask", "0xchallenge");
        assert_ne!(c.signature, d.signature);
    }

    #[test]
    fn signature_binds_all_fields() {
        let signer = LocalSigner::new("secret");
        let a = signer.create_authorization("0xworker", "0xtask", "0xchallenge");
        let b = signer.create_authorization("0xworker", "0xtask", "0xother");
        let c = LocalSigner::new("other").create_authorization("0xworker", "0xtask", "0xchallenge");

        assert_eq!(a.worker_wallet, "0xworker");
        assert_eq!(a.signature.len(), 2 + 64);
        assert_ne!(a.signature, b.signature);
        assert_ne!(a.signature, c.signature);
        assert_eq!(
            a,
            signer.create_authorization("0xworker", "0xtask", "0xchallenge")
        );
    }
}
