//! Replicate data model: one worker's participation in one task.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};

use crate::error::ReplicateError;

/// Status of a replicate.
///
/// Lifecycle statuses are declared in progress order, so "before
/// contributing" is a plain comparison. Markers after `Completed` are
/// terminal or audit entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReplicateStatus {
    Created,
    Contributing,
    Contributed,
    Revealing,
    Revealed,
    ResultUploadRequested,
    ResultUploading,
    ResultUploaded,
    Completed,
    Aborted,
    Failed,
    /// Worker stopped pinging; may come back.
    WorkerLost,
    /// Audit marker written each time recovery notifies the worker.
    Recovering,
    Error,
}

impl ReplicateStatus {
    /// Transient markers that do not describe where the replicate stands.
    pub fn is_relevant(&self) -> bool {
        !matches!(self, Self::WorkerLost | Self::Recovering)
    }

    /// Whether a worker may resume a replicate last seen in this status.
    pub fn is_recoverable(&self) -> bool {
        !matches!(
            self,
            Self::Completed | Self::Aborted | Self::Failed | Self::Error
        )
    }

    /// Statuses that no longer count towards the trust target.
    pub fn is_dead(&self) -> bool {
        matches!(self, Self::Error | Self::WorkerLost)
    }
}

impl std::fmt::Display for ReplicateStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Created => "CREATED",
            Self::Contributing => "CONTRIBUTING",
            Self::Contributed => "CONTRIBUTED",
            Self::Revealing => "REVEALING",
            Self::Revealed => "REVEALED",
            Self::ResultUploadRequested => "RESULT_UPLOAD_REQUESTED",
            Self::ResultUploading => "RESULT_UPLOADING",
            Self::ResultUploaded => "RESULT_UPLOADED",
            Self::Completed => "COMPLETED",
            Self::Aborted => "ABORTED",
            Self::Failed => "FAILED",
            Self::WorkerLost => "WORKER_LOST",
            Self::Recovering => "RECOVERING",
            Self::Error => "ERROR",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for ReplicateStatus {
    type Err = ReplicateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        serde_json::from_value(serde_json::Value::String(s.to_string()))
            .map_err(|_| ReplicateError::UnknownStatus(s.to_string()))
    }
}

/// Who requested a status update.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReplicateStatusModifier {
    Worker,
    PoolManager,
}

/// Optional payload attached to a status update.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicateStatusDetails {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chain_receipt_block_number: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tee_session_generation_error: Option<String>,
    /// Result hash read from the on-chain contribution.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_hash: Option<String>,
}

impl ReplicateStatusDetails {
    pub fn with_block_number(block_number: u64) -> Self {
        Self {
            chain_receipt_block_number: Some(block_number),
            ..Default::default()
        }
    }
}

/// One entry of a replicate's status history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicateStatusUpdate {
    pub status: ReplicateStatus,
    pub modifier: ReplicateStatusModifier,
    pub date: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<ReplicateStatusDetails>,
}

impl ReplicateStatusUpdate {
    /// Update reported by the worker itself.
    pub fn worker_request(status: ReplicateStatus) -> Self {
        Self {
            status,
            modifier: ReplicateStatusModifier::Worker,
            date: Utc::now(),
            details: None,
        }
    }

    /// Update decided by the scheduler.
    pub fn pool_manager_request(status: ReplicateStatus) -> Self {
        Self {
            status,
            modifier: ReplicateStatusModifier::PoolManager,
            date: Utc::now(),
            details: None,
        }
    }

    /// Builder: attach details.
    pub fn with_details(mut self, details: ReplicateStatusDetails) -> Self {
        self.details = Some(details);
        self
    }
}

/// One worker's attempt at a task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Replicate {
    pub chain_task_id: String,
    pub wallet_address: String,
    pub current_status: ReplicateStatus,
    /// Append-only status history.
    pub status_update_list: Vec<ReplicateStatusUpdate>,
    /// Set once from the on-chain contribution, never changed afterwards.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contribution_hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_link: Option<String>,
}

impl Replicate {
    /// Create a replicate in `CREATED` status.
    pub fn new(wallet_address: impl Into<String>, chain_task_id: impl Into<String>) -> Self {
        Self {
            chain_task_id: chain_task_id.into(),
            wallet_address: wallet_address.into(),
            current_status: ReplicateStatus::Created,
            status_update_list: vec![ReplicateStatusUpdate::pool_manager_request(
                ReplicateStatus::Created,
            )],
            contribution_hash: None,
            result_link: None,
        }
    }

    /// Append a status update.
    pub fn update_status(&mut self, update: ReplicateStatusUpdate) {
        if let Some(hash) = update.details.as_ref().and_then(|d| d.result_hash.as_ref())
            && self.contribution_hash.is_none()
        {
            self.contribution_hash = Some(hash.clone());
        }
        self.current_status = update.status;
        self.status_update_list.push(update);
    }

    /// Most recent status that is neither `WORKER_LOST` nor `RECOVERING`.
    pub fn last_relevant_status(&self) -> Option<ReplicateStatus> {
        self.status_update_list
            .iter()
            .rev()
            .map(|u| u.status)
            .find(ReplicateStatus::is_relevant)
    }

    /// Whether the last relevant status comes strictly before `status`.
    pub fn is_before_status(&self, status: ReplicateStatus) -> bool {
        self.last_relevant_status().is_some_and(|s| s < status)
    }

    pub fn is_recoverable(&self) -> bool {
        self.last_relevant_status()
            .is_some_and(|s| s.is_recoverable())
    }

    pub fn contains_status(&self, status: ReplicateStatus) -> bool {
        self.status_update_list.iter().any(|u| u.status == status)
    }

    pub fn contains_contributed_status(&self) -> bool {
        self.contains_status(ReplicateStatus::Contributed)
    }

    pub fn contains_revealed_status(&self) -> bool {
        self.contains_status(ReplicateStatus::Revealed)
    }

    /// Whether the status just before a trailing `WORKER_LOST` is `status`.
    pub fn is_status_before_worker_lost(&self, status: ReplicateStatus) -> bool {
        let size = self.status_update_list.len();
        size >= 2
            && self.status_update_list[size - 1].status == ReplicateStatus::WorkerLost
            && self.status_update_list[size - 2].status == status
    }
}

/// All replicates of one task, versioned for optimistic concurrency.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicatesList {
    pub chain_task_id: String,
    pub version: u64,
    pub replicates: Vec<Replicate>,
}

impl ReplicatesList {
    pub fn new(chain_task_id: impl Into<String>) -> Self {
        Self {
            chain_task_id: chain_task_id.into(),
            version: 0,
            replicates: Vec::new(),
        }
    }

    /// Builder: seed replicates.
    pub fn with_replicates(mut self, replicates: Vec<Replicate>) -> Self {
        self.replicates = replicates;
        self
    }

    pub fn replicate_of_worker(&self, wallet_address: &str) -> Option<&Replicate> {
        self.replicates
            .iter()
            .find(|r| r.wallet_address == wallet_address)
    }

    pub fn replicate_of_worker_mut(&mut self, wallet_address: &str) -> Option<&mut Replicate> {
        self.replicates
            .iter_mut()
            .find(|r| r.wallet_address == wallet_address)
    }

    pub fn has_worker_already_participated(&self, wallet_address: &str) -> bool {
        self.replicate_of_worker(wallet_address).is_some()
    }

    /// Replicates whose last relevant status is `CONTRIBUTED` with the
    /// given hash.
    pub fn nb_valid_contributed_winners(&self, contribution_hash: &str) -> usize {
        self.replicates
            .iter()
            .filter(|r| {
                r.last_relevant_status() == Some(ReplicateStatus::Contributed)
                    && r.contribution_hash.as_deref() == Some(contribution_hash)
            })
            .count()
    }

    pub fn nb_with_current_status(&self, statuses: &[ReplicateStatus]) -> usize {
        self.replicates
            .iter()
            .filter(|r| statuses.contains(&r.current_status))
            .count()
    }

    pub fn nb_with_last_relevant_status(&self, statuses: &[ReplicateStatus]) -> usize {
        self.replicates
            .iter()
            .filter(|r| {
                r.last_relevant_status()
                    .is_some_and(|s| statuses.contains(&s))
            })
            .count()
    }

    /// Distinct workers whose history contains any of `statuses`.
    pub fn nb_containing_status(&self, statuses: &[ReplicateStatus]) -> usize {
        self.replicates
            .iter()
            .filter(|r| statuses.iter().any(|s| r.contains_status(*s)))
            .map(|r| r.wallet_address.as_str())
            .collect::<HashSet<_>>()
            .len()
    }

    pub fn random_replicate_with_revealed_status(&self) -> Option<&Replicate> {
        let revealed: Vec<&Replicate> = self
            .replicates
            .iter()
            .filter(|r| r.current_status == ReplicateStatus::Revealed)
            .collect();
        revealed.choose(&mut rand::thread_rng()).copied()
    }

    /// A replicate that uploaded the result, even if its worker was lost afterwards.
    pub fn replicate_with_result_uploaded_status(&self) -> Option<&Replicate> {
        self.replicates.iter().find(|r| {
            r.current_status == ReplicateStatus::ResultUploaded
                || r.is_status_before_worker_lost(ReplicateStatus::ResultUploaded)
        })
    }
}

/// API view of a replicate with the worker-reported fields folded out of
/// its history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReplicateModel {
    pub chain_task_id: String,
    pub wallet_address: String,
    pub current_status: ReplicateStatus,
    pub status_update_list: Vec<ReplicateStatusUpdate>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub contribution_hash: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result_link: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub app_exit_code: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tee_session_generation_error: Option<String>,
}

impl TryFrom<&Replicate> for ReplicateModel {
    type Error = ReplicateError;

    /// Fails if the exit code or TEE session error was reported more than once.
    fn try_from(replicate: &Replicate) -> Result<Self, Self::Error> {
        let mut app_exit_code = None;
        let mut tee_session_generation_error = None;

        for details in replicate
            .status_update_list
            .iter()
            .filter_map(|u| u.details.as_ref())
        {
            if let Some(code) = details.exit_code {
                if app_exit_code.is_some() {
                    return Err(ReplicateError::MultipleOccurrences {
                        field: "exitCode".to_string(),
                    });
                }
                app_exit_code = Some(code);
            }
            if let Some(ref error) = details.tee_session_generation_error {
                if tee_session_generation_error.is_some() {
                    return Err(ReplicateError::MultipleOccurrences {
                        field: "teeSessionGenerationError".to_string(),
                    });
                }
                tee_session_generation_error = Some(error.clone());
            }
        }

        Ok(Self {
            chain_task_id: replicate.chain_task_id.clone(),
            wallet_address: replicate.wallet_address.clone(),
            current_status: replicate.current_status,
            status_update_list: replicate.status_update_list.clone(),
            contribution_hash: replicate.contribution_hash.clone(),
            result_link: replicate.result_link.clone(),
            app_exit_code,
            tee_session_generation_error,
        })
    }
}
