//! Task data model: statuses, lifecycle phases and status history.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::TaskError;

/// Enclave challenge of a task that does not run inside an enclave.
pub const EMPTY_ENCLAVE_CHALLENGE: &str = "0x0000000000000000000000000000000000000000";

/// Lifecycle status of a task.
///
/// Declaration order is progress order: the update queue serves more
/// advanced statuses first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Received,
    Initializing,
    Initialized,
    Running,
    ConsensusReached,
    ContributionTimeout,
    Revealing,
    ResultUploadRequested,
    ResultUploading,
    ResultUploaded,
    Finalizing,
    Finalized,
    Completed,
    Failed,
}

/// Coarse stage of a task's lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskPhase {
    Contribution,
    Reveal,
    ResultUpload,
    Completion,
}

impl TaskStatus {
    /// Phase this status belongs to, if any.
    pub fn phase(&self) -> Option<TaskPhase> {
        use TaskStatus::*;

        match self {
            Initialized | Running => Some(TaskPhase::Contribution),
            ConsensusReached | Revealing => Some(TaskPhase::Reveal),
            ResultUploadRequested | ResultUploading => Some(TaskPhase::ResultUpload),
            ResultUploaded | Finalizing | Finalized | Completed => Some(TaskPhase::Completion),
            Received | Initializing | ContributionTimeout | Failed => None,
        }
    }

    /// Check if this is a terminal status.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Received => "RECEIVED",
            Self::Initializing => "INITIALIZING",
            Self::Initialized => "INITIALIZED",
            Self::Running => "RUNNING",
            Self::ConsensusReached => "CONSENSUS_REACHED",
            Self::ContributionTimeout => "CONTRIBUTION_TIMEOUT",
            Self::Revealing => "REVEALING",
            Self::ResultUploadRequested => "RESULT_UPLOAD_REQUESTED",
            Self::ResultUploading => "RESULT_UPLOADING",
            Self::ResultUploaded => "RESULT_UPLOADED",
            Self::Finalizing => "FINALIZING",
            Self::Finalized => "FINALIZED",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
        };
        write!(f, "{s}")
    }
}

/// One entry of a task's status history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskStatusChange {
    pub status: TaskStatus,
    pub date: DateTime<Utc>,
}

impl TaskStatusChange {
    pub fn new(status: TaskStatus) -> Self {
        Self {
            status,
            date: Utc::now(),
        }
    }
}

/// A task as tracked by the scheduler.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    /// Internal identifier.
    pub id: Uuid,
    /// Optimistic-concurrency revision, bumped by every successful save.
    pub version: u64,
    pub chain_task_id: String,
    pub chain_deal_id: String,
    pub task_index: u32,
    pub current_status: TaskStatus,
    /// Append-only status history.
    pub date_status_list: Vec<TaskStatusChange>,
    /// Minimum number of valid contributions before consensus.
    pub trust: u32,
    #[serde(with = "duration_secs")]
    pub max_execution_time: Duration,
    /// Whether the task must run inside a trusted execution environment.
    pub tee: bool,
    /// Empty until the task is initialized.
    pub enclave_challenge: String,
    pub contribution_deadline: DateTime<Utc>,
    pub final_deadline: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub consensus: Option<String>,
    pub consensus_reached_block_number: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uploading_worker_wallet_address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_link: Option<String>,
}

impl Task {
    /// Create a freshly received task.
    ///
    /// The contribution deadline is ten execution times away and the final
    /// deadline five times further. Fails if either does not fit a date.
    pub fn new(
        chain_deal_id: impl Into<String>,
        task_index: u32,
        chain_task_id: impl Into<String>,
        trust: u32,
        max_execution_time: Duration,
    ) -> Result<Self, TaskError> {
        let chain_task_id = chain_task_id.into();
        let now = Utc::now();
        let deadlines = max_execution_time
            .checked_mul(10)
            .and_then(|lifetime| chrono::Duration::from_std(lifetime).ok())
            .and_then(|lifetime| {
                let contribution = now.checked_add_signed(lifetime)?;
                let last = now.checked_add_signed(lifetime.checked_mul(5)?)?;
                Some((contribution, last))
            });
        let Some((contribution_deadline, final_deadline)) = deadlines else {
            return Err(TaskError::DeadlineOutOfRange {
                chain_task_id,
                max_execution_time,
            });
        };
        Ok(Self {
            id: Uuid::new_v4(),
            version: 0,
            chain_task_id,
            chain_deal_id: chain_deal_id.into(),
            task_index,
            current_status: TaskStatus::Received,
            date_status_list: vec![TaskStatusChange::new(TaskStatus::Received)],
            trust,
            max_execution_time,
            tee: false,
            enclave_challenge: String::new(),
            contribution_deadline,
            final_deadline,
            consensus: None,
            consensus_reached_block_number: 0,
            uploading_worker_wallet_address: None,
            result_link: None,
        })
    }

    /// Builder: require a trusted execution environment.
    pub fn with_tee(mut self, tee: bool) -> Self {
        self.tee = tee;
        self
    }

    /// Builder: set the enclave challenge.
    pub fn with_enclave_challenge(mut self, challenge: impl Into<String>) -> Self {
        self.enclave_challenge = challenge.into();
        self
    }

    /// Builder: set the contribution deadline.
    pub fn with_contribution_deadline(mut self, deadline: DateTime<Utc>) -> Self {
        self.contribution_deadline = deadline;
        self
    }

    /// Builder: set the final deadline.
    pub fn with_final_deadline(mut self, deadline: DateTime<Utc>) -> Self {
        self.final_deadline = deadline;
        self
    }

    /// Builder: set the current status, recording it in the history.
    pub fn with_status(mut self, status: TaskStatus) -> Self {
        self.change_status(status);
        self
    }

    /// Move to a new status and record it in the history.
    pub fn change_status(&mut self, status: TaskStatus) {
        self.current_status = status;
        self.date_status_list.push(TaskStatusChange::new(status));
    }

    /// Most recent entry of the status history.
    pub fn latest_status_change(&self) -> Option<&TaskStatusChange> {
        self.date_status_list.last()
    }

    pub fn phase(&self) -> Option<TaskPhase> {
        self.current_status.phase()
    }

    pub fn in_contribution_phase(&self) -> bool {
        self.phase() == Some(TaskPhase::Contribution)
    }

    pub fn in_reveal_phase(&self) -> bool {
        self.phase() == Some(TaskPhase::Reveal)
    }

    pub fn in_result_upload_phase(&self) -> bool {
        self.phase() == Some(TaskPhase::ResultUpload)
    }

    pub fn in_completion_phase(&self) -> bool {
        self.phase() == Some(TaskPhase::Completion)
    }

    pub fn is_tee_task(&self) -> bool {
        self.tee
    }

    /// Whether the task has an enclave challenge and can be handed to workers.
    pub fn has_enclave_challenge(&self) -> bool {
        !self.enclave_challenge.is_empty()
    }

    pub fn is_contribution_deadline_reached(&self) -> bool {
        Utc::now() >= self.contribution_deadline
    }

    pub fn is_final_deadline_reached(&self) -> bool {
        Utc::now() >= self.final_deadline
    }
}

mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_secs)
    }
}
