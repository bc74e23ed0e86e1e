//! Notifications returned to workers.

use serde::{Deserialize, Serialize};

use crate::chain::WorkerpoolAuthorization;

/// What a worker should do next for a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskNotificationType {
    PleaseContribute,
    PleaseReveal,
    PleaseUpload,
    PleaseWait,
    PleaseAbort,
    PleaseComplete,
}

impl std::fmt::Display for TaskNotificationType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::PleaseContribute => "PLEASE_CONTRIBUTE",
            Self::PleaseReveal => "PLEASE_REVEAL",
            Self::PleaseUpload => "PLEASE_UPLOAD",
            Self::PleaseWait => "PLEASE_WAIT",
            Self::PleaseAbort => "PLEASE_ABORT",
            Self::PleaseComplete => "PLEASE_COMPLETE",
        };
        write!(f, "{s}")
    }
}

/// Why a worker is asked to abort.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskAbortCause {
    ContributionTimeout,
    ConsensusReached,
    Unknown,
}

/// Extra data carried by a notification, depending on its type.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskNotificationExtra {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workerpool_authorization: Option<WorkerpoolAuthorization>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub block_number: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_abort_cause: Option<TaskAbortCause>,
}

/// Instruction for one or more workers. Derived on demand, never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskNotification {
    pub chain_task_id: String,
    pub workers_address: Vec<String>,
    pub task_notification_type: TaskNotificationType,
    pub task_notification_extra: TaskNotificationExtra,
}

impl TaskNotification {
    /// Notification addressed to a single worker.
    pub fn for_worker(
        chain_task_id: impl Into<String>,
        wallet_address: impl Into<String>,
        notification_type: TaskNotificationType,
        extra: TaskNotificationExtra,
    ) -> Self {
        Self {
            chain_task_id: chain_task_id.into(),
            workers_address: vec![wallet_address.into()],
            task_notification_type: notification_type,
            task_notification_extra: extra,
        }
    }
}
