//! Error types for the workerpool scheduler.

/// Top-level error type for the scheduler.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Chain error: {0}")]
    Chain(#[from] ChainError),

    #[error("Replicate error: {0}")]
    Replicate(#[from] ReplicateError),

    #[error("Task error: {0}")]
    Task(#[from] TaskError),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Persistence errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: String, id: String },

    /// Optimistic-concurrency failure: the entity changed between read and write.
    #[error("Conflicting write on {entity} {id}: expected version {expected}, found {found}")]
    Conflict {
        entity: String,
        id: String,
        expected: u64,
        found: u64,
    },

    #[error("Duplicate {entity}: {id}")]
    Duplicate { entity: String, id: String },

    #[error("Store backend failure: {0}")]
    Backend(String),
}

impl StoreError {
    pub fn not_found(entity: &str, id: impl Into<String>) -> Self {
        Self::NotFound {
            entity: entity.to_string(),
            id: id.into(),
        }
    }

    /// Whether the failed operation may succeed if re-read and retried.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }
}

/// Errors reading blockchain state.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ChainError {
    #[error("RPC call {method} failed: {reason}")]
    Rpc { method: String, reason: String },

    #[error("Chain node unavailable: {0}")]
    Unavailable(String),
}

/// Replicate bookkeeping contract violations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ReplicateError {
    #[error("Multiple occurrences of field {field} across status history")]
    MultipleOccurrences { field: String },

    #[error("Unknown replicate status: {0}")]
    UnknownStatus(String),
}

/// Task construction errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TaskError {
    #[error("Deadlines of task {chain_task_id} overflow for max execution time {max_execution_time:?}")]
    DeadlineOutOfRange {
        chain_task_id: String,
        max_execution_time: std::time::Duration,
    },
}

/// Task update queue failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum QueueError {
    /// A thread panicked while holding the queue; its content is suspect.
    #[error("Update queue lock poisoned")]
    Poisoned,
}

/// Result type alias for the scheduler.
pub type Result<T> = std::result::Result<T, Error>;
