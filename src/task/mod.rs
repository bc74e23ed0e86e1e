//! Tasks and their status updates.

pub mod model;
pub mod update;

pub use model::{EMPTY_ENCLAVE_CHALLENGE, Task, TaskPhase, TaskStatus, TaskStatusChange};
pub use update::{
    TaskUpdatePublisher, TaskUpdateRequestConsumer, TaskUpdateRequestManager, TaskUpdater,
};
