//! Task update dispatch.
//!
//! - `queue`: priority queue of pending update requests
//! - `manager`: worker routines draining the queue under per-task locks
//! - `updater`: the consumer applying status transitions

pub mod manager;
pub mod queue;
pub mod updater;

pub use manager::{TaskUpdatePublisher, TaskUpdateRequestConsumer, TaskUpdateRequestManager};
pub use queue::{QueuedRequest, UpdateQueue};
pub use updater::TaskUpdater;
