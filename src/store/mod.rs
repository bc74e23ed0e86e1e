//! Persistence layer for tasks and replicates.

pub mod memory;
pub mod traits;

pub use memory::MemoryStore;
pub use traits::{ReplicateStore, TaskStore};
