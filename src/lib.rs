//! Workerpool core: task scheduling for a decentralized compute pool.
//!
//! Workers ask for tasks through [`replicate::ReplicateSupply`], come back
//! after downtime through [`replicate::ReplicateRecovery`], and every task
//! status change goes through the [`task::TaskUpdateRequestManager`].

pub mod chain;
pub mod config;
pub mod consensus;
pub mod detector;
pub mod error;
pub mod lock;
pub mod notification;
pub mod replicate;
pub mod store;
pub mod task;
pub mod worker;
