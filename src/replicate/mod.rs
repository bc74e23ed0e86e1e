//! Replicates: worker assignment, recovery and bookkeeping.

pub mod model;
pub mod recovery;
pub mod supply;

pub use model::{
    Replicate, ReplicateModel, ReplicateStatus, ReplicateStatusDetails, ReplicateStatusModifier,
    ReplicateStatusUpdate, ReplicatesList,
};
pub use recovery::ReplicateRecovery;
pub use supply::ReplicateSupply;
