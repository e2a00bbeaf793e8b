//! Partition state (§4.C).

pub mod state;

pub use state::{PartitionId, PartitionState};
