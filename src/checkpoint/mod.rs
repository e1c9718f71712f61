//! Durable workflow snapshots and the per-spec-set shared record.

pub mod shared;
pub mod store;

pub use shared::{
    AggregatedMetrics, SharedCoordinationRecord, SharedPattern, SharedStateStore, SpecMetrics,
};
pub use store::{Checkpoint, CheckpointStore};
