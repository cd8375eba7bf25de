//! Durable persistence (C4): a batching async worker in front of Postgres.

mod queries;
mod worker;

pub use worker::{
    DeltaSubmission, PersistenceConfig, PersistenceMetricsSnapshot, PersistenceWorker,
    QueuePersistHook, SnapshotSubmission,
};
