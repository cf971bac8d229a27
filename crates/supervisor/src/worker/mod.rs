//! Supervised worker instances

mod managed;

pub use managed::{ManagedWorker, WorkerError, WorkerStatus};
