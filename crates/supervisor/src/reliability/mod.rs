//! Reliability policies for worker supervision

mod restart;

pub use restart::RestartPolicy;
