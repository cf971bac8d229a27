//! Worker pool and its health monitor
//!
//! This module provides:
//! - [`WorkerPool`] - named collection of supervised workers
//! - [`PoolStatus`] - point-in-time pool snapshot
//! - [`PoolError`] - errors returned by pool operations

mod monitor;
mod set;
mod worker_pool;

pub use worker_pool::{PoolError, PoolStatus, WorkerPool};
