//! # Taskpool Supervisor
//!
//! Supervises a dynamic set of long-running workers, each bound to a named
//! task queue of an external task-execution engine.
//!
//! ## Features
//!
//! - **Named workers**: add, remove, restart and scale workers per task queue at runtime
//! - **Health monitoring**: a periodic scan restarts workers whose run has ended
//! - **Restart backoff**: failed restarts are retried on a configurable backoff
//! - **Pluggable engines**: any engine implementing [`WorkerFactory`] and [`Runnable`]
//! - **Consistent snapshots**: status and metrics are safe under concurrent mutation
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      WorkerManager                           │
//! │  (scaling per task queue, metrics, health verdict)          │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       WorkerPool                             │
//! │  (named workers behind one lock, health monitor task)       │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     ManagedWorker                            │
//! │  (one runnable per task, running state, error history)      │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │           WorkerFactory / Runnable / HandlerRegistry         │
//! │  (engine boundary: in-memory engine included)               │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```
//! use std::sync::Arc;
//! use std::time::Duration;
//! use taskpool_supervisor::prelude::*;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> anyhow::Result<()> {
//! let registry = TaskQueueRegistry::new();
//! registry.register_activity("greet", &["q1"], |input| async move { Ok(input) })?;
//!
//! let manager = WorkerManager::new(
//!     Arc::new(InMemoryWorkerFactory::new()),
//!     Arc::new(registry),
//!     vec![WorkerConfig::new("a", "q1")],
//!     PoolConfig::default(),
//! );
//!
//! manager.start().await?;
//! manager.scale_workers("q1", 3).await?;
//! assert_eq!(manager.metrics().await.running_workers, 3);
//! manager.health_check().await?;
//!
//! manager.stop(Duration::from_secs(5)).await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod engine;
pub mod manager;
pub mod pool;
pub mod reliability;
pub mod telemetry;
pub mod worker;

/// Prelude for common imports
pub mod prelude {
    pub use crate::config::{PoolConfig, SupervisorConfig, WorkerConfig, WorkerOptions};
    pub use crate::engine::{
        HandlerKind, HandlerRegistry, InMemoryWorkerFactory, RegisteredHandler, Runnable,
        TaskQueueRegistry, WorkerFactory,
    };
    pub use crate::manager::{HealthCheckError, WorkerManager, WorkerMetrics};
    pub use crate::pool::{PoolError, PoolStatus, WorkerPool};
    pub use crate::reliability::RestartPolicy;
    pub use crate::worker::{WorkerError, WorkerStatus};
}

// Re-export key types at crate root
pub use config::{ConfigError, PoolConfig, SupervisorConfig, WorkerConfig, WorkerOptions};
pub use engine::{HandlerRegistry, Runnable, TaskQueueRegistry, WorkerFactory};
pub use manager::{HealthCheckError, WorkerManager, WorkerMetrics};
pub use pool::{PoolError, PoolStatus, WorkerPool};
pub use reliability::RestartPolicy;
pub use worker::{ManagedWorker, WorkerError, WorkerStatus};
