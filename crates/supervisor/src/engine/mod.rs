//! Task-execution engine boundary
//!
//! This module provides:
//! - [`Runnable`], [`WorkerFactory`], [`HandlerRegistry`] - traits an engine implements
//! - [`TaskQueueRegistry`] - handler registry keyed by task queue
//! - [`InMemoryWorkerFactory`] - in-process engine for tests and local runs

mod memory;
mod registry;
mod runnable;

pub use memory::{InMemoryRunnable, InMemoryWorkerFactory, InMemoryWorkerHandle};
pub use registry::{
    HandlerInfo, RegistryBuilder, RegistryError, RegistrySnapshot, TaskQueueRegistry,
    DEFAULT_TASK_QUEUE,
};
pub use runnable::{
    HandlerKind, HandlerRegistry, HandlerResult, QueueHandlers, RegisteredHandler, Runnable,
    TaskHandler, WorkerFactory,
};
