//! Capability traits implemented by a task-execution engine
//!
//! The pool never depends on a concrete engine: it asks a [`WorkerFactory`]
//! for a [`Runnable`], binds every handler the [`HandlerRegistry`] reports
//! for the worker's task queue, and then drives the runnable's `run` in a
//! background task.

use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::watch;

use crate::config::WorkerOptions;

/// Handler execution result
pub type HandlerResult = Result<Value, String>;

/// Handler function type
pub type TaskHandler = Arc<
    dyn Fn(Value) -> Pin<Box<dyn Future<Output = HandlerResult> + Send>> + Send + Sync,
>;

/// Kind of work a handler performs
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HandlerKind {
    Workflow,
    Activity,
}

impl fmt::Display for HandlerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Workflow => write!(f, "workflow"),
            Self::Activity => write!(f, "activity"),
        }
    }
}

/// Handlers for one task queue, keyed by kind and name
///
/// A workflow and an activity may share a name.
pub type QueueHandlers = BTreeMap<(HandlerKind, String), RegisteredHandler>;

/// A handler together with its kind, ready to be bound to a runnable
#[derive(Clone)]
pub struct RegisteredHandler {
    pub kind: HandlerKind,
    pub handler: TaskHandler,
}

impl RegisteredHandler {
    /// Wrap an async function as a handler
    pub fn new<F, Fut>(kind: HandlerKind, f: F) -> Self
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        let handler: TaskHandler = Arc::new(move |input| Box::pin(f(input)));
        Self { kind, handler }
    }

    /// Invoke the handler
    pub async fn invoke(&self, input: Value) -> HandlerResult {
        (self.handler)(input).await
    }
}

impl fmt::Debug for RegisteredHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegisteredHandler")
            .field("kind", &self.kind)
            .finish_non_exhaustive()
    }
}

/// One runnable worker instance provided by the engine
///
/// `run` blocks for the whole lifetime of the worker and returns when the
/// worker stops, with an error if it stopped abnormally. `request_stop` is
/// idempotent and must not block.
#[async_trait]
pub trait Runnable: Send + Sync {
    /// Bind a handler before the worker is run
    ///
    /// Handlers are identified by `handler.kind` together with `name`.
    fn bind_handler(&mut self, name: &str, handler: RegisteredHandler);

    /// Run until stopped or `interrupt` turns true
    async fn run(&self, interrupt: watch::Receiver<bool>) -> anyhow::Result<()>;

    /// Ask the worker to stop
    fn request_stop(&self);
}

/// Creates runnable workers for a task queue
pub trait WorkerFactory: Send + Sync {
    fn create(&self, task_queue: &str, options: &WorkerOptions)
        -> anyhow::Result<Box<dyn Runnable>>;
}

/// Source of the handlers a worker on a given task queue must serve
pub trait HandlerRegistry: Send + Sync {
    fn handlers_for_queue(&self, task_queue: &str) -> QueueHandlers;
}
