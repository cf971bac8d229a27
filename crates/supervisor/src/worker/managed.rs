//! Lifecycle wrapper around one runnable worker
//!
//! A [`ManagedWorker`] owns the runnable handed out by the engine and runs it
//! in its own tokio task. Its state lives behind its own lock so that the
//! background task can record exits without touching the pool lock.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::FutureExt;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::WorkerConfig;
use crate::engine::Runnable;

/// Managed worker errors
#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    /// Start called on a running worker
    #[error("worker {0} is already running")]
    AlreadyRunning(String),

    /// Stop deadline elapsed before the run task finished
    #[error("worker {name} did not stop within {timeout:?}")]
    StopTimeout { name: String, timeout: Duration },
}

/// Point-in-time view of a managed worker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerStatus {
    pub name: String,
    pub task_queue: String,
    /// Changes every time the worker is re-created
    pub instance_id: Uuid,
    pub is_running: bool,
    pub started_at: Option<DateTime<Utc>>,
    pub stopped_at: Option<DateTime<Utc>>,
    /// Failed runs and failed restarts, never reset
    pub error_count: u64,
    pub last_error: Option<String>,
}

#[derive(Debug, Default)]
struct WorkerState {
    is_running: bool,
    started_at: Option<DateTime<Utc>>,
    stopped_at: Option<DateTime<Utc>>,
    error_count: u64,
    last_error: Option<String>,
}

/// One supervised worker instance
pub struct ManagedWorker {
    config: WorkerConfig,
    instance_id: Uuid,
    runnable: Arc<dyn Runnable>,
    state: Arc<RwLock<WorkerState>>,
    shutdown_tx: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ManagedWorker {
    /// Wrap a runnable whose handlers are already bound
    pub fn new(config: WorkerConfig, runnable: Box<dyn Runnable>) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            config,
            instance_id: Uuid::now_v7(),
            runnable: Arc::from(runnable),
            state: Arc::new(RwLock::new(WorkerState::default())),
            shutdown_tx,
            task: Mutex::new(None),
        }
    }

    /// Carry the error history of the instance this one replaces
    pub(crate) fn inherit_history(&self, previous: &ManagedWorker) {
        let (error_count, last_error) = {
            let prev = previous.state.read();
            (prev.error_count, prev.last_error.clone())
        };
        let mut state = self.state.write();
        state.error_count = state.error_count.max(error_count);
        if state.last_error.is_none() {
            state.last_error = last_error;
        }
    }

    /// Worker name
    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// Task queue the worker serves
    pub fn task_queue(&self) -> &str {
        &self.config.task_queue
    }

    /// Config the worker was created from
    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    /// Identifier of this instance
    pub fn instance_id(&self) -> Uuid {
        self.instance_id
    }

    /// Start running the worker in a background task
    ///
    /// The worker is marked running before this returns; the run itself
    /// may not have begun yet.
    pub fn start(&self) -> Result<(), WorkerError> {
        {
            let mut state = self.state.write();
            if state.is_running {
                return Err(WorkerError::AlreadyRunning(self.config.name.clone()));
            }
            state.is_running = true;
            state.started_at = Some(Utc::now());
        }

        self.shutdown_tx.send_replace(false);

        let runnable = Arc::clone(&self.runnable);
        let state = Arc::clone(&self.state);
        let interrupt = self.shutdown_tx.subscribe();
        let name = self.config.name.clone();

        let handle = tokio::spawn(async move {
            let outcome = AssertUnwindSafe(runnable.run(interrupt))
                .catch_unwind()
                .await;

            let error = match outcome {
                Ok(Ok(())) => None,
                Ok(Err(e)) => Some(format!("{:#}", e)),
                Err(panic) => Some(format!("worker panicked: {}", panic_message(panic))),
            };

            {
                let mut state = state.write();
                if let Some(error) = &error {
                    state.error_count += 1;
                    state.last_error = Some(error.clone());
                }
                state.is_running = false;
                state.stopped_at = Some(Utc::now());
            }

            match error {
                Some(error) => warn!(worker = %name, error = %error, "Worker stopped with error"),
                None => info!(worker = %name, "Worker stopped"),
            }
        });

        *self.task.lock() = Some(handle);
        debug!(worker = %self.config.name, instance_id = %self.instance_id, "Worker task spawned");
        Ok(())
    }

    /// Stop the worker, waiting at most `timeout`
    ///
    /// A timeout leaves the run task in place; it may still finish later.
    pub async fn stop(&self, timeout: Duration) -> Result<(), WorkerError> {
        if !self.is_running() {
            return Ok(());
        }

        self.runnable.request_stop();
        self.shutdown_tx.send_replace(true);

        let task = self.task.lock().take();
        let Some(mut task) = task else {
            return Ok(());
        };

        match tokio::time::timeout(timeout, &mut task).await {
            Ok(_) => Ok(()),
            Err(_) => {
                *self.task.lock() = Some(task);
                Err(WorkerError::StopTimeout {
                    name: self.config.name.clone(),
                    timeout,
                })
            }
        }
    }

    /// Whether the run task is active
    pub fn is_running(&self) -> bool {
        self.state.read().is_running
    }

    /// Number of recorded failures
    pub fn error_count(&self) -> u64 {
        self.state.read().error_count
    }

    /// Record a failure that happened outside of `run`
    pub(crate) fn record_error(&self, message: impl Into<String>) {
        let mut state = self.state.write();
        state.error_count += 1;
        state.last_error = Some(message.into());
    }

    /// Snapshot of the worker state
    pub fn status(&self) -> WorkerStatus {
        let state = self.state.read();
        WorkerStatus {
            name: self.config.name.clone(),
            task_queue: self.config.task_queue.clone(),
            instance_id: self.instance_id,
            is_running: state.is_running,
            started_at: state.started_at,
            stopped_at: state.stopped_at,
            error_count: state.error_count,
            last_error: state.last_error.clone(),
        }
    }
}

impl Drop for ManagedWorker {
    fn drop(&mut self) {
        if self.state.read().is_running {
            self.runnable.request_stop();
            self.shutdown_tx.send_replace(true);
        }
    }
}

impl std::fmt::Debug for ManagedWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManagedWorker")
            .field("name", &self.config.name)
            .field("task_queue", &self.config.task_queue)
            .field("instance_id", &self.instance_id)
            .field("running", &self.is_running())
            .finish()
    }
}

fn panic_message(panic: Box<dyn Any + Send>) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
