//! Worker pool
//!
//! Owns a named collection of managed workers, serializes every mutation of
//! that collection behind one lock, and runs a health monitor that restarts
//! workers whose run has ended.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Notify, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use super::monitor::{HealthMonitor, RestartBackoff};
use super::set::WorkerSet;
use crate::config::{PoolConfig, SupervisorConfig, WorkerConfig};
use crate::engine::{HandlerRegistry, WorkerFactory};
use crate::worker::{ManagedWorker, WorkerError, WorkerStatus};

/// Worker pool errors
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    /// A worker with this name already exists
    #[error("worker {0} already exists")]
    DuplicateWorker(String),

    /// Worker config or scale request rejected
    #[error("invalid worker configuration: {0}")]
    InvalidConfig(String),

    /// No worker with this name
    #[error("worker {0} not found")]
    NotFound(String),

    /// Managed worker error
    #[error(transparent)]
    Worker(#[from] WorkerError),

    /// The engine could not create a runnable
    #[error("failed to create worker {name}: {source}")]
    Factory {
        name: String,
        #[source]
        source: anyhow::Error,
    },

    /// One or more workers failed to stop during pool shutdown
    #[error("failed to stop {} worker(s): {}", .0.len(), join_errors(.0))]
    StopFailed(Vec<PoolError>),

    /// Start called twice
    #[error("worker pool is already started")]
    AlreadyStarted,

    /// Pool has been stopped
    #[error("worker pool is shut down")]
    ShutDown,
}

impl PoolError {
    /// Rejected configuration (duplicate name, invalid config or scale target)
    pub fn is_config_error(&self) -> bool {
        matches!(self, Self::DuplicateWorker(_) | Self::InvalidConfig(_))
    }

    /// Unknown worker name
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    /// A stop deadline elapsed
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Worker(WorkerError::StopTimeout { .. }))
    }
}

fn join_errors(errors: &[PoolError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Snapshot of the whole pool
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolStatus {
    pub total_workers: usize,
    pub running_workers: usize,
    pub stopped_workers: usize,
    pub workers: BTreeMap<String, WorkerStatus>,
}

/// State shared between the pool handle and its health monitor
pub(crate) struct PoolShared {
    factory: Arc<dyn WorkerFactory>,
    registry: Arc<dyn HandlerRegistry>,
    configs: Vec<WorkerConfig>,
    pub(crate) settings: PoolConfig,
    pub(crate) workers: RwLock<WorkerSet>,
    pub(crate) shutdown_tx: watch::Sender<bool>,
    pub(crate) restart_signal: Arc<Notify>,
    /// Consecutive failed restarts per worker name
    pub(crate) restart_failures: Mutex<HashMap<String, RestartBackoff>>,
    /// Restart passes run by the health monitor
    pub(crate) restart_passes: AtomicU64,
    started: AtomicBool,
}

impl PoolShared {
    pub(crate) fn is_shut_down(&self) -> bool {
        *self.shutdown_tx.borrow()
    }

    /// Create a runnable, bind the queue's handlers and start it
    pub(crate) fn spawn_worker(&self, config: &WorkerConfig) -> Result<ManagedWorker, PoolError> {
        let mut runnable = self
            .factory
            .create(&config.task_queue, &config.options)
            .map_err(|source| PoolError::Factory {
                name: config.name.clone(),
                source,
            })?;

        let handlers = self.registry.handlers_for_queue(&config.task_queue);
        for ((_, name), handler) in handlers {
            debug!(
                worker = %config.name,
                task_queue = %config.task_queue,
                handler = %name,
                kind = %handler.kind,
                "Binding handler"
            );
            runnable.bind_handler(&name, handler);
        }

        let worker = ManagedWorker::new(config.clone(), runnable);
        worker.start()?;
        Ok(worker)
    }

    fn add_locked(&self, workers: &mut WorkerSet, config: WorkerConfig) -> Result<(), PoolError> {
        config
            .validate()
            .map_err(|e| PoolError::InvalidConfig(e.to_string()))?;
        if workers.contains(&config.name) {
            return Err(PoolError::DuplicateWorker(config.name));
        }

        let worker = self.spawn_worker(&config)?;
        workers.insert(worker);

        info!(
            worker = %config.name,
            task_queue = %config.task_queue,
            "Started worker"
        );
        Ok(())
    }
}

/// Supervised pool of named workers
///
/// # Example
///
/// ```
/// use std::sync::Arc;
/// use std::time::Duration;
/// use taskpool_supervisor::config::{PoolConfig, WorkerConfig};
/// use taskpool_supervisor::engine::{InMemoryWorkerFactory, TaskQueueRegistry};
/// use taskpool_supervisor::WorkerPool;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let pool = WorkerPool::new(
///     Arc::new(InMemoryWorkerFactory::new()),
///     Arc::new(TaskQueueRegistry::new()),
///     vec![WorkerConfig::new("a", "q1"), WorkerConfig::new("b", "q1")],
///     PoolConfig::default(),
/// );
///
/// pool.start().await.unwrap();
/// assert_eq!(pool.status().await.running_workers, 2);
///
/// pool.stop(Duration::from_secs(5)).await.unwrap();
/// # }
/// ```
pub struct WorkerPool {
    inner: Arc<PoolShared>,
    monitor_handle: Mutex<Option<JoinHandle<()>>>,
}

impl WorkerPool {
    /// Create a pool; nothing runs until [`start`](Self::start)
    pub fn new(
        factory: Arc<dyn WorkerFactory>,
        registry: Arc<dyn HandlerRegistry>,
        configs: Vec<WorkerConfig>,
        settings: PoolConfig,
    ) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            inner: Arc::new(PoolShared {
                factory,
                registry,
                configs,
                settings,
                workers: RwLock::new(WorkerSet::new()),
                shutdown_tx,
                restart_signal: Arc::new(Notify::new()),
                restart_failures: Mutex::new(HashMap::new()),
                restart_passes: AtomicU64::new(0),
                started: AtomicBool::new(false),
            }),
            monitor_handle: Mutex::new(None),
        }
    }

    /// Create a pool from a loaded supervisor configuration
    pub fn from_config(
        factory: Arc<dyn WorkerFactory>,
        registry: Arc<dyn HandlerRegistry>,
        config: SupervisorConfig,
    ) -> Self {
        Self::new(factory, registry, config.workers, config.pool)
    }

    /// Worker configs supplied at construction
    pub fn configs(&self) -> &[WorkerConfig] {
        &self.inner.configs
    }

    /// Supervision settings
    pub fn settings(&self) -> &PoolConfig {
        &self.inner.settings
    }

    /// Whether `start` has been called
    pub fn is_started(&self) -> bool {
        self.inner.started.load(Ordering::SeqCst)
    }

    /// Start every enabled auto-start worker, then the health monitor
    ///
    /// Invalid pool settings are rejected before anything runs. Stops at the
    /// first worker that fails to start; workers started before it keep
    /// running and the health monitor is not launched.
    #[instrument(skip(self))]
    pub async fn start(&self) -> Result<(), PoolError> {
        if self.inner.is_shut_down() {
            return Err(PoolError::ShutDown);
        }
        self.inner
            .settings
            .validate()
            .map_err(|e| PoolError::InvalidConfig(e.to_string()))?;
        if self.inner.started.swap(true, Ordering::SeqCst) {
            return Err(PoolError::AlreadyStarted);
        }

        info!(workers = self.inner.configs.len(), "Starting worker pool");

        {
            let mut workers = self.inner.workers.write().await;
            for config in &self.inner.configs {
                if !config.enabled {
                    info!(worker = %config.name, "Worker is disabled, skipping");
                    continue;
                }
                if !config.auto_start {
                    debug!(worker = %config.name, "Worker is not auto-started, skipping");
                    continue;
                }
                self.inner.add_locked(&mut workers, config.clone())?;
            }
        }

        let handle = HealthMonitor::new(&self.inner).spawn();
        *self.monitor_handle.lock() = Some(handle);

        info!("Worker pool started");
        Ok(())
    }

    /// Stop the health monitor and every worker
    ///
    /// All workers are stopped concurrently against one shared deadline.
    /// Failures are collected into [`PoolError::StopFailed`].
    #[instrument(skip(self))]
    pub async fn stop(&self, deadline: Duration) -> Result<(), PoolError> {
        info!("Stopping worker pool");
        self.inner.shutdown_tx.send_replace(true);

        let monitor = self.monitor_handle.lock().take();
        if let Some(monitor) = monitor {
            if let Err(e) = monitor.await {
                warn!(error = %e, "Health monitor task ended abnormally");
            }
        }

        let workers = self.inner.workers.write().await;
        let stops = workers.iter().map(|worker| async move {
            debug!(worker = %worker.name(), "Stopping worker");
            worker
                .stop(deadline)
                .await
                .map_err(|e| (worker.name().to_string(), e))
        });
        let results = futures::future::join_all(stops).await;

        let errors: Vec<PoolError> = results
            .into_iter()
            .filter_map(Result::err)
            .map(|(name, e)| {
                warn!(worker = %name, error = %e, "Failed to stop worker");
                PoolError::from(e)
            })
            .collect();

        if !errors.is_empty() {
            return Err(PoolError::StopFailed(errors));
        }

        info!("Worker pool stopped");
        Ok(())
    }

    /// Create and start a worker outside the initial config list
    ///
    /// The worker is started even if its config is not auto-start; the
    /// flag only decides whether the health monitor restarts it.
    #[instrument(skip(self, config), fields(worker = %config.name, task_queue = %config.task_queue))]
    pub async fn add_worker(&self, config: WorkerConfig) -> Result<(), PoolError> {
        let mut workers = self.inner.workers.write().await;
        if self.inner.is_shut_down() {
            return Err(PoolError::ShutDown);
        }
        self.inner.add_locked(&mut workers, config)
    }

    /// Stop a worker and remove it from the pool
    ///
    /// The worker stays in the pool if it fails to stop in time.
    #[instrument(skip(self))]
    pub async fn remove_worker(&self, name: &str) -> Result<(), PoolError> {
        let mut workers = self.inner.workers.write().await;
        if self.inner.is_shut_down() {
            return Err(PoolError::ShutDown);
        }

        let worker = workers
            .get(name)
            .ok_or_else(|| PoolError::NotFound(name.to_string()))?;
        worker.stop(self.inner.settings.stop_timeout).await?;

        workers.remove(name);
        self.inner.restart_failures.lock().remove(name);

        info!(worker = %name, "Removed worker");
        Ok(())
    }

    /// Replace a worker with a fresh instance from its stored config
    ///
    /// Stop errors on the old instance are logged and ignored. If the new
    /// instance cannot be created the old entry is kept, stopped, so the
    /// health monitor can retry it.
    #[instrument(skip(self))]
    pub async fn restart_worker(&self, name: &str) -> Result<(), PoolError> {
        let mut workers = self.inner.workers.write().await;
        if self.inner.is_shut_down() {
            return Err(PoolError::ShutDown);
        }

        let old = workers
            .get(name)
            .ok_or_else(|| PoolError::NotFound(name.to_string()))?;

        info!(worker = %name, "Restarting worker");
        if let Err(e) = old.stop(self.inner.settings.stop_timeout).await {
            warn!(worker = %name, error = %e, "Ignoring stop error during restart");
        }

        let config = old.config().clone();
        self.inner.restart_failures.lock().remove(name);

        match self.inner.spawn_worker(&config) {
            Ok(fresh) => {
                fresh.inherit_history(old);
                workers.replace(fresh);
                info!(worker = %name, "Successfully restarted worker");
                Ok(())
            }
            Err(e) => {
                old.record_error(e.to_string());
                Err(e)
            }
        }
    }

    /// Ask the health monitor for an immediate restart pass
    ///
    /// Requests coalesce; several calls before the monitor wakes up produce
    /// one pass.
    pub fn request_restart(&self) {
        self.inner.restart_signal.notify_one();
    }

    #[cfg(test)]
    pub(crate) fn restart_passes(&self) -> u64 {
        self.inner.restart_passes.load(Ordering::SeqCst)
    }

    /// Status of one worker
    pub async fn get_worker(&self, name: &str) -> Option<WorkerStatus> {
        self.inner.workers.read().await.get(name).map(ManagedWorker::status)
    }

    /// Whether a worker with this name exists
    pub async fn contains(&self, name: &str) -> bool {
        self.inner.workers.read().await.contains(name)
    }

    /// Status of every worker, in the order they were added
    pub async fn list_workers(&self) -> Vec<WorkerStatus> {
        self.inner
            .workers
            .read()
            .await
            .in_add_order()
            .into_iter()
            .map(ManagedWorker::status)
            .collect()
    }

    /// Status of the workers bound to one task queue, in the order they were added
    pub async fn workers_for_queue(&self, task_queue: &str) -> Vec<WorkerStatus> {
        self.inner
            .workers
            .read()
            .await
            .in_add_order()
            .into_iter()
            .filter(|worker| worker.task_queue() == task_queue)
            .map(ManagedWorker::status)
            .collect()
    }

    /// Counts plus per-worker status
    pub async fn status(&self) -> PoolStatus {
        let workers = self.inner.workers.read().await;

        let mut status = PoolStatus {
            total_workers: workers.len(),
            running_workers: 0,
            stopped_workers: 0,
            workers: BTreeMap::new(),
        };

        for worker in workers.iter() {
            let worker_status = worker.status();
            if worker_status.is_running {
                status.running_workers += 1;
            } else {
                status.stopped_workers += 1;
            }
            status
                .workers
                .insert(worker_status.name.clone(), worker_status);
        }

        status
    }
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("configs", &self.inner.configs.len())
            .field("started", &self.is_started())
            .field("shut_down", &self.inner.is_shut_down())
            .finish()
    }
}
