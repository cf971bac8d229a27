//! Worker manager
//!
//! Facade over one [`WorkerPool`]: per-queue scaling, aggregate metrics and
//! a coarse health verdict. It only uses the pool's public operations.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument};

use crate::config::{PoolConfig, SupervisorConfig, WorkerConfig, WorkerOptions};
use crate::engine::{HandlerRegistry, WorkerFactory};
use crate::pool::{PoolError, PoolStatus, WorkerPool};

/// Aggregate worker metrics
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkerMetrics {
    pub total_workers: usize,
    pub running_workers: usize,
    pub stopped_workers: usize,
    /// Task queue -> number of workers bound to it
    pub task_queues: BTreeMap<String, usize>,
    /// Worker name -> error count, only for workers with errors
    pub error_counts: BTreeMap<String, u64>,
}

/// Reasons the pool is considered unhealthy
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HealthCheckError {
    #[error("no workers are running")]
    NoWorkersRunning,

    #[error("more than 50% of workers are stopped ({stopped} of {total})")]
    TooManyStopped { stopped: usize, total: usize },
}

/// High-level worker management over one pool
#[derive(Debug, Clone)]
pub struct WorkerManager {
    pool: Arc<WorkerPool>,
}

impl WorkerManager {
    /// Create a manager with a new pool
    pub fn new(
        factory: Arc<dyn WorkerFactory>,
        registry: Arc<dyn HandlerRegistry>,
        configs: Vec<WorkerConfig>,
        settings: PoolConfig,
    ) -> Self {
        Self::from_pool(Arc::new(WorkerPool::new(factory, registry, configs, settings)))
    }

    /// Create a manager from a loaded supervisor configuration
    pub fn from_config(
        factory: Arc<dyn WorkerFactory>,
        registry: Arc<dyn HandlerRegistry>,
        config: SupervisorConfig,
    ) -> Self {
        Self::from_pool(Arc::new(WorkerPool::from_config(factory, registry, config)))
    }

    /// Manage an existing pool
    pub fn from_pool(pool: Arc<WorkerPool>) -> Self {
        Self { pool }
    }

    /// The managed pool
    pub fn pool(&self) -> &Arc<WorkerPool> {
        &self.pool
    }

    /// Start the pool
    pub async fn start(&self) -> Result<(), PoolError> {
        self.pool.start().await
    }

    /// Stop the pool
    pub async fn stop(&self, deadline: Duration) -> Result<(), PoolError> {
        self.pool.stop(deadline).await
    }

    /// Pool status
    pub async fn status(&self) -> PoolStatus {
        self.pool.status().await
    }

    /// Bring the number of workers on `task_queue` to `target`
    ///
    /// New workers are named `{task_queue}-worker-{n}` and use default
    /// options; taken names are skipped. When scaling down, the most recently added workers of the
    /// queue are removed first. Stops at the first failing add or remove.
    #[instrument(skip(self))]
    pub async fn scale_workers(&self, task_queue: &str, target: usize) -> Result<(), PoolError> {
        if task_queue.trim().is_empty() {
            return Err(PoolError::InvalidConfig(
                "task queue is required for scaling".into(),
            ));
        }

        let current = self.pool.workers_for_queue(task_queue).await;
        let count = current.len();

        if target > count {
            let mut index = count;
            let mut added = 0;
            while added < target - count {
                let name = format!("{}-worker-{}", task_queue, index);
                index += 1;

                let config = WorkerConfig::new(name, task_queue).with_options(WorkerOptions::default());
                match self.pool.add_worker(config).await {
                    Ok(()) => added += 1,
                    // Name taken, possibly by a concurrent add; try the next index.
                    Err(PoolError::DuplicateWorker(name)) => {
                        debug!(worker = %name, "Worker name taken, trying next index");
                    }
                    Err(e) => return Err(e),
                }
            }
        } else if target < count {
            for worker in current.iter().rev().take(count - target) {
                self.pool.remove_worker(&worker.name).await?;
            }
        }

        info!(task_queue = %task_queue, from = count, to = target, "Scaled workers");
        Ok(())
    }

    /// Worker counts by state and queue, plus per-worker error counts
    pub async fn metrics(&self) -> WorkerMetrics {
        let status = self.pool.status().await;

        let mut metrics = WorkerMetrics {
            total_workers: status.total_workers,
            running_workers: status.running_workers,
            stopped_workers: status.stopped_workers,
            ..Default::default()
        };

        for worker in status.workers.values() {
            *metrics
                .task_queues
                .entry(worker.task_queue.clone())
                .or_insert(0) += 1;
            if worker.error_count > 0 {
                metrics
                    .error_counts
                    .insert(worker.name.clone(), worker.error_count);
            }
        }

        metrics
    }

    /// Fails if no worker is running or more than half are stopped
    pub async fn health_check(&self) -> Result<(), HealthCheckError> {
        let status = self.pool.status().await;
        evaluate_health(status.running_workers, status.stopped_workers, status.total_workers)
    }
}

fn evaluate_health(running: usize, stopped: usize, total: usize) -> Result<(), HealthCheckError> {
    if running == 0 {
        return Err(HealthCheckError::NoWorkersRunning);
    }
    if stopped * 2 > total {
        return Err(HealthCheckError::TooManyStopped { stopped, total });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{InMemoryWorkerFactory, TaskQueueRegistry};

    fn manager(factory: Arc<InMemoryWorkerFactory>, configs: Vec<WorkerConfig>) -> WorkerManager {
        WorkerManager::new(
            factory,
            Arc::new(TaskQueueRegistry::new()),
            configs,
            PoolConfig::default().with_stop_timeout(Duration::from_secs(1)),
        )
    }

    #[test]
    fn test_health_verdicts() {
        assert_eq!(evaluate_health(0, 0, 0), Err(HealthCheckError::NoWorkersRunning));
        assert_eq!(evaluate_health(0, 3, 3), Err(HealthCheckError::NoWorkersRunning));
        assert_eq!(
            evaluate_health(1, 2, 3),
            Err(HealthCheckError::TooManyStopped { stopped: 2, total: 3 })
        );
        // Exactly half stopped is still healthy.
        assert_eq!(evaluate_health(2, 2, 4), Ok(()));
        assert_eq!(evaluate_health(3, 0, 3), Ok(()));
    }

    #[test]
    fn test_health_error_messages() {
        assert_eq!(
            HealthCheckError::NoWorkersRunning.to_string(),
            "no workers are running"
        );
        assert!(HealthCheckError::TooManyStopped { stopped: 3, total: 4 }
            .to_string()
            .starts_with("more than 50% of workers are stopped"));
    }

    #[tokio::test]
    async fn test_scale_up_names_and_defaults() {
        let factory = Arc::new(InMemoryWorkerFactory::new());
        let manager = manager(factory.clone(), vec![]);
        manager.start().await.unwrap();

        manager.scale_workers("orders", 3).await.unwrap();

        let names: Vec<String> = manager
            .pool()
            .workers_for_queue("orders")
            .await
            .into_iter()
            .map(|w| w.name)
            .collect();
        assert_eq!(names, vec!["orders-worker-0", "orders-worker-1", "orders-worker-2"]);
        assert!(factory
            .created()
            .iter()
            .all(|h| h.options() == &WorkerOptions::default()));

        manager.stop(Duration::from_secs(1)).await.unwrap();
    }

    #[tokio::test]
    async fn test_scale_up_skips_taken_names() {
        let factory = Arc::new(InMemoryWorkerFactory::new());
        let manager = manager(factory, vec![WorkerConfig::new("orders-worker-1", "other")]);
        manager.start().await.unwrap();

        manager.scale_workers("orders", 2).await.unwrap();

        let names: Vec<String> = manager
            .pool()
            .workers_for_queue("orders")
            .await
            .into_iter()
            .map(|w| w.name)
            .collect();
        assert_eq!(names, vec!["orders-worker-0", "orders-worker-2"]);

        manager.stop(Duration::from_secs(1)).await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_scale_ups_do_not_collide() {
        let factory = Arc::new(InMemoryWorkerFactory::new());
        let manager = manager(factory, vec![]);
        manager.start().await.unwrap();

        let tasks: Vec<_> = (0..4)
            .map(|_| {
                let manager = manager.clone();
                tokio::spawn(async move { manager.scale_workers("orders", 3).await })
            })
            .collect();
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        let workers = manager.pool().workers_for_queue("orders").await;
        assert!(workers.len() >= 3 && workers.len() <= 12);
        let mut names: Vec<&str> = workers.iter().map(|w| w.name.as_str()).collect();
        names.sort();
        names.dedup();
        assert_eq!(names.len(), workers.len());

        manager.stop(Duration::from_secs(1)).await.unwrap();
    }

    #[tokio::test]
    async fn test_scale_down_removes_newest_first() {
        let factory = Arc::new(InMemoryWorkerFactory::new());
        let manager = manager(
            factory,
            vec![WorkerConfig::new("first", "q1"), WorkerConfig::new("other", "q2")],
        );
        manager.start().await.unwrap();
        manager.scale_workers("q1", 3).await.unwrap();

        manager.scale_workers("q1", 1).await.unwrap();

        let remaining: Vec<String> = manager
            .pool()
            .workers_for_queue("q1")
            .await
            .into_iter()
            .map(|w| w.name)
            .collect();
        assert_eq!(remaining, vec!["first"]);
        assert!(manager.pool().contains("other").await);

        manager.stop(Duration::from_secs(1)).await.unwrap();
    }

    #[tokio::test]
    async fn test_scale_rejects_empty_queue() {
        let manager = manager(Arc::new(InMemoryWorkerFactory::new()), vec![]);
        let err = manager.scale_workers("", 1).await.unwrap_err();
        assert!(err.is_config_error());
    }

    #[tokio::test]
    async fn test_metrics() {
        let factory = Arc::new(InMemoryWorkerFactory::new());
        let manager = manager(
            factory.clone(),
            vec![
                WorkerConfig::new("a", "q1"),
                WorkerConfig::new("b", "q1"),
                WorkerConfig::new("c", "q2").with_auto_start(false),
            ],
        );
        manager.start().await.unwrap();
        manager
            .pool()
            .add_worker(WorkerConfig::new("c", "q2").with_auto_start(false))
            .await
            .unwrap();

        // "c" exits with an error and is not restarted.
        factory.created()[2].fail("bad input");
        tokio::time::timeout(Duration::from_secs(5), async {
            while manager.metrics().await.stopped_workers == 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        let metrics = manager.metrics().await;
        assert_eq!(metrics.total_workers, 3);
        assert_eq!(metrics.running_workers, 2);
        assert_eq!(metrics.stopped_workers, 1);
        assert_eq!(metrics.task_queues.get("q1"), Some(&2));
        assert_eq!(metrics.task_queues.get("q2"), Some(&1));
        assert_eq!(metrics.error_counts.len(), 1);
        assert_eq!(metrics.error_counts.get("c"), Some(&1));

        assert!(manager.health_check().await.is_ok());

        manager.stop(Duration::from_secs(1)).await.unwrap();
    }
}
