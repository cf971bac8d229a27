//! Integration tests for pool supervision
//!
//! Run with: cargo test -p taskpool-supervisor --test pool_supervision_test
//!
//! All tests use the in-memory engine and short monitor intervals.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use taskpool_supervisor::config::{PoolConfig, WorkerConfig};
use taskpool_supervisor::engine::{HandlerKind, InMemoryWorkerFactory, TaskQueueRegistry};
use taskpool_supervisor::{HealthCheckError, PoolError, RestartPolicy, WorkerManager, WorkerPool};

const FAST_MONITOR: Duration = Duration::from_millis(25);

fn fast_settings() -> PoolConfig {
    PoolConfig::default()
        .with_health_check_interval(FAST_MONITOR)
        .with_stop_timeout(Duration::from_millis(200))
        .with_restart_policy(RestartPolicy::fixed(Duration::from_millis(50)))
}

fn new_pool(factory: &Arc<InMemoryWorkerFactory>, configs: Vec<WorkerConfig>) -> WorkerPool {
    WorkerPool::new(
        factory.clone(),
        Arc::new(TaskQueueRegistry::new()),
        configs,
        fast_settings(),
    )
}

/// Poll an async condition until it holds or five seconds pass
macro_rules! eventually {
    ($cond:expr) => {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if $cond {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect(concat!("condition never held: ", stringify!($cond)))
    };
}

// =============================================================================
// Start / stop
// =============================================================================

#[test_log::test(tokio::test)]
async fn test_all_workers_running_when_start_returns() {
    let factory = Arc::new(InMemoryWorkerFactory::new());
    let configs: Vec<WorkerConfig> = (0..5)
        .map(|i| WorkerConfig::new(format!("w{}", i), "q1"))
        .collect();
    let pool = new_pool(&factory, configs);

    pool.start().await.unwrap();

    let status = pool.status().await;
    assert_eq!(status.total_workers, 5);
    assert_eq!(status.running_workers, 5);
    assert_eq!(status.stopped_workers, 0);

    pool.stop(Duration::from_secs(1)).await.unwrap();

    let status = pool.status().await;
    assert_eq!(status.running_workers, 0);
    assert!(factory.created().iter().all(|h| !h.is_running()));
}

#[tokio::test]
async fn test_stop_reports_every_hung_worker() {
    let factory = Arc::new(InMemoryWorkerFactory::new());
    let pool = new_pool(
        &factory,
        vec![
            WorkerConfig::new("a", "q1"),
            WorkerConfig::new("b", "q1"),
            WorkerConfig::new("c", "q1"),
        ],
    );
    pool.start().await.unwrap();

    let created = factory.created();
    created[0].hang_on_stop(true);
    created[2].hang_on_stop(true);

    let err = pool.stop(Duration::from_millis(50)).await.unwrap_err();
    match err {
        PoolError::StopFailed(errors) => {
            assert_eq!(errors.len(), 2);
            assert!(errors.iter().all(PoolError::is_timeout));
        }
        other => panic!("expected StopFailed, got {other:?}"),
    }

    // The well-behaved worker stopped despite the others hanging.
    assert!(!created[1].is_running());
    assert!(!pool.get_worker("b").await.unwrap().is_running);

    for handle in &created {
        handle.hang_on_stop(false);
        handle.finish();
    }
}

#[tokio::test]
async fn test_no_restarts_after_stop() {
    let factory = Arc::new(InMemoryWorkerFactory::new());
    let pool = new_pool(&factory, vec![WorkerConfig::new("a", "q1")]);
    pool.start().await.unwrap();
    pool.stop(Duration::from_secs(1)).await.unwrap();

    pool.request_restart();
    tokio::time::sleep(FAST_MONITOR * 4).await;

    assert_eq!(factory.created().len(), 1);
    assert!(!pool.get_worker("a").await.unwrap().is_running);
}

// =============================================================================
// Add / remove / restart
// =============================================================================

#[tokio::test]
async fn test_add_existing_name_is_config_error() {
    let factory = Arc::new(InMemoryWorkerFactory::new());
    let pool = new_pool(&factory, vec![WorkerConfig::new("a", "q1")]);
    pool.start().await.unwrap();

    let before = pool.list_workers().await;
    let err = pool
        .add_worker(WorkerConfig::new("a", "q9"))
        .await
        .unwrap_err();
    assert!(err.is_config_error());

    assert_eq!(pool.list_workers().await, before);
    pool.stop(Duration::from_secs(1)).await.unwrap();
}

#[tokio::test]
async fn test_remove_missing_is_not_found() {
    let factory = Arc::new(InMemoryWorkerFactory::new());
    let pool = new_pool(&factory, vec![]);
    pool.start().await.unwrap();

    let err = pool.remove_worker("missing").await.unwrap_err();
    assert!(matches!(err, PoolError::NotFound(ref name) if name == "missing"));

    pool.stop(Duration::from_secs(1)).await.unwrap();
}

#[tokio::test]
async fn test_remove_stops_and_deletes() {
    let factory = Arc::new(InMemoryWorkerFactory::new());
    let pool = new_pool(
        &factory,
        vec![WorkerConfig::new("a", "q1"), WorkerConfig::new("b", "q1")],
    );
    pool.start().await.unwrap();

    pool.remove_worker("a").await.unwrap();

    assert!(!pool.contains("a").await);
    assert!(!factory.created()[0].is_running());
    assert!(pool.get_worker("b").await.unwrap().is_running);

    pool.stop(Duration::from_secs(1)).await.unwrap();
}

#[tokio::test]
async fn test_remove_hung_worker_times_out_and_keeps_entry() {
    let factory = Arc::new(InMemoryWorkerFactory::new());
    let pool = new_pool(&factory, vec![WorkerConfig::new("a", "q1")]);
    pool.start().await.unwrap();

    let handle = factory.created()[0].clone();
    handle.hang_on_stop(true);

    let err = pool.remove_worker("a").await.unwrap_err();
    assert!(err.is_timeout());
    assert!(pool.contains("a").await);

    handle.hang_on_stop(false);
    handle.finish();
    pool.remove_worker("a").await.unwrap();
    assert!(!pool.contains("a").await);

    pool.stop(Duration::from_secs(1)).await.unwrap();
}

#[tokio::test]
async fn test_manual_restart_of_running_worker() {
    let factory = Arc::new(InMemoryWorkerFactory::new());
    let pool = new_pool(&factory, vec![WorkerConfig::new("a", "q1")]);
    pool.start().await.unwrap();

    let before = pool.get_worker("a").await.unwrap();
    pool.restart_worker("a").await.unwrap();
    let after = pool.get_worker("a").await.unwrap();

    assert_ne!(before.instance_id, after.instance_id);
    assert!(after.is_running);
    assert_eq!(after.error_count, 0);
    assert!(!factory.created()[0].is_running());

    pool.stop(Duration::from_secs(1)).await.unwrap();
}

// =============================================================================
// Health monitor
// =============================================================================

#[test_log::test(tokio::test)]
async fn test_failed_worker_is_restarted_and_others_unaffected() {
    let factory = Arc::new(InMemoryWorkerFactory::new());
    let pool = new_pool(
        &factory,
        vec![WorkerConfig::new("A", "q1"), WorkerConfig::new("B", "q1")],
    );
    pool.start().await.unwrap();

    let status = pool.status().await;
    assert_eq!(status.running_workers, 2);
    let a_before = status.workers["A"].instance_id;
    let b_before = status.workers["B"].instance_id;

    // Start creates workers in config order.
    factory.created()[0].fail("lost connection to engine");

    eventually!(pool
        .get_worker("A")
        .await
        .is_some_and(|a| a.is_running && a.instance_id != a_before));

    let status = pool.status().await;
    let a = &status.workers["A"];
    let b = &status.workers["B"];
    assert_eq!(a.error_count, 1);
    assert_eq!(a.last_error.as_deref(), Some("lost connection to engine"));
    assert_eq!(b.error_count, 0);
    assert_eq!(b.instance_id, b_before);
    assert!(b.is_running);
    assert_eq!(status.running_workers, 2);

    pool.stop(Duration::from_secs(1)).await.unwrap();
}

#[test_log::test(tokio::test)]
async fn test_simultaneous_failures_restart_each_worker_once() {
    let factory = Arc::new(InMemoryWorkerFactory::new());
    let pool = new_pool(
        &factory,
        vec![
            WorkerConfig::new("a", "q1"),
            WorkerConfig::new("b", "q1"),
            WorkerConfig::new("c", "q2"),
        ],
    );
    pool.start().await.unwrap();

    let before = pool.status().await;
    for handle in factory.created() {
        handle.fail("engine restarted");
    }

    eventually!(factory.created().len() == 6);
    eventually!(pool.status().await.running_workers == 3);

    // Several more monitor intervals must not produce extra instances.
    tokio::time::sleep(FAST_MONITOR * 8).await;
    assert_eq!(factory.created().len(), 6);
    assert_eq!(factory.create_attempts(), 6);

    let after = pool.status().await;
    assert_eq!(after.running_workers, 3);
    for name in ["a", "b", "c"] {
        let old = &before.workers[name];
        let new = &after.workers[name];
        assert_ne!(old.instance_id, new.instance_id, "worker {} not replaced", name);
        assert!(new.is_running);
        assert_eq!(new.error_count, 1);
    }
    assert_eq!(factory.created_for_queue("q1").len(), 4);
    assert_eq!(factory.created_for_queue("q2").len(), 2);
    assert!(factory.created()[3..].iter().all(|h| h.is_running()));

    pool.stop(Duration::from_secs(1)).await.unwrap();
}

#[tokio::test]
async fn test_each_failed_run_counts_once() {
    let factory = Arc::new(InMemoryWorkerFactory::new());
    let pool = new_pool(&factory, vec![WorkerConfig::new("a", "q1")]);
    pool.start().await.unwrap();

    for round in 1..=3u64 {
        let current = factory.last_created().unwrap();
        current.fail(format!("failure {}", round));
        eventually!(factory.created().len() as u64 == round + 1);
        eventually!(pool.get_worker("a").await.is_some_and(|a| a.is_running));
        assert_eq!(pool.get_worker("a").await.unwrap().error_count, round);
    }

    pool.stop(Duration::from_secs(1)).await.unwrap();
}

#[tokio::test]
async fn test_panicking_worker_is_restarted() {
    let factory = Arc::new(InMemoryWorkerFactory::new());
    let pool = new_pool(&factory, vec![WorkerConfig::new("a", "q1")]);
    pool.start().await.unwrap();

    factory.created()[0].panic("handler bug");
    eventually!(factory.created().len() == 2);
    eventually!(pool.get_worker("a").await.is_some_and(|a| a.is_running));

    let status = pool.get_worker("a").await.unwrap();
    assert_eq!(status.error_count, 1);
    assert!(status.last_error.unwrap().contains("handler bug"));

    pool.stop(Duration::from_secs(1)).await.unwrap();
}

#[tokio::test]
async fn test_restart_retries_after_factory_failure() {
    let factory = Arc::new(InMemoryWorkerFactory::new());
    let pool = new_pool(&factory, vec![WorkerConfig::new("a", "q1")]);
    pool.start().await.unwrap();

    factory.fail_next_creates(2);
    factory.created()[0].fail("boom");

    eventually!(factory.created().len() == 2);
    eventually!(pool.get_worker("a").await.is_some_and(|a| a.is_running));

    // Initial start, two failed restarts, one successful restart.
    assert_eq!(factory.create_attempts(), 4);
    // One failed run plus two failed restarts.
    assert_eq!(pool.get_worker("a").await.unwrap().error_count, 3);

    pool.stop(Duration::from_secs(1)).await.unwrap();
}

#[tokio::test]
async fn test_restart_attempt_cap() {
    let factory = Arc::new(InMemoryWorkerFactory::new());
    let pool = WorkerPool::new(
        factory.clone(),
        Arc::new(TaskQueueRegistry::new()),
        vec![WorkerConfig::new("a", "q1")],
        fast_settings().with_restart_policy(
            RestartPolicy::fixed(Duration::from_millis(10)).with_max_attempts(2),
        ),
    );
    pool.start().await.unwrap();

    factory.fail_next_creates(100);
    factory.created()[0].fail("boom");

    eventually!(factory.create_attempts() == 3);
    tokio::time::sleep(FAST_MONITOR * 6).await;
    assert_eq!(factory.create_attempts(), 3);
    assert!(!pool.get_worker("a").await.unwrap().is_running);

    // A manual restart clears the cap.
    factory.fail_next_creates(0);
    pool.restart_worker("a").await.unwrap();
    assert!(pool.get_worker("a").await.unwrap().is_running);

    pool.stop(Duration::from_secs(1)).await.unwrap();
}

#[tokio::test]
async fn test_request_restart_triggers_immediate_pass() {
    let factory = Arc::new(InMemoryWorkerFactory::new());
    let pool = WorkerPool::new(
        factory.clone(),
        Arc::new(TaskQueueRegistry::new()),
        vec![WorkerConfig::new("a", "q1")],
        PoolConfig::default(),
    );
    pool.start().await.unwrap();

    factory.created()[0].finish();
    eventually!(pool.get_worker("a").await.is_some_and(|a| !a.is_running));

    // The 30s tick is far away; an explicit request restarts right away.
    pool.request_restart();
    eventually!(pool.get_worker("a").await.is_some_and(|a| a.is_running));
    assert_eq!(pool.get_worker("a").await.unwrap().error_count, 0);

    pool.stop(Duration::from_secs(1)).await.unwrap();
}

// =============================================================================
// Handler binding
// =============================================================================

#[tokio::test]
async fn test_workers_get_handlers_for_their_queue() {
    let registry = TaskQueueRegistry::builder()
        .workflow("order_flow", &["orders"], |input| async move { Ok(input) })
        .activity("charge", &["orders", "billing"], |input| async move {
            Ok(json!({ "charged": input["amount"] }))
        })
        .activity("refund", &["billing"], |_| async move { Ok(json!("refunded")) })
        .build()
        .unwrap();

    let factory = Arc::new(InMemoryWorkerFactory::new());
    let pool = WorkerPool::new(
        factory.clone(),
        Arc::new(registry),
        vec![
            WorkerConfig::new("orders-1", "orders"),
            WorkerConfig::new("billing-1", "billing"),
        ],
        fast_settings(),
    );
    pool.start().await.unwrap();

    let orders = factory.created_for_queue("orders")[0].clone();
    let billing = factory.created_for_queue("billing")[0].clone();
    assert_eq!(orders.bound_handlers(HandlerKind::Workflow), vec!["order_flow"]);
    assert_eq!(orders.bound_handlers(HandlerKind::Activity), vec!["charge"]);
    assert!(billing.bound_handlers(HandlerKind::Workflow).is_empty());
    assert_eq!(billing.bound_handlers(HandlerKind::Activity), vec!["charge", "refund"]);

    let result = orders
        .execute(HandlerKind::Activity, "charge", json!({ "amount": 42 }))
        .await;
    assert_eq!(result, Ok(json!({ "charged": 42 })));

    // Restarted instances are bound again.
    pool.restart_worker("billing-1").await.unwrap();
    let billing = factory.created_for_queue("billing").pop().unwrap();
    assert_eq!(billing.bound_handlers(HandlerKind::Activity), vec!["charge", "refund"]);

    pool.stop(Duration::from_secs(1)).await.unwrap();
}

// =============================================================================
// Manager
// =============================================================================

#[tokio::test]
async fn test_scale_up_and_down() {
    let factory = Arc::new(InMemoryWorkerFactory::new());
    let manager = WorkerManager::new(
        factory.clone(),
        Arc::new(TaskQueueRegistry::new()),
        vec![WorkerConfig::new("a", "q1"), WorkerConfig::new("x", "q2")],
        fast_settings(),
    );
    manager.start().await.unwrap();

    manager.scale_workers("q1", 4).await.unwrap();
    let metrics = manager.metrics().await;
    assert_eq!(metrics.task_queues["q1"], 4);
    assert_eq!(metrics.task_queues["q2"], 1);
    assert_eq!(metrics.running_workers, 5);

    manager.scale_workers("q1", 2).await.unwrap();
    let names: Vec<String> = manager
        .pool()
        .workers_for_queue("q1")
        .await
        .into_iter()
        .map(|w| w.name)
        .collect();
    assert_eq!(names, vec!["a", "q1-worker-1"]);

    // Scaling to the current size is a no-op.
    manager.scale_workers("q1", 2).await.unwrap();
    assert_eq!(manager.pool().workers_for_queue("q1").await.len(), 2);

    manager.scale_workers("q1", 0).await.unwrap();
    assert!(manager.pool().workers_for_queue("q1").await.is_empty());
    assert!(manager.pool().contains("x").await);

    manager.stop(Duration::from_secs(1)).await.unwrap();
}

#[tokio::test]
async fn test_health_check_verdicts() {
    let factory = Arc::new(InMemoryWorkerFactory::new());
    let manager = WorkerManager::new(
        factory.clone(),
        Arc::new(TaskQueueRegistry::new()),
        vec![],
        PoolConfig::default(),
    );
    manager.start().await.unwrap();

    assert_eq!(
        manager.health_check().await,
        Err(HealthCheckError::NoWorkersRunning)
    );

    for name in ["a", "b", "c"] {
        manager
            .pool()
            .add_worker(WorkerConfig::new(name, "q1").with_auto_start(false))
            .await
            .unwrap();
    }
    assert_eq!(manager.health_check().await, Ok(()));

    factory.created()[0].finish();
    eventually!(manager.metrics().await.stopped_workers == 1);
    assert_eq!(manager.health_check().await, Ok(()));

    factory.created()[1].finish();
    eventually!(manager.metrics().await.stopped_workers == 2);
    assert_eq!(
        manager.health_check().await,
        Err(HealthCheckError::TooManyStopped { stopped: 2, total: 3 })
    );

    factory.created()[2].finish();
    eventually!(manager.metrics().await.stopped_workers == 3);
    assert_eq!(
        manager.health_check().await,
        Err(HealthCheckError::NoWorkersRunning)
    );

    manager.stop(Duration::from_secs(1)).await.unwrap();
}

#[tokio::test]
async fn test_concurrent_operations_keep_counts_consistent() {
    let factory = Arc::new(InMemoryWorkerFactory::new());
    let pool = Arc::new(new_pool(&factory, vec![]));
    pool.start().await.unwrap();

    let mut tasks = Vec::new();
    for i in 0..8 {
        let pool = Arc::clone(&pool);
        tasks.push(tokio::spawn(async move {
            let name = format!("w{}", i);
            pool.add_worker(WorkerConfig::new(name.clone(), "q1")).await.unwrap();
            let status = pool.status().await;
            assert_eq!(
                status.total_workers,
                status.running_workers + status.stopped_workers
            );
            if i % 2 == 0 {
                pool.remove_worker(&name).await.unwrap();
            } else {
                pool.restart_worker(&name).await.unwrap();
            }
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    let status = pool.status().await;
    assert_eq!(status.total_workers, 4);
    assert_eq!(status.running_workers, 4);

    pool.stop(Duration::from_secs(1)).await.unwrap();
}
