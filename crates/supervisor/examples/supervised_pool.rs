//! Supervised pool demo on the in-memory engine
//!
//! Run with: cargo run -p taskpool-supervisor --example supervised_pool [config.json]
//!
//! Without a config file a single worker is configured from the environment
//! (`TASKPOOL_TASK_QUEUE`, `TASKPOOL_*` pool settings). The demo scales the
//! queue, crashes one worker to show the health monitor at work, prints
//! metrics as JSON and shuts down on Ctrl-C or after the demo completes.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde_json::{json, Value};
use taskpool_supervisor::engine::{HandlerKind, InMemoryWorkerFactory, TaskQueueRegistry};
use taskpool_supervisor::telemetry::{init_telemetry, TelemetryConfig};
use taskpool_supervisor::{SupervisorConfig, WorkerManager};

#[tokio::main]
async fn main() -> Result<()> {
    let mut telemetry_config = TelemetryConfig::from_env();
    if telemetry_config.log_filter.is_none() {
        telemetry_config.log_filter = Some("taskpool_supervisor=debug,supervised_pool=info".into());
    }
    init_telemetry(telemetry_config).context("Failed to initialize logging")?;

    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let config = SupervisorConfig::load(config_path.as_deref()).context("Failed to load config")?;
    let stop_timeout = config.pool.stop_timeout;

    tracing::info!(
        workers = config.workers.len(),
        health_check_interval_ms = config.pool.health_check_interval.as_millis() as u64,
        "Starting supervised pool demo"
    );

    let queues: Vec<String> = config.workers.iter().map(|w| w.task_queue.clone()).collect();
    let registry = TaskQueueRegistry::new();
    let queue_refs: Vec<&str> = queues.iter().map(String::as_str).collect();
    registry
        .register_activity("echo", &queue_refs, |input: Value| async move {
            Ok(json!({ "echo": input }))
        })
        .context("Failed to register handlers")?;

    let factory = Arc::new(InMemoryWorkerFactory::new());
    let manager = WorkerManager::from_config(factory.clone(), Arc::new(registry), config);
    manager.start().await?;

    tokio::select! {
        result = run_demo(&manager, &factory, &queues) => {
            if let Err(e) = result {
                tracing::error!(error = %e, "Demo failed");
            }
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Received shutdown signal");
        }
    }

    manager.stop(stop_timeout).await?;
    tracing::info!("Supervised pool demo complete");
    Ok(())
}

async fn run_demo(
    manager: &WorkerManager,
    factory: &InMemoryWorkerFactory,
    queues: &[String],
) -> Result<()> {
    let Some(queue) = queues.first() else {
        return Ok(());
    };

    manager.scale_workers(queue, 3).await?;
    print_metrics(manager).await?;

    let handle = factory
        .last_created()
        .context("No worker has been created")?;
    let reply = handle
        .execute(HandlerKind::Activity, "echo", json!({ "hello": "world" }))
        .await
        .map_err(anyhow::Error::msg)?;
    tracing::info!(%reply, "Dispatched task to a worker");

    handle.fail("simulated crash");
    tokio::time::sleep(Duration::from_millis(100)).await;
    manager.pool().request_restart();
    tokio::time::sleep(Duration::from_millis(500)).await;
    print_metrics(manager).await?;

    match manager.health_check().await {
        Ok(()) => tracing::info!("Pool is healthy"),
        Err(e) => tracing::warn!(error = %e, "Pool is unhealthy"),
    }

    manager.scale_workers(queue, 1).await?;
    print_metrics(manager).await?;
    Ok(())
}

async fn print_metrics(manager: &WorkerManager) -> Result<()> {
    let metrics = manager.metrics().await;
    println!("{}", serde_json::to_string_pretty(&metrics)?);
    Ok(())
}
