//! Health monitor
//!
//! One background loop per pool. Every tick it scans for workers whose run
//! has ended and raises a restart request; a restart request (from a tick,
//! from [`WorkerPool::request_restart`](super::WorkerPool::request_restart)
//! or from a scheduled retry) runs one restart pass over all dead workers.
//! Requests coalesce: [`Notify`] stores at most one permit, and a pass drains
//! the permit left by requests raised before it started.

use std::sync::atomic::Ordering;
use std::sync::{Arc, Weak};
use std::time::Duration;

use futures::FutureExt;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use super::worker_pool::PoolShared;

/// Consecutive restart failures of one worker
#[derive(Debug, Clone, Copy)]
pub(crate) struct RestartBackoff {
    pub failures: u32,
    /// The worker is skipped by restart passes before this instant
    pub retry_at: Instant,
}

pub(crate) struct HealthMonitor {
    pool: Weak<PoolShared>,
    shutdown_rx: watch::Receiver<bool>,
    restart_signal: Arc<Notify>,
    interval: Duration,
}

impl HealthMonitor {
    pub(crate) fn new(pool: &Arc<PoolShared>) -> Self {
        Self {
            pool: Arc::downgrade(pool),
            shutdown_rx: pool.shutdown_tx.subscribe(),
            restart_signal: Arc::clone(&pool.restart_signal),
            interval: pool.settings.health_check_interval,
        }
    }

    pub(crate) fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    async fn run(self) {
        let HealthMonitor {
            pool,
            mut shutdown_rx,
            restart_signal,
            interval,
        } = self;

        info!(interval_ms = interval.as_millis() as u64, "Health monitor started");

        let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            if *shutdown_rx.borrow() {
                break;
            }

            tokio::select! {
                changed = shutdown_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    let Some(pool) = pool.upgrade() else { break };
                    check_health(&pool).await;
                }
                _ = restart_signal.notified() => {
                    // Requests raised before this pass starts are served by it.
                    let _ = restart_signal.notified().now_or_never();
                    let Some(pool) = pool.upgrade() else { break };
                    restart_dead_workers(&pool).await;
                }
            }
        }

        debug!("Health monitor exited");
    }
}

/// Raise one restart request if any worker is not running
async fn check_health(pool: &PoolShared) {
    let workers = pool.workers.read().await;

    let mut dead = 0usize;
    for worker in workers.iter() {
        if worker.is_running() {
            continue;
        }
        dead += 1;
        if worker.config().auto_start {
            warn!(
                worker = %worker.name(),
                task_queue = %worker.task_queue(),
                "Worker is not running, scheduling restart"
            );
        } else {
            debug!(worker = %worker.name(), "Worker is stopped and not auto-started");
        }
    }

    debug!(workers = workers.len(), dead, "Health check complete");

    if dead > 0 {
        pool.restart_signal.notify_one();
    }
}

/// Replace every dead auto-start worker with a fresh instance
async fn restart_dead_workers(pool: &PoolShared) {
    let mut workers = pool.workers.write().await;
    if pool.is_shut_down() {
        return;
    }

    let candidates: Vec<String> = workers
        .in_add_order()
        .into_iter()
        .filter(|worker| !worker.is_running() && worker.config().auto_start)
        .map(|worker| worker.name().to_string())
        .collect();

    let pass = pool.restart_passes.fetch_add(1, Ordering::SeqCst) + 1;
    debug!(pass, candidates = candidates.len(), "Running restart pass");

    let policy = &pool.settings.restart_policy;

    for name in candidates {
        let backoff = pool.restart_failures.lock().get(&name).copied();
        if let Some(backoff) = backoff {
            if !policy.has_attempts_remaining(backoff.failures) {
                debug!(worker = %name, attempts = backoff.failures, "Restart attempts exhausted");
                continue;
            }
            if Instant::now() < backoff.retry_at {
                debug!(worker = %name, "Restart backoff not elapsed");
                continue;
            }
        }

        let Some(stale) = workers.get(&name) else {
            continue;
        };

        info!(worker = %name, "Attempting to restart worker");
        if let Err(e) = stale.stop(pool.settings.stop_timeout).await {
            warn!(worker = %name, error = %e, "Ignoring stop error on dead worker");
        }

        let config = stale.config().clone();
        match pool.spawn_worker(&config) {
            Ok(fresh) => {
                fresh.inherit_history(stale);
                workers.replace(fresh);
                pool.restart_failures.lock().remove(&name);
                info!(worker = %name, task_queue = %config.task_queue, "Successfully restarted worker");
            }
            Err(e) => {
                stale.record_error(e.to_string());

                let failures = backoff.map_or(0, |b| b.failures) + 1;
                let delay = policy.delay_for_attempt(failures);
                pool.restart_failures.lock().insert(
                    name.clone(),
                    RestartBackoff {
                        failures,
                        retry_at: Instant::now() + delay,
                    },
                );

                if policy.has_attempts_remaining(failures) {
                    error!(
                        worker = %name,
                        error = %e,
                        attempt = failures,
                        retry_in_ms = delay.as_millis() as u64,
                        "Failed to restart worker"
                    );
                    schedule_retry(
                        Arc::clone(&pool.restart_signal),
                        pool.shutdown_tx.subscribe(),
                        delay,
                    );
                } else {
                    error!(
                        worker = %name,
                        error = %e,
                        attempts = failures,
                        "Failed to restart worker, giving up"
                    );
                }
            }
        }
    }
}

/// Raise a restart request after `delay` unless the pool shuts down first
fn schedule_retry(signal: Arc<Notify>, mut shutdown_rx: watch::Receiver<bool>, delay: Duration) {
    tokio::spawn(async move {
        if *shutdown_rx.borrow() {
            return;
        }
        tokio::select! {
            _ = tokio::time::sleep(delay) => signal.notify_one(),
            _ = shutdown_rx.changed() => {}
        }
    });
}
