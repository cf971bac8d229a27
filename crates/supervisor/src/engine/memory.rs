//! In-memory engine for tests and local runs
//!
//! [`InMemoryWorkerFactory`] hands out runnables that idle until they are
//! stopped, and keeps an [`InMemoryWorkerHandle`] for each one so callers
//! can inject failures, simulate hung workers and dispatch tasks to bound
//! handlers.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::anyhow;
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tokio::sync::watch;
use tracing::debug;

use super::runnable::{
    HandlerKind, HandlerResult, QueueHandlers, RegisteredHandler, Runnable, WorkerFactory,
};
use crate::config::WorkerOptions;

#[derive(Debug, Clone, PartialEq)]
enum Command {
    Run,
    Stop,
    Fail(String),
    Panic(String),
}

struct Shared {
    id: u64,
    task_queue: String,
    options: WorkerOptions,
    commands: watch::Sender<Command>,
    handlers: RwLock<QueueHandlers>,
    ignore_stop: AtomicBool,
    running: AtomicBool,
    runs: AtomicU32,
    stop_requests: AtomicU32,
}

struct RunningGuard<'a>(&'a AtomicBool);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Runnable produced by [`InMemoryWorkerFactory`]
pub struct InMemoryRunnable {
    shared: Arc<Shared>,
}

#[async_trait]
impl Runnable for InMemoryRunnable {
    fn bind_handler(&mut self, name: &str, handler: RegisteredHandler) {
        self.shared
            .handlers
            .write()
            .insert((handler.kind, name.to_string()), handler);
    }

    async fn run(&self, mut interrupt: watch::Receiver<bool>) -> anyhow::Result<()> {
        let shared = &self.shared;
        let mut commands = shared.commands.subscribe();
        let mut interrupt_open = true;

        shared.runs.fetch_add(1, Ordering::SeqCst);
        shared.running.store(true, Ordering::SeqCst);
        let _guard = RunningGuard(&shared.running);
        debug!(runnable = shared.id, task_queue = %shared.task_queue, "In-memory worker running");

        loop {
            let command = commands.borrow_and_update().clone();
            match command {
                Command::Run => {}
                Command::Stop => return Ok(()),
                Command::Fail(message) => return Err(anyhow!(message)),
                Command::Panic(message) => panic!("{}", message),
            }

            let ignore_stop = shared.ignore_stop.load(Ordering::SeqCst);
            if interrupt_open && *interrupt.borrow_and_update() && !ignore_stop {
                return Ok(());
            }

            tokio::select! {
                changed = commands.changed() => {
                    if changed.is_err() {
                        return Ok(());
                    }
                }
                changed = interrupt.changed(), if interrupt_open => {
                    if changed.is_err() {
                        interrupt_open = false;
                        if !shared.ignore_stop.load(Ordering::SeqCst) {
                            return Ok(());
                        }
                    }
                }
            }
        }
    }

    fn request_stop(&self) {
        self.shared.stop_requests.fetch_add(1, Ordering::SeqCst);
        if !self.shared.ignore_stop.load(Ordering::SeqCst) {
            self.shared.commands.send_replace(Command::Stop);
        }
    }
}

/// Control handle for one in-memory runnable
#[derive(Clone)]
pub struct InMemoryWorkerHandle {
    shared: Arc<Shared>,
}

impl InMemoryWorkerHandle {
    /// Creation sequence number, unique per factory
    pub fn id(&self) -> u64 {
        self.shared.id
    }

    /// Task queue the runnable was created for
    pub fn task_queue(&self) -> &str {
        &self.shared.task_queue
    }

    /// Options the runnable was created with
    pub fn options(&self) -> &WorkerOptions {
        &self.shared.options
    }

    /// Make `run` return with an error
    pub fn fail(&self, message: impl Into<String>) {
        self.shared.commands.send_replace(Command::Fail(message.into()));
    }

    /// Make `run` panic
    pub fn panic(&self, message: impl Into<String>) {
        self.shared
            .commands
            .send_replace(Command::Panic(message.into()));
    }

    /// Make `run` return cleanly, as if the engine shut the worker down
    pub fn finish(&self) {
        self.shared.commands.send_replace(Command::Stop);
    }

    /// Ignore stop requests and interrupts, simulating a hung worker
    pub fn hang_on_stop(&self, hang: bool) {
        self.shared.ignore_stop.store(hang, Ordering::SeqCst);
    }

    /// Whether `run` is currently executing
    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    /// Number of times `run` was entered
    pub fn run_count(&self) -> u32 {
        self.shared.runs.load(Ordering::SeqCst)
    }

    /// Number of `request_stop` calls received
    pub fn stop_requests(&self) -> u32 {
        self.shared.stop_requests.load(Ordering::SeqCst)
    }

    /// Names of the bound handlers of one kind, sorted
    pub fn bound_handlers(&self, kind: HandlerKind) -> Vec<String> {
        self.shared
            .handlers
            .read()
            .keys()
            .filter(|(k, _)| *k == kind)
            .map(|(_, name)| name.clone())
            .collect()
    }

    /// Dispatch a task to a bound handler
    pub async fn execute(&self, kind: HandlerKind, name: &str, input: Value) -> HandlerResult {
        let handler = self
            .shared
            .handlers
            .read()
            .get(&(kind, name.to_string()))
            .cloned();
        match handler {
            Some(handler) => handler.invoke(input).await,
            None => Err(format!("no {} handler bound for {}", kind, name)),
        }
    }
}

impl std::fmt::Debug for InMemoryWorkerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryWorkerHandle")
            .field("id", &self.shared.id)
            .field("task_queue", &self.shared.task_queue)
            .field("running", &self.is_running())
            .finish()
    }
}

/// Worker factory backed by in-memory runnables
///
/// # Example
///
/// ```
/// use taskpool_supervisor::config::WorkerOptions;
/// use taskpool_supervisor::engine::{InMemoryWorkerFactory, WorkerFactory};
///
/// let factory = InMemoryWorkerFactory::new();
/// factory.fail_next_creates(1);
///
/// assert!(factory.create("q1", &WorkerOptions::default()).is_err());
/// assert!(factory.create("q1", &WorkerOptions::default()).is_ok());
/// assert_eq!(factory.created().len(), 1);
/// ```
#[derive(Default)]
pub struct InMemoryWorkerFactory {
    created: Mutex<Vec<InMemoryWorkerHandle>>,
    pending_failures: AtomicU32,
    attempts: AtomicU32,
    next_id: AtomicU64,
}

impl InMemoryWorkerFactory {
    /// Create a new factory
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `count` calls to `create`
    pub fn fail_next_creates(&self, count: u32) {
        self.pending_failures.store(count, Ordering::SeqCst);
    }

    /// Handles for every runnable created so far, in creation order
    pub fn created(&self) -> Vec<InMemoryWorkerHandle> {
        self.created.lock().clone()
    }

    /// Handles for runnables created for one task queue, in creation order
    pub fn created_for_queue(&self, task_queue: &str) -> Vec<InMemoryWorkerHandle> {
        self.created
            .lock()
            .iter()
            .filter(|h| h.task_queue() == task_queue)
            .cloned()
            .collect()
    }

    /// Most recently created runnable
    pub fn last_created(&self) -> Option<InMemoryWorkerHandle> {
        self.created.lock().last().cloned()
    }

    /// Number of `create` calls, including failed ones
    pub fn create_attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }
}

impl WorkerFactory for InMemoryWorkerFactory {
    fn create(
        &self,
        task_queue: &str,
        options: &WorkerOptions,
    ) -> anyhow::Result<Box<dyn Runnable>> {
        self.attempts.fetch_add(1, Ordering::SeqCst);

        let should_fail = self
            .pending_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if should_fail {
            return Err(anyhow!(
                "failed to create worker for task queue {}",
                task_queue
            ));
        }

        let (commands, _) = watch::channel(Command::Run);
        let shared = Arc::new(Shared {
            id: self.next_id.fetch_add(1, Ordering::SeqCst),
            task_queue: task_queue.to_string(),
            options: options.clone(),
            commands,
            handlers: RwLock::new(QueueHandlers::new()),
            ignore_stop: AtomicBool::new(false),
            running: AtomicBool::new(false),
            runs: AtomicU32::new(0),
            stop_requests: AtomicU32::new(0),
        });

        self.created.lock().push(InMemoryWorkerHandle {
            shared: Arc::clone(&shared),
        });

        Ok(Box::new(InMemoryRunnable { shared }))
    }
}
