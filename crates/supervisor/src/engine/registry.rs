//! Task-queue handler registry
//!
//! Maps workflow and activity handlers to the task queues they are served
//! on. A worker created for a queue gets every handler registered for it.

use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::runnable::{
    HandlerKind, HandlerRegistry, HandlerResult, QueueHandlers, RegisteredHandler,
};

/// Queue used when a handler is registered without any
pub const DEFAULT_TASK_QUEUE: &str = "default";

/// Errors from registry operations
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    /// A handler of this kind with this name already exists
    #[error("{kind} {name} already registered")]
    AlreadyRegistered { kind: HandlerKind, name: String },

    /// No handler of this kind with this name
    #[error("{kind} {name} not found")]
    NotFound { kind: HandlerKind, name: String },

    /// Handler name is empty
    #[error("handler name is required")]
    EmptyName,
}

struct Registration {
    handler: RegisteredHandler,
    task_queues: Vec<String>,
    description: Option<String>,
    registered_at: DateTime<Utc>,
}

/// Serializable description of one registered handler
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HandlerInfo {
    pub name: String,
    pub kind: HandlerKind,
    pub task_queues: Vec<String>,
    pub description: Option<String>,
    pub registered_at: DateTime<Utc>,
}

/// Point-in-time listing of the registry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegistrySnapshot {
    pub workflows: Vec<HandlerInfo>,
    pub activities: Vec<HandlerInfo>,
    pub taken_at: DateTime<Utc>,
}

/// Thread-safe registry of workflow and activity handlers
///
/// Names are unique per kind: a workflow and an activity may share one.
///
/// # Example
///
/// ```
/// use serde_json::{json, Value};
/// use taskpool_supervisor::engine::{HandlerRegistry, TaskQueueRegistry};
///
/// let registry = TaskQueueRegistry::new();
/// registry
///     .register_activity("send_email", &["notifications"], |_input: Value| async move {
///         Ok(json!({"sent": true}))
///     })
///     .unwrap();
///
/// assert_eq!(registry.handlers_for_queue("notifications").len(), 1);
/// assert!(registry.handlers_for_queue("billing").is_empty());
/// ```
#[derive(Default)]
pub struct TaskQueueRegistry {
    entries: RwLock<BTreeMap<(HandlerKind, String), Registration>>,
}

impl TaskQueueRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Start building a registry
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::default()
    }

    /// Register a workflow handler on the given queues
    pub fn register_workflow<F, Fut>(
        &self,
        name: &str,
        task_queues: &[&str],
        f: F,
    ) -> Result<(), RegistryError>
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.register(
            name,
            task_queues,
            RegisteredHandler::new(HandlerKind::Workflow, f),
            None,
        )
    }

    /// Register an activity handler on the given queues
    pub fn register_activity<F, Fut>(
        &self,
        name: &str,
        task_queues: &[&str],
        f: F,
    ) -> Result<(), RegistryError>
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.register(
            name,
            task_queues,
            RegisteredHandler::new(HandlerKind::Activity, f),
            None,
        )
    }

    /// Register a prepared handler
    ///
    /// An empty queue list registers the handler on [`DEFAULT_TASK_QUEUE`].
    pub fn register(
        &self,
        name: &str,
        task_queues: &[&str],
        handler: RegisteredHandler,
        description: Option<String>,
    ) -> Result<(), RegistryError> {
        if name.trim().is_empty() {
            return Err(RegistryError::EmptyName);
        }

        let key = (handler.kind, name.to_string());
        let mut entries = self.entries.write();
        if entries.contains_key(&key) {
            return Err(RegistryError::AlreadyRegistered {
                kind: handler.kind,
                name: name.to_string(),
            });
        }

        let task_queues = if task_queues.is_empty() {
            vec![DEFAULT_TASK_QUEUE.to_string()]
        } else {
            task_queues.iter().map(|q| q.to_string()).collect()
        };

        entries.insert(
            key,
            Registration {
                handler,
                task_queues,
                description,
                registered_at: Utc::now(),
            },
        );
        Ok(())
    }

    /// Remove a workflow handler
    pub fn unregister_workflow(&self, name: &str) -> Result<(), RegistryError> {
        self.unregister(HandlerKind::Workflow, name)
    }

    /// Remove an activity handler
    pub fn unregister_activity(&self, name: &str) -> Result<(), RegistryError> {
        self.unregister(HandlerKind::Activity, name)
    }

    fn unregister(&self, kind: HandlerKind, name: &str) -> Result<(), RegistryError> {
        match self.entries.write().remove(&(kind, name.to_string())) {
            Some(_) => Ok(()),
            None => Err(RegistryError::NotFound {
                kind,
                name: name.to_string(),
            }),
        }
    }

    /// Remove every handler
    pub fn clear(&self) {
        self.entries.write().clear();
    }

    /// Check whether a handler of this kind is registered under `name`
    pub fn contains(&self, kind: HandlerKind, name: &str) -> bool {
        self.entries.read().contains_key(&(kind, name.to_string()))
    }

    /// Number of registered handlers
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Check if registry is empty
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// List all registrations
    pub fn snapshot(&self) -> RegistrySnapshot {
        let entries = self.entries.read();
        let mut workflows = Vec::new();
        let mut activities = Vec::new();

        for ((kind, name), reg) in entries.iter() {
            let info = HandlerInfo {
                name: name.clone(),
                kind: *kind,
                task_queues: reg.task_queues.clone(),
                description: reg.description.clone(),
                registered_at: reg.registered_at,
            };
            match kind {
                HandlerKind::Workflow => workflows.push(info),
                HandlerKind::Activity => activities.push(info),
            }
        }

        RegistrySnapshot {
            workflows,
            activities,
            taken_at: Utc::now(),
        }
    }
}

impl HandlerRegistry for TaskQueueRegistry {
    fn handlers_for_queue(&self, task_queue: &str) -> QueueHandlers {
        self.entries
            .read()
            .iter()
            .filter(|(_, reg)| reg.task_queues.iter().any(|q| q == task_queue))
            .map(|(key, reg)| (key.clone(), reg.handler.clone()))
            .collect()
    }
}

impl fmt::Debug for TaskQueueRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskQueueRegistry")
            .field("handlers", &self.entries.read().keys().collect::<Vec<_>>())
            .finish()
    }
}

struct PendingRegistration {
    name: String,
    task_queues: Vec<String>,
    handler: RegisteredHandler,
    description: Option<String>,
}

/// Collects registrations and builds a [`TaskQueueRegistry`]
///
/// The first invalid or duplicate registration fails the build.
#[derive(Default)]
pub struct RegistryBuilder {
    pending: Vec<PendingRegistration>,
}

impl RegistryBuilder {
    /// Add a workflow handler
    pub fn workflow<F, Fut>(self, name: &str, task_queues: &[&str], f: F) -> Self
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.handler(
            name,
            task_queues,
            RegisteredHandler::new(HandlerKind::Workflow, f),
            None,
        )
    }

    /// Add an activity handler
    pub fn activity<F, Fut>(self, name: &str, task_queues: &[&str], f: F) -> Self
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.handler(
            name,
            task_queues,
            RegisteredHandler::new(HandlerKind::Activity, f),
            None,
        )
    }

    /// Add a prepared handler with an optional description
    pub fn handler(
        mut self,
        name: &str,
        task_queues: &[&str],
        handler: RegisteredHandler,
        description: Option<String>,
    ) -> Self {
        self.pending.push(PendingRegistration {
            name: name.to_string(),
            task_queues: task_queues.iter().map(|q| q.to_string()).collect(),
            handler,
            description,
        });
        self
    }

    /// Build the registry
    pub fn build(self) -> Result<TaskQueueRegistry, RegistryError> {
        let registry = TaskQueueRegistry::new();
        for pending in self.pending {
            let queues: Vec<&str> = pending.task_queues.iter().map(String::as_str).collect();
            registry.register(&pending.name, &queues, pending.handler, pending.description)?;
        }
        Ok(registry)
    }
}
