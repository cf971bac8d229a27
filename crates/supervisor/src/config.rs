//! Worker and pool configuration
//!
//! Worker definitions are either loaded from a JSON file or synthesized from the
//! environment, and validated before they reach a [`WorkerPool`](crate::WorkerPool).
//!
//! # Example
//!
//! ```
//! use std::time::Duration;
//! use taskpool_supervisor::config::{PoolConfig, WorkerConfig};
//!
//! let worker = WorkerConfig::new("orders-1", "orders").with_auto_start(false);
//! let pool = PoolConfig::default().with_health_check_interval(Duration::from_secs(10));
//!
//! assert!(worker.enabled);
//! assert_eq!(pool.stop_timeout, Duration::from_secs(30));
//! ```

use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::reliability::RestartPolicy;

/// Environment variable holding the task queue of the default worker
pub const ENV_TASK_QUEUE: &str = "TASKPOOL_TASK_QUEUE";
/// Environment variable overriding the health check interval (seconds)
pub const ENV_HEALTH_CHECK_INTERVAL: &str = "TASKPOOL_HEALTH_CHECK_INTERVAL_SECS";
/// Environment variable overriding the worker stop timeout (seconds)
pub const ENV_STOP_TIMEOUT: &str = "TASKPOOL_STOP_TIMEOUT_SECS";
/// Environment variable overriding the restart backoff (seconds)
pub const ENV_RESTART_BACKOFF: &str = "TASKPOOL_RESTART_BACKOFF_SECS";
/// Environment variable capping consecutive restart attempts
pub const ENV_RESTART_MAX_ATTEMPTS: &str = "TASKPOOL_RESTART_MAX_ATTEMPTS";

const DEFAULT_TASK_QUEUE: &str = "default";

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Config file could not be read
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// Config file is not valid JSON for this schema
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    /// Semantically invalid configuration
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// What the engine does when workflow code panics
///
/// Unknown values deserialize to [`WorkflowPanicPolicy::FailWorkflow`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum WorkflowPanicPolicy {
    /// Block the workflow until a fix is deployed
    BlockWorkflow,
    /// Fail the workflow execution
    #[default]
    FailWorkflow,
}

impl From<String> for WorkflowPanicPolicy {
    fn from(value: String) -> Self {
        match value.as_str() {
            "BlockWorkflow" => Self::BlockWorkflow,
            _ => Self::FailWorkflow,
        }
    }
}

impl From<WorkflowPanicPolicy> for String {
    fn from(policy: WorkflowPanicPolicy) -> Self {
        policy.to_string()
    }
}

impl std::fmt::Display for WorkflowPanicPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::BlockWorkflow => write!(f, "BlockWorkflow"),
            Self::FailWorkflow => write!(f, "FailWorkflow"),
        }
    }
}

/// Options handed to the [`WorkerFactory`](crate::engine::WorkerFactory)
///
/// Zero values mean "engine default". Engine-specific settings that have no
/// typed field go into `extra`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerOptions {
    /// Maximum concurrent workflow task executions
    pub max_concurrent_workflow_tasks: usize,

    /// Maximum concurrent activity executions
    pub max_concurrent_activities: usize,

    /// Maximum concurrent local activity executions
    pub max_concurrent_local_activities: usize,

    /// Overall worker rate limit (0 = unlimited)
    pub worker_rate_limit: f64,

    /// Activities per second across the whole task queue (0 = unlimited)
    pub task_queue_activities_per_second: f64,

    /// Activities per second for this worker (0 = unlimited)
    pub worker_activities_per_second: f64,

    /// Enable session worker support
    pub enable_session_worker: bool,

    /// Maximum concurrent sessions
    pub max_concurrent_sessions: usize,

    /// Behaviour on workflow panic
    pub workflow_panic_policy: WorkflowPanicPolicy,

    /// How long the engine waits for in-flight tasks on stop
    #[serde(with = "duration_millis")]
    pub stop_timeout: Duration,

    /// Sticky schedule-to-start timeout
    #[serde(with = "duration_millis")]
    pub sticky_schedule_to_start_timeout: Duration,

    /// Disable eager activity dispatch
    pub disable_eager_activities: bool,

    /// Upper bound for heartbeat throttling
    #[serde(with = "duration_millis")]
    pub max_heartbeat_throttle_interval: Duration,

    /// Default heartbeat throttling
    #[serde(with = "duration_millis")]
    pub default_heartbeat_throttle_interval: Duration,

    /// Log from workflow code during replay
    pub enable_logging_in_replay: bool,

    /// Opaque engine-specific settings
    pub extra: serde_json::Map<String, Value>,
}

impl WorkerOptions {
    /// Tuned defaults for a general-purpose worker
    pub fn recommended() -> Self {
        Self {
            max_concurrent_workflow_tasks: 100,
            max_concurrent_activities: 100,
            max_concurrent_local_activities: 100,
            max_concurrent_sessions: 1000,
            workflow_panic_policy: WorkflowPanicPolicy::FailWorkflow,
            stop_timeout: Duration::from_secs(30),
            sticky_schedule_to_start_timeout: Duration::from_secs(5),
            max_heartbeat_throttle_interval: Duration::from_secs(60),
            default_heartbeat_throttle_interval: Duration::from_secs(30),
            ..Default::default()
        }
    }

    /// Set an engine-specific option
    pub fn with_extra(mut self, key: impl Into<String>, value: Value) -> Self {
        self.extra.insert(key.into(), value);
        self
    }
}

fn default_true() -> bool {
    true
}

/// Configuration of one named worker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Worker name, unique within a pool
    pub name: String,

    /// Task queue this worker listens on
    pub task_queue: String,

    /// Options passed to the worker factory
    #[serde(default)]
    pub options: WorkerOptions,

    /// Disabled workers are skipped entirely
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Started by the pool and restarted by the health monitor
    #[serde(default = "default_true")]
    pub auto_start: bool,
}

impl WorkerConfig {
    /// Create an enabled, auto-started worker with default options
    pub fn new(name: impl Into<String>, task_queue: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            task_queue: task_queue.into(),
            options: WorkerOptions::default(),
            enabled: true,
            auto_start: true,
        }
    }

    /// Set worker options
    pub fn with_options(mut self, options: WorkerOptions) -> Self {
        self.options = options;
        self
    }

    /// Enable or disable the worker
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Set whether the worker is started and restarted automatically
    pub fn with_auto_start(mut self, auto_start: bool) -> Self {
        self.auto_start = auto_start;
        self
    }

    /// Check required fields
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.name.trim().is_empty() {
            return Err(ConfigError::Invalid("worker name is required".into()));
        }
        if self.task_queue.trim().is_empty() {
            return Err(ConfigError::Invalid(format!(
                "worker {} has no task queue",
                self.name
            )));
        }
        Ok(())
    }
}

/// Supervision settings for a pool
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Period of the health monitor scan
    #[serde(with = "duration_millis")]
    pub health_check_interval: Duration,

    /// Deadline for stopping a single worker on remove/restart
    #[serde(with = "duration_millis")]
    pub stop_timeout: Duration,

    /// Backoff applied when the monitor fails to restart a worker
    pub restart_policy: RestartPolicy,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            health_check_interval: Duration::from_secs(30),
            stop_timeout: Duration::from_secs(30),
            restart_policy: RestartPolicy::default(),
        }
    }
}

impl PoolConfig {
    /// Create a pool configuration with defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Create configuration from environment variables
    ///
    /// Environment variables:
    /// - `TASKPOOL_HEALTH_CHECK_INTERVAL_SECS`: monitor period (default: 30)
    /// - `TASKPOOL_STOP_TIMEOUT_SECS`: per-worker stop deadline (default: 30)
    /// - `TASKPOOL_RESTART_BACKOFF_SECS`: fixed restart backoff (default: 30)
    /// - `TASKPOOL_RESTART_MAX_ATTEMPTS`: cap on consecutive restart failures (default: unbounded)
    pub fn from_env() -> Self {
        Self::from_vars(|key| std::env::var(key).ok())
    }

    /// Build configuration from an arbitrary variable lookup
    pub fn from_vars<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let secs = |key: &str| {
            lookup(key)
                .and_then(|v| v.trim().parse::<u64>().ok())
                .map(Duration::from_secs)
        };

        let mut config = Self::default();
        if let Some(interval) = secs(ENV_HEALTH_CHECK_INTERVAL) {
            config.health_check_interval = interval;
        }
        if let Some(timeout) = secs(ENV_STOP_TIMEOUT) {
            config.stop_timeout = timeout;
        }
        if let Some(backoff) = secs(ENV_RESTART_BACKOFF) {
            config.restart_policy = RestartPolicy::fixed(backoff);
        }
        if let Some(max) = lookup(ENV_RESTART_MAX_ATTEMPTS).and_then(|v| v.trim().parse().ok()) {
            config.restart_policy = config.restart_policy.with_max_attempts(max);
        }
        config
    }

    /// Set the health check interval
    pub fn with_health_check_interval(mut self, interval: Duration) -> Self {
        self.health_check_interval = interval;
        self
    }

    /// Set the per-worker stop timeout
    pub fn with_stop_timeout(mut self, timeout: Duration) -> Self {
        self.stop_timeout = timeout;
        self
    }

    /// Set the restart policy
    pub fn with_restart_policy(mut self, policy: RestartPolicy) -> Self {
        self.restart_policy = policy;
        self
    }

    /// Validate supervision settings
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.health_check_interval.is_zero() {
            return Err(ConfigError::Invalid(
                "health_check_interval must be greater than zero".into(),
            ));
        }
        self.restart_policy.validate()
    }
}

/// Full supervisor configuration: pool settings plus worker definitions
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SupervisorConfig {
    #[serde(default)]
    pub pool: PoolConfig,

    #[serde(default)]
    pub workers: Vec<WorkerConfig>,
}

impl SupervisorConfig {
    /// Load configuration, honouring a `.env` file if present
    ///
    /// With a path the JSON file is authoritative; without one a single
    /// default worker is configured from the environment.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let _ = dotenvy::dotenv();

        let config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::from_env(),
        };
        config.validate()?;
        Ok(config)
    }

    /// Default configuration derived from environment variables
    pub fn from_env() -> Self {
        let task_queue =
            std::env::var(ENV_TASK_QUEUE).unwrap_or_else(|_| DEFAULT_TASK_QUEUE.to_string());

        Self {
            pool: PoolConfig::from_env(),
            workers: vec![WorkerConfig::new("default", task_queue)
                .with_options(WorkerOptions::recommended())],
        }
    }

    /// Read configuration from a JSON file
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let display = path.display().to_string();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: display.clone(),
            source,
        })?;
        serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: display,
            source,
        })
    }

    /// Validate pool settings and worker definitions
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.pool.validate()?;

        if self.workers.is_empty() {
            return Err(ConfigError::Invalid(
                "at least one worker must be configured".into(),
            ));
        }

        let mut seen = HashSet::new();
        for (i, worker) in self.workers.iter().enumerate() {
            worker
                .validate()
                .map_err(|e| ConfigError::Invalid(format!("workers[{}]: {}", i, e)))?;
            if !seen.insert(worker.name.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate worker name: {}",
                    worker.name
                )));
            }
        }
        Ok(())
    }
}

/// Serde support for Duration as milliseconds
pub(crate) mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        (duration.as_millis() as u64).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
