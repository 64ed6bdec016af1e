//! Engine configuration.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{Map, Value};

use crate::bridge::codec::DEFAULT_MAX_FRAME_LENGTH;
use crate::policy::{BridgePolicy, CommandPolicy, PolicyDefaults};
use crate::process::{ProcessSpawner, WorkerCommand, WorkerSpawner};

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{0} is not set")]
    Missing(&'static str),
    #[error("{var} has invalid value {value:?}: {reason}")]
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },
}

pub struct EngineConfig {
    /// Required by [`Engine::spawn`](crate::Engine::spawn); unused by
    /// [`Engine::from_channel`](crate::Engine::from_channel).
    pub worker: Option<WorkerCommand>,
    pub default_timeout: Duration,
    pub max_frame_length: usize,
    pub shutdown_grace: Duration,
    pub policy: Arc<dyn CommandPolicy>,
    pub spawner: Arc<dyn WorkerSpawner>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            worker: None,
            default_timeout: DEFAULT_TIMEOUT,
            max_frame_length: DEFAULT_MAX_FRAME_LENGTH,
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
            policy: Arc::new(BridgePolicy::default()),
            spawner: Arc::new(ProcessSpawner),
        }
    }
}

impl EngineConfig {
    pub fn new(worker: WorkerCommand) -> Self {
        Self {
            worker: Some(worker),
            ..Self::default()
        }
    }

    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    pub fn with_max_frame_length(mut self, len: usize) -> Self {
        self.max_frame_length = len;
        self
    }

    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    pub fn with_policy(mut self, policy: Arc<dyn CommandPolicy>) -> Self {
        self.policy = policy;
        self
    }

    /// Use [`BridgePolicy`] with the given defaults.
    pub fn with_defaults(self, defaults: PolicyDefaults) -> Self {
        self.with_policy(Arc::new(BridgePolicy::new(defaults)))
    }

    pub fn with_spawner(mut self, spawner: Arc<dyn WorkerSpawner>) -> Self {
        self.spawner = spawner;
        self
    }

    /// Build from `SNAKELET_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &'static str| lookup(name).filter(|v| !v.trim().is_empty());

        let executable =
            var("SNAKELET_WORKER_EXECUTABLE").ok_or(ConfigError::Missing("SNAKELET_WORKER_EXECUTABLE"))?;
        let mut worker = WorkerCommand::new(executable);
        if let Some(args) = var("SNAKELET_WORKER_ARGS") {
            worker = worker.args(args.split_whitespace());
        }

        let mut config = Self::new(worker);

        if let Some(ms) = var("SNAKELET_TIMEOUT_MS") {
            config.default_timeout = Duration::from_millis(parse_number("SNAKELET_TIMEOUT_MS", &ms)?);
        }
        if let Some(bytes) = var("SNAKELET_MAX_FRAME_BYTES") {
            config.max_frame_length = parse_number("SNAKELET_MAX_FRAME_BYTES", &bytes)? as usize;
        }
        if let Some(ms) = var("SNAKELET_SHUTDOWN_GRACE_MS") {
            config.shutdown_grace =
                Duration::from_millis(parse_number("SNAKELET_SHUTDOWN_GRACE_MS", &ms)?);
        }
        if let Some(raw) = var("SNAKELET_EXTRA_OPTIONS") {
            let global = parse_object("SNAKELET_EXTRA_OPTIONS", &raw)?;
            config = config.with_defaults(PolicyDefaults {
                global,
                ..PolicyDefaults::default()
            });
        }

        Ok(config)
    }
}

fn parse_number(var: &'static str, value: &str) -> Result<u64, ConfigError> {
    let n = value
        .trim()
        .parse::<u64>()
        .map_err(|e| ConfigError::Invalid {
            var,
            value: value.to_string(),
            reason: e.to_string(),
        })?;
    if n == 0 {
        return Err(ConfigError::Invalid {
            var,
            value: value.to_string(),
            reason: "must be greater than zero".to_string(),
        });
    }
    Ok(n)
}

fn parse_object(var: &'static str, value: &str) -> Result<Map<String, Value>, ConfigError> {
    let invalid = |reason: String| ConfigError::Invalid {
        var,
        value: value.to_string(),
        reason,
    };
    match serde_json::from_str::<Value>(value).map_err(|e| invalid(e.to_string()))? {
        Value::Object(map) => Ok(map),
        _ => Err(invalid("expected a JSON object".to_string())),
    }
}
