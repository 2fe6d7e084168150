use std::sync::Arc;
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};

use crate::context::Context;
use crate::error::{ConfigError, EngineError};
use crate::shuffle::ShuffleService;
use crate::worker::Executor;

/// Settings for a [`Context`].
///
/// `Config` is built either fluently or from JSON. Missing fields take their
/// defaults, so a JSON document only needs to mention what it overrides.
///
/// ```rust
/// use nagare::Config;
///
/// let config = Config::from_json(r#"{ "workers": 2, "max_task_attempts": 3 }"#).unwrap();
/// assert_eq!(config.workers, 2);
/// assert_eq!(config.max_stage_attempts, 4);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Name shown in logs.
    pub app_name: String,
    /// Number of worker threads, which is also the number of task slots.
    pub workers: usize,
    /// Partition count used by sources when none is given.
    pub default_parallelism: usize,
    /// How many times a partition is attempted before the action fails.
    pub max_task_attempts: u32,
    /// How many times lost shuffle output is regenerated within one action.
    pub max_stage_attempts: u32,
    /// Task attempts running longer than this are killed and retried.
    pub task_timeout_ms: Option<u64>,
    /// Bytes of partition data kept in memory across all persisted datasets.
    pub memory_budget: usize,
    /// Directory for partitions spilled to disk. Every context spills into
    /// its own subdirectory, under the system temp dir when unset.
    pub spill_dir: Option<Utf8PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        let cores = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4);

        Self {
            app_name: String::from("nagare"),
            workers: cores,
            default_parallelism: cores,
            max_task_attempts: 4,
            max_stage_attempts: 4,
            task_timeout_ms: None,
            memory_budget: 256 * 1024 * 1024,
            spill_dir: None,
        }
    }
}

impl Config {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses a configuration from JSON, filling in defaults.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: Config = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn app_name(mut self, name: impl Into<String>) -> Self {
        self.app_name = name.into();
        self
    }

    pub fn workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    pub fn default_parallelism(mut self, partitions: usize) -> Self {
        self.default_parallelism = partitions;
        self
    }

    pub fn max_task_attempts(mut self, attempts: u32) -> Self {
        self.max_task_attempts = attempts;
        self
    }

    pub fn max_stage_attempts(mut self, attempts: u32) -> Self {
        self.max_stage_attempts = attempts;
        self
    }

    pub fn task_timeout(mut self, timeout: Duration) -> Self {
        self.task_timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    pub fn memory_budget(mut self, bytes: usize) -> Self {
        self.memory_budget = bytes;
        self
    }

    pub fn spill_dir(mut self, dir: impl AsRef<Utf8Path>) -> Self {
        self.spill_dir = Some(dir.as_ref().to_owned());
        self
    }

    pub(crate) fn timeout(&self) -> Option<Duration> {
        self.task_timeout_ms.map(Duration::from_millis)
    }

    /// Checks the settings that would make the engine unable to run.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.workers == 0 {
            return Err(ConfigError::Zero("workers"));
        }
        if self.default_parallelism == 0 {
            return Err(ConfigError::Zero("default_parallelism"));
        }
        if self.max_task_attempts == 0 {
            return Err(ConfigError::Zero("max_task_attempts"));
        }
        if self.max_stage_attempts == 0 {
            return Err(ConfigError::Zero("max_stage_attempts"));
        }
        Ok(())
    }

    /// Builds a context running tasks on a local rayon pool.
    pub fn finish(self) -> Result<Context, EngineError> {
        Context::new(self)
    }

    /// Builds a context that dispatches tasks through a custom executor.
    pub fn finish_with(self, executor: Arc<dyn Executor>) -> Result<Context, EngineError> {
        Context::with_services(self, executor, None)
    }

    /// Builds a context with a custom executor and shuffle service.
    pub fn finish_with_services(
        self,
        executor: Arc<dyn Executor>,
        shuffle: Arc<dyn ShuffleService>,
    ) -> Result<Context, EngineError> {
        Context::with_services(self, executor, Some(shuffle))
    }
}
