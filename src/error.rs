use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use crate::core::{DatasetId, JobId, ShuffleId, StageId};

/// Failure raised by a user closure, shared so that it can be reported both
/// in the task record and in the action's error.
#[derive(Debug, Error, Clone)]
#[error(transparent)]
pub struct UserError(#[from] pub(crate) Arc<anyhow::Error>);

impl UserError {
    pub fn new(err: impl Into<anyhow::Error>) -> Self {
        Self(Arc::new(err.into()))
    }
}

impl From<anyhow::Error> for UserError {
    fn from(e: anyhow::Error) -> Self {
        UserError(Arc::new(e))
    }
}

/// Outcome of a failed task attempt, as seen by the scheduler.
#[derive(Debug, Error, Clone)]
pub enum TaskError {
    /// A user function returned an error or panicked. Deterministic, never
    /// retried.
    #[error("user function failed: {0}")]
    Transformation(UserError),

    /// The worker could not run the task. Retried.
    #[error("worker unavailable: {0}")]
    WorkerUnavailable(String),

    /// A reduce task could not find the output of a map task.
    #[error("output of map partition {map} in {shuffle} is missing")]
    FetchFailed { shuffle: ShuffleId, map: usize },

    /// The attempt noticed its kill flag and stopped early.
    #[error("task was killed")]
    Killed,

    /// The attempt ran past the configured task timeout.
    #[error("task timed out after {0:?}")]
    TimedOut(Duration),

    #[error("lineage inconsistency: {0}")]
    Lineage(String),
}

impl TaskError {
    pub fn user(err: impl Into<anyhow::Error>) -> Self {
        TaskError::Transformation(UserError::new(err))
    }

    /// Whether the attempt may succeed if it is simply run again.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            TaskError::WorkerUnavailable(_) | TaskError::TimedOut(_) | TaskError::Killed
        )
    }
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Transformation '{name}' failed on partition {partition} of {dataset} ({stage}):\n{source}")]
    Transformation {
        dataset: DatasetId,
        name: String,
        partition: usize,
        stage: StageId,
        source: UserError,
    },

    #[error("Action failed: partition {partition} of {dataset} gave up after {attempts} attempts: {cause}")]
    ActionFailed {
        dataset: DatasetId,
        partition: usize,
        attempts: u32,
        cause: TaskError,
    },

    #[error("Lineage inconsistency: {0}")]
    LineageInconsistency(String),

    #[error("Partition {partition} requested from {dataset}, which has {partitions} partitions")]
    PartitionOutOfRange {
        dataset: DatasetId,
        partition: usize,
        partitions: usize,
    },

    #[error("{0} was cancelled")]
    Cancelled(JobId),

    #[error("Error in the partition store:\n{0}")]
    Storage(#[from] StorageError),

    #[error("Invalid configuration:\n{0}")]
    Config(#[from] ConfigError),

    #[error("Couldn't prepare source data.\n{0}")]
    Source(#[from] SourceError),

    #[error("Couldn't write output.\n{0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("Couldn't encode partition.\n{0}")]
    Encode(#[from] ciborium::ser::Error<std::io::Error>),

    #[error("Couldn't decode partition.\n{0}")]
    Decode(#[from] ciborium::de::Error<std::io::Error>),

    #[error("Stored block has an unexpected element type")]
    TypeMismatch,

    #[error("Block of {needed} bytes does not fit in the memory budget of {budget} bytes")]
    ResourceExhausted { needed: usize, budget: usize },
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Couldn't parse configuration.\n{0}")]
    Json(#[from] serde_json::Error),

    #[error("Couldn't build worker pool.\n{0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),

    #[error("'{0}' must be at least 1")]
    Zero(&'static str),
}

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("Couldn't read source file.\n{0}")]
    FileSystem(#[from] std::io::Error),

    #[error("Couldn't compile glob pattern.\n{0}")]
    GlobPattern(#[from] glob::PatternError),

    #[error("Couldn't run glob.\n{0}")]
    Glob(#[from] glob::GlobError),

    #[error("Couldn't convert path to UTF-8.\n{0}")]
    PathFormat(#[from] camino::FromPathBufError),
}

/// Errors raised while traversing a dataset's elements.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StreamError {
    #[error("grouped values were already traversed once")]
    AlreadyConsumed,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(TaskError::WorkerUnavailable("lost".into()).is_transient());
        assert!(TaskError::TimedOut(Duration::from_secs(1)).is_transient());
        assert!(!TaskError::user(anyhow::anyhow!("boom")).is_transient());
        assert!(!TaskError::Lineage("cycle".into()).is_transient());
        let fetch = TaskError::FetchFailed {
            shuffle: ShuffleId(0),
            map: 1,
        };
        assert!(!fetch.is_transient());
    }

    #[test]
    fn test_transformation_message_names_dataset() {
        let err = EngineError::Transformation {
            dataset: DatasetId(4),
            name: "parse".into(),
            partition: 2,
            stage: StageId(1),
            source: UserError::new(anyhow::anyhow!("bad record")),
        };
        let message = err.to_string();
        assert!(message.contains("'parse'"));
        assert!(message.contains("partition 2 of dataset 4"));
        assert!(message.contains("bad record"));
    }
}
