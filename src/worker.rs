use std::cell::RefCell;
use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::mpsc::Sender;
use std::time::{Duration, Instant};

use crate::core::{Boxed, Data, DatasetId, Dynamic, TaskId};
use crate::error::{ConfigError, TaskError};
use crate::lineage::{AnyIter, LineageGraph, ShuffleDependency};
use crate::shared::AccumulatorId;
use crate::shuffle::ShuffleService;
use crate::storage::{BlockId, CacheManager};
use crate::stream::{ElementIter, Interruptible, KillSwitch};

/// What every task of a job shares: an immutable lineage snapshot and the
/// storage services.
pub(crate) struct TaskEnv {
    pub graph: Arc<LineageGraph>,
    pub cache: Arc<CacheManager>,
    pub shuffle: Arc<dyn ShuffleService>,
}

/// Consumes the iterator of one result partition and erases the result.
pub(crate) type ResultFn = Arc<dyn Fn(AnyIter) -> Result<Boxed, TaskError> + Send + Sync>;

#[derive(Clone)]
pub(crate) enum TaskKind {
    ShuffleMap(Arc<dyn ShuffleDependency>),
    Result(ResultFn),
}

pub(crate) enum TaskOutput {
    /// One bucket per reduce partition, committed by the driver.
    MapOutput(Vec<Dynamic>),
    Value(Boxed),
}

/// Per-thread state of the task currently running on this worker thread.
#[derive(Default)]
pub(crate) struct TaskScope {
    pub id: TaskId,
    pub updates: HashMap<AccumulatorId, Boxed>,
    raised: Option<TaskError>,
}

thread_local! {
    static CURRENT: RefCell<Option<TaskScope>> = const { RefCell::new(None) };
}

/// Runs `f` against the current task scope, if this thread is running a task.
pub(crate) fn with_scope<R>(f: impl FnOnce(&mut TaskScope) -> R) -> Option<R> {
    CURRENT.with(|current| current.borrow_mut().as_mut().map(f))
}

/// Records a failure of a user closure that cannot return it directly. The
/// task stops at its next checkpoint and reports the first raised error.
pub(crate) fn raise(error: TaskError) {
    let recorded = with_scope(|scope| {
        if scope.raised.is_none() {
            scope.raised = Some(error);
        }
    });
    if recorded.is_none() {
        tracing::warn!("error raised outside of a task");
    }
}

/// Identity of the task running on the calling thread, or `None` on the
/// driver.
///
/// ```rust
/// assert!(nagare::current_task().is_none());
/// ```
pub fn current_task() -> Option<TaskId> {
    CURRENT.with(|current| current.borrow().as_ref().map(|scope| scope.id))
}

/// Partition computed by the task running on the calling thread.
pub fn task_partition() -> Option<usize> {
    current_task().map(|task| task.partition)
}

/// Attempt number of the task running on the calling thread. A closure can
/// use it to tell a retry from the first run.
pub fn task_attempt() -> Option<u32> {
    current_task().map(|task| task.attempt)
}

/// Installs a fresh scope and restores the previous one when finished, so a
/// worker thread that picks up another task while blocked keeps both apart.
struct ScopeGuard {
    previous: Option<TaskScope>,
    finished: bool,
}

impl ScopeGuard {
    fn enter(id: TaskId) -> Self {
        let scope = TaskScope {
            id,
            ..TaskScope::default()
        };
        let previous = CURRENT.with(|current| current.replace(Some(scope)));
        Self {
            previous,
            finished: false,
        }
    }

    fn finish(mut self) -> TaskScope {
        self.finished = true;
        let previous = self.previous.take();
        CURRENT
            .with(|current| current.replace(previous))
            .unwrap_or_default()
    }
}

impl Drop for ScopeGuard {
    fn drop(&mut self) {
        if !self.finished {
            let previous = self.previous.take();
            CURRENT.with(|current| *current.borrow_mut() = previous);
        }
    }
}

/// Handed to lineage nodes while they compute a partition.
pub(crate) struct TaskContext {
    env: Arc<TaskEnv>,
    kill: KillSwitch,
    id: TaskId,
}

impl TaskContext {
    /// Iterator over one partition of `dataset`, read from storage when the
    /// dataset is persisted and computed from lineage otherwise.
    pub(crate) fn iterator<T: Data>(
        &self,
        dataset: DatasetId,
        split: usize,
    ) -> Result<ElementIter<T>, TaskError> {
        self.iterator_any(dataset, split)?
            .downcast::<ElementIter<T>>()
            .map(|iter| *iter)
            .map_err(|_| {
                TaskError::Lineage(format!(
                    "{dataset} does not hold elements of type {}",
                    std::any::type_name::<T>()
                ))
            })
    }

    pub(crate) fn iterator_any(&self, dataset: DatasetId, split: usize) -> Result<AnyIter, TaskError> {
        let node = self.env.graph.node(dataset).ok_or_else(|| {
            TaskError::Lineage(format!("{dataset} is missing from the lineage snapshot"))
        })?;

        if !self.env.cache.level(dataset).is_retained() {
            return node.compute_any(split, self);
        }

        let block = BlockId::new(dataset, split);
        if let Some(data) = self.env.cache.get(block) {
            tracing::trace!(%dataset, partition = split, task = %self.id, "read stored partition");
            return node.iterate_block(data, self);
        }

        let computed = node.compute_any(split, self)?;
        let materialized = node.materialize(computed)?;
        // A partition cut short by a kill or a raised error must not be stored.
        self.checkpoint()?;
        let placement = self.env.cache.put(block, materialized.data.clone(), materialized.bytes);
        tracing::trace!(%dataset, partition = split, ?placement, "stored partition");
        node.iterate_block(materialized.data, self)
    }

    pub(crate) fn interruptible<I>(&self, iter: I) -> Interruptible<I> {
        Interruptible::new(iter, self.kill.clone())
    }

    pub(crate) fn shuffle(&self) -> &dyn ShuffleService {
        self.env.shuffle.as_ref()
    }

    /// Fails if a user closure raised an error or the attempt was killed.
    pub(crate) fn checkpoint(&self) -> Result<(), TaskError> {
        if let Some(Some(error)) = with_scope(|scope| scope.raised.clone()) {
            return Err(error);
        }
        if self.kill.is_set() {
            return Err(TaskError::Killed);
        }
        Ok(())
    }
}

/// One attempt at computing one partition.
///
/// Tasks are created by the scheduler and handed to an [`Executor`], which
/// calls [`Task::run`] somewhere and sends the report back.
pub struct Task {
    pub(crate) id: TaskId,
    pub(crate) dataset: DatasetId,
    pub(crate) kind: TaskKind,
    pub(crate) env: Arc<TaskEnv>,
    pub(crate) kill: KillSwitch,
}

impl Task {
    pub fn id(&self) -> TaskId {
        self.id
    }

    /// Dataset whose partition this task computes. For shuffle-map tasks this
    /// is the parent of the shuffle.
    pub fn dataset(&self) -> DatasetId {
        self.dataset
    }

    pub fn partition(&self) -> usize {
        self.id.partition
    }

    pub fn attempt(&self) -> u32 {
        self.id.attempt
    }

    pub fn is_shuffle_map(&self) -> bool {
        matches!(self.kind, TaskKind::ShuffleMap(_))
    }

    /// Executes the task on the calling thread.
    ///
    /// Panics in user closures are caught and reported as transformation
    /// errors.
    pub fn run(self) -> TaskReport {
        let span = tracing::debug_span!(
            "task",
            job = %self.id.job,
            stage = self.id.stage.index(),
            partition = self.id.partition,
            attempt = self.id.attempt
        );
        let _enter = span.enter();

        let start = Instant::now();
        let guard = ScopeGuard::enter(self.id);
        let context = TaskContext {
            env: self.env.clone(),
            kill: self.kill.clone(),
            id: self.id,
        };

        // Nodes only read the shared snapshot, a panic cannot leave it
        // half-updated.
        let outcome = match catch_unwind(AssertUnwindSafe(|| self.execute(&context))) {
            Ok(outcome) => outcome,
            Err(panic) => {
                let msg = if let Some(s) = panic.downcast_ref::<&str>() {
                    format!("Task panicked: {s}")
                } else if let Some(s) = panic.downcast_ref::<String>() {
                    format!("Task panicked: {s}")
                } else {
                    String::from("Task panicked with unknown payload")
                };

                Err(TaskError::user(anyhow::anyhow!(msg)))
            }
        };

        let scope = guard.finish();
        let outcome = match (scope.raised, outcome) {
            (Some(raised), _) => Err(raised),
            (None, Ok(_)) if self.kill.is_set() => Err(TaskError::Killed),
            (None, outcome) => outcome,
        };

        if let Err(error) = &outcome {
            tracing::debug!(%error, "task failed");
        }

        TaskReport {
            id: self.id,
            outcome,
            accumulators: scope.updates.into_iter().collect(),
            duration: start.elapsed(),
        }
    }

    fn execute(&self, context: &TaskContext) -> Result<TaskOutput, TaskError> {
        match &self.kind {
            TaskKind::ShuffleMap(dependency) => dependency
                .run_map_task(self.id.partition, context)
                .map(TaskOutput::MapOutput),
            TaskKind::Result(func) => {
                let iter = context.iterator_any(self.dataset, self.id.partition)?;
                let value = func(iter)?;
                context.checkpoint()?;
                Ok(TaskOutput::Value(value))
            }
        }
    }
}

/// Result of one task attempt, sent back to the scheduler.
pub struct TaskReport {
    pub(crate) id: TaskId,
    pub(crate) outcome: Result<TaskOutput, TaskError>,
    pub(crate) accumulators: Vec<(AccumulatorId, Boxed)>,
    pub(crate) duration: Duration,
}

impl TaskReport {
    /// Report for a task that could not be run at all.
    pub fn failed(task: &Task, error: TaskError) -> Self {
        Self {
            id: task.id,
            outcome: Err(error),
            accumulators: Vec::new(),
            duration: Duration::ZERO,
        }
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn error(&self) -> Option<&TaskError> {
        self.outcome.as_ref().err()
    }

    pub fn duration(&self) -> Duration {
        self.duration
    }
}

/// Where tasks run.
///
/// The scheduler never runs more than `slots()` tasks of a stage at once and
/// waits for exactly one report per dispatched task. An executor that cannot
/// run a task replies with [`TaskReport::failed`] and a
/// [`TaskError::WorkerUnavailable`], which the scheduler retries.
pub trait Executor: Send + Sync {
    fn slots(&self) -> usize;

    fn dispatch(&self, task: Task, reply: Sender<TaskReport>);
}

/// Runs tasks on a dedicated rayon thread pool.
pub struct LocalExecutor {
    pool: rayon::ThreadPool,
    workers: usize,
}

impl LocalExecutor {
    pub fn new(workers: usize) -> Result<Self, ConfigError> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(workers)
            .thread_name(|i| format!("nagare-worker-{i}"))
            .build()?;

        Ok(Self { pool, workers })
    }
}

impl Executor for LocalExecutor {
    fn slots(&self) -> usize {
        self.workers
    }

    fn dispatch(&self, task: Task, reply: Sender<TaskReport>) {
        self.pool.spawn(move || {
            let report = task.run();
            if reply.send(report).is_err() {
                tracing::trace!("driver stopped waiting for this task");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{JobId, StageId};

    fn id(partition: usize) -> TaskId {
        TaskId {
            job: JobId(1),
            stage: StageId(0),
            partition,
            attempt: 0,
        }
    }

    #[test]
    fn test_scope_nesting_restores_outer_task() {
        assert!(current_task().is_none());

        let outer = ScopeGuard::enter(id(1));
        assert_eq!(current_task().map(|t| t.partition), Some(1));

        let inner = ScopeGuard::enter(id(2));
        assert_eq!(current_task().map(|t| t.partition), Some(2));
        let finished = inner.finish();
        assert_eq!(finished.id.partition, 2);

        assert_eq!(current_task().map(|t| t.partition), Some(1));
        drop(outer);
        assert!(current_task().is_none());
    }

    #[test]
    fn test_first_raised_error_wins() {
        let guard = ScopeGuard::enter(id(0));
        raise(TaskError::user(anyhow::anyhow!("first")));
        raise(TaskError::user(anyhow::anyhow!("second")));
        let scope = guard.finish();

        let error = scope.raised.unwrap();
        assert!(error.to_string().contains("first"));
    }
}
