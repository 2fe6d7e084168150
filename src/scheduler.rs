mod report;

use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{RecvTimeoutError, channel};
use std::sync::{Arc, LazyLock};
use std::time::{Duration, Instant};

use indicatif::ProgressStyle;
use tracing_indicatif::span_ext::IndicatifSpanExt;

use crate::context::ContextInner;
use crate::core::{Boxed, Data, DatasetId, JobId, ShuffleId, StageId, TaskId};
use crate::error::{EngineError, TaskError};
use crate::lineage::{AnyIter, LineageGraph, PlanProbe, Stage, StageKind};
use crate::shuffle::ShuffleService;
use crate::storage::{BlockId, CacheManager};
use crate::stream::{ElementIter, KillSwitch};
use crate::worker::{ResultFn, Task, TaskEnv, TaskKind, TaskOutput, TaskReport};

pub use report::{JobReport, StageRecord, TaskRecord, TaskStatus};

/// How often the driver wakes up to check deadlines and cancellation while
/// no report arrives.
const POLL: Duration = Duration::from_millis(10);

static STAGE_STYLE: LazyLock<ProgressStyle> = LazyLock::new(|| {
    ProgressStyle::default_bar()
        .template("{spinner:.green} [{elapsed}] [{bar:40.cyan/blue}] {pos}/{len} ({eta}) {msg}")
        .map(|style| style.progress_chars("=>-"))
        .unwrap_or_else(|_| ProgressStyle::default_bar())
});

/// Why a stage stopped before all of its partitions succeeded.
enum StageFailure {
    /// A reduce task found map output missing. The job is planned again.
    FetchFailed {
        shuffle: ShuffleId,
        map: usize,
        dataset: DatasetId,
        partition: usize,
        cause: TaskError,
    },
    Fatal(EngineError),
}

impl From<EngineError> for StageFailure {
    fn from(error: EngineError) -> Self {
        StageFailure::Fatal(error)
    }
}

/// The attempt currently in flight for a partition.
struct Running {
    attempt: u32,
    kill: KillSwitch,
    dispatched: Instant,
    deadline: Option<Instant>,
}

/// Answers planning questions from the cache and the shuffle service.
struct StorageProbe<'a> {
    cache: &'a CacheManager,
    shuffle: &'a dyn ShuffleService,
}

impl PlanProbe for StorageProbe<'_> {
    fn is_materialized(&self, dataset: DatasetId, partitions: &[usize]) -> bool {
        self.cache.level(dataset).is_retained()
            && partitions
                .iter()
                .all(|&partition| self.cache.contains(BlockId::new(dataset, partition)))
    }

    fn missing_maps(&self, shuffle: ShuffleId, maps: usize) -> Vec<usize> {
        self.shuffle.missing_maps(shuffle, maps)
    }
}

/// Drives one job: plans stages, dispatches their tasks and reacts to the
/// reports. Lives on the driver thread for the duration of an action.
pub(crate) struct Scheduler<'a> {
    ctx: &'a ContextInner,
    job: JobId,
    cancel: Arc<AtomicBool>,
    next_stage: Cell<usize>,
    /// Depth of nested sampling jobs in progress.
    sampling: Cell<usize>,
    report: RefCell<JobReport>,
    started: Instant,
}

impl<'a> Scheduler<'a> {
    pub(crate) fn new(ctx: &'a ContextInner, job: JobId, cancel: Arc<AtomicBool>) -> Self {
        Self {
            ctx,
            job,
            cancel,
            next_stage: Cell::new(0),
            sampling: Cell::new(0),
            report: RefCell::new(JobReport::new(job)),
            started: Instant::now(),
        }
    }

    pub(crate) fn finish(self) -> JobReport {
        let mut report = self.report.into_inner();
        report.duration = self.started.elapsed();
        report
    }

    /// Like [`Scheduler::run_action`] for a job that only inspects data the
    /// main job computes again, such as range bound sampling. Accumulator
    /// updates of its result tasks are dropped. Shuffle output it produces is
    /// reused by the main job, so map tasks keep theirs.
    pub(crate) fn run_sample<T, R, F>(
        &self,
        dataset: DatasetId,
        partitions: &[usize],
        func: F,
    ) -> Result<Vec<R>, EngineError>
    where
        T: Data,
        R: Send + 'static,
        F: Fn(ElementIter<T>) -> anyhow::Result<R> + Send + Sync + 'static,
    {
        self.sampling.set(self.sampling.get() + 1);
        let result = self.run_action(dataset, partitions, func);
        self.sampling.set(self.sampling.get() - 1);
        result
    }

    /// Computes `partitions` of `dataset` and applies `func` to each of them,
    /// returning one result per distinct partition in ascending order.
    ///
    /// Lost shuffle output is regenerated by planning the job again, up to
    /// `max_stage_attempts` times.
    pub(crate) fn run_action<T, R, F>(
        &self,
        dataset: DatasetId,
        partitions: &[usize],
        func: F,
    ) -> Result<Vec<R>, EngineError>
    where
        T: Data,
        R: Send + 'static,
        F: Fn(ElementIter<T>) -> anyhow::Result<R> + Send + Sync + 'static,
    {
        let graph = self.ctx.snapshot();
        if !graph.contains(dataset) {
            return Err(EngineError::LineageInconsistency(format!(
                "{dataset} is not part of this context"
            )));
        }

        let total = graph.partitions(dataset);
        let mut wanted: Vec<usize> = partitions.to_vec();
        wanted.sort_unstable();
        wanted.dedup();
        if let Some(&partition) = wanted.iter().find(|&&p| p >= total) {
            return Err(EngineError::PartitionOutOfRange {
                dataset,
                partition,
                partitions: total,
            });
        }

        let result_fn: ResultFn = Arc::new(move |iter: AnyIter| {
            let iter = iter.downcast::<ElementIter<T>>().map_err(|_| {
                TaskError::Lineage(format!(
                    "action expected elements of type {}",
                    std::any::type_name::<T>()
                ))
            })?;
            let value = func(*iter).map_err(TaskError::user)?;
            Ok(Box::new(value) as Boxed)
        });

        let mut results: BTreeMap<usize, Boxed> = BTreeMap::new();
        let mut attempt = 0;

        loop {
            self.check_cancelled()?;

            let remaining: Vec<usize> = wanted
                .iter()
                .copied()
                .filter(|partition| !results.contains_key(partition))
                .collect();
            if remaining.is_empty() {
                break;
            }

            let graph = self.ctx.snapshot();
            let probe = StorageProbe {
                cache: &self.ctx.cache,
                shuffle: self.ctx.shuffle.as_ref(),
            };
            let stages = graph.plan_for(dataset, &remaining, &probe)?;
            tracing::debug!(%dataset, stages = stages.len(), attempt, "planned");

            match self.run_stages(&graph, stages, &result_fn, attempt, &mut results) {
                Ok(()) => {}
                Err(StageFailure::Fatal(error)) => return Err(error),
                Err(StageFailure::FetchFailed {
                    shuffle,
                    map,
                    dataset,
                    partition,
                    cause,
                }) => {
                    attempt += 1;
                    if attempt >= self.ctx.config.max_stage_attempts {
                        return Err(EngineError::ActionFailed {
                            dataset,
                            partition,
                            attempts: attempt,
                            cause,
                        });
                    }

                    tracing::warn!(%shuffle, map, attempt, "map output lost, recomputing");
                    self.ctx.shuffle.unregister_map(shuffle, map);
                }
            }
        }

        wanted
            .into_iter()
            .map(|partition| {
                results
                    .remove(&partition)
                    .and_then(|value| value.downcast::<R>().ok())
                    .map(|value| *value)
                    .ok_or_else(|| {
                        EngineError::LineageInconsistency(format!(
                            "no result for partition {partition} of {dataset}"
                        ))
                    })
            })
            .collect()
    }

    fn run_stages(
        &self,
        graph: &Arc<LineageGraph>,
        stages: Vec<Stage>,
        result_fn: &ResultFn,
        attempt: u32,
        results: &mut BTreeMap<usize, Boxed>,
    ) -> Result<(), StageFailure> {
        let env = Arc::new(TaskEnv {
            graph: graph.clone(),
            cache: self.ctx.cache.clone(),
            shuffle: self.ctx.shuffle.clone(),
        });

        // Plan indices to job-wide stage ids.
        let mut ids: Vec<StageId> = Vec::with_capacity(stages.len());

        for stage in stages {
            let id = StageId(self.next_stage.get());
            self.next_stage.set(id.0 + 1);
            let parents = stage
                .parents
                .iter()
                .filter_map(|&parent| ids.get(parent).copied())
                .collect();
            ids.push(id);

            let started = Instant::now();
            let outcome = match &stage.kind {
                StageKind::ShuffleMap(dependency) => {
                    dependency.prepare(self)?;

                    let shuffle = dependency.shuffle_id();
                    let kind = TaskKind::ShuffleMap(dependency.clone());
                    self.run_stage(id, &stage, kind, &env, true, &mut |partition: usize, output: TaskOutput| {
                        if let TaskOutput::MapOutput(buckets) = output {
                            self.ctx.shuffle.shuffle_write(shuffle, partition, buckets);
                        }
                    })
                }
                StageKind::Result => {
                    let kind = TaskKind::Result(result_fn.clone());
                    let keep_updates = self.sampling.get() == 0;
                    self.run_stage(id, &stage, kind, &env, keep_updates, &mut |partition: usize, output: TaskOutput| {
                        if let TaskOutput::Value(value) = output {
                            results.insert(partition, value);
                        }
                    })
                }
            };

            self.report.borrow_mut().stages.push(StageRecord {
                id,
                kind: stage.label(),
                dataset: stage.dataset,
                shuffle: stage.shuffle(),
                partitions: stage.partitions.len(),
                parents,
                attempt,
                duration: started.elapsed(),
            });

            outcome?;
        }

        Ok(())
    }

    /// Runs every partition of one stage to success, keeping at most
    /// `slots()` attempts in flight.
    fn run_stage(
        &self,
        id: StageId,
        stage: &Stage,
        kind: TaskKind,
        env: &Arc<TaskEnv>,
        keep_updates: bool,
        on_success: &mut dyn FnMut(usize, TaskOutput),
    ) -> Result<(), StageFailure> {
        let slots = self.ctx.executor.slots().max(1);
        let timeout = self.ctx.config.timeout();
        let (sender, receiver) = channel::<TaskReport>();

        let span = tracing::info_span!("stage", stage = id.index(), kind = stage.label());
        span.pb_set_style(&STAGE_STYLE);
        span.pb_set_length(stage.partitions.len() as u64);
        span.pb_set_message(&format!(
            "{} of {}",
            stage.label(),
            env.graph.name(stage.dataset)
        ));
        let _enter = span.enter();

        let mut pending: VecDeque<usize> = stage.partitions.iter().copied().collect();
        let mut failures: HashMap<usize, u32> = HashMap::new();
        let mut running: HashMap<usize, Running> = HashMap::new();
        let mut done = 0;

        let outcome = loop {
            if done == stage.partitions.len() {
                break Ok(());
            }
            if self.cancel.load(Ordering::Acquire) {
                break Err(StageFailure::Fatal(EngineError::Cancelled(self.job)));
            }

            while running.len() < slots
                && let Some(partition) = pending.pop_front()
            {
                let attempt = failures.get(&partition).copied().unwrap_or(0);
                let kill = KillSwitch::for_job(&self.cancel);
                let now = Instant::now();
                running.insert(
                    partition,
                    Running {
                        attempt,
                        kill: kill.clone(),
                        dispatched: now,
                        deadline: timeout.map(|timeout| now + timeout),
                    },
                );

                let task = Task {
                    id: TaskId {
                        job: self.job,
                        stage: id,
                        partition,
                        attempt,
                    },
                    dataset: stage.dataset,
                    kind: kind.clone(),
                    env: env.clone(),
                    kill,
                };
                self.ctx.executor.dispatch(task, sender.clone());
            }

            match receiver.recv_timeout(POLL) {
                Ok(report) => {
                    let partition = report.id.partition;
                    let current = running
                        .get(&partition)
                        .is_some_and(|run| run.attempt == report.id.attempt);

                    if !current {
                        tracing::trace!(task = %report.id, "ignoring stale report");
                        self.record(&report, TaskStatus::Stale, None);
                        continue;
                    }

                    let run = running.remove(&partition);
                    let dispatched = run.map(|run| run.dispatched);
                    match report.outcome {
                        Ok(output) => {
                            self.record_parts(
                                report.id,
                                report.duration,
                                TaskStatus::Succeeded,
                                dispatched,
                            );
                            if keep_updates {
                                self.ctx.merge_accumulators(report.accumulators);
                            }
                            on_success(partition, output);
                            done += 1;
                            span.pb_inc(1);
                        }
                        Err(error) => {
                            let status = match error {
                                TaskError::Killed => TaskStatus::Killed,
                                _ => TaskStatus::Failed,
                            };
                            self.record_parts(report.id, report.duration, status, dispatched);

                            if let Err(failure) =
                                self.handle_failure(id, stage, partition, error, &mut failures, &mut pending)
                            {
                                break Err(failure);
                            }
                        }
                    }
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => {
                    break Err(StageFailure::Fatal(EngineError::LineageInconsistency(
                        String::from("executor dropped the report channel"),
                    )));
                }
            }

            let now = Instant::now();
            let expired: Vec<usize> = running
                .iter()
                .filter(|(_, run)| run.deadline.is_some_and(|deadline| deadline <= now))
                .map(|(partition, _)| *partition)
                .collect();

            let mut failed = None;
            for partition in expired {
                let Some(run) = running.remove(&partition) else {
                    continue;
                };
                run.kill.kill();
                let elapsed = run.dispatched.elapsed();
                self.record_parts(
                    TaskId {
                        job: self.job,
                        stage: id,
                        partition,
                        attempt: run.attempt,
                    },
                    elapsed,
                    TaskStatus::TimedOut,
                    Some(run.dispatched),
                );
                tracing::warn!(partition, attempt = run.attempt, ?elapsed, "task timed out");

                let error = TaskError::TimedOut(elapsed);
                if let Err(failure) =
                    self.retry_or_fail(stage, partition, error, &mut failures, &mut pending)
                {
                    failed = Some(failure);
                    break;
                }
            }
            if let Some(failure) = failed {
                break Err(failure);
            }
        };

        // Whatever is still running belongs to a stage that is over.
        for run in running.values() {
            run.kill.kill();
        }

        outcome
    }

    fn handle_failure(
        &self,
        id: StageId,
        stage: &Stage,
        partition: usize,
        error: TaskError,
        failures: &mut HashMap<usize, u32>,
        pending: &mut VecDeque<usize>,
    ) -> Result<(), StageFailure> {
        match error {
            TaskError::Transformation(source) => Err(StageFailure::Fatal(EngineError::Transformation {
                dataset: stage.dataset,
                name: self.ctx.snapshot().name(stage.dataset),
                partition,
                stage: id,
                source,
            })),
            TaskError::FetchFailed { shuffle, map } => Err(StageFailure::FetchFailed {
                shuffle,
                map,
                dataset: stage.dataset,
                partition,
                cause: error,
            }),
            TaskError::Lineage(message) => Err(StageFailure::Fatal(
                EngineError::LineageInconsistency(message),
            )),
            TaskError::Killed if self.cancel.load(Ordering::Acquire) => {
                Err(StageFailure::Fatal(EngineError::Cancelled(self.job)))
            }
            error => self.retry_or_fail(stage, partition, error, failures, pending),
        }
    }

    fn retry_or_fail(
        &self,
        stage: &Stage,
        partition: usize,
        error: TaskError,
        failures: &mut HashMap<usize, u32>,
        pending: &mut VecDeque<usize>,
    ) -> Result<(), StageFailure> {
        let count = failures.entry(partition).or_insert(0);
        *count += 1;

        if *count >= self.ctx.config.max_task_attempts {
            return Err(StageFailure::Fatal(EngineError::ActionFailed {
                dataset: stage.dataset,
                partition,
                attempts: *count,
                cause: error,
            }));
        }

        tracing::warn!(partition, attempt = *count, %error, "retrying task");
        pending.push_back(partition);
        Ok(())
    }

    fn check_cancelled(&self) -> Result<(), EngineError> {
        if self.cancel.load(Ordering::Acquire) {
            return Err(EngineError::Cancelled(self.job));
        }
        Ok(())
    }

    fn record(&self, report: &TaskReport, status: TaskStatus, dispatched: Option<Instant>) {
        self.record_parts(report.id, report.duration, status, dispatched);
    }

    fn record_parts(
        &self,
        id: TaskId,
        duration: Duration,
        status: TaskStatus,
        dispatched: Option<Instant>,
    ) {
        let offset = dispatched
            .map(|at| at.saturating_duration_since(self.started))
            .unwrap_or_default();

        self.report.borrow_mut().tasks.push(TaskRecord {
            stage: id.stage,
            partition: id.partition,
            attempt: id.attempt,
            offset,
            duration,
            status,
        });
    }
}
