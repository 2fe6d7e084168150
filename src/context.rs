use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};

use camino::{Utf8Path, Utf8PathBuf};

use crate::config::Config;
use crate::core::{Boxed, Data, DatasetId, JobId, ShuffleId, lock, read, write};
use crate::dataset::Dataset;
use crate::error::EngineError;
use crate::lineage::ops::{Producer, SourceNode};
use crate::lineage::{LineageGraph, SourceKind, TypedNode};
use crate::scheduler::{JobReport, Scheduler};
use crate::shared::{Accumulator, AccumulatorId, AccumulatorSink, Broadcast, BroadcastId};
use crate::shuffle::{LocalShuffle, ShuffleService};
use crate::source;
use crate::storage::{CacheManager, StoreStats};
use crate::stream::ElementIter;
use crate::worker::{Executor, LocalExecutor};

static CONTEXTS: AtomicUsize = AtomicUsize::new(0);

/// Driver state shared by a [`Context`] and every dataset derived from it.
pub(crate) struct ContextInner {
    pub config: Config,
    graph: RwLock<Arc<LineageGraph>>,
    pub cache: Arc<CacheManager>,
    pub shuffle: Arc<dyn ShuffleService>,
    pub executor: Arc<dyn Executor>,
    accumulators: Mutex<HashMap<AccumulatorId, Weak<dyn AccumulatorSink>>>,
    jobs: Mutex<HashMap<JobId, Arc<AtomicBool>>>,
    next_job: AtomicU64,
    next_shuffle: AtomicUsize,
    next_accumulator: AtomicU64,
    next_broadcast: AtomicU64,
    last_report: Mutex<Option<JobReport>>,
    /// Spill directory owned by this context, removed on drop.
    scratch: Utf8PathBuf,
}

impl ContextInner {
    /// Immutable view of the lineage for one job.
    pub(crate) fn snapshot(&self) -> Arc<LineageGraph> {
        read(&self.graph).clone()
    }

    pub(crate) fn merge_accumulators(&self, updates: Vec<(AccumulatorId, Boxed)>) {
        if updates.is_empty() {
            return;
        }

        let sinks = lock(&self.accumulators);
        for (id, update) in updates {
            match sinks.get(&id).and_then(Weak::upgrade) {
                Some(sink) => sink.merge_any(update),
                None => tracing::trace!(?id, "update for a dropped accumulator"),
            }
        }
    }

    pub(crate) fn run_job<T, R, F>(
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
        let job = JobId(self.next_job.fetch_add(1, Ordering::Relaxed));
        let cancel = Arc::new(AtomicBool::new(false));
        lock(&self.jobs).insert(job, cancel.clone());

        let span = tracing::info_span!("job", id = job.0, %dataset);
        let _enter = span.enter();

        let scheduler = Scheduler::new(self, job, cancel);
        let result = scheduler.run_action(dataset, partitions, func);
        let report = scheduler.finish();
        lock(&self.jobs).remove(&job);

        match &result {
            Ok(_) => tracing::info!(
                stages = report.stage_count(),
                tasks = report.tasks.len(),
                duration = ?report.duration,
                "job finished"
            ),
            Err(error) => tracing::warn!(%error, duration = ?report.duration, "job failed"),
        }

        *lock(&self.last_report) = Some(report);
        result
    }
}

impl Drop for ContextInner {
    fn drop(&mut self) {
        self.cache.clear();
        let _ = std::fs::remove_dir_all(&self.scratch);
    }
}

/// Entry point of the engine.
///
/// A context owns the lineage of every dataset derived from it, the
/// partition store, the shuffle service and the executor. It is cheap to
/// clone; all clones share the same state.
///
/// ```rust
/// use nagare::Config;
///
/// let ctx = Config::new().workers(2).finish().unwrap();
/// let squares = ctx.parallelize((1..=4).collect::<Vec<u32>>(), 2).map(|x| x * x);
/// assert_eq!(squares.collect().unwrap(), vec![1, 4, 9, 16]);
/// ```
#[derive(Clone)]
pub struct Context {
    pub(crate) inner: Arc<ContextInner>,
}

impl Context {
    /// Builds a context with a local worker pool and in-memory shuffle.
    pub fn new(config: Config) -> Result<Self, EngineError> {
        config.validate()?;
        let executor = LocalExecutor::new(config.workers)?;
        Self::with_services(config, Arc::new(executor), None)
    }

    /// Builds a context around a custom executor and, optionally, a custom
    /// shuffle service.
    pub fn with_services(
        config: Config,
        executor: Arc<dyn Executor>,
        shuffle: Option<Arc<dyn ShuffleService>>,
    ) -> Result<Self, EngineError> {
        config.validate()?;

        let spill_dir = context_spill_dir(config.spill_dir.as_deref());

        tracing::debug!(
            app = %config.app_name,
            slots = executor.slots(),
            %spill_dir,
            "context created"
        );

        let inner = ContextInner {
            cache: Arc::new(CacheManager::new(config.memory_budget, spill_dir.clone())),
            shuffle: shuffle.unwrap_or_else(|| Arc::new(LocalShuffle::new())),
            executor,
            config,
            graph: RwLock::new(Arc::new(LineageGraph::default())),
            accumulators: Mutex::new(HashMap::new()),
            jobs: Mutex::new(HashMap::new()),
            next_job: AtomicU64::new(0),
            next_shuffle: AtomicUsize::new(0),
            next_accumulator: AtomicU64::new(0),
            next_broadcast: AtomicU64::new(0),
            last_report: Mutex::new(None),
            scratch: spill_dir,
        };

        Ok(Self {
            inner: Arc::new(inner),
        })
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    /// Distributes `items` over `partitions` contiguous slices. Zero means
    /// the configured default parallelism.
    pub fn parallelize<T: Data>(&self, items: Vec<T>, partitions: usize) -> Dataset<T> {
        let partitions = self.or_default(partitions);
        self.source(SourceKind::Parallelize, source::parallelize(items, partitions))
    }

    /// The integers in `start..end`, split into `partitions` ranges.
    pub fn range(&self, start: i64, end: i64, partitions: usize) -> Dataset<i64> {
        let partitions = self.or_default(partitions);
        self.source(SourceKind::Range, source::range(start, end, partitions))
    }

    /// Lines of all files matching the glob `pattern`.
    ///
    /// Files are listed and measured now, their contents are read by the
    /// tasks. Each file is split into byte ranges aligned to line breaks, at
    /// least `min_partitions` of them in total when the files are large
    /// enough.
    pub fn text_file(&self, pattern: &str, min_partitions: usize) -> Result<Dataset<String>, EngineError> {
        let producers = source::text_file(pattern, self.or_default(min_partitions))?;
        Ok(self
            .source(SourceKind::TextFile, producers)
            .named(format!("text_file({pattern})")))
    }

    /// A dataset with one partition per producer. Each producer is called by
    /// the task computing its partition, every time it is computed.
    pub fn from_partitions<T, I, F>(&self, producers: Vec<F>) -> Dataset<T>
    where
        T: Data,
        I: IntoIterator<Item = T>,
        I::IntoIter: Send + 'static,
        F: Fn() -> anyhow::Result<I> + Send + Sync + 'static,
    {
        let producers = producers
            .into_iter()
            .map(|f| {
                let producer: Producer<T> = Arc::new(move || -> anyhow::Result<ElementIter<T>> {
                    Ok(Box::new(f()?.into_iter()))
                });
                producer
            })
            .collect();
        self.source(SourceKind::Producer, producers)
    }

    fn source<T: Data>(&self, kind: SourceKind, producers: Vec<Producer<T>>) -> Dataset<T> {
        self.derive(SourceNode { kind, producers })
    }

    fn or_default(&self, partitions: usize) -> usize {
        if partitions == 0 {
            self.inner.config.default_parallelism
        } else {
            partitions
        }
    }

    /// Shares a read-only value with all tasks.
    pub fn broadcast<T: Send + Sync + 'static>(&self, value: T) -> Broadcast<T> {
        let id = BroadcastId(self.inner.next_broadcast.fetch_add(1, Ordering::Relaxed));
        Broadcast::new(id, value)
    }

    /// Creates an accumulator whose total starts at `zero`. `combine` must be
    /// associative and commutative.
    pub fn accumulator<T, F>(&self, zero: T, combine: F) -> Accumulator<T>
    where
        T: Data,
        F: Fn(T, T) -> T + Send + Sync + 'static,
    {
        let id = AccumulatorId(self.inner.next_accumulator.fetch_add(1, Ordering::Relaxed));
        let accumulator = Accumulator::new(id, zero, Arc::new(combine));

        let mut sinks = lock(&self.inner.accumulators);
        sinks.retain(|_, sink| sink.strong_count() > 0);
        sinks.insert(id, Arc::downgrade(&accumulator.sink()));
        accumulator
    }

    pub fn counter(&self) -> Accumulator<u64> {
        self.accumulator(0, |a, b| a + b)
    }

    /// Computes `partitions` of `dataset` and applies `func` to the elements
    /// of each, returning one result per distinct partition in ascending
    /// order. Every action is built on this.
    ///
    /// Fails with [`EngineError::LineageInconsistency`] if `dataset` was
    /// derived in another context.
    pub fn run_job<T, R, F>(
        &self,
        dataset: &Dataset<T>,
        partitions: &[usize],
        func: F,
    ) -> Result<Vec<R>, EngineError>
    where
        T: Data,
        R: Send + 'static,
        F: Fn(ElementIter<T>) -> anyhow::Result<R> + Send + Sync + 'static,
    {
        if !Arc::ptr_eq(&self.inner, &dataset.ctx.inner) {
            return Err(EngineError::LineageInconsistency(format!(
                "{} belongs to another context",
                dataset.id
            )));
        }
        self.inner.run_job(dataset.id, partitions, func)
    }

    /// Requests cancellation of a running job. Returns `false` if no such job
    /// is running.
    pub fn cancel_job(&self, job: JobId) -> bool {
        match lock(&self.inner.jobs).get(&job) {
            Some(flag) => {
                flag.store(true, Ordering::Release);
                tracing::info!(%job, "cancellation requested");
                true
            }
            None => false,
        }
    }

    pub fn cancel_all_jobs(&self) {
        for (job, flag) in lock(&self.inner.jobs).iter() {
            flag.store(true, Ordering::Release);
            tracing::info!(%job, "cancellation requested");
        }
    }

    pub fn active_jobs(&self) -> Vec<JobId> {
        let mut jobs: Vec<JobId> = lock(&self.inner.jobs).keys().copied().collect();
        jobs.sort();
        jobs
    }

    /// Report of the most recently finished job.
    pub fn last_job_report(&self) -> Option<JobReport> {
        lock(&self.inner.last_report).clone()
    }

    pub fn storage_stats(&self) -> StoreStats {
        self.inner.cache.stats()
    }

    /// The whole lineage as a Mermaid diagram.
    pub fn lineage(&self) -> String {
        self.inner.snapshot().to_string()
    }

    pub(crate) fn derive<N>(&self, node: N) -> Dataset<N::Item>
    where
        N: TypedNode + 'static,
    {
        let name = node.transform().label().to_string();
        let mut graph = write(&self.inner.graph);
        let id = Arc::make_mut(&mut graph).derive(name, Arc::new(node));
        tracing::trace!(dataset = %id, "derived");

        Dataset {
            ctx: self.clone(),
            id,
            _item: PhantomData,
        }
    }

    pub(crate) fn rename(&self, id: DatasetId, name: String) {
        let mut graph = write(&self.inner.graph);
        Arc::make_mut(&mut graph).rename(id, name);
    }

    pub(crate) fn next_shuffle_id(&self) -> ShuffleId {
        ShuffleId(self.inner.next_shuffle.fetch_add(1, Ordering::Relaxed))
    }
}

/// A directory no other context writes to. Dataset ids restart in every
/// context, so a shared spill directory needs a per-context component.
fn context_spill_dir(base: Option<&Utf8Path>) -> Utf8PathBuf {
    let base = match base {
        Some(dir) => dir.to_owned(),
        None => Utf8PathBuf::try_from(std::env::temp_dir())
            .unwrap_or_else(|_| Utf8PathBuf::from(".cache"))
            .join("nagare"),
    };
    let seq = CONTEXTS.fetch_add(1, Ordering::Relaxed);
    base.join(format!("{}-{}", std::process::id(), seq))
}
