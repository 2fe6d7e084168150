use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc::Sender;
use std::thread;
use std::time::{Duration, Instant};

use camino::Utf8PathBuf;
use nagare::{
    Config, Context, Dynamic, EngineError, Executor, JobId, LocalExecutor, LocalShuffle, ShuffleId,
    ShuffleService, StorageLevel, StreamError, Task, TaskError, TaskReport, TaskStatus,
};

fn context(workers: usize) -> Context {
    Config::new().workers(workers).finish().unwrap()
}

fn scratch_dir(name: &str) -> Utf8PathBuf {
    let dir = std::env::temp_dir().join(format!("nagare-{name}-{}", std::process::id()));
    let dir = Utf8PathBuf::try_from(dir).unwrap();
    let _ = std::fs::remove_dir_all(&dir);
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

/// Fails the first `remaining` dispatches as if no worker were available.
struct FlakyExecutor {
    inner: LocalExecutor,
    remaining: AtomicUsize,
}

impl FlakyExecutor {
    fn new(workers: usize, failures: usize) -> Self {
        Self {
            inner: LocalExecutor::new(workers).unwrap(),
            remaining: AtomicUsize::new(failures),
        }
    }
}

impl Executor for FlakyExecutor {
    fn slots(&self) -> usize {
        self.inner.slots()
    }

    fn dispatch(&self, task: Task, reply: Sender<TaskReport>) {
        let fail = self
            .remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();

        if fail {
            let report = TaskReport::failed(&task, TaskError::WorkerUnavailable(String::from("injected")));
            let _ = reply.send(report);
        } else {
            self.inner.dispatch(task, reply);
        }
    }
}

/// Loses the output of map partition 0 the first time it is fetched.
#[derive(Default)]
struct ForgetfulShuffle {
    inner: LocalShuffle,
    forgotten: AtomicBool,
}

impl ShuffleService for ForgetfulShuffle {
    fn shuffle_write(&self, shuffle: ShuffleId, map: usize, buckets: Vec<Dynamic>) {
        self.inner.shuffle_write(shuffle, map, buckets);
    }

    fn shuffle_read(&self, shuffle: ShuffleId, map: usize, reduce: usize) -> Option<Dynamic> {
        if map == 0 && !self.forgotten.swap(true, Ordering::SeqCst) {
            return None;
        }
        self.inner.shuffle_read(shuffle, map, reduce)
    }

    fn missing_maps(&self, shuffle: ShuffleId, maps: usize) -> Vec<usize> {
        self.inner.missing_maps(shuffle, maps)
    }

    fn unregister_map(&self, shuffle: ShuffleId, map: usize) {
        self.inner.unregister_map(shuffle, map);
    }
}

fn wait_for_job(ctx: &Context) -> JobId {
    let started = Instant::now();
    loop {
        if let Some(job) = ctx.active_jobs().first() {
            return *job;
        }
        assert!(started.elapsed() < Duration::from_secs(5), "job never started");
        thread::sleep(Duration::from_millis(2));
    }
}

#[test]
fn test_transformations_are_lazy() {
    let ctx = context(2);
    let calls = ctx.counter();

    let seen = calls.clone();
    let data = ctx
        .range(0, 100, 4)
        .map(move |x| {
            seen.add(1);
            x * 2
        })
        .filter(|x| x % 3 == 0)
        .map(|x| (x % 5, x))
        .reduce_by_key(|a, b| a + b);

    assert_eq!(calls.value(), 0);
    assert!(ctx.last_job_report().is_none());

    data.collect().unwrap();
    assert_eq!(calls.value(), 100);
}

#[test]
fn test_unpersist_recomputes() {
    let ctx = context(3);
    let calls = ctx.counter();

    let seen = calls.clone();
    let data = ctx
        .range(0, 300, 3)
        .map(move |x| {
            seen.add(1);
            x + 1
        })
        .cache();

    assert_eq!(data.storage_level(), StorageLevel::MemoryDeserialized);
    assert_eq!(data.count().unwrap(), 300);
    assert_eq!(data.count().unwrap(), 300);
    assert_eq!(calls.value(), 300);

    data.unpersist();
    data.unpersist();
    assert_eq!(data.storage_level(), StorageLevel::None);
    let total: i64 = data.fold(0, |a, b| a + b).unwrap();
    assert_eq!(total, (1..=300).sum::<i64>());
    assert_eq!(calls.value(), 600);
}

#[test]
fn test_reduce_is_partition_invariant() {
    let ctx = context(4);
    let items: Vec<u64> = (1..=1000).collect();

    for partitions in [1, 2, 5, 13] {
        let data = ctx.parallelize(items.clone(), partitions);
        assert_eq!(data.num_partitions(), partitions);
        assert_eq!(data.reduce(|a, b| a + b).unwrap(), Some(500_500));

        let by_key = data
            .map(|x| (x % 7, x))
            .reduce_by_key(|a, b| a + b)
            .collect_as_map()
            .unwrap();
        assert_eq!(by_key.len(), 7);
        assert_eq!(by_key.values().sum::<u64>(), 500_500);
    }
}

#[test]
fn test_accumulator_counts_once_without_retries() {
    let ctx = context(4);
    let records = ctx.counter();

    let seen = records.clone();
    let sums = ctx
        .range(0, 1000, 4)
        .map(move |x| {
            seen.add(1);
            (x % 10, x)
        })
        .reduce_by_key(|a, b| a + b)
        .collect()
        .unwrap();

    assert_eq!(sums.len(), 10);
    assert_eq!(records.value(), 1000);
}

#[test]
fn test_sort_counts_accumulators_once() {
    let ctx = context(4);
    let records = ctx.counter();

    let seen = records.clone();
    let sorted = ctx
        .range(0, 1000, 4)
        .map(move |x| {
            seen.add(1);
            (999 - x, x)
        })
        .sort_by_key(true, 4)
        .collect()
        .unwrap();

    assert_eq!(sorted.len(), 1000);
    assert_eq!(sorted[0], (0, 999));
    assert_eq!(records.value(), 1000);

    // Sampling after a shuffle reuses its map output.
    let seen = records.clone();
    records.reset();
    let sorted = ctx
        .range(0, 1000, 4)
        .map(move |x| {
            seen.add(1);
            (x % 50, 1)
        })
        .reduce_by_key(|a, b| a + b)
        .sort_by_key(false, 3)
        .collect()
        .unwrap();

    assert_eq!(sorted.len(), 50);
    assert_eq!(sorted[0], (49, 20));
    assert_eq!(records.value(), 1000);
}

#[test]
fn test_accumulator_overcounts_when_map_output_is_lost() {
    let executor = Arc::new(LocalExecutor::new(4).unwrap());
    let shuffle = Arc::new(ForgetfulShuffle::default());
    let ctx = Config::new()
        .workers(4)
        .finish_with_services(executor, shuffle)
        .unwrap();
    let records = ctx.counter();

    let seen = records.clone();
    let sums = ctx
        .range(0, 1000, 4)
        .map(move |x| {
            seen.add(1);
            (x % 10, x)
        })
        .reduce_by_key(|a, b| a + b)
        .collect_as_map()
        .unwrap();

    assert_eq!(sums.values().sum::<i64>(), (0..1000).sum::<i64>());

    // Map partition 0 ran twice.
    assert_eq!(records.value(), 1250);
    let report = ctx.last_job_report().unwrap();
    assert!(report.stages.iter().any(|stage| stage.attempt == 1));
}

/// Never finds any map output.
#[derive(Default)]
struct LosingShuffle {
    inner: LocalShuffle,
}

impl ShuffleService for LosingShuffle {
    fn shuffle_write(&self, shuffle: ShuffleId, map: usize, buckets: Vec<Dynamic>) {
        self.inner.shuffle_write(shuffle, map, buckets);
    }

    fn shuffle_read(&self, _: ShuffleId, _: usize, _: usize) -> Option<Dynamic> {
        None
    }

    fn missing_maps(&self, shuffle: ShuffleId, maps: usize) -> Vec<usize> {
        self.inner.missing_maps(shuffle, maps)
    }

    fn unregister_map(&self, shuffle: ShuffleId, map: usize) {
        self.inner.unregister_map(shuffle, map);
    }
}

#[test]
fn test_lost_map_output_is_bounded() {
    let executor = Arc::new(LocalExecutor::new(2).unwrap());
    let ctx = Config::new()
        .workers(2)
        .max_stage_attempts(3)
        .finish_with_services(executor, Arc::new(LosingShuffle::default()))
        .unwrap();

    let result = ctx
        .range(0, 100, 2)
        .map(|x| (x % 7, x))
        .reduce_by_key(|a, b| a + b)
        .collect();

    match result {
        Err(EngineError::ActionFailed { attempts, cause, .. }) => {
            assert_eq!(attempts, 3);
            assert!(matches!(cause, TaskError::FetchFailed { .. }));
        }
        other => panic!("unexpected {other:?}"),
    }

    let report = ctx.last_job_report().unwrap();
    assert!(report.stages.iter().any(|stage| stage.attempt == 2));
}

#[test]
fn test_group_by_key_over_many_keys() {
    let ctx = context(4);
    let pairs: Vec<(u16, u16)> = (0..100)
        .flat_map(|v| (0..256).map(move |k| (k, v)))
        .collect();

    for partitions in [1, 4, 9] {
        let groups = ctx
            .parallelize(pairs.clone(), partitions)
            .group_by_key()
            .collect_as_map()
            .unwrap();

        assert_eq!(groups.len(), 256);
        for (_, group) in groups {
            let mut values = group.into_vec();
            values.sort();
            assert_eq!(values, (0..100).collect::<Vec<u16>>());
        }
    }
}

#[test]
fn test_grouped_values_are_one_shot() {
    let ctx = context(2);
    let groups = ctx
        .parallelize(vec![("a", 1), ("a", 2), ("b", 3)], 2)
        .group_by_key()
        .collect_as_map()
        .unwrap();

    let group = &groups["a"];
    assert_eq!(group.len(), 2);
    assert_eq!(group.iter().unwrap().sum::<i32>(), 3);
    assert_eq!(group.iter().err(), Some(StreamError::AlreadyConsumed));
    assert_eq!(group.clone().into_vec().len(), 2);

    // Tasks traverse each group once, too.
    let sums = ctx
        .parallelize(vec![(1, 5), (1, 6)], 1)
        .group_by_key()
        .map_values(|group| {
            let first: i32 = group.iter().map(|values| values.sum()).unwrap_or(0);
            let second = group.iter().is_err();
            (first, second)
        })
        .collect()
        .unwrap();
    assert_eq!(sums, vec![(1, (11, true))]);
}

#[test]
fn test_word_count() {
    let ctx = context(2);
    let mut counts = ctx
        .parallelize(vec!["the cat sat on", "the mat the cat ran"], 2)
        .flat_map(|line| line.split(' ').map(str::to_string).collect::<Vec<_>>())
        .map(|word| (word, 1))
        .reduce_by_key(|a, b| a + b)
        .collect()
        .unwrap();
    counts.sort();

    let expected: Vec<(String, i32)> = [("cat", 2), ("mat", 1), ("on", 1), ("ran", 1), ("sat", 1), ("the", 3)]
        .into_iter()
        .map(|(word, n)| (word.to_string(), n))
        .collect();
    assert_eq!(counts, expected);
}

#[test]
fn test_transient_failures_are_retried() {
    let executor = Arc::new(FlakyExecutor::new(2, 2));
    let ctx = Config::new().workers(2).finish_with(executor).unwrap();

    let total = ctx.range(0, 50, 5).fold(0, |a, b| a + b).unwrap();
    assert_eq!(total, (0..50).sum::<i64>());

    let report = ctx.last_job_report().unwrap();
    assert_eq!(report.count(TaskStatus::Failed), 2);
    assert_eq!(report.count(TaskStatus::Succeeded), 5);
}

#[test]
fn test_retries_are_bounded() {
    let executor = Arc::new(FlakyExecutor::new(2, usize::MAX));
    let ctx = Config::new()
        .workers(2)
        .max_task_attempts(3)
        .finish_with(executor)
        .unwrap();

    match ctx.range(0, 10, 2).collect() {
        Err(EngineError::ActionFailed { attempts, cause, .. }) => {
            assert_eq!(attempts, 3);
            assert!(matches!(cause, TaskError::WorkerUnavailable(_)));
        }
        other => panic!("unexpected {other:?}"),
    }
}

#[test]
fn test_panics_are_not_retried() {
    let ctx = context(2);
    let data = ctx
        .range(0, 100, 4)
        .map(|x| {
            if x == 13 {
                panic!("boom at {x}");
            }
            x
        })
        .named("explosive");

    match data.count() {
        Err(EngineError::Transformation { name, partition, source, .. }) => {
            assert_eq!(name, "explosive");
            assert_eq!(partition, 0);
            assert!(source.to_string().contains("boom at 13"));
        }
        other => panic!("unexpected {other:?}"),
    }

    let report = ctx.last_job_report().unwrap();
    assert_eq!(report.count(TaskStatus::Failed), 1);
}

#[test]
fn test_cancel_running_job() {
    let ctx = context(2);
    let slow = ctx.range(0, 100_000, 2).map(|x| {
        thread::sleep(Duration::from_millis(1));
        x
    });

    let action = thread::spawn(move || slow.count());
    let job = wait_for_job(&ctx);
    assert!(ctx.cancel_job(job));

    match action.join().unwrap() {
        Err(EngineError::Cancelled(cancelled)) => assert_eq!(cancelled, job),
        other => panic!("unexpected {other:?}"),
    }
    assert!(ctx.active_jobs().is_empty());
    assert!(!ctx.cancel_job(job));

    // The context stays usable.
    assert_eq!(ctx.range(0, 10, 2).count().unwrap(), 10);
}

#[test]
fn test_cancel_keeps_stored_partitions() {
    let ctx = context(2);
    let computed = ctx.counter();

    let seen = computed.clone();
    let base = ctx
        .range(0, 1000, 2)
        .map(move |x| {
            seen.add(1);
            x
        })
        .cache();
    assert_eq!(base.count().unwrap(), 1000);
    assert_eq!(ctx.storage_stats().memory_blocks, 2);

    let slow = base.map(|x| {
        thread::sleep(Duration::from_millis(5));
        x
    });
    let action = thread::spawn(move || slow.count());
    let job = wait_for_job(&ctx);
    assert!(ctx.cancel_job(job));
    assert!(matches!(action.join().unwrap(), Err(EngineError::Cancelled(_))));

    let stats = ctx.storage_stats();
    assert_eq!(stats.memory_blocks, 2);

    assert_eq!(base.reduce(|a, b| a + b).unwrap(), Some((0..1000).sum::<i64>()));
    assert!(ctx.storage_stats().hits >= stats.hits + 2);
    assert_eq!(computed.value(), 1000);
}

#[test]
fn test_slow_attempt_times_out_and_is_retried() {
    let ctx = Config::new()
        .workers(2)
        .task_timeout(Duration::from_millis(100))
        .finish()
        .unwrap();

    let data = ctx.range(0, 4, 2).map(|x| {
        if x == 0 && nagare::task_attempt() == Some(0) {
            thread::sleep(Duration::from_millis(600));
        }
        x
    });

    assert_eq!(data.collect().unwrap(), vec![0, 1, 2, 3]);
    let report = ctx.last_job_report().unwrap();
    assert_eq!(report.count(TaskStatus::TimedOut), 1);
    assert!(report.tasks.iter().any(|t| t.partition == 0 && t.attempt == 1 && t.status == TaskStatus::Succeeded));
}

#[test]
fn test_stages_split_at_shuffles() {
    let ctx = context(3);
    let words = ctx.parallelize(vec!["a", "b", "a", "c", "b", "a"], 3);
    let by_count = words
        .map(|w| (w, 1))
        .reduce_by_key(|a, b| a + b)
        .map(|(w, n)| (n, w))
        .group_by_key()
        .map_values(|group| {
            let mut words = group.into_vec();
            words.sort();
            words
        });

    let mut out = by_count.collect().unwrap();
    out.sort();
    assert_eq!(out, vec![(1, vec!["c"]), (2, vec!["b"]), (3, vec!["a"])]);

    let report = ctx.last_job_report().unwrap();
    assert_eq!(report.stage_count(), 3);
    assert_eq!(report.shuffle_stage_count(), 2);
    let result = report.stages.last().unwrap();
    assert_eq!(result.kind, "result");
    assert_eq!(result.parents, vec![report.stages[1].id]);
    assert!(report.render_mermaid().contains("shuffle_map"));

    // Shuffle output is kept, so a second action only runs the result stage.
    by_count.count().unwrap();
    assert_eq!(ctx.last_job_report().unwrap().stage_count(), 1);
}

#[test]
fn test_spill_and_demotion() {
    let dir = scratch_dir("spill");
    // Room for one partition of 500 i64 values.
    let ctx = Config::new()
        .workers(2)
        .memory_budget(4096)
        .spill_dir(&dir)
        .finish()
        .unwrap();

    let first = ctx.range(0, 500, 1).persist(StorageLevel::MemoryAndDisk);
    assert_eq!(first.count().unwrap(), 500);
    let stats = ctx.storage_stats();
    assert_eq!((stats.memory_blocks, stats.disk_blocks), (1, 0));

    // The second dataset pushes the first one out to disk.
    let second = first.map(|x| x + 1).cache();
    assert_eq!(second.count().unwrap(), 500);
    let stats = ctx.storage_stats();
    assert_eq!((stats.memory_blocks, stats.disk_blocks), (1, 1));
    assert_eq!(stats.spills, 1);

    let hits = stats.hits;
    assert_eq!(first.reduce(|a, b| a + b).unwrap(), Some((0..500).sum::<i64>()));
    assert!(ctx.storage_stats().hits > hits);

    // Without disk, blocks that do not fit are recomputed.
    let wide = ctx.range(0, 2000, 4).map(|x| x * 2).cache();
    assert_eq!(wide.count().unwrap(), 2000);
    assert_eq!(wide.count().unwrap(), 2000);
    assert!(ctx.storage_stats().evictions > 0);

    drop(ctx);
    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn test_contexts_sharing_a_spill_dir() {
    let dir = scratch_dir("shared-spill");
    let spilling = |dir: &Utf8PathBuf| {
        Config::new()
            .workers(1)
            .memory_budget(16)
            .spill_dir(dir)
            .finish()
            .unwrap()
    };
    let a = spilling(&dir);
    let b = spilling(&dir);

    let low = a.range(0, 5, 1).persist(StorageLevel::MemoryAndDisk);
    let high = b.range(100, 105, 1).persist(StorageLevel::MemoryAndDisk);
    assert_eq!(low.count().unwrap(), 5);
    assert_eq!(high.count().unwrap(), 5);
    assert_eq!(a.storage_stats().disk_blocks, 1);
    assert_eq!(b.storage_stats().disk_blocks, 1);

    drop(high);
    drop(b);
    assert_eq!(low.collect().unwrap(), vec![0, 1, 2, 3, 4]);
    assert_eq!(a.storage_stats().disk_blocks, 1);

    drop(low);
    drop(a);
    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn test_serialized_persistence() {
    let ctx = context(2);
    let data = ctx
        .parallelize(vec![String::from("x"), String::from("yy")], 2)
        .persist(StorageLevel::MemorySerialized);

    assert_eq!(data.collect().unwrap(), vec!["x", "yy"]);
    assert_eq!(data.collect().unwrap(), vec!["x", "yy"]);
    assert_eq!(ctx.storage_stats().memory_blocks, 2);
}

#[test]
fn test_broadcast_in_tasks() {
    let ctx = context(2);
    let names: HashMap<i64, &str> = [(1, "one"), (2, "two")].into_iter().collect();
    let names = ctx.broadcast(names);

    let shared = names.clone();
    let out = ctx
        .range(1, 4, 2)
        .map(move |x| shared.get(&x).copied().unwrap_or("many"))
        .collect()
        .unwrap();
    assert_eq!(out, vec!["one", "two", "many"]);
}

#[test]
fn test_text_files_round_trip() {
    let dir = scratch_dir("text");
    let ctx = context(3);

    let lines: Vec<String> = (0..200).map(|i| format!("line {i:03}")).collect();
    ctx.parallelize(lines.clone(), 4)
        .save_as_text_file(dir.join("out"))
        .unwrap();
    assert!(dir.join("out/part-00003").is_file());

    let read = ctx.text_file(&format!("{dir}/out/part-*"), 6).unwrap();
    assert!(read.num_partitions() >= 4);
    assert_eq!(read.collect().unwrap(), lines);
    assert_eq!(read.name(), format!("text_file({dir}/out/part-*)"));

    let missing = ctx.text_file(&format!("{dir}/nothing/*.txt"), 2).unwrap();
    assert_eq!(missing.count().unwrap(), 0);

    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn test_sorted_take() {
    let ctx = context(4);
    let pairs = ctx.parallelize((0..300).rev().map(|i| (i, i * i)).collect::<Vec<(i32, i32)>>(), 6);
    let sorted = pairs.sort_by_key(true, 4);
    assert_eq!(sorted.take(3).unwrap(), vec![(0, 0), (1, 1), (2, 4)]);
    assert_eq!(sorted.first().unwrap(), Some((0, 0)));
}

#[test]
fn test_run_job_on_selected_partitions() {
    let ctx = context(2);
    let data = ctx.range(0, 40, 4);
    let sums = ctx
        .run_job(&data, &[3, 1, 3], |iter| Ok(iter.sum::<i64>()))
        .unwrap();
    assert_eq!(sums, vec![(10..20).sum::<i64>(), (30..40).sum::<i64>()]);

    assert!(matches!(
        ctx.run_job(&data, &[4], |iter| Ok(iter.count())),
        Err(EngineError::PartitionOutOfRange { partition: 4, partitions: 4, .. })
    ));
}
