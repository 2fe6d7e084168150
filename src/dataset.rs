use std::collections::HashMap;
use std::fmt::{Debug, Display, Formatter};
use std::fs::File;
use std::hash::Hash;
use std::io::{BufWriter, Write};
use std::marker::PhantomData;
use std::sync::Arc;

use anyhow::Context as _;
use camino::Utf8Path;
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::context::Context;
use crate::core::{Data, DatasetId};
use crate::error::{EngineError, TaskError};
use crate::lineage::Transform;
use crate::lineage::ops::{CoalescedNode, MapPartitionsNode, PartitionFn, UnionNode, coalesce_groups};
use crate::partitioner::PartitionerInfo;
use crate::storage::{CborCodec, StorageLevel};
use crate::stream::ElementIter;
use crate::worker;

/// Lets the compiler infer the signature of a partition closure.
pub(crate) fn narrow<T, U, G>(g: G) -> PartitionFn<T, U>
where
    G: Fn(ElementIter<T>, usize) -> ElementIter<U> + Send + Sync + 'static,
{
    Arc::new(g)
}

/// An immutable, partitioned collection, computed lazily.
///
/// Transformations only record a new node in the lineage of the context and
/// return immediately. Actions such as [`Dataset::collect`] or
/// [`Dataset::count`] run a job that computes the partitions they need.
pub struct Dataset<T> {
    pub(crate) ctx: Context,
    pub(crate) id: DatasetId,
    pub(crate) _item: PhantomData<fn() -> T>,
}

impl<T> Clone for Dataset<T> {
    fn clone(&self) -> Self {
        Self {
            ctx: self.ctx.clone(),
            id: self.id,
            _item: PhantomData,
        }
    }
}

impl<T> Debug for Dataset<T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dataset")
            .field("id", &self.id)
            .field("type", &std::any::type_name::<T>())
            .finish()
    }
}

impl<T> Display for Dataset<T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let name = self.ctx.inner.snapshot().name(self.id);
        write!(f, "{name} ({})", self.id)
    }
}

impl<T: Data> Dataset<T> {
    pub fn id(&self) -> DatasetId {
        self.id
    }

    pub fn context(&self) -> &Context {
        &self.ctx
    }

    pub fn num_partitions(&self) -> usize {
        self.ctx.inner.snapshot().partitions(self.id)
    }

    /// How keys are placed, if this dataset came out of a shuffle and kept
    /// its keys in place since.
    pub fn partitioner(&self) -> Option<PartitionerInfo> {
        self.ctx.inner.snapshot().partitioner(self.id)
    }

    pub fn name(&self) -> String {
        self.ctx.inner.snapshot().name(self.id)
    }

    /// Sets the name used in logs, errors and lineage diagrams.
    pub fn named(self, name: impl Into<String>) -> Self {
        self.ctx.rename(self.id, name.into());
        self
    }

    pub(crate) fn same_context<U>(&self, other: &Dataset<U>) {
        assert!(
            Arc::ptr_eq(&self.ctx.inner, &other.ctx.inner),
            "datasets from different contexts cannot be combined"
        );
    }

    pub(crate) fn derive_narrow<U: Data>(
        &self,
        transform: Transform,
        preserves_partitioning: bool,
        f: PartitionFn<T, U>,
    ) -> Dataset<U> {
        // The snapshot must be released before deriving, or the graph is
        // copied on write.
        let (partitions, partitioner) = {
            let graph = self.ctx.inner.snapshot();
            let partitioner = preserves_partitioning.then(|| graph.partitioner(self.id)).flatten();
            (graph.partitions(self.id), partitioner)
        };

        self.ctx.derive(MapPartitionsNode {
            parent: self.id,
            partitions,
            transform,
            partitioner,
            f,
        })
    }

    // TRANSFORMATIONS

    pub fn map<U, F>(&self, f: F) -> Dataset<U>
    where
        U: Data,
        F: Fn(T) -> U + Send + Sync + 'static,
    {
        let f = Arc::new(f);
        self.derive_narrow(
            Transform::Map,
            false,
            narrow::<T, U, _>(move |iter, _| {
                let f = f.clone();
                Box::new(iter.map(move |x| f(x)))
            }),
        )
    }

    /// Like `map`, but the function may fail. The first error fails the task
    /// and, as a transformation error, the action.
    pub fn try_map<U, F>(&self, f: F) -> Dataset<U>
    where
        U: Data,
        F: Fn(T) -> anyhow::Result<U> + Send + Sync + 'static,
    {
        let f = Arc::new(f);
        self.derive_narrow(
            Transform::Map,
            false,
            narrow::<T, U, _>(move |iter, _| {
                let f = f.clone();
                Box::new(iter.map_while(move |x| match f(x) {
                    Ok(value) => Some(value),
                    Err(error) => {
                        worker::raise(TaskError::user(error));
                        None
                    }
                }))
            }),
        )
    }

    pub fn filter<F>(&self, f: F) -> Dataset<T>
    where
        F: Fn(&T) -> bool + Send + Sync + 'static,
    {
        let f = Arc::new(f);
        self.derive_narrow(
            Transform::Filter,
            true,
            narrow::<T, T, _>(move |iter, _| {
                let f = f.clone();
                Box::new(iter.filter(move |x| f(x)))
            }),
        )
    }

    pub fn flat_map<U, I, F>(&self, f: F) -> Dataset<U>
    where
        U: Data,
        I: IntoIterator<Item = U> + 'static,
        I::IntoIter: Send + 'static,
        F: Fn(T) -> I + Send + Sync + 'static,
    {
        let f = Arc::new(f);
        self.derive_narrow(
            Transform::FlatMap,
            false,
            narrow::<T, U, _>(move |iter, _| {
                let f = f.clone();
                Box::new(iter.flat_map(move |x| f(x)))
            }),
        )
    }

    /// Transforms each partition as a whole.
    pub fn map_partitions<U, I, F>(&self, f: F) -> Dataset<U>
    where
        U: Data,
        I: IntoIterator<Item = U>,
        I::IntoIter: Send + 'static,
        F: Fn(ElementIter<T>) -> I + Send + Sync + 'static,
    {
        self.map_partitions_with_index(move |_, iter| f(iter))
    }

    /// Like `map_partitions`, with the index of the partition.
    pub fn map_partitions_with_index<U, I, F>(&self, f: F) -> Dataset<U>
    where
        U: Data,
        I: IntoIterator<Item = U>,
        I::IntoIter: Send + 'static,
        F: Fn(usize, ElementIter<T>) -> I + Send + Sync + 'static,
    {
        self.map_partitions_inner(false, f)
    }

    /// Like `map_partitions_with_index` for functions that leave the keys of
    /// a pair dataset where they are, so the result keeps its partitioner.
    pub fn map_partitions_preserving<U, I, F>(&self, f: F) -> Dataset<U>
    where
        U: Data,
        I: IntoIterator<Item = U>,
        I::IntoIter: Send + 'static,
        F: Fn(usize, ElementIter<T>) -> I + Send + Sync + 'static,
    {
        self.map_partitions_inner(true, f)
    }

    fn map_partitions_inner<U, I, F>(&self, preserves_partitioning: bool, f: F) -> Dataset<U>
    where
        U: Data,
        I: IntoIterator<Item = U>,
        I::IntoIter: Send + 'static,
        F: Fn(usize, ElementIter<T>) -> I + Send + Sync + 'static,
    {
        self.derive_narrow(
            Transform::MapPartitions,
            preserves_partitioning,
            narrow::<T, U, _>(move |iter, split| Box::new(f(split, iter).into_iter())),
        )
    }

    /// Each partition as a single vector.
    pub fn glom(&self) -> Dataset<Vec<T>> {
        self.map_partitions(|iter| std::iter::once_with(move || iter.collect::<Vec<T>>()))
    }

    pub fn key_by<K, F>(&self, f: F) -> Dataset<(K, T)>
    where
        K: Data,
        F: Fn(&T) -> K + Send + Sync + 'static,
    {
        self.map(move |x| (f(&x), x))
    }

    /// Partitions of `self` followed by partitions of `other`. Duplicates are
    /// kept.
    ///
    /// # Panics
    ///
    /// If `other` was derived in another context.
    pub fn union(&self, other: &Dataset<T>) -> Dataset<T> {
        self.same_context(other);
        let parents = {
            let graph = self.ctx.inner.snapshot();
            vec![
                (self.id, graph.partitions(self.id)),
                (other.id, graph.partitions(other.id)),
            ]
        };
        self.ctx.derive(UnionNode {
            parents,
            _item: PhantomData,
        })
    }

    /// Merges neighbouring partitions down to `partitions` without a shuffle.
    pub fn coalesce(&self, partitions: usize) -> Dataset<T> {
        let groups = coalesce_groups(self.num_partitions(), partitions);
        self.ctx.derive(CoalescedNode {
            parent: self.id,
            groups,
            _item: PhantomData,
        })
    }

    /// Spreads the elements evenly over `partitions` through a shuffle.
    pub fn repartition(&self, partitions: usize) -> Dataset<T> {
        self.map_partitions_with_index(|split, iter| {
            iter.enumerate().map(move |(i, x)| (split.wrapping_add(i), x))
        })
        .partition_by(crate::partitioner::HashPartitioner::new(partitions))
        .values()
    }

    pub fn distinct(&self) -> Dataset<T>
    where
        T: Eq + Hash,
    {
        self.map(|x| (x, ())).reduce_by_key(|a, _| a).keys()
    }

    // PERSISTENCE

    /// Keeps computed partitions in memory as they are.
    pub fn cache(&self) -> Dataset<T> {
        self.ctx.inner.cache.persist(self.id, StorageLevel::MemoryDeserialized, None);
        self.clone()
    }

    /// Keeps computed partitions at `level`. Serialized levels encode with
    /// CBOR.
    pub fn persist(&self, level: StorageLevel) -> Dataset<T>
    where
        T: Serialize + DeserializeOwned,
    {
        let codec = Arc::new(CborCodec::<T>::new());
        self.ctx.inner.cache.persist(self.id, level, Some(codec));
        self.clone()
    }

    /// Drops every stored partition. Later actions recompute them.
    pub fn unpersist(&self) {
        self.ctx.inner.cache.unpersist(self.id);
    }

    pub fn storage_level(&self) -> StorageLevel {
        self.ctx.inner.cache.level(self.id)
    }

    /// JSON description of this dataset and its ancestors.
    pub fn explain(&self) -> String {
        let graph = self.ctx.inner.snapshot();
        let cache = &self.ctx.inner.cache;
        let explained = graph.explain(self.id, |dataset| cache.level(dataset));
        serde_json::to_string_pretty(&explained).unwrap_or_default()
    }

    // ACTIONS

    fn all_partitions(&self) -> Vec<usize> {
        (0..self.num_partitions()).collect()
    }

    fn run<R, F>(&self, func: F) -> Result<Vec<R>, EngineError>
    where
        R: Send + 'static,
        F: Fn(ElementIter<T>) -> anyhow::Result<R> + Send + Sync + 'static,
    {
        self.ctx.inner.run_job(self.id, &self.all_partitions(), func)
    }

    /// All elements, in partition order.
    pub fn collect(&self) -> Result<Vec<T>, EngineError> {
        let parts = self.run(|iter| Ok(iter.collect::<Vec<T>>()))?;
        Ok(parts.into_iter().flatten().collect())
    }

    pub fn count(&self) -> Result<u64, EngineError> {
        let counts = self.run(|iter| Ok(iter.count() as u64))?;
        Ok(counts.into_iter().sum())
    }

    /// Combines all elements with `f`, which must be associative and
    /// commutative. `None` for an empty dataset.
    pub fn reduce<F>(&self, f: F) -> Result<Option<T>, EngineError>
    where
        F: Fn(T, T) -> T + Send + Sync + 'static,
    {
        let f = Arc::new(f);
        let task_f = f.clone();
        let parts = self.run(move |iter| Ok(iter.reduce(|a, b| task_f(a, b))))?;
        Ok(parts.into_iter().flatten().reduce(|a, b| f(a, b)))
    }

    /// Folds every partition starting from `zero`, then folds the partition
    /// results starting from `zero` again.
    pub fn fold<F>(&self, zero: T, f: F) -> Result<T, EngineError>
    where
        F: Fn(T, T) -> T + Send + Sync + 'static,
    {
        let f = Arc::new(f);
        let task_f = f.clone();
        let task_zero = zero.clone();
        let parts = self.run(move |iter| Ok(iter.fold(task_zero.clone(), |a, b| task_f(a, b))))?;
        Ok(parts.into_iter().fold(zero, |a, b| f(a, b)))
    }

    /// Folds elements into `U` per partition with `seq`, then merges the
    /// partition results with `comb`.
    pub fn aggregate<U, S, C>(&self, zero: U, seq: S, comb: C) -> Result<U, EngineError>
    where
        U: Data,
        S: Fn(U, T) -> U + Send + Sync + 'static,
        C: Fn(U, U) -> U + Send + Sync + 'static,
    {
        let task_zero = zero.clone();
        let parts = self.run(move |iter| Ok(iter.fold(task_zero.clone(), &seq)))?;
        Ok(parts.into_iter().fold(zero, comb))
    }

    /// The first `n` elements in partition order.
    ///
    /// Partitions are scanned in rounds. The first round computes one
    /// partition and every following round four times as many as the one
    /// before, until enough elements were found.
    pub fn take(&self, n: usize) -> Result<Vec<T>, EngineError> {
        let total = self.num_partitions();
        let mut out = Vec::with_capacity(n.min(1024));
        let mut next = 0;
        let mut batch = 1;

        while out.len() < n && next < total {
            let end = (next + batch).min(total);
            let partitions: Vec<usize> = (next..end).collect();
            let limit = n - out.len();

            let parts = self.ctx.inner.run_job(self.id, &partitions, move |iter: ElementIter<T>| {
                Ok(iter.take(limit).collect::<Vec<T>>())
            })?;
            for part in parts {
                let room = n - out.len();
                out.extend(part.into_iter().take(room));
            }

            next = end;
            batch *= 4;
        }

        Ok(out)
    }

    pub fn first(&self) -> Result<Option<T>, EngineError> {
        Ok(self.take(1)?.into_iter().next())
    }

    pub fn is_empty(&self) -> Result<bool, EngineError> {
        Ok(self.take(1)?.is_empty())
    }

    /// Runs `f` on every element inside the tasks.
    pub fn foreach<F>(&self, f: F) -> Result<(), EngineError>
    where
        F: Fn(T) + Send + Sync + 'static,
    {
        self.run(move |iter| {
            iter.for_each(&f);
            Ok(())
        })?;
        Ok(())
    }

    pub fn foreach_partition<F>(&self, f: F) -> Result<(), EngineError>
    where
        F: Fn(ElementIter<T>) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.run(f)?;
        Ok(())
    }

    /// How many times each distinct element occurs.
    pub fn count_by_value(&self) -> Result<HashMap<T, u64>, EngineError>
    where
        T: Eq + Hash,
    {
        let parts = self.run(|iter| {
            let mut counts: HashMap<T, u64> = HashMap::new();
            for x in iter {
                *counts.entry(x).or_default() += 1;
            }
            Ok(counts)
        })?;

        let mut total: HashMap<T, u64> = HashMap::new();
        for part in parts {
            for (x, n) in part {
                *total.entry(x).or_default() += n;
            }
        }
        Ok(total)
    }

    /// Writes every partition to `dir/part-NNNNN`, one element per line.
    pub fn save_as_text_file(&self, dir: impl AsRef<Utf8Path>) -> Result<(), EngineError>
    where
        T: Display,
    {
        let dir = dir.as_ref().to_owned();
        std::fs::create_dir_all(&dir)?;

        self.run(move |iter| {
            let partition =
                worker::task_partition().context("save_as_text_file must run inside a task")?;
            let path = dir.join(format!("part-{partition:05}"));

            let file = File::create(&path).with_context(|| format!("Couldn't create {path}"))?;
            let mut out = BufWriter::new(file);
            for x in iter {
                writeln!(out, "{x}")?;
            }
            out.flush()?;
            Ok(())
        })?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    fn context() -> Context {
        Config::new().workers(3).finish().unwrap()
    }

    #[test]
    fn test_narrow_chain() {
        let ctx = context();
        let out = ctx
            .parallelize((1..=10).collect::<Vec<i32>>(), 3)
            .map(|x| x * 10)
            .filter(|x| x % 20 == 0)
            .flat_map(|x| vec![x, -x])
            .collect()
            .unwrap();
        assert_eq!(out, vec![20, -20, 40, -40, 60, -60, 80, -80, 100, -100]);
    }

    #[test]
    fn test_glom_and_index() {
        let ctx = context();
        let data = ctx.parallelize((0..6).collect::<Vec<u8>>(), 3);
        assert_eq!(data.glom().collect().unwrap(), vec![vec![0, 1], vec![2, 3], vec![4, 5]]);

        let tagged = data
            .map_partitions_with_index(|split, iter| iter.map(move |x| (split, x)))
            .collect()
            .unwrap();
        assert_eq!(tagged[5], (2, 5));
    }

    #[test]
    fn test_union_and_coalesce() {
        let ctx = context();
        let a = ctx.parallelize(vec![1, 2, 3], 3);
        let b = ctx.parallelize(vec![4, 5], 2);
        let both = a.union(&b);
        assert_eq!(both.num_partitions(), 5);

        let merged = both.coalesce(2);
        assert_eq!(merged.num_partitions(), 2);
        assert_eq!(merged.collect().unwrap(), vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn test_derive_does_not_copy_graph() {
        let ctx = context();
        let data = ctx.parallelize(vec![1, 2, 3], 3);
        let before = Arc::as_ptr(&ctx.inner.snapshot());

        let mapped = data.map(|x| x + 1).filter(|x| x % 2 == 0);
        let _ = mapped.union(&data).coalesce(1);

        assert_eq!(Arc::as_ptr(&ctx.inner.snapshot()), before);
        assert_eq!(ctx.inner.snapshot().len(), 5);
    }

    #[test]
    #[should_panic(expected = "different contexts")]
    fn test_union_across_contexts_panics() {
        let a = context().parallelize(vec![1], 1);
        let b = context().parallelize(vec![2], 1);
        let _ = a.union(&b);
    }

    #[test]
    fn test_actions() {
        let ctx = context();
        let data = ctx.range(1, 101, 4);
        assert_eq!(data.count().unwrap(), 100);
        assert_eq!(data.reduce(|a, b| a + b).unwrap(), Some(5050));
        assert_eq!(data.fold(0, |a, b| a + b).unwrap(), 5050);
        assert_eq!(
            data.aggregate((0, 0), |(s, n), x| (s + x, n + 1), |a, b| (a.0 + b.0, a.1 + b.1))
                .unwrap(),
            (5050, 100)
        );
        assert_eq!(data.first().unwrap(), Some(1));
        assert!(!data.is_empty().unwrap());

        let empty = ctx.parallelize(Vec::<i64>::new(), 3);
        assert_eq!(empty.reduce(|a, b| a + b).unwrap(), None);
        assert!(empty.is_empty().unwrap());
    }

    #[test]
    fn test_take_is_ordered_and_incremental() {
        let ctx = context();
        let data = ctx.range(0, 1000, 20);
        assert_eq!(data.take(3).unwrap(), vec![0, 1, 2]);

        // One partition holds 50 elements, so the first round is enough.
        let report = ctx.last_job_report().unwrap();
        assert_eq!(report.tasks.len(), 1);

        let many = data.take(120).unwrap();
        assert_eq!(many, (0..120).collect::<Vec<i64>>());
        assert!(data.take(0).unwrap().is_empty());
        assert_eq!(data.take(5000).unwrap().len(), 1000);
    }

    #[test]
    fn test_try_map_error_fails_action() {
        let ctx = context();
        let data = ctx.parallelize(vec!["1", "2", "x"], 1).named("numbers");
        let parsed = data.try_map(|s| Ok(s.parse::<u32>()?));
        match parsed.collect() {
            Err(EngineError::Transformation { partition, .. }) => assert_eq!(partition, 0),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_count_by_value_and_distinct() {
        let ctx = context();
        let data = ctx.parallelize(vec!["a", "b", "a", "c", "a"], 2);
        let counts = data.count_by_value().unwrap();
        assert_eq!(counts["a"], 3);
        assert_eq!(counts["c"], 1);

        let mut distinct = data.distinct().collect().unwrap();
        distinct.sort();
        assert_eq!(distinct, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_repartition_keeps_elements() {
        let ctx = context();
        let data = ctx.parallelize((0..100).collect::<Vec<u32>>(), 2).repartition(7);
        assert_eq!(data.num_partitions(), 7);
        let mut out = data.collect().unwrap();
        out.sort();
        assert_eq!(out, (0..100).collect::<Vec<u32>>());
    }

    #[test]
    fn test_explain_is_json() {
        let ctx = context();
        let data = ctx.parallelize(vec![1, 2], 2).map(|x| x + 1).named("plus one");
        let explained: serde_json::Value = serde_json::from_str(&data.explain()).unwrap();
        let nodes = explained.as_array().unwrap();
        assert_eq!(nodes.len(), 2);
        assert_eq!(nodes[1]["name"], "plus one");
        assert_eq!(nodes[1]["transform"]["op"], "map");
    }
}
