use std::collections::HashMap;
use std::hash::Hash;
use std::marker::PhantomData;
use std::sync::Arc;

use crate::core::Data;
use crate::dataset::{Dataset, narrow};
use crate::error::EngineError;
use crate::lineage::Transform;
use crate::lineage::ops::{AggregatedNode, CreateFn, MergeFn, ShuffleDep, ShuffledNode, combine_ordered};
use crate::partitioner::{HashPartitioner, Partitioner, PartitionerInfo, RangePartitioner};
use crate::stream::{ElementIter, Grouped};

/// How values of one key are folded into a combiner of type `C`.
///
/// `create` starts a combiner from the first value of a key in a partition,
/// `merge_value` adds further values and `merge_combiners` joins combiners
/// built in different partitions.
pub struct Aggregator<V, C> {
    create: CreateFn<V, C>,
    merge_value: MergeFn<C, V>,
    merge_combiners: MergeFn<C, C>,
}

impl<V, C> Aggregator<V, C> {
    pub fn new<F, G, H>(create: F, merge_value: G, merge_combiners: H) -> Self
    where
        F: Fn(V) -> C + Send + Sync + 'static,
        G: Fn(C, V) -> C + Send + Sync + 'static,
        H: Fn(C, C) -> C + Send + Sync + 'static,
    {
        Self {
            create: Arc::new(create),
            merge_value: Arc::new(merge_value),
            merge_combiners: Arc::new(merge_combiners),
        }
    }
}

impl<V, C> Clone for Aggregator<V, C> {
    fn clone(&self) -> Self {
        Self {
            create: self.create.clone(),
            merge_value: self.merge_value.clone(),
            merge_combiners: self.merge_combiners.clone(),
        }
    }
}

#[derive(Clone)]
enum Side<V, W> {
    Left(V),
    Right(W),
}

/// Operations on datasets of key-value pairs.
impl<K, V> Dataset<(K, V)>
where
    K: Data + Eq + Hash,
    V: Data,
{
    pub fn map_values<U, F>(&self, f: F) -> Dataset<(K, U)>
    where
        U: Data,
        F: Fn(V) -> U + Send + Sync + 'static,
    {
        let f = Arc::new(f);
        self.derive_narrow(
            Transform::Map,
            true,
            narrow::<(K, V), (K, U), _>(move |iter, _| {
                let f = f.clone();
                Box::new(iter.map(move |(key, value)| (key, f(value))))
            }),
        )
    }

    pub fn flat_map_values<U, I, F>(&self, f: F) -> Dataset<(K, U)>
    where
        U: Data,
        I: IntoIterator<Item = U>,
        I::IntoIter: Send + 'static,
        F: Fn(V) -> I + Send + Sync + 'static,
    {
        let f = Arc::new(f);
        self.derive_narrow(
            Transform::FlatMap,
            true,
            narrow::<(K, V), (K, U), _>(move |iter, _| {
                let f = f.clone();
                Box::new(iter.flat_map(move |(key, value)| {
                    f(value).into_iter().map(move |u| (key.clone(), u))
                }))
            }),
        )
    }

    pub fn keys(&self) -> Dataset<K> {
        self.map(|(key, _)| key)
    }

    pub fn values(&self) -> Dataset<V> {
        self.map(|(_, value)| value)
    }

    /// Moves every pair to the partition `partitioner` assigns its key to.
    /// Returns `self` when the pairs are placed that way already.
    pub fn partition_by<P>(&self, partitioner: P) -> Dataset<(K, V)>
    where
        P: Partitioner<K> + 'static,
    {
        if self.partitioner() == Some(partitioner.info()) {
            return self.clone();
        }

        let dependency = self.shuffle_dependency(Arc::new(partitioner));
        self.ctx.derive(ShuffledNode {
            dependency: Arc::new(dependency),
        })
    }

    fn shuffle_dependency(&self, partitioner: Arc<dyn Partitioner<K>>) -> ShuffleDep<K, V> {
        ShuffleDep {
            id: self.ctx.next_shuffle_id(),
            parent: self.id,
            maps: self.num_partitions(),
            partitioner,
            _value: PhantomData,
        }
    }

    /// Hash partitioning reused from `self` when it has one, so aggregating
    /// twice by the same key does not shuffle twice.
    fn default_partitioner(&self, others: usize) -> HashPartitioner {
        match self.partitioner() {
            Some(PartitionerInfo::Hash { partitions }) => HashPartitioner::new(partitions),
            _ => HashPartitioner::new(self.num_partitions().max(others)),
        }
    }

    fn combine_locally<C: Data>(&self, create: CreateFn<V, C>, merge: MergeFn<C, V>) -> Dataset<(K, C)> {
        self.derive_narrow(
            Transform::Combine,
            true,
            narrow::<(K, V), (K, C), _>(move |iter, _| {
                let create = create.clone();
                let merge = merge.clone();
                Box::new(
                    std::iter::once_with(move || combine_ordered(iter, &*create, &*merge)).flatten(),
                )
            }),
        )
    }

    /// Generic keyed aggregation.
    ///
    /// Without a shuffle when the pairs are already placed by `partitioner`.
    /// Otherwise values are shuffled, after being combined per map partition
    /// if `map_side_combine` is set.
    pub fn combine_by_key_with<C, P>(
        &self,
        aggregator: Aggregator<V, C>,
        partitioner: P,
        map_side_combine: bool,
    ) -> Dataset<(K, C)>
    where
        C: Data,
        P: Partitioner<K> + 'static,
    {
        if self.partitioner() == Some(partitioner.info()) {
            return self.combine_locally(aggregator.create, aggregator.merge_value);
        }

        let partitioner: Arc<dyn Partitioner<K>> = Arc::new(partitioner);
        if map_side_combine {
            let combined = self.combine_locally(aggregator.create, aggregator.merge_value);
            let identity: CreateFn<C, C> = Arc::new(|combiner: C| combiner);
            self.ctx.derive(AggregatedNode {
                dependency: Arc::new(combined.shuffle_dependency(partitioner)),
                create: identity,
                merge: aggregator.merge_combiners,
            })
        } else {
            self.ctx.derive(AggregatedNode {
                dependency: Arc::new(self.shuffle_dependency(partitioner)),
                create: aggregator.create,
                merge: aggregator.merge_value,
            })
        }
    }

    pub fn combine_by_key<C, F, G, H>(&self, create: F, merge_value: G, merge_combiners: H) -> Dataset<(K, C)>
    where
        C: Data,
        F: Fn(V) -> C + Send + Sync + 'static,
        G: Fn(C, V) -> C + Send + Sync + 'static,
        H: Fn(C, C) -> C + Send + Sync + 'static,
    {
        let aggregator = Aggregator::new(create, merge_value, merge_combiners);
        self.combine_by_key_with(aggregator, self.default_partitioner(0), true)
    }

    /// Merges the values of each key with `f`, which must be associative and
    /// commutative.
    pub fn reduce_by_key<F>(&self, f: F) -> Dataset<(K, V)>
    where
        F: Fn(V, V) -> V + Send + Sync + 'static,
    {
        self.reduce_by_key_with(self.default_partitioner(0), f)
    }

    pub fn reduce_by_key_with<P, F>(&self, partitioner: P, f: F) -> Dataset<(K, V)>
    where
        P: Partitioner<K> + 'static,
        F: Fn(V, V) -> V + Send + Sync + 'static,
    {
        let f: MergeFn<V, V> = Arc::new(f);
        let aggregator = Aggregator {
            create: Arc::new(|value: V| value),
            merge_value: f.clone(),
            merge_combiners: f,
        };
        self.combine_by_key_with(aggregator, partitioner, true)
    }

    /// Like `reduce_by_key`, starting every key of every partition from
    /// `zero`.
    pub fn fold_by_key<F>(&self, zero: V, f: F) -> Dataset<(K, V)>
    where
        F: Fn(V, V) -> V + Send + Sync + 'static,
    {
        let f: MergeFn<V, V> = Arc::new(f);
        let first = f.clone();
        let aggregator = Aggregator {
            create: Arc::new(move |value: V| first(zero.clone(), value)),
            merge_value: f.clone(),
            merge_combiners: f,
        };
        self.combine_by_key_with(aggregator, self.default_partitioner(0), true)
    }

    /// Folds the values of each key into `U` with `seq` and merges the
    /// per-partition results with `comb`.
    pub fn aggregate_by_key<U, S, C>(&self, zero: U, seq: S, comb: C) -> Dataset<(K, U)>
    where
        U: Data,
        S: Fn(U, V) -> U + Send + Sync + 'static,
        C: Fn(U, U) -> U + Send + Sync + 'static,
    {
        let seq: MergeFn<U, V> = Arc::new(seq);
        let first = seq.clone();
        let aggregator = Aggregator {
            create: Arc::new(move |value: V| first(zero.clone(), value)),
            merge_value: seq,
            merge_combiners: Arc::new(comb),
        };
        self.combine_by_key_with(aggregator, self.default_partitioner(0), true)
    }

    /// All values of each key. Prefer `reduce_by_key` or `aggregate_by_key`
    /// when the values are folded afterwards, as grouping never combines on
    /// the map side.
    pub fn group_by_key(&self) -> Dataset<(K, Grouped<V>)> {
        self.group_by_key_with(self.default_partitioner(0))
    }

    pub fn group_by_key_with<P>(&self, partitioner: P) -> Dataset<(K, Grouped<V>)>
    where
        P: Partitioner<K> + 'static,
    {
        let aggregator = Aggregator::<V, Vec<V>>::new(
            |value| vec![value],
            |mut group, value| {
                group.push(value);
                group
            },
            |mut group, other| {
                group.extend(other);
                group
            },
        );
        self.combine_by_key_with(aggregator, partitioner, false)
            .map_values(Grouped::new)
    }

    /// For every key of either dataset, its values in `self` and in `other`.
    ///
    /// # Panics
    ///
    /// If `other` was derived in another context.
    pub fn cogroup<W: Data>(&self, other: &Dataset<(K, W)>) -> Dataset<(K, (Vec<V>, Vec<W>))> {
        self.same_context(other);
        let partitioner = self.default_partitioner(other.num_partitions());

        let push = |groups: &mut (Vec<V>, Vec<W>), side: Side<V, W>| match side {
            Side::Left(value) => groups.0.push(value),
            Side::Right(value) => groups.1.push(value),
        };
        let aggregator = Aggregator::<Side<V, W>, (Vec<V>, Vec<W>)>::new(
            move |side| {
                let mut groups = (Vec::new(), Vec::new());
                push(&mut groups, side);
                groups
            },
            move |mut groups, side| {
                push(&mut groups, side);
                groups
            },
            |mut groups, other| {
                groups.0.extend(other.0);
                groups.1.extend(other.1);
                groups
            },
        );

        let left = self.map_values(Side::<V, W>::Left);
        let right = other.map_values(Side::<V, W>::Right);
        left.union(&right)
            .combine_by_key_with(aggregator, partitioner, false)
    }

    /// Every pair of values of keys present in both datasets.
    pub fn join<W: Data>(&self, other: &Dataset<(K, W)>) -> Dataset<(K, (V, W))> {
        self.cogroup(other).flat_map_values(|(left, right)| {
            let mut pairs = Vec::with_capacity(left.len() * right.len());
            for v in &left {
                for w in &right {
                    pairs.push((v.clone(), w.clone()));
                }
            }
            pairs
        })
    }

    /// Like `join`, keeping values of `self` whose key is missing in `other`.
    pub fn left_outer_join<W: Data>(&self, other: &Dataset<(K, W)>) -> Dataset<(K, (V, Option<W>))> {
        self.cogroup(other).flat_map_values(|(left, right)| {
            let mut pairs = Vec::with_capacity(left.len() * right.len().max(1));
            for v in &left {
                if right.is_empty() {
                    pairs.push((v.clone(), None));
                }
                for w in &right {
                    pairs.push((v.clone(), Some(w.clone())));
                }
            }
            pairs
        })
    }

    /// Shuffles the pairs into ordered key ranges and sorts each range, so
    /// that collecting yields the pairs sorted by key.
    ///
    /// The range bounds are sampled when the first action runs. Zero
    /// `partitions` keeps the current partition count.
    pub fn sort_by_key(&self, ascending: bool, partitions: usize) -> Dataset<(K, V)>
    where
        K: Ord,
    {
        let partitions = if partitions == 0 {
            self.num_partitions()
        } else {
            partitions
        };

        self.partition_by(RangePartitioner::<K>::new(partitions, ascending))
            .map_partitions_preserving(move |_, iter| {
                std::iter::once_with(move || {
                    let mut pairs: Vec<(K, V)> = iter.collect();
                    if ascending {
                        pairs.sort_by(|a, b| a.0.cmp(&b.0));
                    } else {
                        pairs.sort_by(|a, b| b.0.cmp(&a.0));
                    }
                    pairs
                })
                .flatten()
            })
    }

    // ACTIONS

    pub fn count_by_key(&self) -> Result<HashMap<K, u64>, EngineError> {
        self.map_values(|_| 1u64)
            .reduce_by_key(|a, b| a + b)
            .collect_as_map()
    }

    /// The pairs as a map. For a key that occurs more than once, the value
    /// that comes last in partition order wins.
    pub fn collect_as_map(&self) -> Result<HashMap<K, V>, EngineError> {
        Ok(self.collect()?.into_iter().collect())
    }

    /// All values of `key`. Only the partition holding the key is computed
    /// when the dataset is hash partitioned.
    pub fn lookup(&self, key: &K) -> Result<Vec<V>, EngineError> {
        let partitions: Vec<usize> = match self.partitioner() {
            Some(PartitionerInfo::Hash { partitions }) => {
                vec![Partitioner::<K>::partition(&HashPartitioner::new(partitions), key)]
            }
            _ => (0..self.num_partitions()).collect(),
        };

        let wanted = key.clone();
        let parts = self.ctx.inner.run_job(self.id, &partitions, move |iter: ElementIter<(K, V)>| {
            Ok(iter
                .filter(|(key, _)| *key == wanted)
                .map(|(_, value)| value)
                .collect::<Vec<V>>())
        })?;
        Ok(parts.into_iter().flatten().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::context::Context;

    fn context() -> Context {
        Config::new().workers(4).finish().unwrap()
    }

    fn sorted<T: Ord>(mut items: Vec<T>) -> Vec<T> {
        items.sort();
        items
    }

    #[test]
    fn test_word_count() {
        let ctx = context();
        let counts = ctx
            .parallelize(vec!["the cat sat on", "the mat the cat ran"], 2)
            .flat_map(|line| line.split_whitespace().map(str::to_string).collect::<Vec<_>>())
            .map(|word| (word, 1u32))
            .reduce_by_key(|a, b| a + b)
            .collect_as_map()
            .unwrap();

        assert_eq!(counts.len(), 6);
        assert_eq!(counts["the"], 3);
        assert_eq!(counts["cat"], 2);
        assert_eq!(counts["ran"], 1);
    }

    #[test]
    fn test_map_values_keeps_partitioner() {
        let ctx = context();
        let pairs = ctx
            .parallelize(vec![(1, 1), (2, 2)], 2)
            .partition_by(HashPartitioner::new(3));
        assert_eq!(pairs.partitioner(), Some(PartitionerInfo::Hash { partitions: 3 }));
        assert_eq!(pairs.map_values(|v| v + 1).partitioner(), pairs.partitioner());
        assert_eq!(pairs.flat_map_values(|v| vec![v, v]).partitioner(), pairs.partitioner());
        assert_eq!(pairs.map(|(k, v)| (v, k)).partitioner(), None);
    }

    #[test]
    fn test_partition_by_same_partitioner_is_noop() {
        let ctx = context();
        let pairs = ctx
            .parallelize(vec![(1, 'a')], 1)
            .partition_by(HashPartitioner::new(2));
        assert_eq!(pairs.partition_by(HashPartitioner::new(2)).id(), pairs.id());
        assert_ne!(pairs.partition_by(HashPartitioner::new(5)).id(), pairs.id());
    }

    #[test]
    fn test_copartitioned_reduce_is_narrow() {
        let ctx = context();
        let pairs = ctx
            .parallelize((0..40).map(|i| (i % 4, 1)).collect::<Vec<(i32, i32)>>(), 3)
            .partition_by(HashPartitioner::new(4));
        let reduced = pairs.reduce_by_key(|a, b| a + b);
        assert_eq!(reduced.partitioner(), pairs.partitioner());

        assert_eq!(sorted(reduced.collect().unwrap()), vec![(0, 10), (1, 10), (2, 10), (3, 10)]);
        let report = ctx.last_job_report().unwrap();
        assert_eq!(report.stage_count(), 2);
        assert_eq!(report.shuffle_stage_count(), 1);
    }

    #[test]
    fn test_combine_by_key_average() {
        let ctx = context();
        let scores = ctx.parallelize(vec![("a", 1.0), ("b", 4.0), ("a", 3.0), ("b", 6.0), ("a", 5.0)], 3);
        let averages = scores
            .combine_by_key(
                |v: f64| (v, 1u32),
                |(sum, n): (f64, u32), v| (sum + v, n + 1),
                |(s1, n1): (f64, u32), (s2, n2): (f64, u32)| (s1 + s2, n1 + n2),
            )
            .map_values(|(sum, n)| sum / n as f64)
            .collect_as_map()
            .unwrap();
        assert_eq!(averages["a"], 3.0);
        assert_eq!(averages["b"], 5.0);
    }

    #[test]
    fn test_fold_and_aggregate_by_key() {
        let ctx = context();
        let pairs = ctx.parallelize(vec![("x", 2), ("y", 3), ("x", 4)], 2);

        let folded = pairs.fold_by_key(0, |a, b| a + b).collect_as_map().unwrap();
        assert_eq!(folded["x"], 6);
        assert_eq!(folded["y"], 3);

        let maxima = pairs
            .aggregate_by_key(
                Vec::<i32>::new(),
                |mut seen, v| {
                    seen.push(v);
                    seen
                },
                |mut a, b| {
                    a.extend(b);
                    a
                },
            )
            .map_values(|seen| seen.into_iter().max())
            .collect_as_map()
            .unwrap();
        assert_eq!(maxima["x"], Some(4));
    }

    #[test]
    fn test_group_by_key() {
        let ctx = context();
        let pairs: Vec<(u32, u32)> = (0..256).flat_map(|k| (0..100).map(move |v| (k, v))).collect();
        for partitions in [1, 3, 8] {
            let groups = ctx
                .parallelize(pairs.clone(), partitions)
                .group_by_key()
                .collect()
                .unwrap();
            assert_eq!(groups.len(), 256);
            for (_, group) in groups {
                let values = sorted(group.into_vec());
                assert_eq!(values, (0..100).collect::<Vec<u32>>());
            }
        }
    }

    #[test]
    fn test_joins() {
        let ctx = context();
        let left = ctx.parallelize(vec![(1, "a"), (2, "b"), (2, "c"), (3, "d")], 2);
        let right = ctx.parallelize(vec![(2, 'x'), (3, 'y'), (3, 'z'), (4, 'w')], 3);

        let joined = sorted(left.join(&right).collect().unwrap());
        assert_eq!(
            joined,
            vec![(2, ("b", 'x')), (2, ("c", 'x')), (3, ("d", 'y')), (3, ("d", 'z'))]
        );

        let outer = sorted(left.left_outer_join(&right).collect().unwrap());
        assert_eq!(outer[0], (1, ("a", None)));
        assert_eq!(outer.len(), 5);

        let grouped = left.cogroup(&right).collect_as_map().unwrap();
        assert_eq!(grouped.len(), 4);
        assert_eq!(grouped[&4], (vec![], vec!['w']));
        assert_eq!(sorted(grouped[&2].0.clone()), vec!["b", "c"]);
    }

    #[test]
    fn test_sort_by_key() {
        let ctx = context();
        let keys: Vec<(i64, ())> = (0..500).map(|i| ((i * 7919) % 500, ())).collect();
        let pairs = ctx.parallelize(keys, 4);

        let ascending: Vec<i64> = pairs.sort_by_key(true, 5).keys().collect().unwrap();
        assert_eq!(ascending, (0..500).collect::<Vec<i64>>());

        let descending: Vec<i64> = pairs.sort_by_key(false, 3).keys().collect().unwrap();
        assert_eq!(descending, (0..500).rev().collect::<Vec<i64>>());
    }

    #[test]
    fn test_lookup_reads_one_partition() {
        let ctx = context();
        let pairs = ctx
            .parallelize((0..60).map(|i| (i % 6, i)).collect::<Vec<(i32, i32)>>(), 3)
            .partition_by(HashPartitioner::new(4));

        assert_eq!(sorted(pairs.lookup(&5).unwrap()), vec![5, 11, 17, 23, 29, 35, 41, 47, 53, 59]);
        let report = ctx.last_job_report().unwrap();
        let result = report.stages.last().unwrap();
        assert_eq!(result.kind, "result");
        assert_eq!(result.partitions, 1);

        assert!(pairs.lookup(&99).unwrap().is_empty());
    }

    #[test]
    fn test_count_by_key() {
        let ctx = context();
        let counts = ctx
            .parallelize(vec![('a', 1), ('b', 1), ('a', 2)], 2)
            .count_by_key()
            .unwrap();
        assert_eq!(counts[&'a'], 2);
        assert_eq!(counts[&'b'], 1);
    }
}
