use std::collections::HashMap;
use std::hash::Hash;
use std::marker::PhantomData;
use std::sync::Arc;

use crate::core::{Data, DatasetId, Dynamic, ShuffleId};
use crate::error::{EngineError, TaskError};
use crate::lineage::{Dependency, ShuffleDependency, SourceKind, Transform, TypedNode};
use crate::partitioner::{Partitioner, PartitionerInfo, SAMPLE_PER_PARTITION, sample_keys};
use crate::scheduler::Scheduler;
use crate::stream::{ElementIter, SharedIter};
use crate::worker::TaskContext;

pub(crate) type Producer<T> = Arc<dyn Fn() -> anyhow::Result<ElementIter<T>> + Send + Sync>;
pub(crate) type PartitionFn<T, U> =
    Arc<dyn Fn(ElementIter<T>, usize) -> ElementIter<U> + Send + Sync>;
pub(crate) type CreateFn<V, C> = Arc<dyn Fn(V) -> C + Send + Sync>;
pub(crate) type MergeFn<C, V> = Arc<dyn Fn(C, V) -> C + Send + Sync>;

/// A dataset with no parents, one producer per partition.
pub(crate) struct SourceNode<T> {
    pub kind: SourceKind,
    pub producers: Vec<Producer<T>>,
}

impl<T: Data> TypedNode for SourceNode<T> {
    type Item = T;

    fn transform(&self) -> Transform {
        Transform::Source { kind: self.kind }
    }

    fn partitions(&self) -> usize {
        self.producers.len()
    }

    fn dependencies(&self) -> Vec<Dependency> {
        Vec::new()
    }

    fn compute(&self, split: usize, task: &TaskContext) -> Result<ElementIter<T>, TaskError> {
        let producer = self
            .producers
            .get(split)
            .ok_or_else(|| TaskError::Lineage(format!("source has no partition {split}")))?;

        let iter = producer().map_err(TaskError::user)?;
        Ok(Box::new(task.interruptible(iter)))
    }
}

/// Every one-to-one transformation: map, filter, flat-map and friends.
pub(crate) struct MapPartitionsNode<T, U> {
    pub parent: DatasetId,
    pub partitions: usize,
    pub transform: Transform,
    /// Kept from the parent when the transformation leaves keys in place.
    pub partitioner: Option<PartitionerInfo>,
    pub f: PartitionFn<T, U>,
}

impl<T: Data, U: Data> TypedNode for MapPartitionsNode<T, U> {
    type Item = U;

    fn transform(&self) -> Transform {
        self.transform.clone()
    }

    fn partitions(&self) -> usize {
        self.partitions
    }

    fn partitioner(&self) -> Option<PartitionerInfo> {
        self.partitioner.clone()
    }

    fn dependencies(&self) -> Vec<Dependency> {
        vec![Dependency::Narrow(self.parent)]
    }

    fn compute(&self, split: usize, task: &TaskContext) -> Result<ElementIter<U>, TaskError> {
        let input = task.iterator::<T>(self.parent, split)?;
        Ok((self.f)(input, split))
    }
}

/// Partitions of all parents, one after another.
pub(crate) struct UnionNode<T> {
    pub parents: Vec<(DatasetId, usize)>,
    pub _item: PhantomData<fn() -> T>,
}

impl<T: Data> TypedNode for UnionNode<T> {
    type Item = T;

    fn transform(&self) -> Transform {
        Transform::Union
    }

    fn partitions(&self) -> usize {
        self.parents.iter().map(|(_, count)| count).sum()
    }

    fn dependencies(&self) -> Vec<Dependency> {
        self.parents
            .iter()
            .map(|(parent, _)| Dependency::Narrow(*parent))
            .collect()
    }

    fn compute(&self, split: usize, task: &TaskContext) -> Result<ElementIter<T>, TaskError> {
        let mut offset = split;
        for (parent, count) in &self.parents {
            if offset < *count {
                return task.iterator::<T>(*parent, offset);
            }
            offset -= count;
        }
        Err(TaskError::Lineage(format!("union has no partition {split}")))
    }
}

/// Fewer partitions, each reading a contiguous group of parent partitions.
pub(crate) struct CoalescedNode<T> {
    pub parent: DatasetId,
    pub groups: Vec<Vec<usize>>,
    pub _item: PhantomData<fn() -> T>,
}

impl<T: Data> TypedNode for CoalescedNode<T> {
    type Item = T;

    fn transform(&self) -> Transform {
        Transform::Coalesce
    }

    fn partitions(&self) -> usize {
        self.groups.len()
    }

    fn dependencies(&self) -> Vec<Dependency> {
        vec![Dependency::Narrow(self.parent)]
    }

    fn compute(&self, split: usize, task: &TaskContext) -> Result<ElementIter<T>, TaskError> {
        let group = self
            .groups
            .get(split)
            .ok_or_else(|| TaskError::Lineage(format!("coalesce has no partition {split}")))?;

        let iters = group
            .iter()
            .map(|&partition| task.iterator::<T>(self.parent, partition))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Box::new(iters.into_iter().flatten()))
    }
}

/// Splits `parents` partitions into `target` contiguous groups.
pub(crate) fn coalesce_groups(parents: usize, target: usize) -> Vec<Vec<usize>> {
    let target = target.clamp(1, parents.max(1));
    (0..target)
        .map(|i| (i * parents / target..(i + 1) * parents / target).collect())
        .collect()
}

/// Map side of a shuffle of `(K, V)` pairs.
pub(crate) struct ShuffleDep<K, V> {
    pub id: ShuffleId,
    pub parent: DatasetId,
    pub maps: usize,
    pub partitioner: Arc<dyn Partitioner<K>>,
    pub _value: PhantomData<fn() -> V>,
}

impl<K, V> ShuffleDependency for ShuffleDep<K, V>
where
    K: Data + Eq + Hash,
    V: Data,
{
    fn shuffle_id(&self) -> ShuffleId {
        self.id
    }

    fn parent(&self) -> DatasetId {
        self.parent
    }

    fn map_partitions(&self) -> usize {
        self.maps
    }

    fn prepare(&self, scheduler: &Scheduler<'_>) -> Result<(), EngineError> {
        if !self.partitioner.needs_sample() {
            return Ok(());
        }

        let limit = SAMPLE_PER_PARTITION * self.partitioner.partitions();
        let partitions: Vec<usize> = (0..self.maps).collect();
        let samples = scheduler.run_sample::<(K, V), Vec<K>, _>(self.parent, &partitions, move |iter| {
            Ok(sample_keys(iter.map(|(key, _)| key), limit))
        })?;

        self.partitioner
            .set_sample(samples.into_iter().flatten().collect());
        tracing::debug!(shuffle = %self.id, "range bounds sampled");
        Ok(())
    }

    fn run_map_task(&self, split: usize, task: &TaskContext) -> Result<Vec<Dynamic>, TaskError> {
        let partitions = self.partitioner.partitions();
        let mut buckets: Vec<Vec<(K, V)>> = (0..partitions).map(|_| Vec::new()).collect();

        for (key, value) in task.iterator::<(K, V)>(self.parent, split)? {
            let target = self.partitioner.partition(&key);
            let bucket = buckets.get_mut(target).ok_or_else(|| {
                TaskError::Lineage(format!(
                    "partitioner placed a key in partition {target} of {partitions}"
                ))
            })?;
            bucket.push((key, value));
        }

        task.checkpoint()?;
        Ok(buckets
            .into_iter()
            .map(|bucket| Arc::new(bucket) as Dynamic)
            .collect())
    }
}

fn read_buckets<K: Data, V: Data>(
    dependency: &ShuffleDep<K, V>,
    reduce: usize,
    task: &TaskContext,
) -> Result<Vec<Arc<Vec<(K, V)>>>, TaskError> {
    (0..dependency.maps)
        .map(|map| {
            let bucket = task
                .shuffle()
                .shuffle_read(dependency.id, map, reduce)
                .ok_or(TaskError::FetchFailed {
                    shuffle: dependency.id,
                    map,
                })?;

            bucket.downcast::<Vec<(K, V)>>().map_err(|_| {
                TaskError::Lineage(format!("{} holds buckets of another type", dependency.id))
            })
        })
        .collect()
}

/// Reduce side of a plain shuffle: every pair routed to this partition.
pub(crate) struct ShuffledNode<K, V> {
    pub dependency: Arc<ShuffleDep<K, V>>,
}

impl<K, V> TypedNode for ShuffledNode<K, V>
where
    K: Data + Eq + Hash,
    V: Data,
{
    type Item = (K, V);

    fn transform(&self) -> Transform {
        Transform::Shuffle {
            shuffle: self.dependency.id,
            partitioner: self.dependency.partitioner.info(),
            aggregate: false,
        }
    }

    fn partitions(&self) -> usize {
        self.dependency.partitioner.partitions()
    }

    fn partitioner(&self) -> Option<PartitionerInfo> {
        Some(self.dependency.partitioner.info())
    }

    fn dependencies(&self) -> Vec<Dependency> {
        vec![Dependency::Shuffle(self.dependency.clone())]
    }

    fn compute(&self, split: usize, task: &TaskContext) -> Result<ElementIter<(K, V)>, TaskError> {
        let buckets = read_buckets(&self.dependency, split, task)?;
        Ok(Box::new(task.interruptible(
            buckets.into_iter().flat_map(SharedIter::new),
        )))
    }
}

/// Reduce side of a keyed aggregation: one combined value per key.
pub(crate) struct AggregatedNode<K, V, C> {
    pub dependency: Arc<ShuffleDep<K, V>>,
    pub create: CreateFn<V, C>,
    pub merge: MergeFn<C, V>,
}

impl<K, V, C> TypedNode for AggregatedNode<K, V, C>
where
    K: Data + Eq + Hash,
    V: Data,
    C: Data,
{
    type Item = (K, C);

    fn transform(&self) -> Transform {
        Transform::Shuffle {
            shuffle: self.dependency.id,
            partitioner: self.dependency.partitioner.info(),
            aggregate: true,
        }
    }

    fn partitions(&self) -> usize {
        self.dependency.partitioner.partitions()
    }

    fn partitioner(&self) -> Option<PartitionerInfo> {
        Some(self.dependency.partitioner.info())
    }

    fn dependencies(&self) -> Vec<Dependency> {
        vec![Dependency::Shuffle(self.dependency.clone())]
    }

    fn compute(&self, split: usize, task: &TaskContext) -> Result<ElementIter<(K, C)>, TaskError> {
        let buckets = read_buckets(&self.dependency, split, task)?;
        let pairs = task.interruptible(buckets.into_iter().flat_map(SharedIter::new));
        let combined = combine_ordered(pairs, &*self.create, &*self.merge);
        Ok(Box::new(combined.into_iter()))
    }
}

/// Folds values per key, keeping keys in order of first appearance so the
/// output does not depend on hash iteration order.
pub(crate) fn combine_ordered<K, V, C>(
    pairs: impl Iterator<Item = (K, V)>,
    create: impl Fn(V) -> C,
    merge: impl Fn(C, V) -> C,
) -> Vec<(K, C)>
where
    K: Eq + Hash + Clone,
{
    let mut combiners: HashMap<K, C> = HashMap::new();
    let mut order: Vec<K> = Vec::new();

    for (key, value) in pairs {
        let combined = match combiners.remove(&key) {
            Some(existing) => merge(existing, value),
            None => {
                order.push(key.clone());
                create(value)
            }
        };
        combiners.insert(key, combined);
    }

    order
        .into_iter()
        .filter_map(|key| combiners.remove(&key).map(|combined| (key, combined)))
        .collect()
}
