use std::any::Any;
use std::sync::Arc;

use crate::core::{Data, DatasetId, Dynamic, ShuffleId};
use crate::error::{EngineError, TaskError};
use crate::lineage::Transform;
use crate::partitioner::PartitionerInfo;
use crate::scheduler::Scheduler;
use crate::stream::{ElementIter, SharedIter};
use crate::worker::TaskContext;

/// A type-erased `ElementIter<T>`.
pub(crate) type AnyIter = Box<dyn Any + Send>;

/// A partition realized for storage.
pub(crate) struct Materialized {
    /// `Arc<Vec<T>>` behind the erased handle.
    pub data: Dynamic,
    /// Estimated size in memory.
    pub bytes: usize,
}

#[derive(Clone)]
pub(crate) enum Dependency {
    /// Each partition reads a fixed set of parent partitions.
    Narrow(DatasetId),
    /// Each partition reads a slice of every parent partition.
    Shuffle(Arc<dyn ShuffleDependency>),
}

/// The map side of a shuffle, shared by the reduce-side node and the
/// scheduler.
pub(crate) trait ShuffleDependency: Send + Sync {
    fn shuffle_id(&self) -> ShuffleId;

    fn parent(&self) -> DatasetId;

    /// Number of map tasks, one per parent partition.
    fn map_partitions(&self) -> usize;

    /// Runs on the driver before the map stage is submitted.
    fn prepare(&self, scheduler: &Scheduler<'_>) -> Result<(), EngineError>;

    /// Buckets one parent partition by target reduce partition.
    fn run_map_task(&self, split: usize, task: &TaskContext) -> Result<Vec<Dynamic>, TaskError>;
}

/// A lineage node that knows the type of its elements.
pub(crate) trait TypedNode: Send + Sync {
    type Item: Data;

    fn transform(&self) -> Transform;

    fn partitions(&self) -> usize;

    fn partitioner(&self) -> Option<PartitionerInfo> {
        None
    }

    fn dependencies(&self) -> Vec<Dependency>;

    /// Builds the iterator of one partition. Narrow nodes wrap the iterator of
    /// their parent, so nothing is evaluated until the task pulls elements.
    fn compute(&self, split: usize, task: &TaskContext) -> Result<ElementIter<Self::Item>, TaskError>;
}

/// Object-safe view of a [`TypedNode`], stored in the lineage graph.
pub(crate) trait Node: Send + Sync {
    fn transform(&self) -> Transform;

    fn output_type_name(&self) -> &'static str;

    fn partitions(&self) -> usize;

    fn partitioner(&self) -> Option<PartitionerInfo>;

    fn dependencies(&self) -> Vec<Dependency>;

    fn compute_any(&self, split: usize, task: &TaskContext) -> Result<AnyIter, TaskError>;

    /// Drains an iterator produced by `compute_any` into a storable block.
    fn materialize(&self, iter: AnyIter) -> Result<Materialized, TaskError>;

    /// Reads a block produced by `materialize` back as an iterator.
    fn iterate_block(&self, block: Dynamic, task: &TaskContext) -> Result<AnyIter, TaskError>;
}

impl<T> Node for T
where
    T: TypedNode + 'static,
{
    fn transform(&self) -> Transform {
        <T as TypedNode>::transform(self)
    }

    fn output_type_name(&self) -> &'static str {
        std::any::type_name::<T::Item>()
    }

    fn partitions(&self) -> usize {
        <T as TypedNode>::partitions(self)
    }

    fn partitioner(&self) -> Option<PartitionerInfo> {
        <T as TypedNode>::partitioner(self)
    }

    fn dependencies(&self) -> Vec<Dependency> {
        <T as TypedNode>::dependencies(self)
    }

    fn compute_any(&self, split: usize, task: &TaskContext) -> Result<AnyIter, TaskError> {
        // Call the typed method, then erase the iterator.
        let iter = <T as TypedNode>::compute(self, split, task)?;
        Ok(Box::new(iter))
    }

    fn materialize(&self, iter: AnyIter) -> Result<Materialized, TaskError> {
        let iter = iter
            .downcast::<ElementIter<T::Item>>()
            .map_err(|_| TaskError::Lineage(format!("expected elements of type {}", self.output_type_name())))?;

        let items: Vec<T::Item> = iter.collect();
        let bytes = items.len() * std::mem::size_of::<T::Item>();
        Ok(Materialized {
            data: Arc::new(items),
            bytes,
        })
    }

    fn iterate_block(&self, block: Dynamic, task: &TaskContext) -> Result<AnyIter, TaskError> {
        let items = block
            .downcast::<Vec<T::Item>>()
            .map_err(|_| TaskError::Lineage(format!("stored block is not a Vec<{}>", self.output_type_name())))?;

        let iter: ElementIter<T::Item> = Box::new(task.interruptible(SharedIter::new(items)));
        Ok(Box::new(iter))
    }
}
