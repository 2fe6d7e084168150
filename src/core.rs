use std::any::Any;
use std::fmt::{Display, Formatter};
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use petgraph::graph::NodeIndex;
use serde::{Deserialize, Serialize};

/// A type-erased, thread-safe container.
///
/// Realized partitions (`Vec<T>`), shuffle buckets and broadcast payloads all
/// travel through the engine in this form and are downcast back by the typed
/// node that produced them.
pub type Dynamic = Arc<dyn Any + Send + Sync>;

/// A type-erased owned value, used for per-task results sent back to the
/// driver.
pub(crate) type Boxed = Box<dyn Any + Send>;

/// Element contract for every dataset.
///
/// Elements are cloned when read out of a stored partition and moved between
/// worker threads, so they must be `Clone + Send + Sync + 'static`. The trait
/// is implemented automatically.
pub trait Data: Clone + Send + Sync + 'static {}

impl<T> Data for T where T: Clone + Send + Sync + 'static {}

/// Identifier of a dataset node in the lineage graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DatasetId(pub(crate) usize);

impl DatasetId {
    /// Position of the node in the lineage arena.
    pub fn index(self) -> usize {
        self.0
    }

    pub(crate) fn node(self) -> NodeIndex {
        NodeIndex::new(self.0)
    }
}

impl From<NodeIndex> for DatasetId {
    fn from(value: NodeIndex) -> Self {
        DatasetId(value.index())
    }
}

impl Display for DatasetId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "dataset {}", self.0)
    }
}

/// Identifier of a shuffle dependency.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ShuffleId(pub(crate) usize);

impl Display for ShuffleId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "shuffle {}", self.0)
    }
}

/// Identifier of a job, one per action.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct JobId(pub(crate) u64);

impl Display for JobId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "job {}", self.0)
    }
}

/// Identifier of a stage, unique within a job.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct StageId(pub(crate) usize);

impl StageId {
    pub fn index(self) -> usize {
        self.0
    }
}

impl Display for StageId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "stage {}", self.0)
    }
}

/// Identity of a single task attempt.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize)]
pub struct TaskId {
    pub job: JobId,
    pub stage: StageId,
    pub partition: usize,
    /// Zero for the first attempt, incremented on every retry.
    pub attempt: u32,
}

impl Display for TaskId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}/{}/partition {} (attempt {})",
            self.job, self.stage, self.partition, self.attempt
        )
    }
}

/// `std::hash::Hasher` backed by BLAKE3.
///
/// `DefaultHasher` is randomly seeded per process, which would make key
/// placement differ between runs. Keys are routed to reduce partitions with
/// this hasher instead so that placement is stable.
#[derive(Default)]
pub(crate) struct Blake3Hasher(blake3::Hasher);

impl Hasher for Blake3Hasher {
    fn finish(&self) -> u64 {
        let mut output = [0u8; 8];
        self.0.finalize_xof().fill(&mut output);
        u64::from_le_bytes(output)
    }

    fn write(&mut self, bytes: &[u8]) {
        self.0.update(bytes);
    }
}

pub(crate) fn stable_hash<K: Hash + ?Sized>(key: &K) -> u64 {
    let mut hasher = Blake3Hasher::default();
    key.hash(&mut hasher);
    hasher.finish()
}

// No user code runs while these locks are held, so a poisoned lock still
// guards consistent data.

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}
