use std::hash::Hash;
use std::sync::OnceLock;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

use crate::core::stable_hash;

/// Description of a partitioner, enough to tell whether two datasets place
/// their keys the same way.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PartitionerInfo {
    Hash { partitions: usize },
    /// Range partitioners only equal themselves, as their bounds depend on
    /// the sampled data.
    Range { partitions: usize, token: u64 },
}

impl PartitionerInfo {
    pub fn partitions(&self) -> usize {
        match self {
            PartitionerInfo::Hash { partitions } | PartitionerInfo::Range { partitions, .. } => {
                *partitions
            }
        }
    }
}

/// Routes keys to reduce partitions.
pub trait Partitioner<K>: Send + Sync {
    fn partitions(&self) -> usize;

    /// Index in `0..self.partitions()` that `key` belongs to.
    fn partition(&self, key: &K) -> usize;

    fn info(&self) -> PartitionerInfo;

    /// Whether the partitioner still needs a sample of the keys before it can
    /// place them.
    fn needs_sample(&self) -> bool {
        false
    }

    fn set_sample(&self, _keys: Vec<K>) {}
}

/// Places keys by a stable hash modulo the partition count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HashPartitioner {
    partitions: usize,
}

impl HashPartitioner {
    pub fn new(partitions: usize) -> Self {
        Self {
            partitions: partitions.max(1),
        }
    }
}

impl<K: Hash> Partitioner<K> for HashPartitioner {
    fn partitions(&self) -> usize {
        self.partitions
    }

    fn partition(&self, key: &K) -> usize {
        (stable_hash(key) % self.partitions as u64) as usize
    }

    fn info(&self) -> PartitionerInfo {
        PartitionerInfo::Hash {
            partitions: self.partitions,
        }
    }
}

static RANGE_TOKENS: AtomicU64 = AtomicU64::new(0);

/// How many keys each map partition contributes to the sample, per output
/// partition.
pub(crate) const SAMPLE_PER_PARTITION: usize = 20;

/// Places keys into contiguous, ordered ranges.
///
/// The range bounds are computed from a sample of the keys, taken when the
/// first action over the sorted dataset runs. Partition `i` holds keys not
/// greater than `bounds[i]` and greater than `bounds[i - 1]`.
#[derive(Debug)]
pub struct RangePartitioner<K> {
    partitions: usize,
    ascending: bool,
    bounds: OnceLock<Vec<K>>,
    token: u64,
}

impl<K: Ord + Clone> RangePartitioner<K> {
    pub fn new(partitions: usize, ascending: bool) -> Self {
        Self {
            partitions: partitions.max(1),
            ascending,
            bounds: OnceLock::new(),
            token: RANGE_TOKENS.fetch_add(1, Ordering::Relaxed),
        }
    }

    /// Builds a partitioner whose bounds are already known.
    pub fn with_bounds(bounds: Vec<K>, ascending: bool) -> Self {
        let partitioner = Self::new(bounds.len() + 1, ascending);
        let _ = partitioner.bounds.set(bounds);
        partitioner
    }

    fn bounds(&self) -> &[K] {
        self.bounds.get().map(Vec::as_slice).unwrap_or_default()
    }
}

impl<K> Partitioner<K> for RangePartitioner<K>
where
    K: Ord + Clone + Send + Sync,
{
    fn partitions(&self) -> usize {
        self.partitions
    }

    fn partition(&self, key: &K) -> usize {
        let bounds = self.bounds();
        let index = bounds.partition_point(|bound| bound < key);
        if self.ascending {
            index
        } else {
            bounds.len() - index
        }
    }

    fn info(&self) -> PartitionerInfo {
        PartitionerInfo::Range {
            partitions: self.partitions,
            token: self.token,
        }
    }

    fn needs_sample(&self) -> bool {
        self.bounds.get().is_none()
    }

    fn set_sample(&self, mut keys: Vec<K>) {
        keys.sort();
        let mut bounds: Vec<K> = Vec::with_capacity(self.partitions.saturating_sub(1));
        if !keys.is_empty() {
            for i in 1..self.partitions {
                let candidate = &keys[i * keys.len() / self.partitions];
                if bounds.last() != Some(candidate) {
                    bounds.push(candidate.clone());
                }
            }
        }
        // Concurrent samplers of the same dependency compute equal bounds.
        let _ = self.bounds.set(bounds);
    }
}

/// Evenly spaced subset of at most `limit` keys.
pub(crate) fn sample_keys<K>(keys: impl Iterator<Item = K>, limit: usize) -> Vec<K> {
    let all: Vec<K> = keys.collect();
    if all.len() <= limit || limit == 0 {
        return all;
    }
    let step = all.len().div_ceil(limit);
    all.into_iter().step_by(step).collect()
}
