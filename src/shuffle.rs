use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::core::{Dynamic, ShuffleId, read, write};

/// Storage of map-side shuffle output.
///
/// Every map task of a shuffle produces one bucket per reduce partition. The
/// scheduler commits those buckets with `shuffle_write` once it accepts the
/// map task's result, and reduce tasks fetch them with `shuffle_read`. This
/// is the only way data crosses partition boundaries.
pub trait ShuffleService: Send + Sync {
    /// Registers the output of one map task, replacing any earlier output.
    fn shuffle_write(&self, shuffle: ShuffleId, map: usize, buckets: Vec<Dynamic>);

    /// Bucket of `map` destined for `reduce`, or `None` if that map output
    /// is not registered.
    fn shuffle_read(&self, shuffle: ShuffleId, map: usize, reduce: usize) -> Option<Dynamic>;

    /// Map partitions in `0..maps` with no registered output.
    fn missing_maps(&self, shuffle: ShuffleId, maps: usize) -> Vec<usize>;

    /// Forgets the output of one map task, e.g. after a failed fetch.
    fn unregister_map(&self, shuffle: ShuffleId, map: usize);
}

/// Keeps shuffle output in memory.
#[derive(Default)]
pub struct LocalShuffle {
    outputs: RwLock<HashMap<(ShuffleId, usize), Arc<Vec<Dynamic>>>>,
}

impl LocalShuffle {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ShuffleService for LocalShuffle {
    fn shuffle_write(&self, shuffle: ShuffleId, map: usize, buckets: Vec<Dynamic>) {
        write(&self.outputs).insert((shuffle, map), Arc::new(buckets));
    }

    fn shuffle_read(&self, shuffle: ShuffleId, map: usize, reduce: usize) -> Option<Dynamic> {
        read(&self.outputs)
            .get(&(shuffle, map))
            .and_then(|buckets| buckets.get(reduce).cloned())
    }

    fn missing_maps(&self, shuffle: ShuffleId, maps: usize) -> Vec<usize> {
        let outputs = read(&self.outputs);
        (0..maps)
            .filter(|map| !outputs.contains_key(&(shuffle, *map)))
            .collect()
    }

    fn unregister_map(&self, shuffle: ShuffleId, map: usize) {
        write(&self.outputs).remove(&(shuffle, map));
    }
}
