mod cache;

use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::Arc;

use camino::Utf8PathBuf;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::core::{DatasetId, Dynamic};
use crate::error::StorageError;

pub(crate) use cache::CacheManager;
pub use cache::StoreStats;

/// How the partitions of a persisted dataset are kept.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageLevel {
    /// Not retained, recomputed by every action.
    #[default]
    None,
    /// Elements kept as they are, in memory.
    MemoryDeserialized,
    /// Elements encoded as CBOR, in memory. Smaller, but decoded on each read.
    MemorySerialized,
    /// Elements kept in memory while the budget allows, spilled to disk
    /// otherwise.
    MemoryAndDisk,
}

impl StorageLevel {
    pub fn is_retained(self) -> bool {
        self != StorageLevel::None
    }
}

/// Key of a stored partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub(crate) struct BlockId {
    pub dataset: DatasetId,
    pub partition: usize,
}

impl BlockId {
    pub(crate) fn new(dataset: DatasetId, partition: usize) -> Self {
        Self { dataset, partition }
    }
}

/// Converts realized partitions to and from bytes.
pub(crate) trait BlockCodec: Send + Sync {
    fn encode(&self, block: &Dynamic) -> Result<Vec<u8>, StorageError>;

    fn decode(&self, bytes: &[u8]) -> Result<Dynamic, StorageError>;
}

pub(crate) struct CborCodec<T>(PhantomData<fn() -> T>);

impl<T> CborCodec<T> {
    pub(crate) fn new() -> Self {
        Self(PhantomData)
    }
}

impl<T> BlockCodec for CborCodec<T>
where
    T: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    fn encode(&self, block: &Dynamic) -> Result<Vec<u8>, StorageError> {
        let items = block
            .downcast_ref::<Vec<T>>()
            .ok_or(StorageError::TypeMismatch)?;
        let mut buffer = Vec::new();
        ciborium::into_writer(items, &mut buffer)?;
        Ok(buffer)
    }

    fn decode(&self, bytes: &[u8]) -> Result<Dynamic, StorageError> {
        let items: Vec<T> = ciborium::from_reader(bytes)?;
        Ok(Arc::new(items))
    }
}

#[derive(Clone)]
pub(crate) enum Block {
    Deserialized(Dynamic),
    Serialized(Arc<Vec<u8>>),
    Disk(Utf8PathBuf),
}

impl Block {
    fn in_memory(&self) -> bool {
        !matches!(self, Block::Disk(_))
    }
}

struct Entry {
    block: Block,
    bytes: usize,
    last_used: u64,
}

/// Stored partitions, keyed by dataset and partition index.
///
/// Only bookkeeping lives here. Which level a dataset uses and what happens
/// when memory runs out is decided by the [`CacheManager`].
#[derive(Default)]
pub(crate) struct PartitionStore {
    entries: HashMap<BlockId, Entry>,
    clock: u64,
    memory_used: usize,
}

impl PartitionStore {
    pub(crate) fn contains(&self, id: BlockId) -> bool {
        self.entries.contains_key(&id)
    }

    /// Looks a block up and marks it as recently used.
    pub(crate) fn touch(&mut self, id: BlockId) -> Option<&Block> {
        self.clock += 1;
        let clock = self.clock;
        self.entries.get_mut(&id).map(|entry| {
            entry.last_used = clock;
            &entry.block
        })
    }

    pub(crate) fn insert(&mut self, id: BlockId, block: Block, bytes: usize) {
        self.clock += 1;
        if block.in_memory() {
            self.memory_used += bytes;
        }
        let entry = Entry {
            block,
            bytes,
            last_used: self.clock,
        };
        if let Some(old) = self.entries.insert(id, entry)
            && old.block.in_memory()
        {
            self.memory_used -= old.bytes;
        }
    }

    pub(crate) fn remove(&mut self, id: BlockId) -> Option<(Block, usize)> {
        let entry = self.entries.remove(&id)?;
        if entry.block.in_memory() {
            self.memory_used -= entry.bytes;
        }
        Some((entry.block, entry.bytes))
    }

    /// Least recently used in-memory block that does not belong to `protect`.
    pub(crate) fn lru_victim(&self, protect: DatasetId) -> Option<BlockId> {
        self.entries
            .iter()
            .filter(|(id, entry)| id.dataset != protect && entry.block.in_memory())
            .min_by_key(|(_, entry)| entry.last_used)
            .map(|(id, _)| *id)
    }

    pub(crate) fn blocks_of(&self, dataset: DatasetId) -> Vec<BlockId> {
        let mut ids: Vec<BlockId> = self
            .entries
            .keys()
            .filter(|id| id.dataset == dataset)
            .copied()
            .collect();
        ids.sort();
        ids
    }

    pub(crate) fn all_blocks(&self) -> Vec<BlockId> {
        self.entries.keys().copied().collect()
    }

    pub(crate) fn memory_used(&self) -> usize {
        self.memory_used
    }

    pub(crate) fn count(&self, in_memory: bool) -> usize {
        self.entries
            .values()
            .filter(|entry| entry.block.in_memory() == in_memory)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn block(values: Vec<u32>) -> Block {
        Block::Deserialized(Arc::new(values))
    }

    #[test]
    fn test_store_tracks_memory() {
        let mut store = PartitionStore::default();
        store.insert(BlockId::new(DatasetId(0), 0), block(vec![1]), 100);
        store.insert(BlockId::new(DatasetId(0), 1), block(vec![2]), 50);
        store.insert(
            BlockId::new(DatasetId(1), 0),
            Block::Disk(Utf8PathBuf::from("x.cbor")),
            70,
        );
        assert_eq!(store.memory_used(), 150);
        assert_eq!(store.count(true), 2);
        assert_eq!(store.count(false), 1);

        store.remove(BlockId::new(DatasetId(0), 0));
        assert_eq!(store.memory_used(), 50);
    }

    #[test]
    fn test_lru_skips_protected_dataset() {
        let mut store = PartitionStore::default();
        let a = BlockId::new(DatasetId(0), 0);
        let b = BlockId::new(DatasetId(1), 0);
        let c = BlockId::new(DatasetId(2), 0);
        store.insert(a, block(vec![]), 1);
        store.insert(b, block(vec![]), 1);
        store.insert(c, block(vec![]), 1);

        store.touch(a);
        assert_eq!(store.lru_victim(DatasetId(9)), Some(b));
        assert_eq!(store.lru_victim(DatasetId(1)), Some(c));
    }

    #[test]
    fn test_cbor_codec() {
        let codec = CborCodec::<(String, u32)>::new();
        let data: Dynamic = Arc::new(vec![("a".to_string(), 1u32), ("b".to_string(), 2)]);
        let bytes = codec.encode(&data).unwrap();
        let back = codec.decode(&bytes).unwrap();
        let back = back.downcast_ref::<Vec<(String, u32)>>().unwrap();
        assert_eq!(back[1], ("b".to_string(), 2));

        let wrong: Dynamic = Arc::new(vec![1u8]);
        assert!(matches!(codec.encode(&wrong), Err(StorageError::TypeMismatch)));
    }
}
