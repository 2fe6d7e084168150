use std::collections::HashMap;
use std::fs;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use camino::{Utf8Path, Utf8PathBuf};
use serde::Serialize;

use crate::core::{DatasetId, Dynamic, lock, read, write};
use crate::error::StorageError;
use crate::storage::{Block, BlockCodec, BlockId, PartitionStore, StorageLevel};

/// Counters describing the partition store.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StoreStats {
    pub memory_bytes: usize,
    pub memory_blocks: usize,
    pub disk_blocks: usize,
    pub hits: u64,
    pub misses: u64,
    /// Blocks dropped from memory without a disk copy.
    pub evictions: u64,
    /// Blocks written to disk.
    pub spills: u64,
}

/// Where a partition ended up after `put`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Placement {
    NotRetained,
    AlreadyStored,
    Memory,
    Disk,
    Dropped,
}

#[derive(Clone)]
struct Retention {
    level: StorageLevel,
    codec: Option<Arc<dyn BlockCodec>>,
}

/// Tracks which datasets are persisted and keeps their partitions within the
/// memory budget.
///
/// When a new block does not fit, the least recently used blocks of other
/// datasets are demoted first. `MemoryAndDisk` blocks move to disk; blocks of
/// other levels are dropped and will be recomputed from lineage when needed.
pub(crate) struct CacheManager {
    budget: usize,
    spill_dir: Utf8PathBuf,
    retention: RwLock<HashMap<DatasetId, Retention>>,
    store: Mutex<PartitionStore>,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    spills: AtomicU64,
}

impl CacheManager {
    pub(crate) fn new(budget: usize, spill_dir: Utf8PathBuf) -> Self {
        Self {
            budget,
            spill_dir,
            retention: RwLock::new(HashMap::new()),
            store: Mutex::new(PartitionStore::default()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            spills: AtomicU64::new(0),
        }
    }

    pub(crate) fn persist(
        &self,
        dataset: DatasetId,
        level: StorageLevel,
        codec: Option<Arc<dyn BlockCodec>>,
    ) {
        if !level.is_retained() {
            self.unpersist(dataset);
            return;
        }

        // Blocks already stored under another level are not converted.
        let changed = read(&self.retention)
            .get(&dataset)
            .is_some_and(|old| old.level != level);
        if changed {
            self.evict(dataset);
        }
        tracing::debug!(%dataset, ?level, "dataset marked for retention");
        write(&self.retention).insert(dataset, Retention { level, codec });
    }

    pub(crate) fn unpersist(&self, dataset: DatasetId) {
        write(&self.retention).remove(&dataset);
        self.evict(dataset);
    }

    pub(crate) fn level(&self, dataset: DatasetId) -> StorageLevel {
        read(&self.retention)
            .get(&dataset)
            .map(|r| r.level)
            .unwrap_or_default()
    }

    fn codec(&self, dataset: DatasetId) -> Option<Arc<dyn BlockCodec>> {
        read(&self.retention)
            .get(&dataset)
            .and_then(|r| r.codec.clone())
    }

    pub(crate) fn contains(&self, id: BlockId) -> bool {
        lock(&self.store).contains(id)
    }

    /// Returns the stored partition, or `None` when it has to be computed.
    ///
    /// Blocks that can no longer be read are dropped and reported as missing.
    pub(crate) fn get(&self, id: BlockId) -> Option<Dynamic> {
        let block = lock(&self.store).touch(id).cloned();

        let found = match block {
            None => None,
            Some(Block::Deserialized(data)) => Some(data),
            Some(Block::Serialized(bytes)) => self.decode(id, &bytes),
            Some(Block::Disk(path)) => {
                match fs::read(&path) {
                    Ok(bytes) => self.decode(id, &bytes),
                    Err(err) => {
                        tracing::warn!(dataset = %id.dataset, partition = id.partition, %path, error = %err, "spilled partition unreadable");
                        self.discard(id);
                        None
                    }
                }
            }
        };

        match found {
            Some(_) => self.hits.fetch_add(1, Ordering::Relaxed),
            None => self.misses.fetch_add(1, Ordering::Relaxed),
        };
        found
    }

    fn decode(&self, id: BlockId, bytes: &[u8]) -> Option<Dynamic> {
        let result = self
            .codec(id.dataset)
            .ok_or(StorageError::TypeMismatch)
            .and_then(|codec| codec.decode(bytes));

        match result {
            Ok(data) => Some(data),
            Err(err) => {
                tracing::warn!(dataset = %id.dataset, partition = id.partition, error = %err, "stored partition unreadable");
                self.discard(id);
                None
            }
        }
    }

    /// Stores a freshly computed partition, following the dataset's level.
    ///
    /// The first block stored for a key wins. Failing to store is never an
    /// error for the task: the partition is simply recomputed next time.
    pub(crate) fn put(&self, id: BlockId, data: Dynamic, bytes: usize) -> Placement {
        let Some(retention) = read(&self.retention).get(&id.dataset).cloned() else {
            return Placement::NotRetained;
        };

        let mut store = lock(&self.store);
        if store.contains(id) {
            return Placement::AlreadyStored;
        }

        let placed = match retention.level {
            StorageLevel::None => Ok(Placement::NotRetained),
            StorageLevel::MemoryDeserialized => {
                if self.make_room(&mut store, bytes, id.dataset) {
                    store.insert(id, Block::Deserialized(data), bytes);
                    Ok(Placement::Memory)
                } else {
                    Ok(Placement::Dropped)
                }
            }
            StorageLevel::MemorySerialized => {
                self.encode(&retention, &data).map(|encoded| {
                    let size = encoded.len();
                    if self.make_room(&mut store, size, id.dataset) {
                        store.insert(id, Block::Serialized(Arc::new(encoded)), size);
                        Placement::Memory
                    } else {
                        Placement::Dropped
                    }
                })
            }
            StorageLevel::MemoryAndDisk => {
                if self.make_room(&mut store, bytes, id.dataset) {
                    store.insert(id, Block::Deserialized(data), bytes);
                    Ok(Placement::Memory)
                } else {
                    self.encode(&retention, &data)
                        .and_then(|encoded| self.spill(&mut store, id, &encoded))
                        .map(|_| Placement::Disk)
                }
            }
        };

        match placed {
            Ok(Placement::Dropped) => {
                let err = StorageError::ResourceExhausted {
                    needed: bytes,
                    budget: self.budget,
                };
                tracing::warn!(dataset = %id.dataset, partition = id.partition, error = %err, "partition not cached");
                self.evictions.fetch_add(1, Ordering::Relaxed);
                Placement::Dropped
            }
            Ok(placement) => placement,
            Err(err) => {
                tracing::warn!(dataset = %id.dataset, partition = id.partition, error = %err, "partition not cached");
                Placement::Dropped
            }
        }
    }

    fn encode(&self, retention: &Retention, data: &Dynamic) -> Result<Vec<u8>, StorageError> {
        retention
            .codec
            .as_ref()
            .ok_or(StorageError::TypeMismatch)?
            .encode(data)
    }

    /// Demotes blocks of other datasets until `needed` more bytes fit.
    fn make_room(&self, store: &mut PartitionStore, needed: usize, protect: DatasetId) -> bool {
        if needed > self.budget {
            return false;
        }
        while store.memory_used() + needed > self.budget {
            let Some(victim) = store.lru_victim(protect) else {
                return false;
            };
            self.demote(store, victim);
        }
        true
    }

    fn demote(&self, store: &mut PartitionStore, victim: BlockId) {
        let Some((block, _)) = store.remove(victim) else {
            return;
        };

        let retention = read(&self.retention).get(&victim.dataset).cloned();
        let to_disk = retention
            .as_ref()
            .filter(|r| r.level == StorageLevel::MemoryAndDisk)
            .map(|r| match &block {
                Block::Deserialized(data) => self.encode(r, data),
                Block::Serialized(bytes) => Ok(bytes.to_vec()),
                Block::Disk(_) => Err(StorageError::TypeMismatch),
            });

        match to_disk {
            Some(Ok(encoded)) => {
                if let Err(err) = self.spill(store, victim, &encoded) {
                    tracing::warn!(dataset = %victim.dataset, partition = victim.partition, error = %err, "couldn't spill partition, dropping it");
                    self.evictions.fetch_add(1, Ordering::Relaxed);
                }
            }
            Some(Err(err)) => {
                tracing::warn!(dataset = %victim.dataset, partition = victim.partition, error = %err, "couldn't encode partition, dropping it");
                self.evictions.fetch_add(1, Ordering::Relaxed);
            }
            None => {
                tracing::debug!(dataset = %victim.dataset, partition = victim.partition, "partition evicted from memory");
                self.evictions.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    fn spill(
        &self,
        store: &mut PartitionStore,
        id: BlockId,
        encoded: &[u8],
    ) -> Result<(), StorageError> {
        fs::create_dir_all(&self.spill_dir)?;
        let path = spill_path(&self.spill_dir, id);
        fs::write(&path, encoded)?;
        tracing::debug!(dataset = %id.dataset, partition = id.partition, %path, "partition spilled to disk");
        store.insert(id, Block::Disk(path), encoded.len());
        self.spills.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn discard(&self, id: BlockId) {
        let removed = lock(&self.store).remove(id);
        if let Some((Block::Disk(path), _)) = removed {
            let _ = fs::remove_file(path);
        }
    }

    /// Drops every stored partition of `dataset`, in memory and on disk.
    pub(crate) fn evict(&self, dataset: DatasetId) {
        let ids = lock(&self.store).blocks_of(dataset);
        for id in &ids {
            self.discard(*id);
        }
        if !ids.is_empty() {
            tracing::debug!(%dataset, blocks = ids.len(), "dataset evicted");
        }
    }

    /// Removes everything, including spill files.
    pub(crate) fn clear(&self) {
        let ids = lock(&self.store).all_blocks();
        for id in ids {
            self.discard(id);
        }
    }

    pub(crate) fn stats(&self) -> StoreStats {
        let store = lock(&self.store);
        StoreStats {
            memory_bytes: store.memory_used(),
            memory_blocks: store.count(true),
            disk_blocks: store.count(false),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            spills: self.spills.load(Ordering::Relaxed),
        }
    }
}

fn spill_path(dir: &Utf8Path, id: BlockId) -> Utf8PathBuf {
    dir.join(format!(
        "block-{}-{}.cbor",
        id.dataset.index(),
        id.partition
    ))
}
