#![forbid(unsafe_code)]
#![doc = include_str!("../README.md")]

mod config;
mod context;
mod core;
mod dataset;
mod error;
mod lineage;
mod pair;
mod partitioner;
mod scheduler;
mod shared;
mod shuffle;
mod source;
mod storage;
mod stream;
mod worker;

pub use crate::config::Config;
pub use crate::context::Context;
pub use crate::core::{Data, DatasetId, Dynamic, JobId, ShuffleId, StageId, TaskId};
pub use crate::dataset::Dataset;
pub use crate::error::*;
pub use crate::lineage::{SourceKind, Transform};
pub use crate::pair::Aggregator;
pub use crate::partitioner::{HashPartitioner, Partitioner, PartitionerInfo, RangePartitioner};
pub use crate::scheduler::{JobReport, StageRecord, TaskRecord, TaskStatus};
pub use crate::shared::{Accumulator, AccumulatorId, Broadcast, BroadcastId};
pub use crate::shuffle::{LocalShuffle, ShuffleService};
pub use crate::storage::{StorageLevel, StoreStats};
pub use crate::stream::{ElementIter, Grouped};
pub use crate::worker::{Executor, LocalExecutor, Task, TaskReport, current_task, task_attempt, task_partition};

/// Installs a global subscriber that prints log events above the progress
/// bars of running stages.
///
/// The filter is read from `NAGARE_LOG`, then `RUST_LOG`, and defaults to
/// `info`. Returns `false` if a global subscriber was already set.
#[cfg(feature = "logging")]
pub fn init_logging() -> bool {
    use tracing_indicatif::IndicatifLayer;
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = EnvFilter::try_from_env("NAGARE_LOG")
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new("info"));
    let indicatif = IndicatifLayer::new();

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(indicatif.get_stderr_writer()))
        .with(indicatif)
        .try_init()
        .is_ok()
}
