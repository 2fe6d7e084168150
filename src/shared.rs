use std::collections::hash_map::Entry;
use std::fmt::{Debug, Formatter};
use std::ops::Deref;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};

use crate::core::{Boxed, Data, lock};
use crate::worker;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AccumulatorId(pub(crate) u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BroadcastId(pub(crate) u64);

type Combine<T> = Arc<dyn Fn(T, T) -> T + Send + Sync>;

pub(crate) struct AccumulatorCell<T> {
    zero: T,
    total: Mutex<T>,
    combine: Combine<T>,
}

impl<T: Data> AccumulatorCell<T> {
    fn merge(&self, value: T) {
        let mut total = lock(&self.total);
        let previous = std::mem::replace(&mut *total, self.zero.clone());
        *total = (self.combine)(previous, value);
    }
}

/// Driver side of an accumulator, reached by id when task results arrive.
pub(crate) trait AccumulatorSink: Send + Sync {
    fn merge_any(&self, update: Boxed);
}

impl<T: Data> AccumulatorSink for AccumulatorCell<T> {
    fn merge_any(&self, update: Boxed) {
        match update.downcast::<T>() {
            Ok(value) => self.merge(*value),
            Err(_) => tracing::error!(
                "accumulator update of unexpected type, expected {}",
                std::any::type_name::<T>()
            ),
        }
    }
}

/// A shared variable that tasks can only add to.
///
/// Inside a task, [`Accumulator::add`] buffers the value in the task. The
/// buffer is merged into the driver's total only when the driver accepts the
/// task's successful result, so failed attempts contribute nothing.
///
/// A task that succeeded and is then executed again, for example because the
/// shuffle output it produced was lost, contributes twice. Only use
/// accumulators for diagnostics or inside actions whose tasks run once.
///
/// The combine function must be associative and commutative.
pub struct Accumulator<T> {
    id: AccumulatorId,
    cell: Arc<AccumulatorCell<T>>,
}

impl<T> Clone for Accumulator<T> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            cell: self.cell.clone(),
        }
    }
}

impl<T: Data> Accumulator<T> {
    pub(crate) fn new(id: AccumulatorId, zero: T, combine: Combine<T>) -> Self {
        let cell = AccumulatorCell {
            total: Mutex::new(zero.clone()),
            zero,
            combine,
        };
        Self {
            id,
            cell: Arc::new(cell),
        }
    }

    pub(crate) fn sink(&self) -> Arc<dyn AccumulatorSink> {
        self.cell.clone()
    }

    pub fn id(&self) -> AccumulatorId {
        self.id
    }

    pub fn add(&self, value: T) {
        let mut value = Some(value);
        worker::with_scope(|scope| {
            let Some(value) = value.take() else {
                return;
            };
            match scope.updates.entry(self.id) {
                Entry::Occupied(mut slot) => {
                    if let Some(pending) = slot.get_mut().downcast_mut::<T>() {
                        let previous = std::mem::replace(pending, self.cell.zero.clone());
                        *pending = (self.cell.combine)(previous, value);
                    }
                }
                Entry::Vacant(slot) => {
                    slot.insert(Box::new(value));
                }
            }
        });

        // On the driver the value goes straight into the total.
        if let Some(value) = value {
            self.cell.merge(value);
        }
    }

    /// The total merged so far. Only meaningful on the driver.
    pub fn value(&self) -> T {
        lock(&self.cell.total).clone()
    }

    /// Resets the total to the zero value.
    pub fn reset(&self) {
        *lock(&self.cell.total) = self.cell.zero.clone();
    }
}

impl<T: Data + Debug> Debug for Accumulator<T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Accumulator")
            .field("id", &self.id)
            .field("value", &self.value())
            .finish()
    }
}

/// A read-only value shared with every task.
///
/// All workers of a context live in one process, so the value is stored
/// once and every task reads the same allocation.
pub struct Broadcast<T> {
    id: BroadcastId,
    value: Arc<T>,
}

impl<T> Clone for Broadcast<T> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            value: self.value.clone(),
        }
    }
}

impl<T: Send + Sync + 'static> Broadcast<T> {
    pub(crate) fn new(id: BroadcastId, value: T) -> Self {
        Self {
            id,
            value: Arc::new(value),
        }
    }

    pub fn id(&self) -> BroadcastId {
        self.id
    }

    pub fn value(&self) -> &T {
        &self.value
    }
}

impl<T> Deref for Broadcast<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.value
    }
}

impl<T: Debug> Debug for Broadcast<T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Broadcast")
            .field("id", &self.id)
            .field("value", &*self.value)
            .finish()
    }
}
