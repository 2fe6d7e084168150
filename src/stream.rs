use std::fmt::Debug;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use serde::{Deserialize, Serialize};

use crate::error::StreamError;

/// Elements of one partition, as handed to user closures and actions.
///
/// Narrow transformations wrap their parent's iterator, so a chain of them is
/// evaluated element by element without realizing intermediate partitions.
pub type ElementIter<T> = Box<dyn Iterator<Item = T> + Send>;

/// Iterates over a stored partition, cloning each element out of it.
pub(crate) struct SharedIter<T> {
    data: Arc<Vec<T>>,
    pos: usize,
    end: usize,
}

impl<T> SharedIter<T> {
    pub(crate) fn new(data: Arc<Vec<T>>) -> Self {
        let end = data.len();
        Self { data, pos: 0, end }
    }

    pub(crate) fn slice(data: Arc<Vec<T>>, start: usize, end: usize) -> Self {
        let end = end.min(data.len());
        Self {
            data,
            pos: start.min(end),
            end,
        }
    }
}

impl<T: Clone> Iterator for SharedIter<T> {
    type Item = T;

    fn next(&mut self) -> Option<T> {
        if self.pos >= self.end {
            return None;
        }
        let item = self.data[self.pos].clone();
        self.pos += 1;
        Some(item)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let left = self.end - self.pos;
        (left, Some(left))
    }
}

/// Kill flag of one task attempt.
///
/// Set by the scheduler when the attempt times out, or through the job flag
/// when the whole job is cancelled.
#[derive(Clone, Debug, Default)]
pub(crate) struct KillSwitch {
    attempt: Arc<AtomicBool>,
    job: Arc<AtomicBool>,
}

impl KillSwitch {
    pub(crate) fn for_job(job: &Arc<AtomicBool>) -> Self {
        Self {
            attempt: Arc::new(AtomicBool::new(false)),
            job: job.clone(),
        }
    }

    pub(crate) fn kill(&self) {
        self.attempt.store(true, Ordering::Release);
    }

    pub(crate) fn is_set(&self) -> bool {
        self.attempt.load(Ordering::Acquire) || self.job.load(Ordering::Acquire)
    }
}

/// Stops yielding as soon as the kill flag is raised.
///
/// Sources, stored partitions and shuffle reads are wrapped in this, so every
/// fused chain checks the flag between elements.
pub(crate) struct Interruptible<I> {
    inner: I,
    kill: KillSwitch,
}

impl<I> Interruptible<I> {
    pub(crate) fn new(inner: I, kill: KillSwitch) -> Self {
        Self { inner, kill }
    }
}

impl<I: Iterator> Iterator for Interruptible<I> {
    type Item = I::Item;

    fn next(&mut self) -> Option<I::Item> {
        if self.kill.is_set() {
            return None;
        }
        self.inner.next()
    }
}

/// Values collected for one key by `group_by_key`.
///
/// The group can be traversed by reference exactly once. A second call to
/// [`Grouped::iter`] fails with [`StreamError::AlreadyConsumed`] instead of
/// silently yielding nothing. Taking ownership with [`Grouped::into_vec`] or
/// `into_iter` is always allowed.
#[derive(Serialize, Deserialize)]
pub struct Grouped<V> {
    values: Vec<V>,
    #[serde(skip)]
    consumed: AtomicBool,
}

impl<V> Grouped<V> {
    pub(crate) fn new(values: Vec<V>) -> Self {
        Self {
            values,
            consumed: AtomicBool::new(false),
        }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn iter(&self) -> Result<std::slice::Iter<'_, V>, StreamError> {
        if self.consumed.swap(true, Ordering::AcqRel) {
            return Err(StreamError::AlreadyConsumed);
        }
        Ok(self.values.iter())
    }

    pub fn into_vec(self) -> Vec<V> {
        self.values
    }
}

// A clone is a fresh group that has not been traversed yet.
impl<V: Clone> Clone for Grouped<V> {
    fn clone(&self) -> Self {
        Self::new(self.values.clone())
    }
}

impl<V: Debug> Debug for Grouped<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Grouped")
            .field("values", &self.values)
            .field("consumed", &self.consumed.load(Ordering::Relaxed))
            .finish()
    }
}

impl<V> IntoIterator for Grouped<V> {
    type Item = V;
    type IntoIter = std::vec::IntoIter<V>;

    fn into_iter(self) -> Self::IntoIter {
        self.values.into_iter()
    }
}
