//! Single-flight bookkeeping: at most one in-flight task per key, plus a bounded retry budget per key, and a shared
//! limit on how many loads run at once.
use std::cell::Cell;
use std::collections::HashMap;
use std::rc::Rc;

use ahash::RandomState;
use log::{debug, warn};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RetryDecision {
    /// Try again; this is retry number `attempt`, starting at 1.
    Retry { attempt: u32 },
    /// No more retries.  Propagate the failure.
    Exhausted { failures: u32 },
}

/// Counts retries up towards a fixed maximum.
///
/// A failure arriving once `max_retry_count` retries have already been made exhausts the counter, so with a maximum
/// of 2 the first two failures are retried and the third is final.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryCounter {
    retry_count: u32,
    max_retry_count: u32,
}

impl RetryCounter {
    pub fn new(max_retry_count: u32) -> RetryCounter {
        RetryCounter {
            retry_count: 0,
            max_retry_count,
        }
    }

    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    pub fn max_retry_count(&self) -> u32 {
        self.max_retry_count
    }

    pub fn is_exhausted(&self) -> bool {
        self.retry_count >= self.max_retry_count
    }

    pub fn record_failure(&mut self) -> RetryDecision {
        if self.is_exhausted() {
            RetryDecision::Exhausted {
                failures: self.retry_count + 1,
            }
        } else {
            self.retry_count += 1;
            RetryDecision::Retry {
                attempt: self.retry_count,
            }
        }
    }

    pub fn reset(&mut self) {
        self.retry_count = 0;
    }
}

/// Tracks in-flight tasks by key so that concurrent requests share one task.
///
/// Tasks are usually shared operation handles; `try_get_task` hands out a reference and callers clone what they
/// need.
#[derive(Debug)]
pub struct LoadingTaskTracker<T> {
    tasks: HashMap<String, T, RandomState>,
    retries: HashMap<String, RetryCounter, RandomState>,
    max_retry_count: u32,
}

impl<T> LoadingTaskTracker<T> {
    pub fn new(max_retry_count: u32) -> LoadingTaskTracker<T> {
        LoadingTaskTracker {
            tasks: Default::default(),
            retries: Default::default(),
            max_retry_count,
        }
    }

    pub fn has_task(&self, key: &str) -> bool {
        self.tasks.contains_key(key)
    }

    pub fn try_get_task(&self, key: &str) -> Option<&T> {
        self.tasks.get(key)
    }

    /// Register a task.  Does nothing and returns `false` if one is already registered for `key`.
    pub fn add_task(&mut self, key: &str, task: T) -> bool {
        if self.tasks.contains_key(key) {
            return false;
        }
        self.tasks.insert(key.to_string(), task);
        debug!("Marked {} as loading", key);
        true
    }

    pub fn remove_task(&mut self, key: &str) -> Option<T> {
        let task = self.tasks.remove(key)?;
        debug!("Cleared loading flag of {}", key);
        Some(task)
    }

    /// Record a failure of the task for `key` against its retry budget.
    pub fn record_failure(&mut self, key: &str) -> RetryDecision {
        let max = self.max_retry_count;
        let decision = self
            .retries
            .entry(key.to_string())
            .or_insert_with(|| RetryCounter::new(max))
            .record_failure();
        match decision {
            RetryDecision::Retry { attempt } => {
                warn!("Retrying {} ({}/{})", key, attempt, max)
            }
            RetryDecision::Exhausted { failures } => {
                warn!("Giving up on {} after {} failures", key, failures)
            }
        }
        decision
    }

    /// Forget the failures recorded for `key`, typically after it succeeded.
    pub fn reset_retry(&mut self, key: &str) {
        self.retries.remove(key);
    }

    pub fn retry_count(&self, key: &str) -> u32 {
        self.retries.get(key).map(|r| r.retry_count()).unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.tasks.keys().map(|k| k.as_str())
    }

    pub fn tasks(&self) -> impl Iterator<Item = (&str, &T)> {
        self.tasks.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn retain(&mut self, mut keep: impl FnMut(&str, &T) -> bool) {
        self.tasks.retain(|k, v| keep(k, v));
    }
}

/// Caps the number of loads in flight.  Cloning shares the limit.
#[derive(Clone, Debug)]
pub struct LoadLimiter {
    in_flight: Rc<Cell<usize>>,
    max: usize,
}

impl LoadLimiter {
    /// A maximum of 0 is treated as 1.
    pub fn new(max: usize) -> LoadLimiter {
        LoadLimiter {
            in_flight: Rc::new(Cell::new(0)),
            max: max.max(1),
        }
    }

    pub fn max(&self) -> usize {
        self.max
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.get()
    }

    /// Take a slot if one is free.
    pub fn try_acquire(&self) -> Option<LoadSlot> {
        if self.in_flight.get() >= self.max {
            return None;
        }
        Some(self.acquire_unbounded())
    }

    /// Take a slot regardless of the limit.  Used by synchronous waits, which cannot wait for a slot to free up.
    pub fn acquire_unbounded(&self) -> LoadSlot {
        self.in_flight.set(self.in_flight.get() + 1);
        LoadSlot {
            in_flight: self.in_flight.clone(),
        }
    }
}

/// A held slot of a [LoadLimiter], released on drop.
#[derive(Debug)]
#[must_use]
pub struct LoadSlot {
    in_flight: Rc<Cell<usize>>,
}

impl Drop for LoadSlot {
    fn drop(&mut self) {
        self.in_flight.set(self.in_flight.get() - 1);
    }
}
