//! # Task Queue
//!
//! This module implements the thread-safe work queue that distributes piece
//! tasks to the worker pool.
//!
//! ## Extraction Policies
//!
//! Extraction is pluggable: a policy inspects the queued items under the
//! queue's lock and picks the index to remove, or declines. The default
//! policy is LIFO, so workers tend to process recently enqueued pieces and
//! bursts of tasks for the same torrent stay hot.
//!
//! ## Wake and Stop Semantics
//!
//! Workers that find nothing to extract block in [`TaskQueue::wait_work`].
//! A blocked worker is released when a task is inserted or when
//! [`TaskQueue::begin_skip_waiting`] is called; the latter is permanent and
//! is used during shutdown so that every current and future waiter returns
//! immediately with no work.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};

/// Why [`TaskQueue::try_extract`] returned no item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtractError {
    /// There are no items
    Empty,
    /// There are items but the policy declined to pick one
    PolicyFailure,
}

/// Rule for selecting the next item to extract.
///
/// Policies receive a borrowed view of the queued items and return the index
/// to remove, or `None` to decline. They are called under the queue's lock
/// and must be pure functions of the sequence's current contents.
pub trait ExtractPolicy<T>: Send + Sync {
    /// Select the index of the item to extract.
    fn select(&self, items: &VecDeque<T>) -> Option<usize>;
}

/// Last-in, first-out extraction.
pub struct LifoPolicy;

impl<T> ExtractPolicy<T> for LifoPolicy {
    fn select(&self, items: &VecDeque<T>) -> Option<usize> {
        items.len().checked_sub(1)
    }
}

/// Guarded state: the items plus the permanent shutdown latch.
struct QueueState<T> {
    items: VecDeque<T>,
    skip_waiting: bool,
}

/// Thread-safe collection of tasks with pluggable extraction.
///
/// A single mutex protects the items and a condition variable signals
/// waiters. Fairness between waiters is not guaranteed.
pub struct TaskQueue<T> {
    state: Mutex<QueueState<T>>,
    work_available: Condvar,
}

impl<T> TaskQueue<T> {
    /// Build a new, empty queue.
    pub fn new() -> TaskQueue<T> {
        TaskQueue {
            state: Mutex::new(QueueState {
                items: VecDeque::new(),
                skip_waiting: false,
            }),
            work_available: Condvar::new(),
        }
    }

    /// Insert a task and wake one waiter.
    pub fn insert(&self, item: T) {
        let mut state = self.state.lock().unwrap();
        state.items.push_back(item);
        self.work_available.notify_one();
    }

    /// Try to extract a task using `policy`, without blocking.
    pub fn try_extract(&self, policy: &dyn ExtractPolicy<T>) -> Result<T, ExtractError> {
        let mut state = self.state.lock().unwrap();

        if state.items.is_empty() {
            return Err(ExtractError::Empty);
        }

        match policy.select(&state.items) {
            Some(index) => state.items.remove(index).ok_or(ExtractError::PolicyFailure),
            None => Err(ExtractError::PolicyFailure),
        }
    }

    /// Block until a task is inserted or [`begin_skip_waiting`] is called.
    ///
    /// Spurious wake-ups are filtered; the call returns as soon as the queue
    /// is non-empty or shutting down, without extracting anything.
    ///
    /// [`begin_skip_waiting`]: TaskQueue::begin_skip_waiting
    pub fn wait_work(&self) {
        let mut state = self.state.lock().unwrap();
        while state.items.is_empty() && !state.skip_waiting {
            state = self.work_available.wait(state).unwrap();
        }
    }

    /// Atomically remove every item for which `pred` returns true,
    /// preserving the relative order of the rest.
    pub fn mutate<F>(&self, mut pred: F)
    where
        F: FnMut(&T) -> bool,
    {
        let mut state = self.state.lock().unwrap();
        state.items.retain(|item| !pred(item));
    }

    /// Permanently release all current and future waiters.
    pub fn begin_skip_waiting(&self) {
        let mut state = self.state.lock().unwrap();
        state.skip_waiting = true;
        self.work_available.notify_all();
    }

    /// Number of queued tasks.
    pub fn len(&self) -> usize {
        self.state.lock().unwrap().items.len()
    }

    /// Whether the queue holds no tasks.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T> Default for TaskQueue<T> {
    fn default() -> Self {
        TaskQueue::new()
    }
}
