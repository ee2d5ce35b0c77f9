//! Bounded FIFO of dispatch tasks shared by the worker pool.
//!
//! Producers never block: when the queue is full the oldest task is evicted and handed
//! back to the caller, which releases its tracking entry so the next directory scan can
//! pick the file up again.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio::sync::Notify;

use crate::dispatch::DispatchTask;

#[derive(Debug)]
pub struct TaskQueue {
    capacity: usize,
    items: Mutex<VecDeque<DispatchTask>>,
    available: Notify,
}

impl TaskQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            items: Mutex::new(VecDeque::new()),
            available: Notify::new(),
        }
    }

    /// Appends a task, returning the evicted oldest task if the queue was full.
    pub fn push(&self, task: DispatchTask) -> Option<DispatchTask> {
        let evicted = {
            let mut items = self.lock();
            let evicted = if items.len() >= self.capacity {
                items.pop_front()
            } else {
                None
            };
            items.push_back(task);
            evicted
        };
        self.available.notify_one();
        evicted
    }

    pub fn try_pop(&self) -> Option<DispatchTask> {
        self.lock().pop_front()
    }

    /// Waits until a task is available. Cancel-safe: no task is lost if the future is
    /// dropped while waiting.
    pub async fn pop(&self) -> DispatchTask {
        loop {
            let notified = self.available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if let Some(task) = self.try_pop() {
                if !self.lock().is_empty() {
                    self.available.notify_one();
                }
                return task;
            }
            notified.await;
        }
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<DispatchTask>> {
        self.items.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
