//! Bounded trampoline queue.
//!
//! Completions and deferred fiber starts are enqueued here instead of being
//! run on the caller's stack. The first thread to enqueue while no one is
//! draining becomes the drainer and runs tasks until the queue is empty;
//! tasks enqueued meanwhile (from any thread) are picked up by that loop.
//! This keeps long chains of synchronous completions flat.

use core::fmt;
use std::sync::atomic::{AtomicBool, Ordering};

use crossbeam_queue::ArrayQueue;

use crate::tracing_compat::trace;

/// A unit of deferred work.
pub type Task = Box<dyn FnOnce() + Send>;

/// A bounded FIFO of deferred tasks.
pub struct Scheduler {
    queue: ArrayQueue<Task>,
    draining: AtomicBool,
}

impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scheduler")
            .field("len", &self.queue.len())
            .field("capacity", &self.queue.capacity())
            .field("draining", &self.is_draining())
            .finish()
    }
}

/// Resets the draining flag even if a task unwinds.
struct DrainGuard<'a>(&'a AtomicBool);

impl Drop for DrainGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl Scheduler {
    /// Creates a scheduler holding at most `limit` tasks (minimum 1).
    #[must_use]
    pub fn new(limit: usize) -> Self {
        Self {
            queue: ArrayQueue::new(limit.max(1)),
            draining: AtomicBool::new(false),
        }
    }

    /// Returns true while some thread is running queued tasks.
    #[must_use]
    pub fn is_draining(&self) -> bool {
        self.draining.load(Ordering::Acquire)
    }

    /// Number of queued tasks.
    #[must_use]
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    /// Returns true if no task is queued.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Queue capacity.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.queue.capacity()
    }

    /// Queues `task`, draining the queue on this thread if no other thread
    /// is already doing so.
    ///
    /// When the queue is full the oldest task runs inline to make room.
    pub fn enqueue(&self, task: Task) {
        let mut task = task;
        loop {
            match self.queue.push(task) {
                Ok(()) => break,
                Err(rejected) => {
                    task = rejected;
                    trace!(capacity = self.queue.capacity(), "scheduler queue full");
                    if let Some(oldest) = self.queue.pop() {
                        oldest();
                    }
                }
            }
        }
        self.drain();
    }

    fn drain(&self) {
        loop {
            if self
                .draining
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                return;
            }
            {
                let _guard = DrainGuard(&self.draining);
                while let Some(task) = self.queue.pop() {
                    task();
                }
            }
            // A task pushed between the last pop and the flag reset would
            // otherwise be stranded.
            if self.queue.is_empty() {
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::Arc;

    #[test]
    fn runs_tasks_in_fifo_order() {
        let scheduler = Arc::new(Scheduler::new(8));
        let order = Arc::new(Mutex::new(Vec::new()));
        let outer = Arc::clone(&order);
        let nested = Arc::clone(&scheduler);
        scheduler.enqueue(Box::new(move || {
            outer.lock().push(1);
            for n in 2..=4 {
                let order = Arc::clone(&outer);
                nested.enqueue(Box::new(move || order.lock().push(n)));
            }
            // Nested tasks wait for the running one.
            outer.lock().push(0);
        }));
        assert_eq!(*order.lock(), vec![1, 0, 2, 3, 4]);
        assert!(scheduler.is_empty());
        assert!(!scheduler.is_draining());
    }

    #[test]
    fn full_queue_runs_oldest_inline() {
        let scheduler = Arc::new(Scheduler::new(2));
        let order = Arc::new(Mutex::new(Vec::new()));
        let outer = Arc::clone(&order);
        let nested = Arc::clone(&scheduler);
        scheduler.enqueue(Box::new(move || {
            for n in 1..=3 {
                let order = Arc::clone(&outer);
                nested.enqueue(Box::new(move || order.lock().push(n)));
            }
        }));
        assert_eq!(*order.lock(), vec![1, 2, 3]);
    }

    #[test]
    fn panicking_task_releases_the_drain() {
        let scheduler = Scheduler::new(4);
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            scheduler.enqueue(Box::new(|| panic!("task exploded")));
        }));
        assert!(result.is_err());
        assert!(!scheduler.is_draining());
        let hit = Arc::new(Mutex::new(false));
        let flag = Arc::clone(&hit);
        scheduler.enqueue(Box::new(move || *flag.lock() = true));
        assert!(*hit.lock());
    }

    #[test]
    fn zero_limit_is_clamped() {
        assert_eq!(Scheduler::new(0).capacity(), 1);
    }
}
