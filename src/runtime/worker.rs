//! Per-CPU work queue: one pinned worker thread draining a two-priority
//! ready queue, parked on a counting semaphore.

use crate::runtime::PRIORITY_COUNT;
use crate::task::Handle;
use crate::utils::Semaphore;
use crate::utils::thread::pin_current_thread;
use anyhow::Result;
use crossbeam_queue::SegQueue;
use std::panic::Location;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use tracing::{trace, warn};

/// Dequeue attempts spent spinning before yielding the CPU while a
/// semaphore token waits on its producer's store to become visible.
const DEQUEUE_SPIN_LIMIT: u32 = 64;

/// One pinned worker thread plus its ready queues.
///
/// Dropping the queue shuts the worker down: the active flag is cleared,
/// one semaphore token unblocks the thread and the thread is joined. Any
/// handles still queued at that point are abandoned; quiescing in-flight
/// work before teardown is the caller's responsibility.
pub(crate) struct WorkQueue {
    shared: Arc<Shared>,
    thread: Option<thread::JoinHandle<()>>,
}

pub(super) struct Shared {
    id: u32,
    active: AtomicBool,
    sem: Semaphore,
    /// Ready handles, one queue per priority, index 1 = high.
    queues: [SegQueue<Handle>; PRIORITY_COUNT],
}

impl WorkQueue {
    pub(crate) fn new(id: u32) -> Result<WorkQueue> {
        let shared = Arc::new(Shared::new(id));

        let thread = thread::Builder::new()
            .name(format!("pinwheel-worker-{id}"))
            .spawn({
                let shared = shared.clone();
                move || worker_loop(&shared)
            })?;

        Ok(WorkQueue {
            shared,
            thread: Some(thread),
        })
    }

    /// Approximate number of queued handles across both priorities. A
    /// lower bound only; concurrent producers and the worker race it.
    pub(crate) fn size_approx(&self) -> usize {
        self.shared.queues.iter().map(|queue| queue.len()).sum()
    }

    /// Pushes a handle for resumption on this queue's CPU. Threadsafe.
    pub(crate) fn enqueue(
        &self,
        handle: Handle,
        priority: u32,
        location: &'static Location<'static>,
    ) {
        self.shared.push(handle, priority, location);
    }
}

impl Drop for WorkQueue {
    fn drop(&mut self) {
        self.shared.active.store(false, Ordering::Release);
        self.shared.sem.release();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Shared {
    pub(super) fn new(id: u32) -> Shared {
        Shared {
            id,
            active: AtomicBool::new(true),
            sem: Semaphore::new(0),
            queues: [SegQueue::new(), SegQueue::new()],
        }
    }

    pub(super) fn push(&self, handle: Handle, priority: u32, location: &'static Location<'static>) {
        let priority = (priority as usize).min(PRIORITY_COUNT - 1);
        trace!(cpu = self.id, priority, %location, "enqueueing handle");
        self.queues[priority].push(handle);
        self.sem.release();
    }
}

fn worker_loop(shared: &Shared) {
    if let Err(error) = pin_current_thread(shared.id) {
        // Restricted cpusets can refuse the pin; an unpinned worker still
        // drains its queue.
        warn!(cpu = shared.id, %error, "failed to pin worker thread, continuing unpinned");
    }

    loop {
        shared.sem.acquire();
        if !shared.active.load(Ordering::Acquire) {
            trace!(cpu = shared.id, "worker stopping");
            return;
        }

        // One resume per token keeps the semaphore an accurate count of
        // available work; the queue is never drained within a token.
        let mut spins = 0u32;
        let handle = loop {
            // High priority first.
            if let Some(handle) = shared.queues.iter().rev().find_map(|queue| queue.pop()) {
                break handle;
            }
            if !shared.active.load(Ordering::Acquire) {
                return;
            }

            // The queues are not sequentially consistent across
            // priorities: a token can arrive before the corresponding
            // producer's store is visible. The store lands in bounded
            // time, so spin briefly, then yield.
            spins += 1;
            if spins < DEQUEUE_SPIN_LIMIT {
                std::hint::spin_loop();
            } else {
                thread::yield_now();
            }
        };

        trace!(cpu = shared.id, "dequeued handle");
        handle.resume();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::paused;
    use static_assertions::assert_impl_all;

    assert_impl_all!(WorkQueue: Send, Sync);

    #[test]
    fn test_out_of_range_priority_clamps_to_high() {
        let shared = Shared::new(0);
        let (task, handle) = paused(async { 3 });

        shared.push(handle, 9, Location::caller());
        assert_eq!(shared.queues[1].len(), 1);
        assert_eq!(shared.queues[0].len(), 0);

        let handle = shared.queues[1].pop().unwrap();
        handle.resume();
        assert!(task.is_ready());
    }

    #[test]
    fn test_worker_resumes_enqueued_handle() {
        let queue = WorkQueue::new(0).unwrap();
        let (task, handle) = paused(async { 3 });

        queue.enqueue(handle, 0, Location::caller());

        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
        while !task.is_ready() {
            assert!(std::time::Instant::now() < deadline, "handle never resumed");
            thread::yield_now();
        }
    }
}
