//! Singleton fan-out: picks a per-CPU queue for each incoming handle using
//! the affinity mask, queue load and a low-discrepancy tie-break.

use crate::event::{Event, EventRef};
use crate::runtime::worker::WorkQueue;
use crate::runtime::{Schedule, multiplexer};
use crate::task::Handle;
use anyhow::Result;
use crossbeam_queue::SegQueue;
use std::panic::Location;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread;
use tracing::{debug, trace};

/// Affinity masks address CPUs through a u64; wider hosts are unsupported.
const MAX_CPUS: u32 = 64;

/// Golden ratio, driving the Kronecker low-discrepancy sequence used to
/// break ties between busy queues.
const PHI: f32 = 1.618_034;

/// Record carried from a task awaiting an event to the multiplexer thread.
pub(super) struct PendingEvent {
    pub(super) handle: Handle,
    pub(super) event: EventRef,
    pub(super) cpu_affinity: u64,
    pub(super) priority: u32,
}

/// The dispatcher: one work queue per logical CPU plus the multiplexer
/// bridging OS events back into those queues.
///
/// Most callers use the process-wide [`Scheduler::instance`]; owning a
/// `Scheduler` directly is also supported, and dropping it shuts the
/// runtime down (multiplexer first, then each worker).
pub struct Scheduler {
    core: Arc<Core>,
    multiplexer: Option<thread::JoinHandle<()>>,
}

pub(super) struct Core {
    /// One queue per logical CPU, indexed by CPU id.
    queues: Box<[WorkQueue]>,
    cpu_count: u32,
    /// All valid-CPU bits set; masks are normalized against it.
    cpu_mask: u64,
    /// Drives the low-discrepancy queue selection when every permitted
    /// queue looks busy.
    update: AtomicU32,
    pub(super) active: AtomicBool,
    /// Records headed for the multiplexer; MPMC but drained only there.
    pub(super) pending: SegQueue<PendingEvent>,
    /// Wakes the multiplexer for new pending records or shutdown.
    pub(super) wakeup: Event,
}

impl Scheduler {
    /// Returns the default global threadsafe scheduler, created on first
    /// access. It lives until process exit.
    pub fn instance() -> &'static Scheduler {
        static INSTANCE: OnceLock<Scheduler> = OnceLock::new();
        INSTANCE.get_or_init(|| Scheduler::new().expect("failed to start the default scheduler"))
    }

    /// Spawns a scheduler: one pinned worker per logical CPU and the event
    /// multiplexer thread.
    ///
    /// # Panics
    ///
    /// Panics when hardware concurrency falls outside (0, 64].
    pub fn new() -> Result<Scheduler> {
        let cpu_count = thread::available_parallelism()?.get() as u32;
        assert!(
            cpu_count > 0 && cpu_count <= MAX_CPUS,
            "pinwheel supports 1 to {MAX_CPUS} logical CPUs, found {cpu_count}"
        );
        let cpu_mask = u64::MAX >> (MAX_CPUS - cpu_count);

        debug!(cpu_count, "starting scheduler");

        let queues = (0..cpu_count)
            .map(WorkQueue::new)
            .collect::<Result<Vec<_>>>()?
            .into_boxed_slice();

        let core = Arc::new(Core {
            queues,
            cpu_count,
            cpu_mask,
            // A high quality seed is not needed; the counter only drives a
            // low-discrepancy sequence.
            update: AtomicU32::new(fastrand::u32(..)),
            active: AtomicBool::new(true),
            pending: SegQueue::new(),
            wakeup: Event::new(false, "pinwheel-multiplexer-wakeup")?,
        });

        let multiplexer = multiplexer::spawn(core.clone())?;

        Ok(Scheduler {
            core,
            multiplexer: Some(multiplexer),
        })
    }

    /// Number of logical CPUs (and worker queues) this scheduler drives.
    pub fn cpu_count(&self) -> u32 {
        self.core.cpu_count
    }

    /// Parks `handle` with the multiplexer until `event` is signaled, then
    /// schedules it with the given affinity and priority. Threadsafe.
    pub fn schedule_event(&self, handle: Handle, event: EventRef, cpu_affinity: u64, priority: u32) {
        self.core.pending.push(PendingEvent {
            handle,
            event,
            cpu_affinity,
            priority,
        });
        self.core.wakeup.signal();
    }
}

impl Schedule for Scheduler {
    fn schedule(
        &self,
        handle: Handle,
        cpu_affinity: u64,
        priority: u32,
        location: &'static Location<'static>,
    ) {
        self.core.schedule(handle, cpu_affinity, priority, location);
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        debug!("shutting down scheduler");
        self.core.active.store(false, Ordering::Release);
        self.core.wakeup.signal();
        if let Some(multiplexer) = self.multiplexer.take() {
            let _ = multiplexer.join();
        }
        // Dropping `core` tears down the work queues, joining each worker.
    }
}

impl Core {
    pub(super) fn schedule(
        &self,
        handle: Handle,
        cpu_affinity: u64,
        priority: u32,
        location: &'static Location<'static>,
    ) {
        // Mask 0 means every CPU is permitted. A mask that selects no
        // valid CPU would strand the handle, so it degrades the same way.
        let mut mask = cpu_affinity & self.cpu_mask;
        if mask == 0 {
            mask = self.cpu_mask;
        }

        // First pass: prefer an idle permitted queue, lowest CPU first.
        // The emptiness check is approximate; racing producers may make us
        // miss a queue that just drained, which is acceptable.
        for cpu in 0..self.cpu_count {
            if mask & (1u64 << cpu) != 0 && self.queues[cpu as usize].size_approx() == 0 {
                trace!(cpu, "empty work queue identified");
                self.queues[cpu as usize].enqueue(handle, priority, location);
                return;
            }
        }

        // Every permitted queue appears busy; spread load across them with
        // a Kronecker recurrence sequence.
        let update = self.update.fetch_add(1, Ordering::Relaxed);
        let popcount = mask.count_ones();
        let index = ((update as f32 * PHI).fract() * popcount as f32) as u32;
        let cpu = nth_set_bit(mask, index.min(popcount - 1));

        trace!(cpu, "work queue identified");
        self.queues[cpu as usize].enqueue(handle, priority, location);
    }
}

/// Index of the `n`-th set bit of `mask`, found by iteratively clearing
/// the lowest set bit. `n` must be below the popcount.
fn nth_set_bit(mut mask: u64, n: u32) -> u32 {
    for _ in 0..n {
        mask &= mask - 1;
    }
    mask.trailing_zeros()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use static_assertions::assert_impl_all;

    assert_impl_all!(Scheduler: Send, Sync, Schedule);
    assert_impl_all!(PendingEvent: Send);

    #[rstest]
    #[case(0b1, 0, 0)]
    #[case(0b1010, 0, 1)]
    #[case(0b1010, 1, 3)]
    #[case(1 << 63, 0, 63)]
    #[case(u64::MAX, 42, 42)]
    fn test_nth_set_bit(#[case] mask: u64, #[case] n: u32, #[case] expected: u32) {
        assert_eq!(nth_set_bit(mask, n), expected);
    }

    #[test]
    fn test_low_discrepancy_index_stays_in_range() {
        for update in [0u32, 1, 7, 1000, u32::MAX] {
            for popcount in [1u32, 2, 3, 64] {
                let index = ((update as f32 * PHI).fract() * popcount as f32) as u32;
                assert!(index.min(popcount - 1) < popcount);
            }
        }
    }
}
