//! The OS-event multiplexer: a single thread blocked in a multi-wait over
//! event handles, routing signaled events back into the scheduler.

use crate::event::{EventRef, WaitStatus};
use crate::runtime::scheduler::{Core, PendingEvent};
use anyhow::Result;
use std::panic::Location;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::thread;
use tracing::{debug, trace};

pub(super) fn spawn(core: Arc<Core>) -> Result<thread::JoinHandle<()>> {
    let thread = thread::Builder::new()
        .name("pinwheel-multiplexer".into())
        .spawn(move || run(&core))?;
    Ok(thread)
}

/// Multiplexer loop.
///
/// `events[0]` is the scheduler's wakeup event; it announces new pending
/// records or shutdown. `events[k]` for k > 0 is a user event whose
/// pending record sits at `continuations[k - 1]`. Both arrays are owned
/// exclusively by this thread.
fn run(core: &Core) {
    let mut events: Vec<EventRef> = vec![core.wakeup.event_ref()];
    let mut continuations: Vec<PendingEvent> = Vec::new();

    loop {
        let result = EventRef::wait_many(&events);
        match result.status {
            // Transient; wait again.
            WaitStatus::Failed | WaitStatus::Timeout => continue,
            WaitStatus::Normal | WaitStatus::Abandoned => {}
        }

        let index = result.index as usize;
        if index == 0 {
            if !core.active.load(Ordering::Acquire) {
                debug!("multiplexer stopping");
                return;
            }

            // Register the newly pending events in bulk.
            let mut added = 0usize;
            while let Some(record) = core.pending.pop() {
                events.push(record.event);
                continuations.push(record);
                added += 1;
            }
            trace!(added, watched = continuations.len(), "registered events");
        } else {
            // A user event fired: schedule its continuation with the
            // affinity and priority recorded at await time, then compact
            // both arrays by swapping the tail in.
            let record = continuations.swap_remove(index - 1);
            events.swap_remove(index);

            trace!(index, watched = continuations.len(), "event signaled");
            core.schedule(
                record.handle,
                record.cpu_affinity,
                record.priority,
                Location::caller(),
            );
        }
    }
}
