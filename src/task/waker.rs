#![allow(unsafe_op_in_unsafe_fn)]

use crate::runtime::{Schedule, Scheduler};
use crate::task::header::Header;
use crate::task::raw::{Handle, RawTask};
use crate::task::state::TransitionToNotified;
use std::marker::PhantomData;
use std::mem::ManuallyDrop;
use std::ops;
use std::panic::Location;
use std::ptr::NonNull;
use std::task::{RawWaker, RawWakerVTable, Waker};

/// The waker's data pointer carries the frame header. Pinwheel's own
/// awaitables read it back through [`current_task`] to record suspension
/// requests; foreign futures treat it as an ordinary waker, whose wake
/// reschedules the task on the default scheduler.
pub(super) struct WakerRef<'a> {
    waker: ManuallyDrop<Waker>,
    _p: PhantomData<&'a Header>,
}

/// Returns a `WakerRef` which avoids having to preemptively increase the
/// refcount if there is no need to do so.
pub(super) fn waker_ref(header: &NonNull<Header>) -> WakerRef<'_> {
    // Since we pass in a reference and not an *owned* waker, we must
    // ensure `drop` is never called on this instance; `ManuallyDrop` does
    // exactly that.
    let waker = unsafe { ManuallyDrop::new(Waker::from_raw(raw_waker(*header))) };

    WakerRef {
        waker,
        _p: PhantomData,
    }
}

impl ops::Deref for WakerRef<'_> {
    type Target = Waker;

    fn deref(&self) -> &Waker {
        &self.waker
    }
}

/// Recovers the frame header of the task currently being polled.
///
/// Panics when the waker does not belong to this runtime, i.e. when a
/// pinwheel suspension point is awaited from a foreign executor.
pub(crate) fn current_task(waker: &Waker) -> NonNull<Header> {
    assert!(
        std::ptr::eq(waker.vtable(), &WAKER_VTABLE),
        "suspension point awaited outside a pinwheel task"
    );
    unsafe { NonNull::new_unchecked(waker.data() as *mut Header) }
}

unsafe fn clone_waker(ptr: *const ()) -> RawWaker {
    let header = NonNull::new_unchecked(ptr as *mut Header);
    let raw = RawTask::from_raw(header);
    raw.ref_inc();
    raw_waker(header)
}

unsafe fn drop_waker(ptr: *const ()) {
    let raw = RawTask::from_raw(NonNull::new_unchecked(ptr as *mut Header));
    raw.drop_reference();
}

// Wake by consuming the waker: its reference either travels into the queue
// with the handle or is dropped when the wake is redundant.
unsafe fn wake_by_val(ptr: *const ()) {
    let raw = RawTask::from_raw(NonNull::new_unchecked(ptr as *mut Header));
    match raw.header().state.transition_to_notified() {
        TransitionToNotified::Submit => submit(raw),
        TransitionToNotified::DoNothing => raw.drop_reference(),
    }
}

// Wake without consuming the waker: submitting creates a new reference for
// the queued handle.
unsafe fn wake_by_ref(ptr: *const ()) {
    let raw = RawTask::from_raw(NonNull::new_unchecked(ptr as *mut Header));
    if raw.header().state.transition_to_notified() == TransitionToNotified::Submit {
        raw.ref_inc();
        submit(raw);
    }
}

fn submit(raw: RawTask) {
    // Foreign wakes carry no placement hints; any CPU, normal priority.
    Scheduler::instance().schedule(Handle::new(raw), 0, 0, Location::caller());
}

static WAKER_VTABLE: RawWakerVTable =
    RawWakerVTable::new(clone_waker, wake_by_val, wake_by_ref, drop_waker);

fn raw_waker(header: NonNull<Header>) -> RawWaker {
    let ptr = header.as_ptr() as *const ();
    RawWaker::new(ptr, &WAKER_VTABLE)
}
