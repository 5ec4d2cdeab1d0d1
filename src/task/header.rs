#![allow(unsafe_op_in_unsafe_fn)]

use crate::event::EventRef;
use crate::runtime::Schedule;
use crate::task::layout::{Trailer, Vtable};
use crate::task::raw::RawTask;
use crate::task::state::State;
use std::cell::UnsafeCell;
use std::panic::Location;
use std::ptr::NonNull;
use std::sync::atomic::AtomicBool;

/// Suspension recorded by an awaitable during poll and executed by the
/// harness once the frame's poll stack has fully unwound.
///
/// Executing these inline from the awaitable would hand the frame to
/// another thread while this thread is still returning through the frame's
/// own future, so every suspension point defers through this slot instead.
pub(crate) enum Request {
    /// Hand the frame's handle to a scheduler.
    ///
    /// The scheduler pointer stays valid because the borrow it was created
    /// from lives inside the suspended frame; [`Schedule`] implementors
    /// must outlive the tasks scheduled onto them.
    Reschedule {
        scheduler: *const dyn Schedule,
        cpu_affinity: u64,
        priority: u32,
        location: &'static Location<'static>,
    },

    /// Park the frame with the event multiplexer.
    WaitEvent {
        event: EventRef,
        cpu_affinity: u64,
        priority: u32,
    },

    /// Install the frame as the continuation of another task's frame.
    AwaitTask { awaited: NonNull<Header> },
}

/// Hot per-frame data. The frame is addressed through thin `NonNull<Header>`
/// pointers, so `Header` must stay the first field of the cell layout; the
/// vtable carries the trailer offset for untyped access to the cold fields.
#[repr(C)]
pub(crate) struct Header {
    /// Frame lifecycle: reference count plus running/notified/complete bits.
    pub(super) state: State,

    /// One-shot rendezvous token between the awaiter installing a
    /// continuation and this frame reaching final exit. Whoever swaps the
    /// flag second learns the other side already passed and acts for it.
    pub(super) flag: AtomicBool,

    /// Resume point of the awaiting task. Written at most once, by the
    /// awaiter, before its flag swap; read only by the final-exit path
    /// after observing the flag already set.
    pub(super) continuation: UnsafeCell<Option<RawTask>>,

    /// Deferred suspension request. Only the thread currently running the
    /// frame touches this slot.
    pub(super) request: UnsafeCell<Option<Request>>,

    /// Table of function pointers for driving the type-erased frame.
    pub(super) vtable: &'static Vtable,

    /// Joinable frames release their trailer semaphore at final exit and
    /// never take part in the continuation rendezvous.
    pub(super) joinable: bool,
}

// Safety: the unsafe-cell fields are confined by protocol. `request` is
// touched only by the thread holding the RUNNING claim; `continuation` is
// serialized by `flag`.
unsafe impl Send for Header {}
unsafe impl Sync for Header {}

impl Header {
    pub(super) fn new(vtable: &'static Vtable, joinable: bool) -> Header {
        Header {
            state: State::new(),
            flag: AtomicBool::new(false),
            continuation: UnsafeCell::new(None),
            request: UnsafeCell::new(None),
            vtable,
            joinable,
        }
    }

    /// Gets a pointer to the `Trailer` of the frame containing this
    /// `Header`.
    ///
    /// # Safety
    ///
    /// The provided raw pointer must point at the header of a frame.
    pub(super) unsafe fn get_trailer(me: NonNull<Header>) -> NonNull<Trailer> {
        let offset = me.as_ref().vtable.trailer_offset;
        let trailer = me.as_ptr().cast::<u8>().add(offset).cast::<Trailer>();
        NonNull::new_unchecked(trailer)
    }

    /// Records the suspension to perform once this frame's poll returns.
    ///
    /// # Safety
    ///
    /// May only be called from the thread currently running the frame,
    /// i.e. from an awaitable polled by it.
    pub(crate) unsafe fn set_request(me: NonNull<Header>, request: Request) {
        let slot = me.as_ref().request.get();
        debug_assert!((*slot).is_none(), "task suspended twice in one poll");
        *slot = Some(request);
    }

    /// Takes the pending suspension request, if any.
    ///
    /// # Safety
    ///
    /// May only be called by the thread currently running the frame.
    pub(super) unsafe fn take_request(me: NonNull<Header>) -> Option<Request> {
        (*me.as_ref().request.get()).take()
    }
}
