#![allow(unsafe_op_in_unsafe_fn)]

use crate::task::TaskControl;
use crate::task::header::Header;
use crate::task::layout::TaskCell;
use crate::utils::Semaphore;
use std::fmt;
use std::future::Future;
use std::ptr::NonNull;

/// Untyped frame pointer.
///
/// Plain `Copy` data; reference-count bookkeeping is explicit. Every copy
/// held across threads (queue entries, continuation slots, user handles,
/// cloned wakers) corresponds to one reference.
#[derive(Clone, Copy)]
pub(crate) struct RawTask {
    ptr: NonNull<Header>,
}

impl RawTask {
    pub(super) fn new<F, C>(future: F, joinable: bool) -> RawTask
    where
        F: Future,
        C: TaskControl,
    {
        let ptr = TaskCell::<F>::allocate::<C>(future, joinable);
        RawTask { ptr: ptr.cast() }
    }

    pub(crate) unsafe fn from_raw(ptr: NonNull<Header>) -> RawTask {
        RawTask { ptr }
    }

    pub(crate) fn header_ptr(&self) -> NonNull<Header> {
        self.ptr
    }

    pub(super) fn header(&self) -> &Header {
        unsafe { self.ptr.as_ref() }
    }

    /// True once the frame reached final exit and its output is readable.
    pub(crate) fn is_complete(&self) -> bool {
        self.header().state.is_complete()
    }

    /// Joinable frames only: the semaphore released at final exit.
    pub(super) fn join_sem(&self) -> &Semaphore {
        let trailer = unsafe { Header::get_trailer(self.ptr).as_ref() };
        trailer
            .join_sem
            .as_ref()
            .expect("joinable frame without a join semaphore")
    }

    /// Polls the frame once, executing any resulting suspension request.
    /// Returns the continuation handed off at final exit, if any.
    ///
    /// Consumes one reference (the execution reference the resume carried).
    pub(super) fn poll(self) -> Option<RawTask> {
        let vtable = self.header().vtable;
        unsafe { (vtable.poll)(self.ptr) }
    }

    /// Moves the output out of a completed frame.
    ///
    /// # Safety
    ///
    /// `dst` must be a `*mut Option<T>` where `T` is the output type of the
    /// frame's future, and completion must have been observed first.
    pub(super) unsafe fn read_output(self, dst: *mut ()) {
        let vtable = self.header().vtable;
        (vtable.read_output)(self.ptr, dst);
    }

    pub(super) fn dealloc(self) {
        let vtable = self.header().vtable;
        unsafe {
            (vtable.dealloc)(self.ptr);
        }
    }

    /// Increments the frame's reference count.
    pub(crate) fn ref_inc(self) {
        self.header().state.ref_inc();
    }

    /// Drops one reference, freeing the frame when it was the last.
    pub(crate) fn drop_reference(self) {
        if self.header().state.ref_dec() {
            self.dealloc();
        }
    }
}

impl fmt::Debug for RawTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("RawTask").field(&self.ptr).finish()
    }
}

/// Opaque resumable token addressing a suspended task frame.
///
/// A `Handle` is what schedulers move around: pointer-sized, move-only,
/// resumed at most once. [`Handle::resume`] continues the task on the
/// calling thread until it suspends again or completes, then resumes any
/// continuation the completion handed off.
pub struct Handle {
    raw: RawTask,
}

// Safety: frames only wrap `Send` futures (enforced at task construction),
// so the handle may hop threads.
unsafe impl Send for Handle {}

impl Handle {
    pub(crate) fn new(raw: RawTask) -> Handle {
        Handle { raw }
    }

    /// Resumes the suspended task on the calling thread.
    ///
    /// When the resumed task reaches final exit with a continuation
    /// installed, the continuation is resumed here as well, iteratively,
    /// until a frame suspends instead of finishing.
    pub fn resume(self) {
        let mut raw = self.raw;
        loop {
            tracing::trace!(frame = ?raw.header_ptr(), "resuming");
            match raw.poll() {
                Some(next) => raw = next,
                None => return,
            }
        }
    }
}

impl fmt::Debug for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Handle").field(&self.raw).finish()
    }
}
