#![allow(unsafe_op_in_unsafe_fn)]

use crate::task::header::{Header, Request};
use crate::task::layout::{Core, TaskCell, Trailer};
use crate::task::raw::{Handle, RawTask};
use crate::task::state::{State, TransitionToIdle};
use crate::runtime::{Schedule, Scheduler};
use crate::task::waker::waker_ref;
use std::future::Future;
use std::panic::Location;
use std::ptr::NonNull;
use std::sync::atomic::Ordering::AcqRel;
use std::task::{Context, Poll};
use tracing::trace;

/// Typed frame driver.
///
/// A harness is reconstructed from a raw header pointer every time the
/// frame is resumed; it performs the state transitions, runs the future,
/// executes the deferred suspension request and, at final exit, the
/// continuation rendezvous.
pub(super) struct Harness<F: Future> {
    cell: NonNull<TaskCell<F>>,
}

impl<F: Future> Harness<F> {
    pub(super) unsafe fn from_raw(ptr: NonNull<Header>) -> Harness<F> {
        Harness {
            cell: ptr.cast::<TaskCell<F>>(),
        }
    }

    fn header_ptr(&self) -> NonNull<Header> {
        self.cell.cast()
    }

    fn header(&self) -> &Header {
        unsafe { &self.cell.as_ref().header }
    }

    fn state(&self) -> &State {
        &self.header().state
    }

    fn core(&self) -> &Core<F> {
        unsafe { &self.cell.as_ref().core }
    }

    fn trailer(&self) -> &Trailer {
        unsafe { &self.cell.as_ref().trailer }
    }

    fn raw(&self) -> RawTask {
        unsafe { RawTask::from_raw(self.header_ptr()) }
    }

    pub(super) fn take_output(&self) -> F::Output {
        self.core().take_output()
    }

    /// Resumes the frame: one poll of the future plus whatever suspension
    /// or completion work it mandates. Consumes the execution reference the
    /// caller was resumed with.
    ///
    /// Returns the continuation to resume next when final exit handed one
    /// off (the symmetric-transfer case).
    pub(super) fn poll(self) -> Option<RawTask> {
        loop {
            if !self.state().transition_to_running() {
                // A racing wake got here first and the frame is being
                // polled elsewhere; this resume is redundant.
                trace!(frame = ?self.header_ptr(), "dropping redundant resume");
                self.raw().drop_reference();
                return None;
            }

            let header_ptr = self.header_ptr();
            let waker = waker_ref(&header_ptr);
            let mut cx = Context::from_waker(&waker);

            match self.core().poll(&mut cx) {
                Poll::Pending => {
                    // The request slot is ours only while RUNNING is held.
                    let request = unsafe { Header::take_request(self.header_ptr()) };
                    let idle = self.state().transition_to_idle();

                    match request {
                        Some(Request::Reschedule {
                            scheduler,
                            cpu_affinity,
                            priority,
                            location,
                        }) => {
                            // From here on the frame belongs to whoever
                            // dequeues it.
                            unsafe {
                                (*scheduler).schedule(
                                    Handle::new(self.raw()),
                                    cpu_affinity,
                                    priority,
                                    location,
                                );
                            }
                            return None;
                        }
                        Some(Request::WaitEvent {
                            event,
                            cpu_affinity,
                            priority,
                        }) => {
                            Scheduler::instance().schedule_event(
                                Handle::new(self.raw()),
                                event,
                                cpu_affinity,
                                priority,
                            );
                            return None;
                        }
                        Some(Request::AwaitTask { awaited }) => {
                            if self.install_continuation(awaited) {
                                return None;
                            }
                            // Lost the rendezvous: the awaited frame
                            // finished before observing the continuation.
                            // Resume ourselves on this thread.
                            continue;
                        }
                        None => {
                            // Suspended on a foreign future that holds our
                            // waker. If a wake already landed, resume via
                            // the default scheduler.
                            if idle == TransitionToIdle::Notified {
                                Scheduler::instance().schedule(
                                    Handle::new(self.raw()),
                                    0,
                                    0,
                                    Location::caller(),
                                );
                            }
                            return None;
                        }
                    }
                }
                Poll::Ready(output) => return self.complete(output),
            }
        }
    }

    /// Install path of the continuation rendezvous: publish this frame as
    /// the continuation of `awaited`, then swap its flag. Returns false
    /// when the awaited frame already reached final exit, in which case the
    /// caller resumes itself.
    fn install_continuation(&self, awaited: NonNull<Header>) -> bool {
        trace!(frame = ?self.header_ptr(), awaited = ?awaited, "installing continuation");
        unsafe {
            *awaited.as_ref().continuation.get() = Some(self.raw());
        }

        // The swap publishes the continuation write to the final-exit side
        // and, when lost, acquires the awaited frame's output store.
        !unsafe { awaited.as_ref() }.flag.swap(true, AcqRel)
    }

    /// Final exit: store the output, publish completion and hand the frame
    /// off to whichever side awaits it.
    fn complete(self, output: F::Output) -> Option<RawTask> {
        self.core().store_output(output);
        self.state().transition_to_complete();

        if self.header().joinable {
            trace!(frame = ?self.header_ptr(), "final exit, releasing joiner");
            self.trailer()
                .join_sem
                .as_ref()
                .expect("joinable frame without a join semaphore")
                .release();
            self.raw().drop_reference();
            return None;
        }

        if self.header().flag.swap(true, AcqRel) {
            // The awaiter got here first, so its continuation is installed
            // and it is our job to resume it. Read it out before releasing
            // our reference; the awaiter may free this frame immediately.
            let continuation = unsafe { (*self.header().continuation.get()).take() };
            let raw = self.raw();

            match continuation {
                Some(continuation) => {
                    trace!(frame = ?self.header_ptr(), "final exit, resuming continuation");
                    raw.drop_reference();
                    Some(continuation)
                }
                None => {
                    trace!(frame = ?self.header_ptr(), "final exit, missing continuation");
                    raw.drop_reference();
                    None
                }
            }
        } else {
            // First at the rendezvous; the awaiter (if any ever arrives)
            // will observe the flag and resume itself.
            trace!(frame = ?self.header_ptr(), "final exit, no continuation installed");
            self.raw().drop_reference();
            None
        }
    }
}
