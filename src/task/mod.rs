//! Suspendable tasks and their frame machinery.
//!
//! A task is created by handing a future to [`start`] (or
//! [`start_joinable`]) and begins executing *eagerly* on the calling
//! thread, up to its first suspension point. Awaiting a non-joinable task
//! from inside another task installs the awaiter as the inner task's
//! continuation; joinable tasks are instead joined from ordinary threads
//! through a semaphore.

use crate::runtime::{Schedule, Scheduler};
use std::alloc::Layout;
use std::future::Future;
use std::marker::PhantomData;
use std::panic::Location;
use std::pin::Pin;
use std::task::{Context, Poll};
use tracing::trace;

pub(crate) mod header;
use self::header::{Header, Request};

mod harness;

pub(crate) mod layout;

mod raw;
pub use self::raw::Handle;
pub(crate) use self::raw::RawTask;

mod state;

pub(crate) mod waker;
use self::waker::current_task;

/// Frame allocation hook. Implement and pass to [`start_in`] to override
/// where task frames live, e.g. to pool frames of identical size on
/// fine-grained workloads.
pub trait TaskControl {
    fn alloc(layout: Layout) -> *mut u8;

    /// # Safety
    ///
    /// `ptr` must originate from [`TaskControl::alloc`] on the same
    /// implementation with the same layout.
    unsafe fn free(ptr: *mut u8, layout: Layout);
}

/// Default task control: the global allocator.
pub struct DefaultTaskControl;

impl TaskControl for DefaultTaskControl {
    fn alloc(layout: Layout) -> *mut u8 {
        unsafe { std::alloc::alloc(layout) }
    }

    unsafe fn free(ptr: *mut u8, layout: Layout) {
        unsafe { std::alloc::dealloc(ptr, layout) }
    }
}

/// An in-flight suspendable task.
///
/// Move-only; the handle owns one reference to the frame. Non-joinable
/// tasks (`JOINABLE = false`, the default) implement [`Future`] and are
/// awaited from inside other tasks, at most once. Joinable tasks are
/// top-level: they never carry a continuation and are completed via
/// [`Task::join`] from a non-task thread. The split is enforced at the
/// type level, so joining an awaitable task or awaiting a joinable one
/// does not compile.
pub struct Task<T, const JOINABLE: bool = false> {
    raw: Option<RawTask>,
    _marker: PhantomData<T>,
}

// Safety: the frame only wraps `Send` futures with `Send` outputs
// (enforced by the start functions), so the handle may leave the thread
// that created it.
unsafe impl<T: Send, const JOINABLE: bool> Send for Task<T, JOINABLE> {}

// Safety: `Task` never stores `T` directly, only a pointer to the
// heap-allocated frame, so moving a `Task` never moves a `T` in place.
impl<T, const JOINABLE: bool> Unpin for Task<T, JOINABLE> {}

impl<T, const JOINABLE: bool> Task<T, JOINABLE> {
    /// True when the task has no live frame or its frame reached final
    /// exit; awaiting a ready task returns immediately.
    pub fn is_ready(&self) -> bool {
        match &self.raw {
            None => true,
            Some(raw) => raw.is_complete(),
        }
    }
}

impl<T> Task<T, true> {
    /// Blocks the calling thread until the task reaches final exit, then
    /// returns its output.
    ///
    /// The semaphore release at final exit strictly follows the output
    /// store, so the returned value is fully visible to the joiner.
    pub fn join(mut self) -> T {
        let raw = self.raw.take().expect("joining an empty task");
        raw.join_sem().acquire();

        let mut output: Option<T> = None;
        unsafe { raw.read_output((&raw mut output).cast()) };
        raw.drop_reference();
        output.expect("joined task produced no output")
    }
}

impl<T> Future for Task<T, false> {
    type Output = T;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<T> {
        let this = self.get_mut();
        let raw = *this.raw.as_ref().expect("awaiting an empty task");

        if raw.is_complete() {
            let mut output: Option<T> = None;
            unsafe { raw.read_output((&raw mut output).cast()) };
            return Poll::Ready(output.expect("awaited task produced no output"));
        }

        // Defer the install to the harness: it runs once this poll stack
        // has unwound and the awaiter is safely idle.
        let me = current_task(cx.waker());
        unsafe {
            Header::set_request(
                me,
                Request::AwaitTask {
                    awaited: raw.header_ptr(),
                },
            );
        }
        Poll::Pending
    }
}

impl<T, const JOINABLE: bool> Drop for Task<T, JOINABLE> {
    fn drop(&mut self) {
        if let Some(raw) = self.raw.take() {
            raw.drop_reference();
        }
    }
}

impl<T, const JOINABLE: bool> std::fmt::Debug for Task<T, JOINABLE> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task")
            .field("joinable", &JOINABLE)
            .field("ready", &self.is_ready())
            .finish()
    }
}

/// Starts a task: allocates its frame and runs it on the calling thread up
/// to the first suspension point.
pub fn start<F>(future: F) -> Task<F::Output, false>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    start_in::<DefaultTaskControl, F>(future)
}

/// Starts a joinable task; completion is awaited with [`Task::join`].
pub fn start_joinable<F>(future: F) -> Task<F::Output, true>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    start_in_joinable::<DefaultTaskControl, F>(future)
}

/// [`start`], with the frame allocated through `C`.
pub fn start_in<C, F>(future: F) -> Task<F::Output, false>
where
    C: TaskControl,
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    launch::<C, F, false>(future)
}

/// [`start_joinable`], with the frame allocated through `C`.
pub fn start_in_joinable<C, F>(future: F) -> Task<F::Output, true>
where
    C: TaskControl,
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    launch::<C, F, true>(future)
}

fn launch<C, F, const JOINABLE: bool>(future: F) -> Task<F::Output, JOINABLE>
where
    C: TaskControl,
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    let raw = RawTask::new::<F, C>(future, JOINABLE);
    trace!(frame = ?raw.header_ptr(), joinable = JOINABLE, "task started");

    // Eager start: the execution reference runs here, on the caller's
    // thread, until the task first suspends or completes.
    Handle::new(raw).resume();

    Task {
        raw: Some(raw),
        _marker: PhantomData,
    }
}

/// Awaitable returned by the suspend functions. Resolves after the task
/// has been handed to the scheduler and resumed by a worker.
pub struct Suspend<'a> {
    scheduler: &'a dyn Schedule,
    cpu_mask: u64,
    priority: u32,
    location: &'static Location<'static>,
    resumed: bool,
}

impl Future for Suspend<'_> {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        let this = self.get_mut();
        if this.resumed {
            return Poll::Ready(());
        }

        let me = current_task(cx.waker());
        unsafe {
            // Safety: the doc contract on `Request::Reschedule` requires the
            // scheduler to outlive every task scheduled onto it, so erasing
            // the borrow's lifetime here to match the untyped `Request`
            // storage does not extend its real validity.
            let scheduler: *const dyn Schedule =
                std::mem::transmute::<&dyn Schedule, &'static dyn Schedule>(this.scheduler);
            Header::set_request(
                me,
                Request::Reschedule {
                    scheduler,
                    cpu_affinity: this.cpu_mask,
                    priority: this.priority,
                    location: this.location,
                },
            );
        }
        this.resumed = true;
        Poll::Pending
    }
}

/// Suspends the current task and reschedules it on the default scheduler,
/// any CPU, normal priority.
#[track_caller]
pub fn suspend() -> Suspend<'static> {
    suspend_to(0, 0)
}

/// Suspends the current task and reschedules it on the default scheduler
/// with the given affinity mask and priority. A mask of 0 permits every
/// CPU; priorities outside [0, 1] are clamped.
#[track_caller]
pub fn suspend_to(cpu_mask: u64, priority: u32) -> Suspend<'static> {
    suspend_on(Scheduler::instance(), cpu_mask, priority)
}

/// Suspends the current task onto an arbitrary [`Schedule`] implementation.
///
/// The scheduler must outlive every task scheduled onto it.
#[track_caller]
pub fn suspend_on(scheduler: &dyn Schedule, cpu_mask: u64, priority: u32) -> Suspend<'_> {
    Suspend {
        scheduler,
        cpu_mask,
        priority,
        location: Location::caller(),
        resumed: false,
    }
}

/// Creates a task frame without running it, returning the user handle and
/// the execution handle separately. Lets tests drive queues directly.
#[cfg(test)]
pub(crate) fn paused<F>(future: F) -> (Task<F::Output, false>, Handle)
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    let raw = RawTask::new::<F, DefaultTaskControl>(future, false);
    (
        Task {
            raw: Some(raw),
            _marker: PhantomData,
        },
        Handle::new(raw),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use static_assertions::assert_impl_all;

    assert_impl_all!(Task<i32>: Send);
    assert_impl_all!(Task<i32, true>: Send);
    assert_impl_all!(Handle: Send);

    #[test]
    fn test_synchronous_completion_is_ready() {
        // No suspension point: the task completes during start, on this
        // thread, without touching any worker.
        let task = start(async { 7 });
        assert!(task.is_ready());
    }

    #[test]
    fn test_synchronous_joinable_completes_on_caller() {
        let task = start_joinable(async { 5 });
        assert!(task.is_ready());
        assert_eq!(task.join(), 5);
    }

    #[test]
    fn test_dropping_completed_task_frees_frame() {
        let task = start(async { vec![1, 2, 3] });
        assert!(task.is_ready());
        drop(task);
    }

    #[test]
    fn test_paused_frame_resumes_once() {
        let (task, handle) = paused(async { 11 });
        assert!(!task.is_ready());

        handle.resume();
        assert!(task.is_ready());
    }
}
