#![allow(unsafe_op_in_unsafe_fn)]

use crate::task::TaskControl;
use crate::task::harness::Harness;
use crate::task::header::Header;
use crate::task::raw::RawTask;
use crate::utils::Semaphore;
use std::alloc::Layout;
use std::cell::UnsafeCell;
use std::future::Future;
use std::mem;
use std::pin::Pin;
use std::ptr::NonNull;
use std::task::{Context, Poll};

/// The task frame. Contains the components of a suspended task.
///
/// It is critical for `Header` to be the first field, as the frame is
/// referenced through both `*mut TaskCell` and `*mut Header`.
///
/// Any changes to the layout of this struct _must_ also be reflected in the
/// offset computations below.
#[repr(C)]
pub(super) struct TaskCell<F: Future> {
    /// Hot frame state data.
    pub(super) header: Header,

    /// Either the future or its output, depending on the execution stage.
    pub(super) core: Core<F>,

    /// Cold data.
    pub(super) trailer: Trailer,
}

impl<F: Future> TaskCell<F> {
    /// Allocates and initializes a frame through the given task control.
    ///
    /// Allocation failure is surfaced at this site via the global
    /// allocation-error path.
    pub(super) fn allocate<C: TaskControl>(future: F, joinable: bool) -> NonNull<TaskCell<F>> {
        let layout = Layout::new::<TaskCell<F>>();
        let Some(ptr) = NonNull::new(C::alloc(layout)) else {
            std::alloc::handle_alloc_error(layout);
        };

        let ptr = ptr.cast::<TaskCell<F>>();
        let vtable = vtable::<F, C>();
        unsafe {
            ptr.as_ptr().write(TaskCell {
                header: Header::new(vtable, joinable),
                core: Core {
                    stage: UnsafeCell::new(Stage::Running(future)),
                },
                trailer: Trailer {
                    join_sem: joinable.then(|| Semaphore::new(0)),
                },
            });
        }

        #[cfg(debug_assertions)]
        {
            // Using a separate function for this code avoids instantiating
            // it separately for every `F`.
            unsafe fn check(header: &Header, trailer: &Trailer) {
                let trailer_addr = trailer as *const Trailer as usize;
                let trailer_ptr = unsafe { Header::get_trailer(NonNull::from(header)) };
                assert_eq!(trailer_addr, trailer_ptr.as_ptr() as usize);
            }

            unsafe {
                let cell = ptr.as_ref();
                check(&cell.header, &cell.trailer);
            }
        }

        ptr
    }
}

/// The core of the frame. Holds the future or its output, depending on the
/// stage of execution.
pub(super) struct Core<F: Future> {
    stage: UnsafeCell<Stage<F>>,
}

/// Either the future or the output.
pub(super) enum Stage<F: Future> {
    Running(F),
    Finished(F::Output),
    Consumed,
}

impl<F: Future> Core<F> {
    /// Polls the future.
    ///
    /// # Safety
    ///
    /// The caller must hold the frame's RUNNING claim, which guarantees
    /// mutual exclusion over the stage field. The frame lives on the heap,
    /// so the future is pinned.
    pub(super) fn poll(&self, cx: &mut Context<'_>) -> Poll<F::Output> {
        let res = {
            let ptr = self.stage.get();
            let future = match unsafe { &mut *ptr } {
                Stage::Running(future) => future,
                _ => unreachable!("unexpected stage"),
            };

            let future = unsafe { Pin::new_unchecked(future) };
            future.poll(cx)
        };

        if res.is_ready() {
            // Drop the future eagerly; the output is stored separately.
            unsafe { *self.stage.get() = Stage::Consumed };
        }

        res
    }

    /// Stores the task output.
    ///
    /// # Safety: same mutual-exclusion requirement as `poll`.
    pub(super) fn store_output(&self, output: F::Output) {
        unsafe { *self.stage.get() = Stage::Finished(output) };
    }

    /// Takes the task output.
    ///
    /// Only called after completion was observed through the state word or
    /// the join semaphore, which also orders the stage write.
    pub(super) fn take_output(&self) -> F::Output {
        let ptr = self.stage.get();
        match mem::replace(unsafe { &mut *ptr }, Stage::Consumed) {
            Stage::Finished(output) => output,
            _ => panic!("task output consumed twice"),
        }
    }
}

/// Cold data is stored after the future. Only joinable frames carry a
/// semaphore; it is released exactly once, at final exit.
pub(crate) struct Trailer {
    pub(super) join_sem: Option<Semaphore>,
}

pub(crate) struct Vtable {
    /// Polls the frame once and executes the resulting suspension request.
    /// Returns the continuation handed off at final exit, if any.
    pub(super) poll: unsafe fn(NonNull<Header>) -> Option<RawTask>,

    /// Moves the output into `dst`, a `*mut Option<F::Output>`.
    pub(super) read_output: unsafe fn(NonNull<Header>, *mut ()),

    /// Drops the frame contents and releases its memory.
    pub(super) dealloc: unsafe fn(NonNull<Header>),

    /// The number of bytes the `trailer` field is offset from the header.
    pub(super) trailer_offset: usize,
}

/// Gets the vtable for the requested `F` and `C` instantiation.
pub(super) fn vtable<F: Future, C: TaskControl>() -> &'static Vtable {
    &Vtable {
        poll: poll::<F>,
        read_output: read_output::<F>,
        dealloc: dealloc::<F, C>,
        trailer_offset: OffsetHelper::<F>::TRAILER_OFFSET,
    }
}

/// Calling the offset computation directly in `vtable` prevents the vtable
/// from being promoted to a static reference, hence this helper type.
struct OffsetHelper<F>(F);

impl<F: Future> OffsetHelper<F> {
    const TRAILER_OFFSET: usize = get_trailer_offset(
        mem::size_of::<Header>(),
        mem::size_of::<Core<F>>(),
        mem::align_of::<Core<F>>(),
        mem::align_of::<Trailer>(),
    );
}

/// Computes the offset of the `Trailer` field in `TaskCell<F>` using the
/// `#[repr(C)]` layout algorithm.
const fn get_trailer_offset(
    header_size: usize,
    core_size: usize,
    core_align: usize,
    trailer_align: usize,
) -> usize {
    let mut offset = header_size;

    let core_misalign = offset % core_align;
    if core_misalign > 0 {
        offset += core_align - core_misalign;
    }
    offset += core_size;

    let trailer_misalign = offset % trailer_align;
    if trailer_misalign > 0 {
        offset += trailer_align - trailer_misalign;
    }

    offset
}

unsafe fn poll<F: Future>(ptr: NonNull<Header>) -> Option<RawTask> {
    let harness = Harness::<F>::from_raw(ptr);
    harness.poll()
}

unsafe fn read_output<F: Future>(ptr: NonNull<Header>, dst: *mut ()) {
    let harness = Harness::<F>::from_raw(ptr);
    let dst = &mut *(dst as *mut Option<F::Output>);
    *dst = Some(harness.take_output());
}

unsafe fn dealloc<F: Future, C: TaskControl>(ptr: NonNull<Header>) {
    let cell = ptr.cast::<TaskCell<F>>();
    let layout = Layout::new::<TaskCell<F>>();
    std::ptr::drop_in_place(cell.as_ptr());
    C::free(cell.as_ptr().cast(), layout);
}
