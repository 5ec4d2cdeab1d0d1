//! A small cooperative-multitasking runtime for multithreaded hosts.
//!
//! Tasks are ordinary futures wrapped in a heap-allocated frame and driven
//! eagerly: calling [`start`] runs the task on the current thread up to its
//! first suspension point. At a suspension point the task hands its resume
//! handle to a scheduler, which places it on one of the per-CPU work queues
//! (one pinned worker thread per logical CPU), honoring a 64-bit CPU
//! affinity mask and two priority levels. Awaiting an OS [`event::Event`]
//! routes the handle through a dedicated multiplexer thread instead.
//!
//! ```no_run
//! let out = pinwheel::start_joinable(async {
//!     // Hop off the calling thread onto a worker.
//!     pinwheel::suspend().await;
//!     21 * 2
//! })
//! .join();
//! assert_eq!(out, 42);
//! ```

pub mod event;
pub use event::{Event, EventRef, WaitResult, WaitStatus};

pub mod runtime;
pub use runtime::{Schedule, Scheduler};

pub mod task;
pub use task::{
    DefaultTaskControl, Handle, Suspend, Task, TaskControl, start, start_in, start_in_joinable,
    start_joinable, suspend, suspend_on, suspend_to,
};

pub(crate) mod utils;
