//! OS event handles and the multi-wait primitive the multiplexer blocks on.
//!
//! An event is an `eventfd(2)` handle. Signaling writes to the counter;
//! waiting polls the descriptor for readability. Auto-reset events consume
//! the counter on a successful wait (one waiter proceeds per signal, as
//! with an auto-reset kernel event object); manual-reset events stay
//! signaled until [`EventRef::reset`] is called.

use crate::task::header::{Header, Request};
use crate::task::waker::current_task;
use anyhow::{Result, anyhow};
use smallvec::SmallVec;
use std::future::Future;
use std::io;
use std::os::fd::RawFd;
use std::pin::Pin;
use std::task::{Context, Poll};
use tracing::trace;

/// Outcome class of a [`EventRef::wait_many`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitStatus {
    Normal,
    Abandoned,
    Timeout,
    Failed,
}

/// Which event fired, and how the wait ended.
#[derive(Debug, Clone, Copy)]
pub struct WaitResult {
    pub status: WaitStatus,
    pub index: u32,
}

/// Non-owning reference to an event handle.
///
/// Plain `Copy` data; the referenced handle must outlive every copy,
/// including copies registered with the multiplexer through an await.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventRef {
    fd: RawFd,
    manual_reset: bool,
}

impl EventRef {
    /// Blocks until one of `events` is signaled and returns its index.
    ///
    /// Auto-reset events are consumed by a successful wait. A consume lost
    /// to a concurrent waiter re-enters the wait, so a `Normal` result
    /// always corresponds to a signal this caller observed.
    pub fn wait_many(events: &[EventRef]) -> WaitResult {
        loop {
            let mut fds: SmallVec<[libc::pollfd; 16]> = events
                .iter()
                .map(|event| libc::pollfd {
                    fd: event.fd,
                    events: libc::POLLIN,
                    revents: 0,
                })
                .collect();

            let ret = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, -1) };
            if ret < 0 {
                return WaitResult {
                    status: WaitStatus::Failed,
                    index: 0,
                };
            }
            if ret == 0 {
                return WaitResult {
                    status: WaitStatus::Timeout,
                    index: 0,
                };
            }

            for (index, fd) in fds.iter().enumerate() {
                if fd.revents == 0 {
                    continue;
                }

                let index = index as u32;
                if fd.revents & libc::POLLNVAL != 0 {
                    return WaitResult {
                        status: WaitStatus::Failed,
                        index,
                    };
                }
                if fd.revents & (libc::POLLERR | libc::POLLHUP) != 0 {
                    return WaitResult {
                        status: WaitStatus::Abandoned,
                        index,
                    };
                }
                if events[index as usize].try_consume() {
                    return WaitResult {
                        status: WaitStatus::Normal,
                        index,
                    };
                }

                // Another waiter consumed the signal first; wait again.
                break;
            }
        }
    }

    /// Checks whether this event is signaled, without consuming it.
    pub fn is_signaled(&self) -> bool {
        let mut fd = libc::pollfd {
            fd: self.fd,
            events: libc::POLLIN,
            revents: 0,
        };
        let ret = unsafe { libc::poll(&mut fd, 1, 0) };
        ret > 0 && fd.revents & libc::POLLIN != 0
    }

    /// Waits, potentially indefinitely, for this event to be signaled.
    pub fn wait(&self) -> bool {
        loop {
            let mut fd = libc::pollfd {
                fd: self.fd,
                events: libc::POLLIN,
                revents: 0,
            };
            let ret = unsafe { libc::poll(&mut fd, 1, -1) };
            if ret < 0 {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return false;
            }
            if fd.revents & (libc::POLLERR | libc::POLLHUP | libc::POLLNVAL) != 0 {
                return false;
            }
            if self.try_consume() {
                return true;
            }
        }
    }

    /// Marks this event as signaled.
    pub fn signal(&self) {
        let increment: u64 = 1;
        // EAGAIN means the counter is saturated, i.e. already signaled.
        unsafe {
            libc::write(
                self.fd,
                (&raw const increment).cast(),
                std::mem::size_of::<u64>(),
            );
        }
    }

    /// Marks this event as unsignaled. Needed for manual-reset events;
    /// auto-reset events are reset by the wait that observes them.
    pub fn reset(&self) {
        let mut counter: u64 = 0;
        unsafe {
            libc::read(
                self.fd,
                (&raw mut counter).cast(),
                std::mem::size_of::<u64>(),
            );
        }
    }

    /// Consumes a pending signal on auto-reset events. Returns false when a
    /// concurrent waiter took the signal first.
    fn try_consume(&self) -> bool {
        if self.manual_reset {
            return true;
        }
        let mut counter: u64 = 0;
        let ret = unsafe {
            libc::read(
                self.fd,
                (&raw mut counter).cast(),
                std::mem::size_of::<u64>(),
            )
        };
        ret == std::mem::size_of::<u64>() as isize
    }
}

/// Owning event handle. Closes the underlying descriptor on drop.
#[derive(Debug)]
pub struct Event {
    inner: EventRef,
    cpu_affinity: u64,
    priority: u32,
    label: String,
}

impl Event {
    /// Creates a new, unsignaled event.
    ///
    /// `manual_reset` selects whether a wait consumes the signal (false) or
    /// the event stays signaled until [`EventRef::reset`] (true). The label
    /// only feeds tracing output.
    pub fn new(manual_reset: bool, label: impl Into<String>) -> Result<Event> {
        let fd = unsafe { libc::eventfd(0, libc::EFD_CLOEXEC | libc::EFD_NONBLOCK) };
        if fd < 0 {
            return Err(anyhow!(
                "failed to create event handle: {}",
                io::Error::last_os_error()
            ));
        }

        let label = label.into();
        trace!(fd, manual_reset, label = %label, "event created");

        Ok(Event {
            inner: EventRef { fd, manual_reset },
            cpu_affinity: 0,
            priority: 0,
            label,
        })
    }

    /// Non-owning reference, e.g. for [`EventRef::wait_many`] arrays.
    pub fn event_ref(&self) -> EventRef {
        self.inner
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// CPU affinity applied to the *continuation* resumed after this event
    /// is signaled.
    pub fn set_cpu_affinity(&mut self, cpu_affinity: u64) {
        self.cpu_affinity = cpu_affinity;
    }

    /// Priority applied to the continuation resumed after this event is
    /// signaled.
    pub fn set_priority(&mut self, priority: u32) {
        self.priority = priority;
    }

    /// Awaitable form: ready exactly when [`EventRef::is_signaled`] holds,
    /// otherwise parks the task with the multiplexer until the signal.
    pub fn signaled(&self) -> Signaled<'_> {
        Signaled {
            event: self,
            registered: false,
        }
    }
}

impl std::ops::Deref for Event {
    type Target = EventRef;

    fn deref(&self) -> &EventRef {
        &self.inner
    }
}

impl Drop for Event {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.inner.fd);
        }
    }
}

/// Future returned by [`Event::signaled`].
pub struct Signaled<'a> {
    event: &'a Event,
    registered: bool,
}

impl Future for Signaled<'_> {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        let this = self.get_mut();
        if this.registered || this.event.is_signaled() {
            return Poll::Ready(());
        }

        // Hand our frame to the multiplexer once the enclosing poll returns.
        let me = current_task(cx.waker());
        unsafe {
            Header::set_request(
                me,
                Request::WaitEvent {
                    event: this.event.event_ref(),
                    cpu_affinity: this.event.cpu_affinity,
                    priority: this.event.priority,
                },
            );
        }
        this.registered = true;
        Poll::Pending
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use static_assertions::assert_impl_all;

    assert_impl_all!(Event: Send, Sync);
    assert_impl_all!(EventRef: Send, Sync, Copy);

    #[rstest]
    #[case::auto_reset(false)]
    #[case::manual_reset(true)]
    fn test_signal_sets_signaled(#[case] manual_reset: bool) {
        let event = Event::new(manual_reset, "test").unwrap();
        assert!(!event.is_signaled());

        event.signal();
        assert!(event.is_signaled());

        // Signaling twice keeps the event signaled, and is_signaled does
        // not consume.
        event.signal();
        assert!(event.is_signaled());
        assert!(event.is_signaled());
    }

    #[test]
    fn test_wait_returns_immediately_when_signaled() {
        let event = Event::new(false, "test").unwrap();
        event.signal();
        event.signal();
        assert!(event.wait());
    }

    #[test]
    fn test_auto_reset_wait_consumes_signal() {
        let event = Event::new(false, "test").unwrap();
        event.signal();
        assert!(event.wait());
        assert!(!event.is_signaled());
    }

    #[test]
    fn test_manual_reset_survives_wait_until_reset() {
        let event = Event::new(true, "test").unwrap();
        event.signal();
        assert!(event.wait());
        assert!(event.is_signaled());

        event.reset();
        assert!(!event.is_signaled());
    }

    #[test]
    fn test_wait_many_reports_signaled_index() {
        let first = Event::new(false, "first").unwrap();
        let second = Event::new(false, "second").unwrap();
        let events = [first.event_ref(), second.event_ref()];

        second.signal();
        let result = EventRef::wait_many(&events);
        assert_eq!(result.status, WaitStatus::Normal);
        assert_eq!(result.index, 1);
    }

    #[test]
    fn test_wait_many_prefers_lowest_ready_index() {
        let first = Event::new(true, "first").unwrap();
        let second = Event::new(true, "second").unwrap();
        let events = [first.event_ref(), second.event_ref()];

        first.signal();
        second.signal();
        let result = EventRef::wait_many(&events);
        assert_eq!(result.status, WaitStatus::Normal);
        assert_eq!(result.index, 0);
    }
}
