use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering::{AcqRel, Acquire, Relaxed};

const RUNNING: usize = 0b0001;
const NOTIFIED: usize = 0b0010;
const COMPLETE: usize = 0b0100;

const REF_ONE: usize = 0b1000;
const REF_MASK: usize = !(RUNNING | NOTIFIED | COMPLETE);

/// Frame lifecycle word: a reference count in the upper bits, three flag
/// bits below.
///
/// - RUNNING serializes resumption: at most one thread polls the frame at a
///   time. A resume that loses the claim is simply dropped; the winner is
///   responsible for observing NOTIFIED on its way out.
/// - NOTIFIED marks a pending wake from a cloned waker, either queued or
///   about to be. It coalesces wakes that land while the frame is running.
/// - COMPLETE is published after the output is stored; readers pair their
///   acquire load with the releasing transition.
///
/// A frame starts with two references: the user-facing task handle and the
/// execution side (the suspended handle travelling through queues and
/// continuation slots). Cloned wakers add more. The frame is freed by
/// whoever drops the last reference.
pub(super) struct State {
    val: AtomicUsize,
}

#[derive(Debug, PartialEq, Eq)]
pub(super) enum TransitionToIdle {
    Ok,
    Notified,
}

#[derive(Debug, PartialEq, Eq)]
pub(super) enum TransitionToNotified {
    /// The caller must enqueue the frame's handle.
    Submit,
    DoNothing,
}

impl State {
    pub(super) fn new() -> State {
        State {
            val: AtomicUsize::new(2 * REF_ONE),
        }
    }

    pub(super) fn ref_inc(&self) {
        self.val.fetch_add(REF_ONE, Relaxed);
    }

    /// True when the caller dropped the last reference and must free the
    /// frame.
    pub(super) fn ref_dec(&self) -> bool {
        let prev = self.val.fetch_sub(REF_ONE, AcqRel);
        prev & REF_MASK == REF_ONE
    }

    pub(super) fn is_complete(&self) -> bool {
        self.val.load(Acquire) & COMPLETE != 0
    }

    /// Claims the frame for polling. Fails when another thread already runs
    /// it, in which case the caller must drop its resume.
    pub(super) fn transition_to_running(&self) -> bool {
        self.val
            .fetch_update(AcqRel, Acquire, |cur| {
                if cur & RUNNING != 0 {
                    None
                } else {
                    Some((cur | RUNNING) & !NOTIFIED)
                }
            })
            .is_ok()
    }

    /// Releases the RUNNING claim after a pending poll. Reports whether a
    /// wake landed while the frame was running.
    pub(super) fn transition_to_idle(&self) -> TransitionToIdle {
        let prev = self
            .val
            .fetch_update(AcqRel, Acquire, |cur| Some(cur & !(RUNNING | NOTIFIED)))
            .expect("state update cannot fail");

        if prev & NOTIFIED != 0 {
            TransitionToIdle::Notified
        } else {
            TransitionToIdle::Ok
        }
    }

    /// Publishes completion. The output store must precede this call.
    pub(super) fn transition_to_complete(&self) {
        self.val
            .fetch_update(AcqRel, Acquire, |cur| {
                Some((cur | COMPLETE) & !(RUNNING | NOTIFIED))
            })
            .expect("state update cannot fail");
    }

    /// Records a wake arriving from a cloned waker.
    pub(super) fn transition_to_notified(&self) -> TransitionToNotified {
        let prev = self.val.fetch_update(AcqRel, Acquire, |cur| {
            if cur & (COMPLETE | NOTIFIED) != 0 {
                None
            } else {
                Some(cur | NOTIFIED)
            }
        });

        match prev {
            Ok(prev) if prev & RUNNING == 0 => TransitionToNotified::Submit,
            _ => TransitionToNotified::DoNothing,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_state_holds_two_refs() {
        let state = State::new();
        assert!(!state.ref_dec());
        assert!(state.ref_dec());
    }

    #[test]
    fn test_running_claim_is_exclusive() {
        let state = State::new();
        assert!(state.transition_to_running());
        assert!(!state.transition_to_running());

        assert_eq!(state.transition_to_idle(), TransitionToIdle::Ok);
        assert!(state.transition_to_running());
    }

    #[test]
    fn test_wake_while_running_is_deferred() {
        let state = State::new();
        assert!(state.transition_to_running());

        assert_eq!(
            state.transition_to_notified(),
            TransitionToNotified::DoNothing
        );
        assert_eq!(state.transition_to_idle(), TransitionToIdle::Notified);
    }

    #[test]
    fn test_wake_while_idle_submits_once() {
        let state = State::new();
        assert_eq!(state.transition_to_notified(), TransitionToNotified::Submit);
        // Coalesced until the next running transition clears the bit.
        assert_eq!(
            state.transition_to_notified(),
            TransitionToNotified::DoNothing
        );
    }

    #[test]
    fn test_wake_after_complete_is_ignored() {
        let state = State::new();
        assert!(state.transition_to_running());
        state.transition_to_complete();

        assert!(state.is_complete());
        assert_eq!(
            state.transition_to_notified(),
            TransitionToNotified::DoNothing
        );
    }
}
