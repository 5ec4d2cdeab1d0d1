use parking_lot::{Condvar, Mutex};

/// Counting semaphore.
///
/// The standard library has no stable semaphore and the runtime only ever
/// acquires or releases a single permit at a time, so this stays minimal: a
/// permit counter under a mutex plus a condvar to park consumers. The
/// mutex/condvar pair also provides the release→acquire happens-before edge
/// the join path relies on.
pub(crate) struct Semaphore {
    permits: Mutex<usize>,
    cond: Condvar,
}

impl Semaphore {
    pub(crate) fn new(permits: usize) -> Semaphore {
        Semaphore {
            permits: Mutex::new(permits),
            cond: Condvar::new(),
        }
    }

    /// Adds one permit and wakes a single parked consumer, if any.
    pub(crate) fn release(&self) {
        let mut permits = self.permits.lock();
        *permits += 1;
        drop(permits);
        self.cond.notify_one();
    }

    /// Blocks until a permit is available, then consumes it.
    pub(crate) fn acquire(&self) {
        let mut permits = self.permits.lock();
        while *permits == 0 {
            self.cond.wait(&mut permits);
        }
        *permits -= 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use static_assertions::assert_impl_all;
    use std::sync::Arc;
    use std::thread;

    assert_impl_all!(Semaphore: Send, Sync);

    #[test]
    fn test_release_then_acquire() {
        let sem = Semaphore::new(0);
        sem.release();
        sem.acquire();
    }

    #[test]
    fn test_initial_permits() {
        let sem = Semaphore::new(2);
        sem.acquire();
        sem.acquire();
    }

    #[test]
    fn test_acquire_blocks_until_release() {
        let sem = Arc::new(Semaphore::new(0));
        let waiter = thread::spawn({
            let sem = sem.clone();
            move || sem.acquire()
        });

        // The waiter parks until the permit arrives.
        thread::sleep(std::time::Duration::from_millis(10));
        sem.release();
        waiter.join().unwrap();
    }
}
