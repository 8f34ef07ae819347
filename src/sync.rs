//! Named synchronisation primitives.
//!
//! Spec §5 distinguishes three primitive classes by suspension behaviour:
//! spin locks for short critical sections that never sleep, sleep locks for
//! regions that may block a thread, and counting semaphores for shootdown
//! acknowledgement. Rather than sprinkling bare `spin::Mutex`/`std::sync::Mutex`
//! through the tree, each class gets a thin named wrapper so call sites read
//! as a statement of which discipline applies.

use std::sync::{Condvar, Mutex};

/// A short, busy-waiting critical section. Must never be held across a sleep.
pub struct SpinLock<T> {
    inner: spin::Mutex<T>,
}

impl<T> SpinLock<T> {
    pub const fn new(value: T) -> Self {
        SpinLock { inner: spin::Mutex::new(value) }
    }

    pub fn lock(&self) -> spin::MutexGuard<'_, T> {
        self.inner.lock()
    }

    pub fn try_lock(&self) -> Option<spin::MutexGuard<'_, T>> {
        self.inner.try_lock()
    }
}

/// A lock that may block the calling thread. Protects per-L2 pagetable
/// regions, per-file state, the swap bitmap, the journal write state, and
/// the active-transactions list.
#[derive(Debug)]
pub struct SleepLock<T> {
    inner: Mutex<T>,
}

impl<T> SleepLock<T> {
    pub fn new(value: T) -> Self {
        SleepLock { inner: Mutex::new(value) }
    }

    pub fn lock(&self) -> std::sync::MutexGuard<'_, T> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// A counting semaphore used to synchronise TLB-shootdown acknowledgement:
/// the initiator calls [`Semaphore::acquire`] once per expected CPU ack and
/// each acknowledging party calls [`Semaphore::release`].
pub struct Semaphore {
    count: Mutex<usize>,
    cond: Condvar,
}

impl Semaphore {
    pub fn new(initial: usize) -> Self {
        Semaphore { count: Mutex::new(initial), cond: Condvar::new() }
    }

    /// Block until the count is positive, then decrement it.
    pub fn acquire(&self) {
        let mut count = self.count.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        while *count == 0 {
            count = self.cond.wait(count).unwrap_or_else(|poisoned| poisoned.into_inner());
        }
        *count -= 1;
    }

    /// Increment the count and wake one waiter.
    pub fn release(&self) {
        let mut count = self.count.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        *count += 1;
        self.cond.notify_one();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn spin_lock_serialises_access() {
        let lock = SpinLock::new(0u32);
        *lock.lock() += 1;
        assert_eq!(*lock.lock(), 1);
    }

    #[test]
    fn sleep_lock_serialises_access() {
        let lock = Arc::new(SleepLock::new(0u32));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let lock = Arc::clone(&lock);
            handles.push(thread::spawn(move || {
                for _ in 0..1000 {
                    *lock.lock() += 1;
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(*lock.lock(), 8000);
    }

    #[test]
    fn semaphore_gates_until_released() {
        let sem = Arc::new(Semaphore::new(0));
        let waiter_sem = Arc::clone(&sem);
        let handle = thread::spawn(move || {
            waiter_sem.acquire();
        });
        thread::sleep(std::time::Duration::from_millis(20));
        sem.release();
        handle.join().unwrap();
    }

    #[test]
    fn semaphore_counts_multiple_acknowledgements() {
        let sem = Semaphore::new(0);
        sem.release();
        sem.release();
        sem.release();
        sem.acquire();
        sem.acquire();
        sem.acquire();
    }
}
