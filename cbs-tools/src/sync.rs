//! Synchronization primitives.

use std::sync::{Condvar, Mutex};

/// Counting semaphore built from a mutex and a condition variable.
///
/// The standard library has no semaphore; this provides the minimal
/// blocking/non-blocking pair needed to coordinate a bounded ring of
/// producers and consumers.
pub struct Semaphore {
    count: Mutex<usize>,
    cond: Condvar,
}

impl Semaphore {
    pub fn new(count: usize) -> Self {
        Self {
            count: Mutex::new(count),
            cond: Condvar::new(),
        }
    }

    /// Decrement the counter, blocking while it is zero.
    pub fn acquire(&self) {
        let mut count = self.count.lock().unwrap();
        while *count == 0 {
            count = self.cond.wait(count).unwrap();
        }
        *count -= 1;
    }

    /// Try to decrement the counter. Returns `false` if it is zero.
    pub fn try_acquire(&self) -> bool {
        let mut count = self.count.lock().unwrap();
        if *count == 0 {
            return false;
        }
        *count -= 1;
        true
    }

    /// Increment the counter and wake one waiter.
    pub fn release(&self) {
        let mut count = self.count.lock().unwrap();
        *count += 1;
        self.cond.notify_one();
    }
}
