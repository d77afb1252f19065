// src/sync.rs
//! Blocking primitives shared by the worker pool and the store pool.
//!
//! Mutex and condition variable are `parking_lot`'s; the counting semaphore
//! is built from the two.

use std::time::Duration;

pub use parking_lot::{Condvar, Mutex, MutexGuard};

/// Counting semaphore. Created with a count of 1 it behaves as a binary one.
pub struct Semaphore {
    count: Mutex<usize>,
    cond: Condvar,
}

impl Semaphore {
    pub fn new(initial: usize) -> Self {
        Self {
            count: Mutex::new(initial),
            cond: Condvar::new(),
        }
    }

    /// Block until the count is positive, then decrement it.
    pub fn wait(&self) {
        let mut count = self.count.lock();
        while *count == 0 {
            self.cond.wait(&mut count);
        }
        *count -= 1;
    }

    /// Decrement without blocking. Returns false if the count was zero.
    pub fn try_wait(&self) -> bool {
        let mut count = self.count.lock();
        if *count == 0 {
            return false;
        }
        *count -= 1;
        true
    }

    /// Like [`wait`](Self::wait) but gives up after `timeout`.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let mut count = self.count.lock();
        while *count == 0 {
            if self.cond.wait_for(&mut count, timeout).timed_out() {
                if *count == 0 {
                    return false;
                }
                break;
            }
        }
        *count -= 1;
        true
    }

    /// Increment the count and wake one waiter.
    pub fn post(&self) {
        let mut count = self.count.lock();
        *count += 1;
        self.cond.notify_one();
    }

    pub fn available(&self) -> usize {
        *self.count.lock()
    }
}

impl Default for Semaphore {
    fn default() -> Self {
        Self::new(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn try_wait_follows_count() {
        let sem = Semaphore::new(2);
        assert!(sem.try_wait());
        assert!(sem.try_wait());
        assert!(!sem.try_wait());
        sem.post();
        assert_eq!(sem.available(), 1);
    }

    #[test]
    fn wait_blocks_until_post() {
        let sem = Arc::new(Semaphore::new(0));
        let waiter = {
            let sem = Arc::clone(&sem);
            thread::spawn(move || {
                sem.wait();
                true
            })
        };
        thread::sleep(Duration::from_millis(20));
        sem.post();
        assert!(waiter.join().unwrap());
        assert_eq!(sem.available(), 0);
    }

    #[test]
    fn wait_timeout_expires_on_empty() {
        let sem = Semaphore::new(0);
        assert!(!sem.wait_timeout(Duration::from_millis(10)));
        sem.post();
        assert!(sem.wait_timeout(Duration::from_millis(10)));
    }
}
