//! A counting semaphore built on `parking_lot::{Mutex, Condvar}`, used for
//! the cache's `hard_limit` and `blocks_pending` counters. Locking
//! throughout this crate already leans on `parking_lot`; no dependency
//! offers a synchronous (non-async) counting semaphore, so this is
//! hand-rolled in the same primitive the rest of the crate uses for locks.

use std::time::Duration;

use parking_lot::{Condvar, Mutex};

pub struct CountingSemaphore {
    count: Mutex<usize>,
    cond: Condvar,
}

impl CountingSemaphore {
    #[must_use]
    pub fn new(initial: usize) -> Self {
        Self { count: Mutex::new(initial), cond: Condvar::new() }
    }

    /// Blocks until a permit is available, then takes it.
    pub fn acquire(&self) {
        let mut count = self.count.lock();
        while *count == 0 {
            self.cond.wait(&mut count);
        }
        *count -= 1;
    }

    /// Like [`acquire`](Self::acquire) but gives up after `timeout`,
    /// returning `false` if no permit became available.
    pub fn acquire_timeout(&self, timeout: Duration) -> bool {
        let mut count = self.count.lock();
        if *count == 0 {
            let result = self.cond.wait_for(&mut count, timeout);
            if result.timed_out() && *count == 0 {
                return false;
            }
        }
        if *count == 0 {
            return false;
        }
        *count -= 1;
        true
    }

    /// Returns a permit, waking one waiter.
    pub fn release(&self) {
        let mut count = self.count.lock();
        *count += 1;
        self.cond.notify_one();
    }

    #[must_use]
    pub fn available(&self) -> usize {
        *self.count.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn acquire_blocks_until_release() {
        let sem = Arc::new(CountingSemaphore::new(0));
        let sem2 = Arc::clone(&sem);
        let handle = thread::spawn(move || {
            sem2.acquire();
            "acquired"
        });
        thread::sleep(Duration::from_millis(20));
        sem.release();
        assert_eq!(handle.join().unwrap(), "acquired");
    }

    #[test]
    fn acquire_timeout_fails_without_a_permit() {
        let sem = CountingSemaphore::new(0);
        assert!(!sem.acquire_timeout(Duration::from_millis(10)));
    }

    #[test]
    fn permits_round_trip() {
        let sem = CountingSemaphore::new(2);
        sem.acquire();
        sem.acquire();
        assert_eq!(sem.available(), 0);
        sem.release();
        assert_eq!(sem.available(), 1);
    }
}
