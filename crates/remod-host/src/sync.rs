//! Synchronization primitives the container protocol is built on.
//!
//! std has no counting semaphore; this one is a `Condvar` over a count.
//! The direct-call protocol needs exactly the classic post/wait pair, no
//! timeouts, no fairness requirements.

use parking_lot::{Condvar, Mutex};

/// Counting semaphore.
pub struct Semaphore {
    count: Mutex<usize>,
    available: Condvar,
}

impl Semaphore {
    pub fn new(count: usize) -> Self {
        Self {
            count: Mutex::new(count),
            available: Condvar::new(),
        }
    }

    /// Increment the count, waking one waiter.
    pub fn post(&self) {
        let mut count = self.count.lock();
        *count += 1;
        drop(count);
        self.available.notify_one();
    }

    /// Block until the count is nonzero, then decrement it.
    pub fn wait(&self) {
        let mut count = self.count.lock();
        while *count == 0 {
            self.available.wait(&mut count);
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
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn initial_count_is_consumable() {
        let sem = Semaphore::new(2);
        assert!(sem.try_wait());
        assert!(sem.try_wait());
        assert!(!sem.try_wait());
    }

    #[test]
    fn post_wakes_waiter() {
        let sem = Arc::new(Semaphore::new(0));
        let sem2 = Arc::clone(&sem);
        let waiter = std::thread::spawn(move || {
            sem2.wait();
        });
        std::thread::sleep(Duration::from_millis(20));
        sem.post();
        waiter.join().unwrap();
    }

    #[test]
    fn counts_accumulate() {
        let sem = Semaphore::new(0);
        sem.post();
        sem.post();
        sem.wait();
        sem.wait();
        assert!(!sem.try_wait());
    }
}
