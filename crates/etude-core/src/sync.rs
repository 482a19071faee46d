// src/sync.rs
use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

/// Lock a mutex, recovering the guard if a panicking holder poisoned it.
pub(crate) fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Counting semaphore built from a mutex-guarded counter and a condvar.
pub struct Semaphore {
    permits: Mutex<usize>,
    cond: Condvar,
}

impl Semaphore {
    pub fn new(permits: usize) -> Self {
        Self {
            permits: Mutex::new(permits),
            cond: Condvar::new(),
        }
    }

    /// Block until a permit is available and take it.
    pub fn acquire(&self) {
        let mut permits = lock(&self.permits);
        while *permits == 0 {
            permits = self
                .cond
                .wait(permits)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
        }
        *permits -= 1;
    }

    /// Like [`acquire`](Self::acquire) but gives up after `timeout`.
    pub fn acquire_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut permits = lock(&self.permits);
        while *permits == 0 {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let (guard, _) = self
                .cond
                .wait_timeout(permits, deadline - now)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            permits = guard;
        }
        *permits -= 1;
        true
    }

    #[cfg(test)]
    pub fn try_acquire(&self) -> bool {
        let mut permits = lock(&self.permits);
        if *permits == 0 {
            return false;
        }
        *permits -= 1;
        true
    }

    pub fn release(&self) {
        self.release_many(1);
    }

    pub fn release_many(&self, n: usize) {
        let mut permits = lock(&self.permits);
        *permits += n;
        if n == 1 {
            self.cond.notify_one();
        } else {
            self.cond.notify_all();
        }
    }

    pub fn available(&self) -> usize {
        *lock(&self.permits)
    }
}
