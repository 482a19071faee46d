// src/db.rs
use std::mem::ManuallyDrop;
use std::ops::{Deref, DerefMut};
use std::sync::Mutex;
use std::time::Duration;

use tracing::warn;

use crate::error::{EtudeError, EtudeResult};
use crate::sync::{Semaphore, lock};

/// How long a handler waits for a pooled connection before giving up.
pub const ACQUIRE_TIMEOUT: Duration = Duration::from_secs(5);

/// Fixed set of pre-opened connections behind a counting semaphore.
pub struct ConnectionPool<C> {
    free: Mutex<Vec<C>>,
    permits: Semaphore,
    capacity: usize,
}

impl<C> ConnectionPool<C> {
    pub fn new(connections: Vec<C>) -> EtudeResult<Self> {
        if connections.is_empty() {
            return Err(EtudeError::Database("pool needs at least one connection".into()));
        }
        let capacity = connections.len();
        Ok(Self {
            free: Mutex::new(connections),
            permits: Semaphore::new(capacity),
            capacity,
        })
    }

    /// Block until a connection is free.
    pub fn acquire(&self) -> EtudeResult<PooledConnection<'_, C>> {
        self.acquire_timeout(ACQUIRE_TIMEOUT)
    }

    pub fn acquire_timeout(&self, timeout: Duration) -> EtudeResult<PooledConnection<'_, C>> {
        if !self.permits.acquire_timeout(timeout) {
            warn!(capacity = self.capacity, "database pool exhausted");
            return Err(EtudeError::PoolExhausted);
        }
        match lock(&self.free).pop() {
            Some(conn) => Ok(PooledConnection {
                pool: self,
                conn: ManuallyDrop::new(conn),
            }),
            None => {
                self.permits.release();
                Err(EtudeError::PoolExhausted)
            }
        }
    }

    fn release(&self, conn: C) {
        lock(&self.free).push(conn);
        self.permits.release();
    }

    pub fn idle(&self) -> usize {
        lock(&self.free).len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// Returns its connection to the pool on drop.
pub struct PooledConnection<'a, C> {
    pool: &'a ConnectionPool<C>,
    conn: ManuallyDrop<C>,
}

impl<C> Deref for PooledConnection<'_, C> {
    type Target = C;

    fn deref(&self) -> &C {
        &self.conn
    }
}

impl<C> DerefMut for PooledConnection<'_, C> {
    fn deref_mut(&mut self) -> &mut C {
        &mut self.conn
    }
}

impl<C> Drop for PooledConnection<'_, C> {
    fn drop(&mut self) {
        // SAFETY: `conn` is never touched again after this.
        let conn = unsafe { ManuallyDrop::take(&mut self.conn) };
        self.pool.release(conn);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn guard_returns_connection() {
        let pool = ConnectionPool::new(vec![1u32, 2]).unwrap();
        {
            let a = pool.acquire().unwrap();
            let b = pool.acquire().unwrap();
            assert_eq!(*a + *b, 3);
            assert_eq!(pool.idle(), 0);
            assert!(matches!(
                pool.acquire_timeout(Duration::from_millis(10)),
                Err(EtudeError::PoolExhausted)
            ));
        }
        assert_eq!(pool.idle(), 2);
    }

    #[test]
    fn waiter_gets_released_connection() {
        let pool = Arc::new(ConnectionPool::new(vec![String::from("only")]).unwrap());
        let held = pool.acquire().unwrap();
        let waiter = {
            let pool = Arc::clone(&pool);
            thread::spawn(move || pool.acquire().map(|c| c.clone()).ok())
        };
        thread::sleep(Duration::from_millis(20));
        drop(held);
        assert_eq!(waiter.join().unwrap().as_deref(), Some("only"));
    }

    #[test]
    fn empty_pool_is_rejected() {
        assert!(ConnectionPool::<u8>::new(Vec::new()).is_err());
    }
}
