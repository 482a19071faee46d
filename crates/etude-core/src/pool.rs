// src/pool.rs
use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};

use tracing::{debug, error, info, warn};

use crate::error::{EtudeError, EtudeResult};
use crate::sync::{Semaphore, lock};

/// A unit of work handed from the reactor to a pool thread.
pub trait Job: Send + 'static {
    fn run(self);
}

struct Inner<J> {
    queue: Mutex<VecDeque<J>>,
    available: Semaphore,
    stop: AtomicBool,
    max_jobs: usize,
}

/// Fixed set of worker threads draining a bounded FIFO.
pub struct ThreadPool<J: Job> {
    inner: Arc<Inner<J>>,
    workers: Vec<JoinHandle<()>>,
}

impl<J: Job> ThreadPool<J> {
    pub fn new(threads: usize, max_jobs: usize, pin: bool) -> EtudeResult<Self> {
        if threads == 0 || max_jobs == 0 {
            return Err(EtudeError::Config(
                "thread pool needs at least one thread and one queue slot".into(),
            ));
        }

        let inner = Arc::new(Inner {
            queue: Mutex::new(VecDeque::with_capacity(max_jobs.min(1024))),
            available: Semaphore::new(0),
            stop: AtomicBool::new(false),
            max_jobs,
        });

        let core_ids = if pin {
            core_affinity::get_core_ids().unwrap_or_default()
        } else {
            Vec::new()
        };

        let mut workers = Vec::with_capacity(threads);
        for i in 0..threads {
            let core_id = if core_ids.is_empty() {
                None
            } else {
                core_ids.get(i % core_ids.len()).copied()
            };
            let inner = Arc::clone(&inner);
            let handle = thread::Builder::new()
                .name(format!("etude-worker-{}", i))
                .spawn(move || {
                    if let Some(id) = core_id {
                        if core_affinity::set_for_current(id) {
                            debug!(worker = i, core = id.id, "worker pinned");
                        } else {
                            warn!(worker = i, core = id.id, "failed to pin worker");
                        }
                    }
                    worker_loop(i, &inner);
                })?;
            workers.push(handle);
        }
        info!(threads, max_jobs, "thread pool started");

        Ok(Self { inner, workers })
    }

    /// Queue a job without blocking. A full queue hands the job back.
    pub fn append(&self, job: J) -> Result<(), J> {
        {
            let mut queue = lock(&self.inner.queue);
            if queue.len() >= self.inner.max_jobs {
                return Err(job);
            }
            queue.push_back(job);
        }
        self.inner.available.release();
        Ok(())
    }

    pub fn queued(&self) -> usize {
        lock(&self.inner.queue).len()
    }

    /// Ask workers to stop after their current job, then join them.
    pub fn shutdown(&mut self) {
        if self.workers.is_empty() {
            return;
        }
        self.inner.stop.store(true, Ordering::Release);
        self.inner.available.release_many(self.workers.len());
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
        let dropped = lock(&self.inner.queue).drain(..).count();
        if dropped > 0 {
            debug!(dropped, "discarded queued jobs at shutdown");
        }
    }
}

impl<J: Job> Drop for ThreadPool<J> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop<J: Job>(id: usize, inner: &Inner<J>) {
    loop {
        inner.available.acquire();
        if inner.stop.load(Ordering::Acquire) {
            break;
        }
        let Some(job) = lock(&inner.queue).pop_front() else {
            continue;
        };
        if panic::catch_unwind(AssertUnwindSafe(|| job.run())).is_err() {
            error!(worker = id, "job panicked");
        }
    }
    debug!(worker = id, "worker exiting");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::mpsc;
    use std::time::Duration;

    struct Count(Arc<AtomicUsize>, mpsc::Sender<()>);

    impl Job for Count {
        fn run(self) {
            self.0.fetch_add(1, Ordering::SeqCst);
            let _ = self.1.send(());
        }
    }

    struct Block(Arc<(Mutex<bool>, std::sync::Condvar)>);

    impl Job for Block {
        fn run(self) {
            let (released, cond) = &*self.0;
            let mut released = lock(released);
            while !*released {
                released = cond.wait(released).unwrap();
            }
        }
    }

    enum Either {
        Count(Count),
        Block(Block),
        Panic,
    }

    impl Job for Either {
        fn run(self) {
            match self {
                Either::Count(c) => c.run(),
                Either::Block(b) => b.run(),
                Either::Panic => panic!("boom"),
            }
        }
    }

    #[test]
    fn runs_every_appended_job() {
        let pool = ThreadPool::new(4, 100, false).unwrap();
        let counter = Arc::new(AtomicUsize::new(0));
        let (tx, rx) = mpsc::channel();
        for _ in 0..50 {
            assert!(pool.append(Count(Arc::clone(&counter), tx.clone())).is_ok());
        }
        for _ in 0..50 {
            rx.recv_timeout(Duration::from_secs(5)).unwrap();
        }
        assert_eq!(counter.load(Ordering::SeqCst), 50);
    }

    #[test]
    fn rejects_when_queue_is_full() {
        let gate = Arc::new((Mutex::new(false), std::sync::Condvar::new()));
        let mut pool = ThreadPool::new(1, 1, false).unwrap();

        // Occupy the only worker, then fill the single queue slot.
        pool.append(Either::Block(Block(Arc::clone(&gate)))).ok().unwrap();
        while pool.queued() > 0 {
            thread::sleep(Duration::from_millis(1));
        }
        let counter = Arc::new(AtomicUsize::new(0));
        let (tx, rx) = mpsc::channel();
        assert!(pool.append(Either::Count(Count(Arc::clone(&counter), tx.clone()))).is_ok());
        assert!(pool.append(Either::Count(Count(Arc::clone(&counter), tx))).is_err());

        *lock(&gate.0) = true;
        gate.1.notify_all();
        rx.recv_timeout(Duration::from_secs(5)).unwrap();
        pool.shutdown();
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn survives_panicking_job() {
        let pool = ThreadPool::new(1, 10, false).unwrap();
        let counter = Arc::new(AtomicUsize::new(0));
        let (tx, rx) = mpsc::channel();
        assert!(pool.append(Either::Panic).is_ok());
        assert!(pool.append(Either::Count(Count(Arc::clone(&counter), tx))).is_ok());
        rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn zero_threads_is_a_config_error() {
        assert!(matches!(
            ThreadPool::<Either>::new(0, 10, false),
            Err(EtudeError::Config(_))
        ));
    }
}
