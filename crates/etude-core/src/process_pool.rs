// src/process_pool.rs
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use libc::{c_int, pid_t};
use tracing::{debug, error, info, warn};

use crate::config::{MAX_EVENTS, MAX_PROCESSES, TriggerMode};
use crate::error::{EtudeError, EtudeResult};
use crate::signals::{self, SignalPipe};
use crate::syscalls::{self, Epoll, Forked, Readiness};

const WAIT_TIMEOUT_MS: i32 = 1000;

/// One process image may create one pool.
static POOL_CREATED: AtomicBool = AtomicBool::new(false);

/// Next live worker at or after `cursor`, wrapping around.
pub fn pick_worker(alive: &[bool], cursor: usize) -> Option<usize> {
    let n = alive.len();
    (0..n).map(|i| (cursor + i) % n).find(|&i| alive[i])
}

struct WorkerSlot {
    pid: pid_t,
    /// Parent's end of the control socket.
    pipe: c_int,
    alive: bool,
}

/// What `create` turned this process into.
pub enum PoolRole {
    Parent(ProcessPool),
    /// A forked worker: its index and its end of the control socket.
    Child { index: usize, pipe: c_int },
}

/// Pre-forked workers fed accept tokens round-robin over unix sockets.
pub struct ProcessPool {
    listener: c_int,
    workers: Vec<WorkerSlot>,
    cursor: usize,
}

impl ProcessPool {
    /// Fork `count` workers sharing `listener`. Returns in every process.
    pub fn create(listener: c_int, count: usize) -> EtudeResult<PoolRole> {
        if count == 0 || count > MAX_PROCESSES {
            return Err(EtudeError::Config(format!(
                "process count must be within 1..={}",
                MAX_PROCESSES
            )));
        }
        if POOL_CREATED.swap(true, Ordering::SeqCst) {
            return Err(EtudeError::Config("process pool already created".into()));
        }

        let mut workers: Vec<WorkerSlot> = Vec::with_capacity(count);
        for index in 0..count {
            let (parent_end, child_end) = syscalls::create_socketpair()?;
            match syscalls::fork()? {
                Forked::Child => {
                    syscalls::close_fd(parent_end);
                    for sibling in &workers {
                        syscalls::close_fd(sibling.pipe);
                    }
                    signals::forget_inherited();
                    return Ok(PoolRole::Child {
                        index,
                        pipe: child_end,
                    });
                }
                Forked::Parent(pid) => {
                    syscalls::close_fd(child_end);
                    debug!(index, pid, "worker forked");
                    workers.push(WorkerSlot {
                        pid,
                        pipe: parent_end,
                        alive: true,
                    });
                }
            }
        }
        info!(count, "process pool started");
        Ok(PoolRole::Parent(Self {
            listener,
            workers,
            cursor: 0,
        }))
    }

    pub fn live_workers(&self) -> usize {
        self.workers.iter().filter(|w| w.alive).count()
    }

    /// Hand one accept token to the next live worker.
    fn dispatch(&mut self) -> bool {
        let alive: Vec<bool> = self.workers.iter().map(|w| w.alive).collect();
        let Some(index) = pick_worker(&alive, self.cursor) else {
            return false;
        };
        self.cursor = (index + 1) % self.workers.len();
        let worker = &self.workers[index];
        if !syscalls::send_best_effort(worker.pipe, &[1]) {
            warn!(index, pid = worker.pid, "failed to signal worker");
        }
        true
    }

    fn reap(&mut self) {
        for pid in syscalls::reap_children() {
            if let Some((index, worker)) = self
                .workers
                .iter_mut()
                .enumerate()
                .find(|(_, w)| w.pid == pid && w.alive)
            {
                warn!(index, pid, "worker exited");
                worker.alive = false;
                syscalls::close_fd(worker.pipe);
            }
        }
    }

    fn terminate(&self) {
        for w in self.workers.iter().filter(|w| w.alive) {
            syscalls::kill(w.pid, libc::SIGTERM);
        }
    }

    /// Parent loop: watch the listener and wake workers in turn until every worker
    /// has exited.
    pub fn run_parent(mut self, shutdown: Arc<AtomicBool>) -> EtudeResult<()> {
        let epoll = Epoll::new()?;
        let signals = SignalPipe::install(&[libc::SIGCHLD, libc::SIGTERM, libc::SIGINT])?;
        epoll.add(self.listener, TriggerMode::Edge, false)?;
        epoll.add(signals.read_fd(), TriggerMode::Level, false)?;
        let mut events = syscalls::empty_events(MAX_EVENTS);
        let mut terminating = false;

        while self.live_workers() > 0 {
            if !terminating && shutdown.load(Ordering::Acquire) {
                info!("shutdown requested, stopping workers");
                self.terminate();
                terminating = true;
            }
            let n = epoll.wait(&mut events, WAIT_TIMEOUT_MS)?;
            for ev in &events[..n] {
                let ready = Readiness::from_event(ev);
                if ready.fd == self.listener {
                    if !terminating && !self.dispatch() {
                        error!("no live workers to accept");
                    }
                } else if ready.fd == signals.read_fd() {
                    for sig in signals.drain() {
                        match sig {
                            libc::SIGCHLD => self.reap(),
                            libc::SIGTERM | libc::SIGINT if !terminating => {
                                info!(signal = sig, "stopping workers");
                                self.terminate();
                                terminating = true;
                            }
                            _ => {}
                        }
                    }
                }
            }
            self.reap();
        }

        info!("all workers exited");
        Ok(())
    }
}

impl Drop for ProcessPool {
    fn drop(&mut self) {
        for w in self.workers.iter().filter(|w| w.alive) {
            syscalls::close_fd(w.pipe);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conn::tests::{doc_root, shared_for};
    use crate::reactor::{AcceptSource, Dispatch, Reactor};
    use std::io::{Read, Write};
    use std::net::TcpStream;
    use std::os::fd::AsRawFd;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn round_robin_skips_dead_workers() {
        let alive = [true, false, true];
        let mut cursor = 0;
        let mut picked = Vec::new();
        for _ in 0..4 {
            let i = pick_worker(&alive, cursor).unwrap();
            picked.push(i);
            cursor = (i + 1) % alive.len();
        }
        assert_eq!(picked, vec![0, 2, 0, 2]);
        assert_eq!(pick_worker(&[false, false], 1), None);
    }

    /// A worker reactor driven by tokens, without forking.
    #[test]
    fn token_wakes_worker_reactor() {
        let root = doc_root();
        let listener =
            syscalls::create_listen_socket("127.0.0.1:0".parse().unwrap()).unwrap();
        let addr = listener.local_addr().unwrap();
        let (parent_end, child_end) = syscalls::create_socketpair().unwrap();
        let shutdown = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&shutdown);
        let shared = shared_for(root.path(), TriggerMode::Edge);

        let handle = thread::spawn(move || {
            let reactor = Reactor::new(
                shared,
                AcceptSource::ControlPipe {
                    pipe: child_end,
                    listener: listener.as_raw_fd(),
                },
                Dispatch::Inline,
                16,
                flag,
            )
            .unwrap();
            reactor.run().unwrap();
            syscalls::close_fd(child_end);
            drop(listener);
        });

        let mut client = TcpStream::connect(addr).unwrap();
        client
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        thread::sleep(Duration::from_millis(50));
        assert!(syscalls::send_best_effort(parent_end, &[1]));

        client
            .write_all(b"GET /ten.txt HTTP/1.1\r\nConnection: keep-alive\r\n\r\n")
            .unwrap();
        let mut raw = Vec::new();
        let mut buf = [0u8; 512];
        while !raw.ends_with(b"0123456789") {
            let n = client.read(&mut buf).unwrap();
            assert!(n > 0);
            raw.extend_from_slice(&buf[..n]);
        }
        assert!(raw.starts_with(b"HTTP/1.1 200 OK"));

        shutdown.store(true, Ordering::Release);
        handle.join().unwrap();
        syscalls::close_fd(parent_end);
    }
}
