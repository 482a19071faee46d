// src/reactor.rs
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, TryLockError};
use std::time::{Duration, Instant};

use libc::c_int;
use tracing::{debug, info, trace, warn};

use crate::config::{ALARM_INTERVAL_SECS, IDLE_TIMEOUT_SECS, MAX_EVENTS, TriggerMode};
use crate::conn::{Shared, WriteOutcome};
use crate::error::EtudeResult;
use crate::pool::{Job, ThreadPool};
use crate::signals::SignalPipe;
use crate::sync::lock;
use crate::syscalls::{self, Readiness};
use crate::table::{ConnSlot, ConnTable};
use crate::timer::{ClientData, IdleTimers};

const WAIT_TIMEOUT_MS: i32 = 1000;

/// A readable connection handed to the pool. Stale once its slot moved on.
pub struct ConnJob {
    conn: ConnSlot,
    generation: u64,
}

impl Job for ConnJob {
    fn run(self) {
        let mut conn = lock(&self.conn);
        if conn.generation() != self.generation || !conn.is_open() {
            trace!(generation = self.generation, "dropping stale job");
            return;
        }
        conn.process();
    }
}

/// Where new connections come from.
pub enum AcceptSource {
    /// Accept straight off the listening socket.
    Listener(c_int),
    /// Wait for a token from the parent process, then race siblings for `accept`.
    ControlPipe { pipe: c_int, listener: c_int },
}

/// Who parses and answers a connection once its request bytes are in.
pub enum Dispatch {
    Pool(ThreadPool<ConnJob>),
    /// Process on the reactor thread itself.
    Inline,
}

fn evict_idle(data: &ClientData, table: &mut ConnTable) {
    let Some(slot) = table.get(data.fd) else {
        return;
    };
    let mut conn = match slot.try_lock() {
        Ok(conn) => conn,
        Err(TryLockError::Poisoned(p)) => p.into_inner(),
        // Busy in a worker; its next activity re-arms the deadline.
        Err(TryLockError::WouldBlock) => return,
    };
    if conn.generation() == data.generation && conn.is_open() {
        info!(fd = data.fd, peer = ?conn.peer(), "closing idle connection");
        conn.close();
    }
}

/// Single-threaded event loop owning the epoll set, the connection table and the
/// idle timers.
pub struct Reactor {
    shared: Arc<Shared>,
    source: AcceptSource,
    dispatch: Dispatch,
    table: ConnTable,
    timers: IdleTimers<ConnTable>,
    signals: SignalPipe,
    max_connections: usize,
    shutdown: Arc<AtomicBool>,
}

impl Reactor {
    pub fn new(
        shared: Arc<Shared>,
        source: AcceptSource,
        dispatch: Dispatch,
        max_connections: usize,
        shutdown: Arc<AtomicBool>,
    ) -> EtudeResult<Self> {
        let signals = SignalPipe::install(&[
            libc::SIGALRM,
            libc::SIGCHLD,
            libc::SIGTERM,
            libc::SIGINT,
        ])?;
        let epoll = &shared.epoll;
        match source {
            AcceptSource::Listener(fd) => epoll.add(fd, shared.trigger, false)?,
            AcceptSource::ControlPipe { pipe, .. } => {
                epoll.add(pipe, TriggerMode::Level, false)?
            }
        }
        epoll.add(signals.read_fd(), TriggerMode::Level, false)?;

        Ok(Self {
            table: ConnTable::new(Arc::clone(&shared), max_connections),
            timers: IdleTimers::new(Duration::from_secs(IDLE_TIMEOUT_SECS), evict_idle),
            shared,
            source,
            dispatch,
            signals,
            max_connections,
            shutdown,
        })
    }

    /// Run until a termination signal arrives or the shutdown flag is set.
    pub fn run(mut self) -> EtudeResult<()> {
        let mut events = syscalls::empty_events(MAX_EVENTS);
        let signal_fd = self.signals.read_fd();
        let (accept_fd, pipe_fd) = match self.source {
            AcceptSource::Listener(fd) => (fd, None),
            AcceptSource::ControlPipe { pipe, listener } => (listener, Some(pipe)),
        };
        syscalls::alarm(ALARM_INTERVAL_SECS);
        info!(
            trigger = ?self.shared.trigger,
            max_connections = self.max_connections,
            "reactor running"
        );

        let mut stop = false;
        while !stop && !self.shutdown.load(Ordering::Acquire) {
            let n = self.shared.epoll.wait(&mut events, WAIT_TIMEOUT_MS)?;
            for ev in &events[..n] {
                let ready = Readiness::from_event(ev);
                if pipe_fd == Some(ready.fd) {
                    self.drain_tokens(ready.fd);
                    self.accept_all(accept_fd);
                } else if ready.fd == accept_fd && pipe_fd.is_none() {
                    match self.shared.trigger {
                        TriggerMode::Edge => self.accept_all(accept_fd),
                        TriggerMode::Level => {
                            self.accept_one(accept_fd);
                        }
                    }
                } else if ready.fd == signal_fd {
                    stop |= self.handle_signals();
                } else if ready.hangup {
                    self.close(ready.fd);
                } else if ready.readable {
                    self.on_readable(ready.fd);
                } else if ready.writable {
                    self.on_writable(ready.fd);
                }
            }
        }

        syscalls::alarm(0);
        self.table.close_all();
        if let Dispatch::Pool(pool) = &mut self.dispatch {
            pool.shutdown();
        }
        info!(stats = ?self.shared.metrics.snapshot(), "reactor stopped");
        Ok(())
    }

    fn drain_tokens(&self, pipe: c_int) {
        let mut buf = [0u8; 64];
        while let Ok(Some(n)) = syscalls::recv_nonblocking(pipe, &mut buf) {
            if n == 0 {
                warn!(pipe, "control pipe closed by parent");
                self.shutdown.store(true, Ordering::Release);
                break;
            }
        }
    }

    fn accept_all(&mut self, listener: c_int) {
        while self.accept_one(listener) {}
    }

    /// Accept one connection. False once the backlog is empty or accept failed.
    fn accept_one(&mut self, listener: c_int) -> bool {
        let (fd, peer) = match syscalls::accept_connection(listener) {
            Ok(Some(accepted)) => accepted,
            Ok(None) => return false,
            Err(e) => {
                warn!(error = %e, "accept failed");
                return false;
            }
        };

        if self.shared.metrics.live() >= self.max_connections {
            warn!(fd, peer = ?peer, max = self.max_connections, "connection limit reached");
            self.shared.reject_busy(fd);
            return true;
        }

        let Some(slot) = self.table.slot(fd) else {
            syscalls::close_fd(fd);
            return true;
        };
        match lock(&slot).init(fd, peer) {
            Ok(generation) => self.timers.arm(ClientData { fd, generation }, Instant::now()),
            Err(e) => {
                warn!(fd, error = %e, "failed to register connection");
                syscalls::close_fd(fd);
            }
        }
        true
    }

    fn close(&mut self, fd: c_int) {
        if let Some(slot) = self.table.get(fd) {
            lock(&slot).close();
        }
        self.timers.cancel(fd);
    }

    fn on_readable(&mut self, fd: c_int) {
        let Some(slot) = self.table.get(fd) else {
            return;
        };
        let mut conn = lock(&slot);
        if !conn.is_open() {
            return;
        }
        if let Err(e) = conn.read() {
            debug!(fd, error = %e, "read ended connection");
            conn.close();
            drop(conn);
            self.timers.cancel(fd);
            return;
        }
        self.timers.reset(fd, Instant::now());

        match &self.dispatch {
            Dispatch::Inline => conn.process(),
            Dispatch::Pool(pool) => {
                let generation = conn.generation();
                drop(conn);
                let job = ConnJob {
                    conn: Arc::clone(&slot),
                    generation,
                };
                if pool.append(job).is_err() {
                    warn!(fd, queued = pool.queued(), "job queue full");
                    lock(&slot).reject_busy();
                    self.timers.cancel(fd);
                }
            }
        }
    }

    fn on_writable(&mut self, fd: c_int) {
        let Some(slot) = self.table.get(fd) else {
            return;
        };
        let mut conn = lock(&slot);
        if !conn.is_open() {
            return;
        }
        match conn.write() {
            Ok(WriteOutcome::Pending | WriteOutcome::KeepAlive) => {
                drop(conn);
                self.timers.reset(fd, Instant::now());
            }
            Ok(WriteOutcome::Close) | Err(_) => {
                conn.close();
                drop(conn);
                self.timers.cancel(fd);
            }
        }
    }

    /// Returns true when the loop should stop.
    fn handle_signals(&mut self) -> bool {
        let mut stop = false;
        for sig in self.signals.drain() {
            match sig {
                libc::SIGALRM => {
                    let evicted = self.timers.tick(Instant::now(), &mut self.table);
                    debug!(evicted, stats = ?self.shared.metrics.snapshot(), "timer tick");
                    syscalls::alarm(ALARM_INTERVAL_SECS);
                }
                libc::SIGCHLD => {
                    for pid in syscalls::reap_children() {
                        debug!(pid, "reaped child");
                    }
                }
                libc::SIGTERM | libc::SIGINT => {
                    info!(signal = sig, "termination requested");
                    stop = true;
                }
                other => trace!(signal = other, "ignoring signal"),
            }
        }
        stop
    }
}
