// src/signals.rs
use std::mem;
use std::sync::atomic::{AtomicI32, Ordering};

use libc::{c_int, c_void};
use tracing::debug;

use crate::error::{EtudeError, EtudeResult};
use crate::syscalls;

const MAX_RELAYS: usize = 8;

/// Write ends of every live relay. The handler fans each signal out to all of them.
static RELAYS: [AtomicI32; MAX_RELAYS] = [const { AtomicI32::new(-1) }; MAX_RELAYS];

extern "C" fn relay(sig: c_int) {
    // Async-signal-safe only: non-blocking sends, errno preserved.
    unsafe {
        let errno = libc::__errno_location();
        let saved = *errno;
        let byte = sig as u8;
        for slot in &RELAYS {
            let fd = slot.load(Ordering::Relaxed);
            if fd >= 0 {
                libc::send(
                    fd,
                    &byte as *const u8 as *const c_void,
                    1,
                    libc::MSG_DONTWAIT | libc::MSG_NOSIGNAL,
                );
            }
        }
        *errno = saved;
    }
}

/// Turns signals into bytes on a socket the reactor can poll.
///
/// Handlers stay installed after the pipe is dropped; with no relay registered
/// they do nothing, so a late `SIGALRM` can never fall back to the default action.
pub struct SignalPipe {
    read_fd: c_int,
    write_fd: c_int,
    slot: usize,
}

impl SignalPipe {
    /// Create the pipe and route `signals` into it (with `SA_RESTART`).
    pub fn install(signals: &[c_int]) -> EtudeResult<Self> {
        let (read_fd, write_fd) = syscalls::create_socketpair()?;
        let Some(slot) = RELAYS.iter().position(|s| {
            s.compare_exchange(-1, write_fd, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
        }) else {
            syscalls::close_fd(read_fd);
            syscalls::close_fd(write_fd);
            return Err(EtudeError::Config("too many signal relays".into()));
        };
        let pipe = Self {
            read_fd,
            write_fd,
            slot,
        };

        for &sig in signals {
            unsafe {
                let mut action: libc::sigaction = mem::zeroed();
                action.sa_sigaction = relay as extern "C" fn(c_int) as usize;
                action.sa_flags = libc::SA_RESTART;
                libc::sigfillset(&mut action.sa_mask);
                if libc::sigaction(sig, &action, std::ptr::null_mut()) < 0 {
                    return Err(EtudeError::setup("sigaction"));
                }
            }
        }
        debug!(read_fd, ?signals, "signal relay installed");
        Ok(pipe)
    }

    pub fn read_fd(&self) -> c_int {
        self.read_fd
    }

    /// Every signal queued since the last drain, in arrival order.
    pub fn drain(&self) -> Vec<c_int> {
        let mut out = Vec::new();
        let mut buf = [0u8; 64];
        while let Ok(Some(n)) = syscalls::recv_nonblocking(self.read_fd, &mut buf) {
            if n == 0 {
                break;
            }
            out.extend(buf[..n].iter().map(|b| *b as c_int));
        }
        out
    }
}

impl Drop for SignalPipe {
    fn drop(&mut self) {
        let _ = RELAYS[self.slot].compare_exchange(
            self.write_fd,
            -1,
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
        syscalls::close_fd(self.read_fd);
        syscalls::close_fd(self.write_fd);
    }
}

/// Drop relays inherited across `fork`; they belong to the parent's reactor.
pub fn forget_inherited() {
    for slot in &RELAYS {
        let fd = slot.swap(-1, Ordering::SeqCst);
        if fd >= 0 {
            syscalls::close_fd(fd);
        }
    }
}
