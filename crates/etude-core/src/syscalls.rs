// src/syscalls.rs
use crate::config::TriggerMode;
use crate::error::{EtudeError, EtudeResult};
use libc::{c_int, c_void, socklen_t};
use std::io;
use std::mem;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6, TcpListener};
use std::os::fd::FromRawFd;
use std::ptr;

pub use libc::epoll_event;

// ---- Socket Operations ----

/// Create a non-blocking listening socket with SO_REUSEADDR and a zero-timeout SO_LINGER,
/// so shutdown resets lingering peers instead of leaving them in TIME_WAIT.
pub fn create_listen_socket(addr: SocketAddr) -> EtudeResult<TcpListener> {
    let domain = match addr {
        SocketAddr::V4(_) => libc::AF_INET,
        SocketAddr::V6(_) => libc::AF_INET6,
    };

    unsafe {
        let fd = libc::socket(
            domain,
            libc::SOCK_STREAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
            0,
        );
        if fd < 0 {
            return Err(EtudeError::setup("socket"));
        }

        let one: c_int = 1;
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_REUSEADDR,
            &one as *const _ as *const c_void,
            mem::size_of_val(&one) as socklen_t,
        );

        let linger = libc::linger {
            l_onoff: 1,
            l_linger: 0,
        };
        if libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_LINGER,
            &linger as *const _ as *const c_void,
            mem::size_of_val(&linger) as socklen_t,
        ) < 0
        {
            let err = EtudeError::setup("setsockopt(SO_LINGER)");
            libc::close(fd);
            return Err(err);
        }

        if let Err(e) = bind_addr(fd, &addr) {
            libc::close(fd);
            return Err(e);
        }

        if libc::listen(fd, libc::SOMAXCONN) < 0 {
            let err = EtudeError::setup("listen");
            libc::close(fd);
            return Err(err);
        }

        Ok(TcpListener::from_raw_fd(fd))
    }
}

fn bind_addr(fd: c_int, addr: &SocketAddr) -> EtudeResult<()> {
    let res = unsafe {
        match addr {
            SocketAddr::V4(a) => {
                let sin = libc::sockaddr_in {
                    sin_family: libc::AF_INET as libc::sa_family_t,
                    sin_port: a.port().to_be(),
                    sin_addr: libc::in_addr {
                        s_addr: u32::from_ne_bytes(a.ip().octets()),
                    },
                    sin_zero: [0; 8],
                };
                libc::bind(
                    fd,
                    &sin as *const _ as *const libc::sockaddr,
                    mem::size_of_val(&sin) as socklen_t,
                )
            }
            SocketAddr::V6(a) => {
                let sin6 = libc::sockaddr_in6 {
                    sin6_family: libc::AF_INET6 as libc::sa_family_t,
                    sin6_port: a.port().to_be(),
                    sin6_flowinfo: a.flowinfo(),
                    sin6_addr: libc::in6_addr {
                        s6_addr: a.ip().octets(),
                    },
                    sin6_scope_id: a.scope_id(),
                };
                libc::bind(
                    fd,
                    &sin6 as *const _ as *const libc::sockaddr,
                    mem::size_of_val(&sin6) as socklen_t,
                )
            }
        }
    };
    if res < 0 {
        return Err(EtudeError::setup("bind"));
    }
    Ok(())
}

fn sockaddr_to_std(storage: &libc::sockaddr_storage) -> Option<SocketAddr> {
    match storage.ss_family as c_int {
        libc::AF_INET => {
            let sin = unsafe { &*(storage as *const _ as *const libc::sockaddr_in) };
            let ip = Ipv4Addr::from(u32::from_be(sin.sin_addr.s_addr));
            Some(SocketAddr::V4(SocketAddrV4::new(ip, u16::from_be(sin.sin_port))))
        }
        libc::AF_INET6 => {
            let sin6 = unsafe { &*(storage as *const _ as *const libc::sockaddr_in6) };
            let ip = Ipv6Addr::from(sin6.sin6_addr.s6_addr);
            Some(SocketAddr::V6(SocketAddrV6::new(
                ip,
                u16::from_be(sin6.sin6_port),
                sin6.sin6_flowinfo,
                sin6.sin6_scope_id,
            )))
        }
        _ => None,
    }
}

/// Accept one non-blocking connection. `Ok(None)` means the backlog is drained.
pub fn accept_connection(listen_fd: c_int) -> EtudeResult<Option<(c_int, Option<SocketAddr>)>> {
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    let mut len = mem::size_of::<libc::sockaddr_storage>() as socklen_t;
    loop {
        let fd = unsafe {
            libc::accept4(
                listen_fd,
                &mut storage as *mut _ as *mut libc::sockaddr,
                &mut len,
                libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
            )
        };

        if fd >= 0 {
            return Ok(Some((fd, sockaddr_to_std(&storage))));
        }
        let err = io::Error::last_os_error();
        match err.raw_os_error() {
            Some(libc::EINTR) => continue,
            // A peer that reset before we got to it is not our problem.
            Some(libc::ECONNABORTED) => continue,
            _ if err.kind() == io::ErrorKind::WouldBlock => return Ok(None),
            _ => return Err(err.into()),
        }
    }
}

// ---- Epoll Operations ----

/// Which direction a descriptor is currently waiting on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interest {
    Read,
    Write,
}

/// Readiness bits of one event, decoded.
#[derive(Debug, Clone, Copy)]
pub struct Readiness {
    pub fd: c_int,
    pub readable: bool,
    pub writable: bool,
    /// Peer hangup or socket error.
    pub hangup: bool,
}

impl Readiness {
    pub fn from_event(ev: &epoll_event) -> Self {
        let bits = ev.events;
        let token = ev.u64;
        Self {
            fd: token as c_int,
            readable: bits & libc::EPOLLIN as u32 != 0,
            writable: bits & libc::EPOLLOUT as u32 != 0,
            hangup: bits & (libc::EPOLLRDHUP | libc::EPOLLHUP | libc::EPOLLERR) as u32 != 0,
        }
    }
}

pub fn empty_events(n: usize) -> Vec<epoll_event> {
    vec![epoll_event { events: 0, u64: 0 }; n]
}

pub struct Epoll {
    pub fd: c_int,
}

impl Epoll {
    pub fn new() -> EtudeResult<Self> {
        let fd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if fd < 0 {
            return Err(EtudeError::setup("epoll_create1"));
        }
        Ok(Self { fd })
    }

    fn flags(interest: Interest, trigger: TriggerMode, oneshot: bool) -> u32 {
        let mut flags = libc::EPOLLRDHUP as u32;
        flags |= match interest {
            Interest::Read => libc::EPOLLIN as u32,
            Interest::Write => libc::EPOLLOUT as u32,
        };
        if trigger == TriggerMode::Edge {
            flags |= libc::EPOLLET as u32;
        }
        if oneshot {
            flags |= libc::EPOLLONESHOT as u32;
        }
        flags
    }

    fn ctl(&self, op: c_int, fd: c_int, events: u32) -> EtudeResult<()> {
        let mut event = epoll_event {
            events,
            u64: fd as u64,
        };
        if unsafe { libc::epoll_ctl(self.fd, op, fd, &mut event) } < 0 {
            return Err(io::Error::last_os_error().into());
        }
        Ok(())
    }

    /// Register `fd` for reading. The event token is the descriptor itself.
    pub fn add(&self, fd: c_int, trigger: TriggerMode, oneshot: bool) -> EtudeResult<()> {
        self.ctl(
            libc::EPOLL_CTL_ADD,
            fd,
            Self::flags(Interest::Read, trigger, oneshot),
        )
    }

    /// Re-arm a oneshot registration for exactly one direction.
    pub fn rearm(&self, fd: c_int, interest: Interest, trigger: TriggerMode) -> EtudeResult<()> {
        self.ctl(libc::EPOLL_CTL_MOD, fd, Self::flags(interest, trigger, true))
    }

    pub fn delete(&self, fd: c_int) -> EtudeResult<()> {
        unsafe {
            if libc::epoll_ctl(self.fd, libc::EPOLL_CTL_DEL, fd, ptr::null_mut()) < 0 {
                let err = io::Error::last_os_error();
                if err.raw_os_error() != Some(libc::ENOENT) {
                    return Err(err.into());
                }
            }
        }
        Ok(())
    }

    /// Returns 0 when interrupted by a signal; the caller just loops.
    pub fn wait(&self, events: &mut [epoll_event], timeout_ms: i32) -> EtudeResult<usize> {
        let res = unsafe {
            libc::epoll_wait(
                self.fd,
                events.as_mut_ptr(),
                events.len() as c_int,
                timeout_ms,
            )
        };
        if res < 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EINTR) {
                return Ok(0);
            }
            return Err(err.into());
        }
        Ok(res as usize)
    }
}

impl Drop for Epoll {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.fd);
        }
    }
}

// ---- Non-blocking I/O ----

/// `Ok(None)` is would-block, `Ok(Some(0))` is an orderly shutdown by the peer.
pub fn recv_nonblocking(fd: c_int, buf: &mut [u8]) -> EtudeResult<Option<usize>> {
    loop {
        let res = unsafe { libc::recv(fd, buf.as_mut_ptr() as *mut c_void, buf.len(), 0) };
        if res >= 0 {
            return Ok(Some(res as usize));
        }
        let err = io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::EINTR) {
            continue;
        }
        if err.kind() == io::ErrorKind::WouldBlock {
            return Ok(None);
        }
        return Err(err.into());
    }
}

/// Vectored write of up to two slices. `Ok(None)` is would-block.
pub fn writev_nonblocking(fd: c_int, bufs: &[&[u8]]) -> EtudeResult<Option<usize>> {
    let mut iovecs: [libc::iovec; 2] = unsafe { mem::zeroed() };
    let iov_count = bufs.len().min(2);
    for (iov, buf) in iovecs.iter_mut().zip(bufs) {
        *iov = libc::iovec {
            iov_base: buf.as_ptr() as *mut c_void,
            iov_len: buf.len(),
        };
    }

    loop {
        let res = unsafe { libc::writev(fd, iovecs.as_ptr(), iov_count as c_int) };
        if res >= 0 {
            return Ok(Some(res as usize));
        }
        let err = io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::EINTR) {
            continue;
        }
        if err.kind() == io::ErrorKind::WouldBlock {
            return Ok(None);
        }
        return Err(err.into());
    }
}

/// Fire-and-forget send that never blocks and never raises SIGPIPE.
pub fn send_best_effort(fd: c_int, bytes: &[u8]) -> bool {
    let res = unsafe {
        libc::send(
            fd,
            bytes.as_ptr() as *const c_void,
            bytes.len(),
            libc::MSG_DONTWAIT | libc::MSG_NOSIGNAL,
        )
    };
    res >= 0
}

pub fn close_fd(fd: c_int) {
    unsafe {
        libc::close(fd);
    }
}

// ---- Pipes and processes ----

/// A connected pair of non-blocking Unix stream sockets.
pub fn create_socketpair() -> EtudeResult<(c_int, c_int)> {
    let mut fds = [0 as c_int; 2];
    let res = unsafe {
        libc::socketpair(
            libc::AF_UNIX,
            libc::SOCK_STREAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
            0,
            fds.as_mut_ptr(),
        )
    };
    if res < 0 {
        return Err(EtudeError::setup("socketpair"));
    }
    Ok((fds[0], fds[1]))
}

pub enum Forked {
    Parent(libc::pid_t),
    Child,
}

pub fn fork() -> EtudeResult<Forked> {
    match unsafe { libc::fork() } {
        pid if pid < 0 => Err(EtudeError::setup("fork")),
        0 => Ok(Forked::Child),
        pid => Ok(Forked::Parent(pid)),
    }
}

/// Reap every exited child without blocking.
pub fn reap_children() -> Vec<libc::pid_t> {
    let mut reaped = Vec::new();
    loop {
        let mut status: c_int = 0;
        let pid = unsafe { libc::waitpid(-1, &mut status, libc::WNOHANG) };
        if pid <= 0 {
            break;
        }
        reaped.push(pid);
    }
    reaped
}

pub fn kill(pid: libc::pid_t, sig: c_int) {
    unsafe {
        libc::kill(pid, sig);
    }
}

pub fn alarm(secs: u32) {
    unsafe {
        libc::alarm(secs);
    }
}

pub fn ignore_sigpipe() {
    unsafe {
        libc::signal(libc::SIGPIPE, libc::SIG_IGN);
    }
}
