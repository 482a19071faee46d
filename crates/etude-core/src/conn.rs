// src/conn.rs
use std::net::SocketAddr;
use std::sync::Arc;

use libc::c_int;
use tracing::{debug, trace, warn};

use crate::buffer::{ReadBuf, WriteBuf};
use crate::config::TriggerMode;
use crate::error::{EtudeError, EtudeResult};
use crate::http::{Method, Status, resolve_range};
use crate::metrics::ServerMetrics;
use crate::parser::{ParseOutcome, RequestParser};
use crate::resource::{DEFAULT_PAGE, Lookup, Resource, StaticResources};
use crate::routes::{RouteOutcome, Services, match_route};
use crate::syscalls::{self, Epoll, Interest};
use crate::urlcode;

/// Sent verbatim when the server cannot take another connection or job.
pub const BUSY_MESSAGE: &[u8] = b"Internal server busy";

/// State every connection of one reactor shares.
pub struct Shared {
    pub epoll: Epoll,
    pub trigger: TriggerMode,
    pub metrics: Arc<ServerMetrics>,
    pub resources: Arc<StaticResources>,
    pub services: Arc<Services>,
}

impl Shared {
    pub fn new(
        trigger: TriggerMode,
        metrics: Arc<ServerMetrics>,
        resources: Arc<StaticResources>,
        services: Arc<Services>,
    ) -> EtudeResult<Arc<Self>> {
        Ok(Arc::new(Self {
            epoll: Epoll::new()?,
            trigger,
            metrics,
            resources,
            services,
        }))
    }

    /// Tell a connection we cannot serve it, then drop it. Never blocks.
    pub fn reject_busy(&self, fd: c_int) {
        syscalls::send_best_effort(fd, BUSY_MESSAGE);
        syscalls::close_fd(fd);
        self.metrics.inc_rejected();
    }
}

enum Body {
    None,
    Static(&'static [u8]),
    Owned(Vec<u8>),
    File {
        res: Arc<Resource>,
        start: usize,
        len: usize,
    },
}

/// Result of a completed `write` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    /// The socket is full; the connection is armed for writability again.
    Pending,
    /// Response done, connection re-armed for the next request.
    KeepAlive,
    /// Response done, the caller should close.
    Close,
}

/// One client socket: its buffers, parser, and the response being sent.
pub struct Conn {
    fd: c_int,
    peer: Option<SocketAddr>,
    generation: u64,
    shared: Arc<Shared>,
    read_buf: ReadBuf,
    write_buf: WriteBuf,
    parser: RequestParser,
    body: Body,
    content_range: Option<(u64, u64, u64)>,
    keep_alive: bool,
    bytes_to_send: usize,
    bytes_sent: usize,
}

impl Conn {
    /// An unused slot.
    pub fn new(shared: Arc<Shared>) -> Self {
        Self {
            fd: -1,
            peer: None,
            generation: 0,
            shared,
            read_buf: ReadBuf::new(),
            write_buf: WriteBuf::new(),
            parser: RequestParser::new(),
            body: Body::None,
            content_range: None,
            keep_alive: false,
            bytes_to_send: 0,
            bytes_sent: 0,
        }
    }

    /// Take over a freshly accepted socket and register it for reading.
    /// Returns the new generation of this slot.
    pub fn init(&mut self, fd: c_int, peer: Option<SocketAddr>) -> EtudeResult<u64> {
        self.reset();
        self.shared.epoll.add(fd, self.shared.trigger, true)?;
        self.fd = fd;
        self.peer = peer;
        self.generation += 1;
        self.shared.metrics.inc_conn();
        debug!(fd, peer = ?peer, generation = self.generation, "connection accepted");
        Ok(self.generation)
    }

    fn reset(&mut self) {
        self.read_buf.clear();
        self.write_buf.clear();
        self.parser.reset();
        self.body = Body::None;
        self.content_range = None;
        self.keep_alive = false;
        self.bytes_to_send = 0;
        self.bytes_sent = 0;
    }

    pub fn fd(&self) -> c_int {
        self.fd
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn is_open(&self) -> bool {
        self.fd >= 0
    }

    /// Deregister and close the socket. The slot stays allocated for reuse.
    pub fn close(&mut self) {
        if self.fd < 0 {
            return;
        }
        debug!(fd = self.fd, peer = ?self.peer, "closing connection");
        if let Err(e) = self.shared.epoll.delete(self.fd) {
            trace!(fd = self.fd, error = %e, "epoll delete failed");
        }
        syscalls::close_fd(self.fd);
        self.shared.metrics.dec_conn();
        self.fd = -1;
        self.body = Body::None;
    }

    /// Capacity rejection for an already registered connection.
    pub fn reject_busy(&mut self) {
        if self.fd >= 0 {
            syscalls::send_best_effort(self.fd, BUSY_MESSAGE);
            self.shared.metrics.inc_rejected();
        }
        self.close();
    }

    fn rearm(&self, interest: Interest) {
        if let Err(e) = self.shared.epoll.rearm(self.fd, interest, self.shared.trigger) {
            warn!(fd = self.fd, error = %e, "failed to re-arm connection");
        }
    }

    /// Pull bytes off the socket into the read buffer.
    ///
    /// Edge-triggered sockets are drained until would-block, level-triggered ones get a
    /// single read. A full buffer stops reading without failing; the parser decides.
    pub fn read(&mut self) -> EtudeResult<()> {
        loop {
            if self.read_buf.is_full() {
                return Ok(());
            }
            match syscalls::recv_nonblocking(self.fd, self.read_buf.spare_mut())? {
                None => return Ok(()),
                Some(0) => return Err(EtudeError::PeerClosed),
                Some(n) => {
                    self.read_buf.advance(n);
                    if self.shared.trigger == TriggerMode::Level {
                        return Ok(());
                    }
                }
            }
        }
    }

    /// Parse what has been read and, if a request is complete, build its response.
    /// Runs on a pool thread. Always ends by re-arming the socket or closing it.
    pub fn process(&mut self) {
        if !self.is_open() {
            return;
        }
        let status = match self.parser.parse(&mut self.read_buf) {
            ParseOutcome::Incomplete if self.read_buf.is_full() => {
                debug!(fd = self.fd, "request does not fit the read buffer");
                Status::BadRequest
            }
            ParseOutcome::Incomplete => {
                self.rearm(Interest::Read);
                return;
            }
            ParseOutcome::Bad => Status::BadRequest,
            ParseOutcome::Complete => {
                self.shared.metrics.inc_req();
                self.do_request()
            }
        };

        if self.process_write(status) {
            self.rearm(Interest::Write);
        } else {
            self.send_error_now(Status::InternalError);
            self.close();
        }
    }

    /// Map a complete request onto a body and status.
    fn do_request(&mut self) -> Status {
        let decoded = urlcode::decode_bytes(self.parser.target(&self.read_buf));
        let Ok(mut path) = String::from_utf8(decoded) else {
            return Status::BadRequest;
        };
        if let Some(q) = path.find('?') {
            path.truncate(q);
        }
        trace!(fd = self.fd, method = self.parser.method.as_str(), path = %path, "request");

        if self.parser.method == Method::Post {
            if let Some((route, dir)) = match_route(&path) {
                let services = Arc::clone(&self.shared.services);
                match services.handle(route, dir, self.parser.body(&self.read_buf)) {
                    RouteOutcome::Page(page) => path = page,
                    RouteOutcome::Output(output) => {
                        self.body = Body::Owned(output);
                        return Status::Ok;
                    }
                    RouteOutcome::Fail(status) => return status,
                }
            }
        }

        if path.ends_with('/') {
            path.push_str(DEFAULT_PAGE);
        }

        let res = match self.shared.resources.resolve(&path) {
            Lookup::NotFound => return Status::NotFound,
            Lookup::Found(res) => res,
        };
        if !res.is_world_readable() {
            return Status::Forbidden;
        }
        if !res.is_servable() {
            return Status::BadRequest;
        }

        let size = res.size();
        let Some(span) = resolve_range(self.parser.range, size) else {
            return Status::Ok;
        };
        let (Ok(start), Ok(len)) = (usize::try_from(span.start), usize::try_from(span.len())) else {
            return Status::InternalError;
        };
        if start + len > res.bytes().len() {
            return Status::InternalError;
        }
        self.body = Body::File { res, start, len };
        if span.partial {
            self.content_range = Some((span.start, span.end, size));
            Status::PartialContent
        } else {
            Status::Ok
        }
    }

    /// Write the status line and headers. False when they do not fit.
    fn process_write(&mut self, status: Status) -> bool {
        if !matches!(status, Status::Ok | Status::PartialContent) {
            self.body = Body::Static(status.form().as_bytes());
            self.content_range = None;
        }
        self.keep_alive = self.parser.keep_alive && !status.forces_close();
        let body_len = self.body_bytes().len();
        let range = self.content_range;

        self.write_buf.clear();
        let w = &mut self.write_buf;
        let ok = w.append_fmt(format_args!(
            "HTTP/1.1 {} {}\r\n",
            status.code(),
            status.title()
        )) && w.append_fmt(format_args!("Content-Length: {}\r\n", body_len))
            && w.append(b"Accept-Ranges: bytes\r\n")
            && range.is_none_or(|(start, end, total)| {
                w.append_fmt(format_args!(
                    "Content-Range: bytes {}-{}/{}\r\n",
                    start, end, total
                ))
            })
            && w.append_fmt(format_args!(
                "Connection: {}\r\n",
                if self.keep_alive { "keep-alive" } else { "close" }
            ))
            && w.append(b"\r\n");
        if !ok {
            return false;
        }

        self.bytes_sent = 0;
        self.bytes_to_send = self.write_buf.len() + body_len;
        debug!(fd = self.fd, status = status.code(), bytes = self.bytes_to_send, "response ready");
        true
    }

    fn body_bytes(&self) -> &[u8] {
        match &self.body {
            Body::None => &[],
            Body::Static(s) => s,
            Body::Owned(v) => v,
            Body::File { res, start, len } => &res.bytes()[*start..*start + *len],
        }
    }

    /// Unsent parts of the headers and of the body.
    fn pending(&self) -> (&[u8], &[u8]) {
        let head = self.write_buf.as_slice();
        let body = self.body_bytes();
        if self.bytes_sent >= head.len() {
            let done: &[u8] = &[];
            (done, &body[(self.bytes_sent - head.len()).min(body.len())..])
        } else {
            (&head[self.bytes_sent..], body)
        }
    }

    /// Send the prepared response with vectored writes, resuming after partial sends.
    pub fn write(&mut self) -> EtudeResult<WriteOutcome> {
        if self.bytes_to_send == 0 {
            self.reset();
            self.rearm(Interest::Read);
            return Ok(WriteOutcome::KeepAlive);
        }

        loop {
            let (head, body) = self.pending();
            let sent = match syscalls::writev_nonblocking(self.fd, &[head, body]) {
                Ok(Some(n)) => n,
                Ok(None) => {
                    self.rearm(Interest::Write);
                    return Ok(WriteOutcome::Pending);
                }
                Err(e) => {
                    warn!(fd = self.fd, error = %e, "write failed");
                    self.send_error_now(Status::InternalError);
                    return Err(e);
                }
            };
            self.bytes_sent += sent;
            self.shared.metrics.add_bytes(sent);

            if self.bytes_sent >= self.bytes_to_send {
                self.body = Body::None;
                if self.keep_alive {
                    self.reset();
                    self.rearm(Interest::Read);
                    return Ok(WriteOutcome::KeepAlive);
                }
                return Ok(WriteOutcome::Close);
            }
        }
    }

    /// Best-effort standalone error response, used on paths that are about to close.
    fn send_error_now(&self, status: Status) {
        let form = status.form();
        let msg = format!(
            "HTTP/1.1 {} {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
            status.code(),
            status.title(),
            form.len(),
            form
        );
        syscalls::send_best_effort(self.fd, msg.as_bytes());
    }
}

impl Drop for Conn {
    fn drop(&mut self) {
        self.close();
    }
}
