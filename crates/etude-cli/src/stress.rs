// src/stress.rs
use std::io::{self, BufRead, BufReader, Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

const IO_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy)]
pub struct StressReport {
    pub ok: usize,
    pub failed: usize,
    pub elapsed: Duration,
}

impl StressReport {
    pub fn requests_per_sec(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs == 0.0 { 0.0 } else { self.ok as f64 / secs }
    }
}

/// Read one response and return its status code. The body is consumed.
pub fn read_response<R: BufRead>(reader: &mut R) -> io::Result<u16> {
    let mut line = String::new();
    if reader.read_line(&mut line)? == 0 {
        return Err(io::ErrorKind::UnexpectedEof.into());
    }
    let status = line
        .split_whitespace()
        .nth(1)
        .and_then(|code| code.parse().ok())
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "bad status line"))?;

    let mut content_length = 0usize;
    loop {
        line.clear();
        if reader.read_line(&mut line)? == 0 {
            return Err(io::ErrorKind::UnexpectedEof.into());
        }
        let header = line.trim_end();
        if header.is_empty() {
            break;
        }
        if let Some((name, value)) = header.split_once(':') {
            if name.eq_ignore_ascii_case("content-length") {
                content_length = value.trim().parse().map_err(|_| {
                    io::Error::new(io::ErrorKind::InvalidData, "bad content-length")
                })?;
            }
        }
    }

    io::copy(&mut reader.take(content_length as u64), &mut io::sink())?;
    Ok(status)
}

/// One keep-alive connection issuing `requests` sequential GETs.
/// Returns how many got a 200.
fn drive(addr: SocketAddr, requests: usize) -> io::Result<usize> {
    let stream = TcpStream::connect_timeout(&addr, IO_TIMEOUT)?;
    stream.set_read_timeout(Some(IO_TIMEOUT))?;
    stream.set_write_timeout(Some(IO_TIMEOUT))?;
    let mut writer = stream.try_clone()?;
    let mut reader = BufReader::new(stream);

    let mut ok = 0;
    for _ in 0..requests {
        writer.write_all(b"GET / HTTP/1.1\r\nConnection: keep-alive\r\n\r\n")?;
        if read_response(&mut reader)? == 200 {
            ok += 1;
        }
    }
    Ok(ok)
}

pub fn run(addr: SocketAddr, connections: usize, requests: usize) -> StressReport {
    let ok = Arc::new(AtomicUsize::new(0));
    let failed = Arc::new(AtomicUsize::new(0));
    let start = Instant::now();

    let handles: Vec<_> = (0..connections)
        .map(|i| {
            let ok = Arc::clone(&ok);
            let failed = Arc::clone(&failed);
            thread::spawn(move || match drive(addr, requests) {
                Ok(n) => {
                    ok.fetch_add(n, Ordering::Relaxed);
                    failed.fetch_add(requests - n, Ordering::Relaxed);
                    debug!(connection = i, ok = n, "connection finished");
                }
                Err(e) => {
                    warn!(connection = i, error = %e, "connection failed");
                    failed.fetch_add(requests, Ordering::Relaxed);
                }
            })
        })
        .collect();
    for handle in handles {
        if handle.join().is_err() {
            failed.fetch_add(requests, Ordering::Relaxed);
        }
    }

    StressReport {
        ok: ok.load(Ordering::Relaxed),
        failed: failed.load(Ordering::Relaxed),
        elapsed: start.elapsed(),
    }
}
