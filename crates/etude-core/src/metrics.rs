// src/metrics.rs
use std::sync::atomic::{AtomicUsize, Ordering};

/// Server-wide counters shared by the reactor and every pool thread.
#[repr(C, align(64))]
pub struct ServerMetrics {
    pub live_conns: AtomicUsize,
    pub req_count: AtomicUsize,
    pub bytes_sent: AtomicUsize,
    pub rejected: AtomicUsize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Snapshot {
    pub live_conns: usize,
    pub req_count: usize,
    pub bytes_sent: usize,
    pub rejected: usize,
}

impl ServerMetrics {
    pub fn new() -> Self {
        Self {
            live_conns: AtomicUsize::new(0),
            req_count: AtomicUsize::new(0),
            bytes_sent: AtomicUsize::new(0),
            rejected: AtomicUsize::new(0),
        }
    }

    pub fn inc_req(&self) {
        self.req_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_conn(&self) {
        self.live_conns.fetch_add(1, Ordering::AcqRel);
    }

    /// Saturates at zero.
    pub fn dec_conn(&self) {
        let _ = self
            .live_conns
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
    }

    pub fn live(&self) -> usize {
        self.live_conns.load(Ordering::Acquire)
    }

    pub fn add_bytes(&self, bytes: usize) {
        self.bytes_sent.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn inc_rejected(&self) {
        self.rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            live_conns: self.live(),
            req_count: self.req_count.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
        }
    }
}

impl Default for ServerMetrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn live_counter_never_underflows() {
        let m = ServerMetrics::new();
        m.inc_conn();
        m.dec_conn();
        m.dec_conn();
        assert_eq!(m.live(), 0);

        m.inc_req();
        m.add_bytes(10);
        let snap = m.snapshot();
        assert_eq!((snap.req_count, snap.bytes_sent), (1, 10));
    }
}
