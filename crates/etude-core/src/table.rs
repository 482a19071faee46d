// src/table.rs
use std::sync::{Arc, Mutex};

use libc::c_int;

use crate::conn::{Conn, Shared};
use crate::sync::lock;

pub type ConnSlot = Arc<Mutex<Conn>>;

/// Connection slots indexed by file descriptor, allocated on first use and reused
/// whenever the kernel hands the same descriptor out again.
pub struct ConnTable {
    slots: Vec<Option<ConnSlot>>,
    shared: Arc<Shared>,
}

impl ConnTable {
    pub fn new(shared: Arc<Shared>, expected: usize) -> Self {
        Self {
            slots: Vec::with_capacity(expected.min(4096)),
            shared,
        }
    }

    pub fn get(&self, fd: c_int) -> Option<ConnSlot> {
        let idx = usize::try_from(fd).ok()?;
        self.slots.get(idx)?.as_ref().map(Arc::clone)
    }

    /// The slot for `fd`, created if this descriptor has never been seen.
    pub fn slot(&mut self, fd: c_int) -> Option<ConnSlot> {
        let idx = usize::try_from(fd).ok()?;
        if idx >= self.slots.len() {
            self.slots.resize_with(idx + 1, || None);
        }
        let shared = &self.shared;
        let slot = self.slots[idx].get_or_insert_with(|| {
            Arc::new(Mutex::new(Conn::new(Arc::clone(shared))))
        });
        Some(Arc::clone(slot))
    }

    /// Slots ever allocated.
    pub fn allocated(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    /// Close every open connection.
    pub fn close_all(&mut self) {
        for slot in self.slots.iter().flatten() {
            lock(slot).close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TriggerMode;
    use crate::conn::tests::{doc_root, shared_for};
    use std::os::fd::IntoRawFd;
    use std::os::unix::net::UnixStream;

    #[test]
    fn slots_are_reused_per_descriptor() {
        let root = doc_root();
        let mut table = ConnTable::new(shared_for(root.path(), TriggerMode::Edge), 16);
        assert!(table.get(5).is_none());

        let a = table.slot(5).unwrap();
        let b = table.slot(5).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert!(table.get(3).is_none());
        assert_eq!(table.allocated(), 1);
        assert!(table.slot(-1).is_none());
    }

    #[test]
    fn generation_advances_across_reuse() {
        let root = doc_root();
        let shared = shared_for(root.path(), TriggerMode::Edge);
        let mut table = ConnTable::new(Arc::clone(&shared), 16);

        let (ours, _theirs) = UnixStream::pair().unwrap();
        ours.set_nonblocking(true).unwrap();
        let fd = ours.into_raw_fd();
        let slot = table.slot(fd).unwrap();
        let first = lock(&slot).init(fd, None).unwrap();
        assert_eq!(shared.metrics.live(), 1);
        table.close_all();
        assert_eq!(shared.metrics.live(), 0);

        // Same slot, next connection.
        let (ours, _peer) = UnixStream::pair().unwrap();
        ours.set_nonblocking(true).unwrap();
        let second = lock(&slot).init(ours.into_raw_fd(), None).unwrap();
        assert_eq!(second, first + 1);
        assert_eq!(shared.metrics.live(), 1);
        lock(&slot).close();
    }
}
