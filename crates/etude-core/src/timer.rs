// src/timer.rs
use std::cell::RefCell;
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::rc::Rc;
use std::time::{Duration, Instant};

use libc::c_int;

/// What a timer knows about the connection it guards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientData {
    pub fd: c_int,
    /// Generation of the connection slot at arm time.
    pub generation: u64,
}

pub type TimerCallback<C> = fn(&ClientData, &mut C);

enum TimerState<C> {
    Armed(TimerCallback<C>),
    Cancelled,
}

pub struct Timer<C> {
    expire: Instant,
    data: ClientData,
    state: RefCell<TimerState<C>>,
}

impl<C> Timer<C> {
    pub fn is_armed(&self) -> bool {
        matches!(*self.state.borrow(), TimerState::Armed(_))
    }

    /// Lazy deletion: the heap entry stays until it surfaces, then is dropped silently.
    pub fn cancel(&self) {
        *self.state.borrow_mut() = TimerState::Cancelled;
    }

    fn callback(&self) -> Option<TimerCallback<C>> {
        match *self.state.borrow() {
            TimerState::Armed(cb) => Some(cb),
            TimerState::Cancelled => None,
        }
    }
}

struct Entry<C>(Rc<Timer<C>>);

impl<C> PartialEq for Entry<C> {
    fn eq(&self, other: &Self) -> bool {
        self.0.expire == other.0.expire
    }
}

impl<C> Eq for Entry<C> {}

impl<C> PartialOrd for Entry<C> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<C> Ord for Entry<C> {
    // Reversed so the max-heap yields the earliest expiry first.
    fn cmp(&self, other: &Self) -> Ordering {
        other.0.expire.cmp(&self.0.expire)
    }
}

/// Min-heap of timers keyed by expiry, with lazy deletion.
pub struct TimerHeap<C> {
    heap: BinaryHeap<Entry<C>>,
}

impl<C> Default for TimerHeap<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C> TimerHeap<C> {
    pub fn new() -> Self {
        Self {
            heap: BinaryHeap::new(),
        }
    }

    pub fn add(&mut self, expire: Instant, data: ClientData, cb: TimerCallback<C>) -> Rc<Timer<C>> {
        let timer = Rc::new(Timer {
            expire,
            data,
            state: RefCell::new(TimerState::Armed(cb)),
        });
        self.heap.push(Entry(Rc::clone(&timer)));
        timer
    }

    /// Fire every expired timer still armed, popping cancelled ones on the way.
    /// Returns how many callbacks ran.
    pub fn tick(&mut self, now: Instant, ctx: &mut C) -> usize {
        let mut fired = 0;
        while let Some(top) = self.heap.peek() {
            if top.0.expire > now {
                break;
            }
            let Some(Entry(timer)) = self.heap.pop() else {
                break;
            };
            if let Some(cb) = timer.callback() {
                timer.cancel();
                cb(&timer.data, ctx);
                fired += 1;
            }
        }
        fired
    }

    /// Heap entries, cancelled ones included.
    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    pub fn armed(&self) -> usize {
        self.heap.iter().filter(|e| e.0.is_armed()).count()
    }
}

/// Idle deadlines for connections, one live timer per descriptor.
pub struct IdleTimers<C> {
    heap: TimerHeap<C>,
    slots: Vec<Option<Rc<Timer<C>>>>,
    timeout: Duration,
    on_expire: TimerCallback<C>,
}

impl<C> IdleTimers<C> {
    pub fn new(timeout: Duration, on_expire: TimerCallback<C>) -> Self {
        Self {
            heap: TimerHeap::new(),
            slots: Vec::new(),
            timeout,
            on_expire,
        }
    }

    fn slot(&mut self, fd: c_int) -> Option<&mut Option<Rc<Timer<C>>>> {
        let idx = usize::try_from(fd).ok()?;
        if idx >= self.slots.len() {
            self.slots.resize_with(idx + 1, || None);
        }
        self.slots.get_mut(idx)
    }

    /// Arm a fresh deadline for a newly accepted connection, replacing any stale one.
    pub fn arm(&mut self, data: ClientData, now: Instant) {
        let timer = self.heap.add(now + self.timeout, data, self.on_expire);
        if let Some(slot) = self.slot(data.fd) {
            if let Some(old) = slot.replace(timer) {
                old.cancel();
            }
        }
    }

    /// Push the deadline out after activity. Invalidates the old entry and inserts a new one.
    ///
    /// Works even if the old timer already fired: an expiry can be skipped while a
    /// worker holds the connection, and the next activity must re-arm it.
    pub fn reset(&mut self, fd: c_int, now: Instant) {
        let data = match self.slot(fd).and_then(|s| s.take()) {
            Some(old) => {
                old.cancel();
                old.data
            }
            None => return,
        };
        self.arm(data, now);
    }

    pub fn cancel(&mut self, fd: c_int) {
        if let Some(old) = self.slot(fd).and_then(Option::take) {
            old.cancel();
        }
    }

    pub fn tick(&mut self, now: Instant, ctx: &mut C) -> usize {
        self.heap.tick(now, ctx)
    }
}

#[cfg(test)]
impl<C> IdleTimers<C> {
    /// Armed timers for `fd` still sitting in the heap.
    pub fn live_count(&self, fd: c_int) -> usize {
        self.heap
            .heap
            .iter()
            .filter(|e| e.0.data.fd == fd && e.0.is_armed())
            .count()
    }

    pub fn heap_len(&self) -> usize {
        self.heap.len()
    }
}
