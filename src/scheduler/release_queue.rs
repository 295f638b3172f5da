//! Priority queue with per-entry release times.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use crate::util;

struct Entry<T> {
    release_at: u64,
    seq: u64,
    item: T,
}

impl<T> PartialEq for Entry<T> {
    fn eq(&self, other: &Self) -> bool {
        self.release_at == other.release_at && self.seq == other.seq
    }
}

impl<T> Eq for Entry<T> {}

impl<T> PartialOrd for Entry<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> Ord for Entry<T> {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap is a max-heap; invert so the earliest release wins.
        other
            .release_at
            .cmp(&self.release_at)
            .then(other.seq.cmp(&self.seq))
    }
}

struct Inner<T> {
    heap: BinaryHeap<Entry<T>>,
    alive: bool,
    next_seq: u64,
}

/// A queue whose entries become eligible for dequeue only once their release
/// time has been reached.
///
/// `dequeue` blocks until an eligible entry exists or `shutdown` is called;
/// `try_dequeue` never blocks. Entries come out earliest-release first; among
/// entries with equal release times no FIFO order is promised.
pub struct TimedReleaseQueue<T> {
    inner: Mutex<Inner<T>>,
    available: Condvar,
}

impl<T> TimedReleaseQueue<T> {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                heap: BinaryHeap::new(),
                alive: true,
                next_seq: 0,
            }),
            available: Condvar::new(),
        }
    }

    /// Enqueue `item` eligible at `release_at`. Returns false after shutdown.
    pub fn enqueue(&self, item: T, release_at: u64) -> bool {
        let mut inner = self.inner.lock();
        if !inner.alive {
            return false;
        }
        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.heap.push(Entry { release_at, seq, item });
        drop(inner);
        self.available.notify_one();
        true
    }

    /// Pop the earliest eligible entry without blocking.
    pub fn try_dequeue(&self) -> Option<T> {
        let mut inner = self.inner.lock();
        if !inner.alive {
            return None;
        }
        match inner.heap.peek() {
            Some(top) if top.release_at <= util::now() => {
                inner.heap.pop().map(|e| e.item)
            }
            _ => None,
        }
    }

    /// Block until an entry is eligible, then pop it. Returns None once the
    /// queue has been shut down.
    pub fn dequeue(&self) -> Option<T> {
        let mut inner = self.inner.lock();
        loop {
            if !inner.alive {
                return None;
            }
            let now = util::now();
            match inner.heap.peek() {
                Some(top) if top.release_at <= now => {
                    return inner.heap.pop().map(|e| e.item);
                }
                Some(top) => {
                    let wait = Duration::from_nanos(top.release_at - now);
                    self.available.wait_for(&mut inner, wait);
                }
                None => {
                    self.available.wait(&mut inner);
                }
            }
        }
    }

    /// Remove and return every entry regardless of release time.
    pub fn drain(&self) -> Vec<T> {
        let mut inner = self.inner.lock();
        let mut out = Vec::with_capacity(inner.heap.len());
        while let Some(e) = inner.heap.pop() {
            out.push(e.item);
        }
        out
    }

    /// Release all waiters; subsequent dequeues return None.
    pub fn shutdown(&self) {
        let mut inner = self.inner.lock();
        inner.alive = false;
        drop(inner);
        self.available.notify_all();
    }

    pub fn len(&self) -> usize {
        self.inner.lock().heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().heap.is_empty()
    }
}

impl<T> Default for TimedReleaseQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}
