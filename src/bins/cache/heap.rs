//! Process-local pooled byte buffers.

use crate::defaults::{HEAP_BUFFERS_PER_CLASS, HEAP_MAX_POOLED, HEAP_MIN_CLASS};
use crate::error::{Error, Result};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Recycling pool of heap buffers, bucketed by power-of-two size class.
///
/// `acquire` hands out a zeroed `Vec<u8>` whose capacity is the request's
/// size class; `recycle` returns it for reuse. An optional byte capacity
/// bounds the memory handed out at once.
pub struct HeapPool {
    /// Idle buffers per class, class `i` holding `HEAP_MIN_CLASS << i` bytes.
    classes: Mutex<Vec<Vec<Vec<u8>>>>,
    capacity: Option<usize>,
    /// Bytes currently handed out (by capacity).
    in_use: AtomicUsize,
    hits: AtomicUsize,
    misses: AtomicUsize,
}

/// Pool statistics for monitoring.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeapStats {
    pub in_use: usize,
    pub idle_buffers: usize,
    pub hits: usize,
    pub misses: usize,
}

impl HeapPool {
    /// Create a pool. `capacity` of `None` means unbounded.
    pub fn new(capacity: Option<usize>) -> Self {
        let class_count = class_index(HEAP_MAX_POOLED) + 1;
        Self {
            classes: Mutex::new(vec![Vec::new(); class_count]),
            capacity,
            in_use: AtomicUsize::new(0),
            hits: AtomicUsize::new(0),
            misses: AtomicUsize::new(0),
        }
    }

    /// Get a zeroed buffer of length `size`.
    pub fn acquire(&self, size: usize) -> Result<Vec<u8>> {
        let class = class_size(size).ok_or(Error::NoMemory { requested: size })?;

        // Reserve budget first so concurrent callers cannot overshoot.
        let reserved = self
            .in_use
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |used| {
                let next = used.checked_add(class)?;
                match self.capacity {
                    Some(cap) if next > cap => None,
                    _ => Some(next),
                }
            });
        if reserved.is_err() {
            return Err(Error::NoMemory { requested: size });
        }

        let pooled = if class <= HEAP_MAX_POOLED {
            self.classes.lock()[class_index(class)].pop()
        } else {
            None
        };

        let mut buf = match pooled {
            Some(buf) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                buf
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                let mut buf = Vec::new();
                if buf.try_reserve_exact(class).is_err() {
                    self.in_use.fetch_sub(class, Ordering::AcqRel);
                    return Err(Error::NoMemory { requested: size });
                }
                buf
            }
        };

        buf.clear();
        buf.resize(size, 0);
        Ok(buf)
    }

    /// Return a buffer obtained from [`acquire`](Self::acquire).
    pub fn recycle(&self, mut buf: Vec<u8>) {
        // Capacities handed out are always classes, so this never falls back.
        let class = class_size(buf.capacity()).unwrap_or(buf.capacity());
        self.in_use.fetch_sub(class, Ordering::AcqRel);

        // Only exact class buffers are pooled; anything grown elsewhere is dropped.
        if buf.capacity() != class || class > HEAP_MAX_POOLED {
            return;
        }
        let mut classes = self.classes.lock();
        let bucket = &mut classes[class_index(class)];
        if bucket.len() < HEAP_BUFFERS_PER_CLASS {
            buf.clear();
            bucket.push(buf);
        }
    }

    /// Bytes currently handed out, rounded to size classes.
    pub fn in_use(&self) -> usize {
        self.in_use.load(Ordering::Acquire)
    }

    pub fn capacity(&self) -> Option<usize> {
        self.capacity
    }

    pub fn stats(&self) -> HeapStats {
        HeapStats {
            in_use: self.in_use(),
            idle_buffers: self.classes.lock().iter().map(Vec::len).sum(),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }
}

impl Default for HeapPool {
    fn default() -> Self {
        Self::new(None)
    }
}

/// Power-of-two class serving `size`, `None` past the largest `usize` power.
fn class_size(size: usize) -> Option<usize> {
    size.max(HEAP_MIN_CLASS).checked_next_power_of_two()
}

/// Bucket of a class returned by [`class_size`].
fn class_index(class: usize) -> usize {
    (class.trailing_zeros() - HEAP_MIN_CLASS.trailing_zeros()) as usize
}
