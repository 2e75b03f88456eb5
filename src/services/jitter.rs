//! Time-ordered release buffer
//!
//! Frames fan in over independent TCP connections, so per-topic timestamps
//! arrive shuffled. The jitter buffer holds payloads on a min-heap keyed by
//! timestamp and releases them once they are `buffer_delay` old, restoring
//! monotone order within the delay window. With a zero delay it degrades to
//! a plain ordered pop for lowest latency.

use crate::domain::frame::unix_now;
use bytes::Bytes;
use std::cmp::Ordering;
use std::collections::BinaryHeap;

/// Stragglers older than the release deadline by this much are dropped
const GC_SLACK_SECS: f64 = 0.5;

/// Default bound on buffered payloads per topic
pub const DEFAULT_BUFFER_CAP: usize = 100;

struct Entry {
    ts: f64,
    data: Bytes,
}

// Min-heap on timestamp: reverse the comparison for BinaryHeap
impl Ord for Entry {
    fn cmp(&self, other: &Self) -> Ordering {
        other.ts.total_cmp(&self.ts)
    }
}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.ts.total_cmp(&other.ts) == Ordering::Equal
    }
}

impl Eq for Entry {}

pub struct TimeJitterBuffer {
    buffer_delay: f64,
    max_size: usize,
    heap: BinaryHeap<Entry>,
}

impl TimeJitterBuffer {
    pub fn new(buffer_delay: f64) -> Self {
        Self::with_capacity(buffer_delay, DEFAULT_BUFFER_CAP)
    }

    pub fn with_capacity(buffer_delay: f64, max_size: usize) -> Self {
        Self { buffer_delay, max_size, heap: BinaryHeap::new() }
    }

    /// Insert a payload. On overflow the oldest entry is evicted - a full
    /// buffer means the consumer side stopped draining, and the oldest
    /// frame is the least useful one to keep.
    pub fn push(&mut self, ts: f64, data: Bytes) {
        if self.heap.len() >= self.max_size {
            self.heap.pop();
        }
        self.heap.push(Entry { ts, data });
    }

    /// Release the next payload, honouring the configured delay.
    pub fn pop(&mut self) -> Option<Bytes> {
        self.pop_at(unix_now())
    }

    /// Deterministic variant of `pop` for a supplied clock.
    pub fn pop_at(&mut self, now: f64) -> Option<Bytes> {
        if self.buffer_delay == 0.0 {
            return self.heap.pop().map(|e| e.data);
        }

        let deadline = now - self.buffer_delay;

        // Drop stragglers with no chance of in-order playback
        while matches!(self.heap.peek(), Some(e) if e.ts < deadline - GC_SLACK_SECS) {
            self.heap.pop();
        }

        match self.heap.peek() {
            Some(e) if e.ts <= deadline => self.heap.pop().map(|e| e.data),
            _ => None,
        }
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    pub fn clear(&mut self) {
        self.heap.clear();
    }
}
