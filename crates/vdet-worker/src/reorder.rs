//! Per-stream result reordering.
//!
//! Workers finish jobs in any order. Results are held back by sequence number
//! and released in order. At most `window` entries wait behind a gap; past
//! that the gap is given up and anything arriving for it later is late.

use std::collections::BTreeMap;

enum Slot<T> {
    Ready(T),
    Skipped,
}

pub struct ReorderBuffer<T> {
    next: u64,
    window: usize,
    pending: BTreeMap<u64, Slot<T>>,
    late: u64,
    gaps: u64,
}

impl<T> ReorderBuffer<T> {
    pub fn new(window: usize) -> Self {
        Self {
            next: 0,
            window: window.max(1),
            pending: BTreeMap::new(),
            late: 0,
            gaps: 0,
        }
    }

    /// Whether a result for `sequence` would be dropped as late.
    pub fn is_late(&self, sequence: u64) -> bool {
        sequence < self.next
    }

    /// Add a result, returning everything now releasable in order.
    pub fn push(&mut self, sequence: u64, item: T) -> Vec<T> {
        if self.is_late(sequence) {
            self.late += 1;
            return Vec::new();
        }
        self.pending.insert(sequence, Slot::Ready(item));
        self.drain()
    }

    /// Mark a sequence that will never produce a result.
    pub fn skip(&mut self, sequence: u64) -> Vec<T> {
        if self.is_late(sequence) {
            return Vec::new();
        }
        self.pending.insert(sequence, Slot::Skipped);
        self.drain()
    }

    fn drain(&mut self) -> Vec<T> {
        let mut released = Vec::new();
        loop {
            while let Some(slot) = self.pending.remove(&self.next) {
                if let Slot::Ready(item) = slot {
                    released.push(item);
                }
                self.next += 1;
            }

            if self.pending.len() <= self.window {
                break;
            }
            // Window overflow: give up on the gap in front
            if let Some(&first) = self.pending.keys().next() {
                self.gaps += first - self.next;
                self.next = first;
            }
        }
        released
    }

    /// Next sequence to be released.
    pub fn next_sequence(&self) -> u64 {
        self.next
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Results dropped for arriving after their window closed.
    pub fn late(&self) -> u64 {
        self.late
    }

    /// Sequences given up without a result or skip.
    pub fn gaps(&self) -> u64 {
        self.gaps
    }
}
