//! Thread-safe bitset over block indices.
//!
//! Reads vastly outnumber writes in the mark-then-read-forever lifecycle of
//! a cache file, so a reader-biased `RwLock` over a growable bitset is the
//! right tradeoff here rather than anything lock-free.

use bitvec::prelude::*;
use parking_lot::RwLock;

pub struct Marker {
    bits: RwLock<BitVec>,
}

impl Marker {
    pub fn new(num_blocks: u64) -> Self {
        Self {
            bits: RwLock::new(bitvec![0; num_blocks as usize]),
        }
    }

    pub fn mark(&self, block_idx: u64) {
        let idx = block_idx as usize;
        // Fast path: a block is marked at most once in practice (the overlay
        // re-marks a block on every overwrite, but repeat writes to an
        // already-resident block are common), so check under a read lock
        // first and skip the write lock entirely when there's nothing to do.
        {
            let bits = self.bits.read();
            if idx < bits.len() && bits[idx] {
                return;
            }
        }
        let mut bits = self.bits.write();
        if idx >= bits.len() {
            bits.resize(idx + 1, false);
        }
        bits.set(idx, true);
    }

    pub fn is_marked(&self, block_idx: u64) -> bool {
        let bits = self.bits.read();
        let idx = block_idx as usize;
        idx < bits.len() && bits[idx]
    }

    /// True iff every block in `[start, end)` is marked.
    pub fn all_marked(&self, start: u64, end: u64) -> bool {
        let bits = self.bits.read();
        (start..end).all(|b| {
            let idx = b as usize;
            idx < bits.len() && bits[idx]
        })
    }

    pub fn mark_range(&self, start: u64, end: u64) {
        for b in start..end {
            self.mark(b);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn mark_and_check() {
        let marker = Marker::new(16);
        assert!(!marker.is_marked(4));
        marker.mark(4);
        assert!(marker.is_marked(4));
        assert!(!marker.is_marked(5));
    }

    #[test]
    fn all_marked_over_range() {
        let marker = Marker::new(16);
        marker.mark_range(2, 6);
        assert!(marker.all_marked(2, 6));
        assert!(!marker.all_marked(2, 7));
    }

    #[test]
    fn grows_past_initial_capacity() {
        let marker = Marker::new(4);
        marker.mark(100);
        assert!(marker.is_marked(100));
        assert!(!marker.is_marked(99));
    }

    #[test]
    fn concurrent_mark_and_read() {
        let marker = Arc::new(Marker::new(1024));
        let mut handles = Vec::new();
        for i in 0..1024u64 {
            let marker = marker.clone();
            handles.push(std::thread::spawn(move || marker.mark(i)));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert!(marker.all_marked(0, 1024));
    }
}
