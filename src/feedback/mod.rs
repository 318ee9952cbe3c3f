//! §4.1 FeedbackStore: the shared coverage bitmaps and per-worker counters.

pub mod backend;
pub mod sancov;

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use crate::config::{BITMAP_MASK, BITMAP_SIZE, MAX_THREADS};

/// Which of the two coverage oracles a bit belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BitmapKind {
    Pc,
    Cmp,
}

/// A 16 MiB bit array, addressed by a 27-bit masked key, expressed as a flat
/// array of atomic words so that first-setter detection is lock-free.
struct AtomicBitmap {
    words: Vec<AtomicU32>,
}

impl AtomicBitmap {
    fn new() -> Self {
        let word_count = BITMAP_SIZE * 8 / 32;
        let mut words = Vec::with_capacity(word_count);
        words.resize_with(word_count, || AtomicU32::new(0));
        AtomicBitmap { words }
    }

    /// Set the bit at `key & mask`. Returns `true` iff this call was the
    /// first to set it (the caller is credited with "new").
    fn set(&self, key: u32) -> bool {
        let idx = (key & BITMAP_MASK) as usize;
        let word_idx = idx / 32;
        let bit = 1u32 << (idx % 32);
        let prev = self.words[word_idx].fetch_or(bit, Ordering::AcqRel);
        prev & bit == 0
    }
}

/// Per-worker hit counters (§3 `PerWorkerCounters`). Written only by the
/// owning worker; read by [`FeedbackStore::snapshot_totals`].
#[derive(Default)]
struct WorkerCounters {
    pc: AtomicU64,
    cmp: AtomicU64,
}

/// The shared coverage store: two bitmaps plus per-worker counters. Safe to
/// share behind an `Arc` across worker threads or processes that mmap the
/// same region; no locks are taken on the hot path.
pub struct FeedbackStore {
    pc_bitmap: AtomicBitmap,
    cmp_bitmap: AtomicBitmap,
    counters: Vec<WorkerCounters>,
}

/// Aggregate PC/CMP totals across all workers, used for progress reporting.
#[derive(Debug, Clone, Copy, Default)]
pub struct FeedbackTotals {
    pub pc: u64,
    pub cmp: u64,
}

impl FeedbackStore {
    pub fn new(worker_count: usize) -> Self {
        assert!(worker_count <= MAX_THREADS);
        let mut counters = Vec::with_capacity(worker_count);
        counters.resize_with(worker_count, WorkerCounters::default);
        FeedbackStore {
            pc_bitmap: AtomicBitmap::new(),
            cmp_bitmap: AtomicBitmap::new(),
            counters,
        }
    }

    /// Record a hit at `key` in bitmap `kind` on behalf of `worker`. Returns
    /// `true` iff this was the first worker to ever set that bit.
    pub fn record_bitmap(&self, worker: usize, kind: BitmapKind, key: u32) -> bool {
        let (bitmap, counter) = match kind {
            BitmapKind::Pc => (&self.pc_bitmap, &self.counters[worker].pc),
            BitmapKind::Cmp => (&self.cmp_bitmap, &self.counters[worker].cmp),
        };
        let is_new = bitmap.set(key);
        if is_new {
            counter.fetch_add(1, Ordering::Relaxed);
        }
        is_new
    }

    /// Sum PC and CMP counters across all workers.
    pub fn snapshot_totals(&self) -> FeedbackTotals {
        let mut totals = FeedbackTotals::default();
        for c in &self.counters {
            totals.pc += c.pc.load(Ordering::Relaxed);
            totals.cmp += c.cmp.load(Ordering::Relaxed);
        }
        totals
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn bit_transitions_zero_to_one_at_most_once() {
        let store = FeedbackStore::new(4);
        assert!(store.record_bitmap(0, BitmapKind::Pc, 5));
        assert!(!store.record_bitmap(1, BitmapKind::Pc, 5));
        assert!(!store.record_bitmap(2, BitmapKind::Pc, 5));
    }

    #[test]
    fn exactly_one_worker_credited_under_contention() {
        let store = Arc::new(FeedbackStore::new(8));
        let mut handles = Vec::new();
        for worker in 0..8 {
            let store = Arc::clone(&store);
            handles.push(thread::spawn(move || {
                store.record_bitmap(worker, BitmapKind::Pc, 12345)
            }));
        }
        let mut new_count = 0;
        for h in handles {
            if h.join().unwrap() {
                new_count += 1;
            }
        }
        assert_eq!(new_count, 1);
    }

    #[test]
    fn snapshot_totals_sum_across_workers() {
        let store = FeedbackStore::new(2);
        store.record_bitmap(0, BitmapKind::Pc, 1);
        store.record_bitmap(0, BitmapKind::Pc, 2);
        store.record_bitmap(1, BitmapKind::Cmp, 3);
        let totals = store.snapshot_totals();
        assert_eq!(totals.pc, 2);
        assert_eq!(totals.cmp, 1);
    }

    #[test]
    fn mask_wraps_large_keys_into_range() {
        let store = FeedbackStore::new(1);
        assert!(store.record_bitmap(0, BitmapKind::Pc, u32::MAX));
        assert!(!store.record_bitmap(0, BitmapKind::Pc, u32::MAX & BITMAP_MASK));
    }
}
