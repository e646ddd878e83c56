//! `ExpertSyncInfo` — expected/received token counters.
//!
//! Lives in the symmetric heap, one instance per locally-owned global
//! expert. Mutated by many senders (dispatch's send phase) and drained by
//! one receiver (dispatch's receive phase and combine's wait), all via
//! atomics — final reads are `Acquire` to match the `__threadfence_system()`
//! requirement before a consistent read.

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug)]
pub struct ExpertSyncInfo {
    expected_tokens_per_rank: Vec<AtomicU64>,
    received_tokens_per_rank: Vec<AtomicU64>,
    expected_total: AtomicU64,
    received_total: AtomicU64,
}

impl ExpertSyncInfo {
    pub fn new(ranks: u32) -> Self {
        Self {
            expected_tokens_per_rank: (0..ranks).map(|_| AtomicU64::new(0)).collect(),
            received_tokens_per_rank: (0..ranks).map(|_| AtomicU64::new(0)).collect(),
            expected_total: AtomicU64::new(0),
            received_total: AtomicU64::new(0),
        }
    }

    pub fn reset(&self) {
        for c in &self.expected_tokens_per_rank {
            c.store(0, Ordering::Relaxed);
        }
        for c in &self.received_tokens_per_rank {
            c.store(0, Ordering::Relaxed);
        }
        self.expected_total.store(0, Ordering::Relaxed);
        self.received_total.store(0, Ordering::Relaxed);
    }

    /// Called once per dispatched message, on the sender's local counter
    /// for `rank`.
    pub fn record_expected(&self, rank: u32, n: u64) {
        self.expected_tokens_per_rank[rank as usize].fetch_add(n, Ordering::AcqRel);
        self.expected_total.fetch_add(n, Ordering::AcqRel);
    }

    /// Called once per drained (expert, src_rank) pair at the end of
    /// dispatch's receive phase, after the `n` payloads have been copied.
    pub fn record_received(&self, src_rank: u32, n: u64) {
        self.received_tokens_per_rank[src_rank as usize].fetch_add(n, Ordering::AcqRel);
        self.received_total.fetch_add(n, Ordering::AcqRel);
    }

    pub fn total_expected(&self) -> u64 {
        self.expected_total.load(Ordering::Acquire)
    }

    pub fn total_received(&self) -> u64 {
        self.received_total.load(Ordering::Acquire)
    }

    /// Invariant 3: `total_received <= total_expected` always.
    pub fn is_consistent(&self) -> bool {
        self.total_received() <= self.total_expected()
    }

    pub fn is_satisfied(&self) -> bool {
        self.total_received() >= self.total_expected()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tracks_expected_and_received_per_rank() {
        let info = ExpertSyncInfo::new(2);
        info.record_expected(0, 3);
        info.record_expected(1, 2);
        assert_eq!(info.total_expected(), 5);
        assert!(!info.is_satisfied());

        info.record_received(0, 3);
        info.record_received(1, 2);
        assert_eq!(info.total_received(), 5);
        assert!(info.is_satisfied());
        assert!(info.is_consistent());
    }

    #[test]
    fn reset_clears_all_counters() {
        let info = ExpertSyncInfo::new(1);
        info.record_expected(0, 4);
        info.record_received(0, 4);
        info.reset();
        assert_eq!(info.total_expected(), 0);
        assert_eq!(info.total_received(), 0);
    }
}
