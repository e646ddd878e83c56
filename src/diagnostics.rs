//! Process-wide diagnostic state and the optional token-drop detector.
//!
//! Device-global diagnostic arrays (`g_sync_counter` and friends) are
//! initialized at module load, never freed, and updated only by one thread
//! per block with no cross-block consistency required — the same lifecycle
//! as a lazily-initialized process-global atomic here.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;

static GRID_SYNC_COUNTER: OnceLock<AtomicU64> = OnceLock::new();

/// Counts total `GridBarrier::wait()` rendezvous completed process-wide.
/// Purely a debug aid; no code path depends on its value.
pub fn record_grid_sync() -> u64 {
    GRID_SYNC_COUNTER
        .get_or_init(|| AtomicU64::new(0))
        .fetch_add(1, Ordering::Relaxed)
        + 1
}

pub fn grid_sync_count() -> u64 {
    GRID_SYNC_COUNTER
        .get_or_init(|| AtomicU64::new(0))
        .load(Ordering::Relaxed)
}

/// A token-drop detector that scans all tokens on every block; this is
/// O(E·T·K) per iteration and is a defensive check rather than a protocol
/// requirement, so it stays optional.
///
/// Scans a rank's full top-k routing table and confirms that, for Pure EP,
/// every non-padding `(token, k)` entry was actually sent by this rank's
/// slot counters — i.e. nothing was silently dropped before reaching the
/// transport layer. Intended to run once per dispatch call, gated behind
/// [`crate::config::LaunchConfig::enable_token_drop_detector`].
pub fn detect_token_drops(
    topk: &[Vec<i32>],
    rank: u32,
    ranks: u32,
    sent_mask: impl Fn(u32, usize) -> bool,
) -> Vec<(usize, i32)> {
    let mut dropped = Vec::new();
    for (token_idx, experts) in topk.iter().enumerate() {
        let owner = (token_idx as u64 % ranks as u64) as u32;
        if owner != rank {
            continue;
        }
        for &e in experts {
            if e < 0 {
                continue;
            }
            if !sent_mask(e as u32, token_idx) {
                dropped.push((token_idx, e));
            }
        }
    }
    dropped
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grid_sync_counter_monotonically_increases() {
        let before = grid_sync_count();
        record_grid_sync();
        record_grid_sync();
        assert_eq!(grid_sync_count(), before + 2);
    }

    #[test]
    fn detector_flags_unsent_routes() {
        let topk = vec![vec![2, -1], vec![0, 1]];
        let dropped = detect_token_drops(&topk, 0, 2, |_e, t| t != 0);
        assert_eq!(dropped, vec![(0, 2)]);
    }
}
