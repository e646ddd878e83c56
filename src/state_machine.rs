//! Per-`(expert, src_rank)` state machine. Optional diagnostic
//! bookkeeping, not consulted by the hot path — the protocol's actual
//! correctness comes from the atomics and spin-polls in
//! [`crate::dispatch`]/[`crate::combine`], not from this tracker.

use std::collections::HashMap;
use std::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PairState {
    Idle,
    Sending,
    CountPosted,
    CountObserved,
    Draining,
    Done,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("invalid transition {from:?} -> {to:?} for pair {pair:?}")]
pub struct InvalidTransition {
    pub pair: (u32, u32),
    pub from: PairState,
    pub to: PairState,
}

fn allowed(from: PairState, to: PairState) -> bool {
    use PairState::*;
    matches!(
        (from, to),
        (Idle, Sending)
            | (Sending, CountPosted)
            | (CountPosted, CountObserved)
            | (CountObserved, Draining)
            | (Draining, Done)
    )
}

#[derive(Default)]
pub struct PairStateTracker {
    states: Mutex<HashMap<(u32, u32), PairState>>,
}

impl PairStateTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self, local_expert: u32, src_rank: u32) -> PairState {
        *self
            .states
            .lock()
            .unwrap()
            .get(&(local_expert, src_rank))
            .unwrap_or(&PairState::Idle)
    }

    pub fn transition(
        &self,
        local_expert: u32,
        src_rank: u32,
        to: PairState,
    ) -> Result<(), InvalidTransition> {
        let mut states = self.states.lock().unwrap();
        let from = *states.get(&(local_expert, src_rank)).unwrap_or(&PairState::Idle);
        if !allowed(from, to) {
            return Err(InvalidTransition {
                pair: (local_expert, src_rank),
                from,
                to,
            });
        }
        states.insert((local_expert, src_rank), to);
        Ok(())
    }

    pub fn reset(&self) {
        self.states.lock().unwrap().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn walks_full_lifecycle() {
        let tracker = PairStateTracker::new();
        assert_eq!(tracker.state(0, 0), PairState::Idle);
        tracker.transition(0, 0, PairState::Sending).unwrap();
        tracker.transition(0, 0, PairState::CountPosted).unwrap();
        tracker.transition(0, 0, PairState::CountObserved).unwrap();
        tracker.transition(0, 0, PairState::Draining).unwrap();
        tracker.transition(0, 0, PairState::Done).unwrap();
        assert_eq!(tracker.state(0, 0), PairState::Done);
    }

    #[test]
    fn zero_token_pairs_still_traverse_every_state() {
        let tracker = PairStateTracker::new();
        tracker.transition(1, 2, PairState::Sending).unwrap();
        tracker.transition(1, 2, PairState::CountPosted).unwrap();
        tracker.transition(1, 2, PairState::CountObserved).unwrap();
        tracker.transition(1, 2, PairState::Draining).unwrap();
        tracker.transition(1, 2, PairState::Done).unwrap();
        assert_eq!(tracker.state(1, 2), PairState::Done);
    }

    #[test]
    fn rejects_skipped_states() {
        let tracker = PairStateTracker::new();
        assert!(tracker.transition(0, 0, PairState::CountPosted).is_err());
    }
}
