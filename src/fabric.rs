//! Wires ranks' heaps, slot counters, and transports together. The crate's
//! `Router`-equivalent: a shared object every rank-thread holds an `Arc`
//! to and calls into, rather than a message-passing actor.

use std::sync::{Condvar, Mutex};

use crate::config::{LaunchConfig, RuntimeToggles};
use crate::heap::RankHeap;
use crate::slot::SlotCounters;
use crate::state_machine::PairStateTracker;
use crate::topology::Topology;
use crate::transport::TransportSelector;

struct ReduceGateState {
    arrived: u32,
    generation: u32,
}

/// Everything a single dispatch/combine call needs to reach its peers.
/// Constructed once per test/run and shared via `Arc` across rank threads.
pub struct Fabric {
    topo: Topology,
    cfg: LaunchConfig,
    heaps: Vec<RankHeap>,
    slots: SlotCounters,
    transport: TransportSelector,
    toggles: RuntimeToggles,
    pair_states: Vec<PairStateTracker>,
    reduce_gate: Mutex<ReduceGateState>,
    reduce_cvar: Condvar,
    max_combined_tokens: usize,
}

impl Fabric {
    pub fn new(topo: Topology, cfg: LaunchConfig, max_combined_tokens: usize) -> Self {
        let ranks = topo.ranks();
        let heaps = (0..ranks)
            .map(|_| RankHeap::new(topo, cfg, max_combined_tokens))
            .collect();
        let slots = SlotCounters::new(topo.global_experts(), ranks, cfg.slot_capacity);
        let pair_states = (0..ranks).map(|_| PairStateTracker::new()).collect();
        Self {
            topo,
            cfg,
            heaps,
            slots,
            transport: TransportSelector::all_p2p(ranks),
            toggles: RuntimeToggles::from_env(),
            pair_states,
            reduce_gate: Mutex::new(ReduceGateState {
                arrived: 0,
                generation: 0,
            }),
            reduce_cvar: Condvar::new(),
            max_combined_tokens,
        }
    }

    pub fn with_transport(mut self, transport: TransportSelector) -> Self {
        self.transport = transport;
        self
    }

    pub fn with_toggles(mut self, toggles: RuntimeToggles) -> Self {
        self.toggles = toggles;
        self
    }

    pub fn topology(&self) -> &Topology {
        &self.topo
    }

    pub fn config(&self) -> &LaunchConfig {
        &self.cfg
    }

    pub fn heap(&self, rank: u32) -> &RankHeap {
        &self.heaps[rank as usize]
    }

    pub fn slots(&self) -> &SlotCounters {
        &self.slots
    }

    pub fn transport(&self) -> &TransportSelector {
        &self.transport
    }

    pub fn toggles(&self) -> &RuntimeToggles {
        &self.toggles
    }

    pub fn pair_states(&self, rank: u32) -> &PairStateTracker {
        &self.pair_states[rank as usize]
    }

    pub fn max_combined_tokens(&self) -> usize {
        self.max_combined_tokens
    }

    /// Resets every rank's heap, the shared slot counters, and diagnostic
    /// state, ready for a fresh dispatch+combine iteration.
    pub fn reset_all(&self) {
        for heap in &self.heaps {
            heap.reset_for_next_iteration();
            heap.clean_scratch();
        }
        self.slots.reset();
        for tracker in &self.pair_states {
            tracker.reset();
        }
    }

    /// Pure-EP cross-rank FP32 sum-reduce: blocks until every
    /// rank has called it the same number of times, then the caller that
    /// completes the rendezvous sums every rank's workspace and replicates
    /// the total back into all of them. Mirrors `nvshmemx_float_sum_reduce_block`
    /// being a *collective* — a rank that calls it a different number of
    /// times than its peers deadlocks here, same as the real kernel would
    /// hang on a mismatched collective.
    pub fn collective_sum_reduce(&self, num_tokens: usize) {
        let ranks = self.topo.ranks();
        if ranks <= 1 {
            return;
        }
        let mut state = self.reduce_gate.lock().unwrap();
        let my_generation = state.generation;
        state.arrived += 1;
        if state.arrived == ranks {
            drop(state);
            self.do_collective_sum(num_tokens);
            let mut state = self.reduce_gate.lock().unwrap();
            state.arrived = 0;
            state.generation += 1;
            self.reduce_cvar.notify_all();
        } else {
            while state.generation == my_generation {
                state = self.reduce_cvar.wait(state).unwrap();
            }
        }
    }

    fn do_collective_sum(&self, num_tokens: usize) {
        let hidden_dim = self.cfg.hidden_dim as usize;
        let mut totals = vec![0f32; num_tokens * hidden_dim];
        for heap in &self.heaps {
            for t in 0..num_tokens {
                let partial = heap.read_workspace(t, hidden_dim);
                for (dst, src) in totals[t * hidden_dim..(t + 1) * hidden_dim]
                    .iter_mut()
                    .zip(partial.iter())
                {
                    *dst += src;
                }
            }
        }
        for heap in &self.heaps {
            heap.zero_workspace();
            for t in 0..num_tokens {
                heap.add_to_workspace(t, hidden_dim, &totals[t * hidden_dim..(t + 1) * hidden_dim])
                    .expect("workspace sized for max_combined_tokens at construction");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn collective_sum_reduce_replicates_single_contributor() {
        let topo = Topology::new(2, 2, 1).unwrap();
        let cfg = LaunchConfig::new(128, 4, 1).unwrap();
        let fabric = Arc::new(Fabric::new(topo, cfg, 1));
        fabric.heap(0).add_to_workspace(0, 128, &vec![1.0; 128]).unwrap();

        thread::scope(|s| {
            let a = fabric.clone();
            let b = fabric.clone();
            s.spawn(move || a.collective_sum_reduce(1));
            s.spawn(move || b.collective_sum_reduce(1));
        });

        assert_eq!(fabric.heap(0).read_workspace(0, 128), fabric.heap(1).read_workspace(0, 128));
        assert_eq!(fabric.heap(1).read_workspace(0, 128)[0], 1.0);
    }

    #[test]
    fn single_rank_topology_skips_the_collective() {
        let topo = Topology::new(1, 1, 1).unwrap();
        let cfg = LaunchConfig::new(128, 4, 1).unwrap();
        let fabric = Fabric::new(topo, cfg, 1);
        fabric.collective_sum_reduce(1);
    }
}
