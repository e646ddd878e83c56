//! Combine kernel: gathers expert outputs back to the rank
//! that originally dispatched each token and weighted-sums them.
//!
//! Same grid shape as dispatch's send phase (one block per global expert),
//! but only the `L` blocks owned by this rank do real work; the rest just
//! keep the intra-rank barrier balanced. Phase 2's per-token accumulation
//! doesn't need its own block partitioning — the interesting concurrency
//! (the cross-rank combine-staging RDMA and the Pure-EP all-reduce) is
//! already exercised by [`Fabric::collective_sum_reduce`], so it runs on
//! the calling thread once the send blocks have finished.

use std::collections::HashMap;
use std::thread;

use half::bf16;
use tracing::debug;

use crate::barrier::GridBarrier;
use crate::error::{DispatchError, ProtocolError};
use crate::fabric::Fabric;
use crate::heap::RankHeap;
use crate::message::{Message, Payload};
use crate::phases::Phases;
use crate::token::{CombineOutput, TokenInput};

/// Per-local-expert, per-packed-offset output vectors, as produced by the
/// (out-of-scope here) MLP that consumed dispatch's packed receive arrays.
#[derive(Debug, Clone, Default)]
pub struct ExpertOutputs {
    by_local_expert: Vec<Vec<Vec<bf16>>>,
}

impl ExpertOutputs {
    pub fn new(local_experts: u32) -> Self {
        Self {
            by_local_expert: vec![Vec::new(); local_experts as usize],
        }
    }

    pub fn set(&mut self, local_expert: u32, offset: u32, payload: Vec<bf16>) {
        let slots = &mut self.by_local_expert[local_expert as usize];
        if slots.len() <= offset as usize {
            slots.resize(offset as usize + 1, Vec::new());
        }
        slots[offset as usize] = payload;
    }

    fn get(&self, local_expert: u32, offset: u32) -> &[bf16] {
        &self.by_local_expert[local_expert as usize][offset as usize]
    }
}

pub fn combine(
    fabric: &Fabric,
    rank: u32,
    phases: Phases,
    tokens: &[TokenInput],
    expert_outputs: &ExpertOutputs,
) -> Result<CombineOutput, DispatchError> {
    debug!(rank, tokens = tokens.len(), "combine launch");
    if phases.contains(Phases::SEND) {
        send_phase(fabric, rank, expert_outputs)?;
    }
    if !phases.contains(Phases::RECV) {
        return Ok(CombineOutput::empty());
    }
    receive_and_reduce(fabric, rank, tokens)
}

fn send_phase(fabric: &Fabric, rank: u32, expert_outputs: &ExpertOutputs) -> Result<(), DispatchError> {
    let e_count = fabric.topology().global_experts();
    let barrier = GridBarrier::new(e_count as usize);

    thread::scope(|scope| -> Result<(), DispatchError> {
        let handles: Vec<_> = (0..e_count)
            .map(|e| {
                let barrier = &barrier;
                scope.spawn(move || -> Result<(), DispatchError> {
                    // Rendezvous unconditionally: a block that bails out of
                    // `send_block` early (e.g. dispatch never settled) must
                    // still reach the barrier, or every other block waiting
                    // on it hangs forever.
                    let result = send_block(fabric, rank, e, expert_outputs);
                    barrier.wait();
                    result
                })
            })
            .collect();
        handles
            .into_iter()
            .map(|h| h.join().expect("combine send block panicked"))
            .collect::<Result<Vec<()>, DispatchError>>()?;
        Ok(())
    })
}

fn send_block(
    fabric: &Fabric,
    rank: u32,
    e: u32,
    expert_outputs: &ExpertOutputs,
) -> Result<(), DispatchError> {
    let topo = fabric.topology();
    if topo.expert_owner(e) != rank {
        return Ok(());
    }
    let local_e = topo.local_expert_index(e);
    let budget = fabric.config().spin_retry_budget;

    wait_dispatch_settled(fabric.heap(rank), local_e, budget)?;

    for dst_rank in 0..topo.ranks() {
        let (num, begin) = fabric.heap(rank).layout(local_e, dst_rank);
        if num == 0 {
            continue;
        }
        for i in 0..num {
            let offset = begin + i;
            let src_token = fabric.heap(rank).read_packed_src(local_e, offset);
            let payload = expert_outputs.get(local_e, offset).to_vec();
            fabric.transport().choose(rank, dst_rank);
            fabric
                .heap(dst_rank)
                .write_combine_slot(local_e, rank, i, Message::new_bf16(src_token, payload));
        }
        fabric.heap(dst_rank).bump_recv_flag(local_e, 1);
    }
    Ok(())
}

/// Confirms dispatch's receive phase for this local expert genuinely
/// finished
/// before trusting `layout_range`/`packed_recv_src_info` enough to send
/// results back.
fn wait_dispatch_settled(heap: &RankHeap, local_e: u32, budget: u32) -> Result<(), DispatchError> {
    let info = &heap.sync_info[local_e as usize];
    let mut tries = 0u32;
    while !info.is_satisfied() {
        tries += 1;
        if tries > budget {
            return Err(ProtocolError::SpinBudgetExhausted {
                what: "dispatch_settled",
                expert: local_e,
                src_rank: None,
            }
            .into());
        }
        std::hint::spin_loop();
    }
    Ok(())
}

fn receive_and_reduce(fabric: &Fabric, rank: u32, tokens: &[TokenInput]) -> Result<CombineOutput, DispatchError> {
    let topo = fabric.topology();
    let hidden_dim = fabric.config().hidden_dim as usize;
    let budget = fabric.config().spin_retry_budget;
    let pure_ep = topo.is_pure_ep();
    let heap = fabric.heap(rank);

    // Recomputes, deterministically, the slot each (token, expert) pair was
    // assigned during this rank's own dispatch send — the same order
    // `crate::dispatch::send_tokens` reserved it in, so no remote scan is
    // needed to find it again.
    let mut next_slot: HashMap<u32, u32> = HashMap::new();
    let mut partials = vec![vec![0f32; hidden_dim]; tokens.len()];

    for (t, token) in tokens.iter().enumerate() {
        if pure_ep && topo.pure_ep_owner(t as u64) != rank {
            continue;
        }
        for (e, weight) in token.routes() {
            let slot = *next_slot.entry(e).or_insert(0);
            next_slot.insert(e, slot + 1);

            let owner = topo.expert_owner(e);
            let local_e = topo.local_expert_index(e);
            let msg = wait_combine_slot(heap, local_e, owner, slot, budget)?;
            let Payload::Bf16(payload) = msg.payload else {
                unreachable!("combine wire format is always bf16")
            };
            for (acc, v) in partials[t].iter_mut().zip(payload.iter()) {
                *acc += weight * v.to_f32();
            }
        }
    }

    if pure_ep {
        heap.zero_workspace();
        for (t, partial) in partials.iter().enumerate() {
            heap.add_to_workspace(t, hidden_dim, partial)?;
        }
        fabric.collective_sum_reduce(tokens.len());
        let combined = (0..tokens.len())
            .map(|t| heap.read_workspace(t, hidden_dim).iter().map(|v| bf16::from_f32(*v)).collect())
            .collect();
        Ok(CombineOutput { combined })
    } else {
        let combined = partials
            .iter()
            .map(|p| p.iter().map(|v| bf16::from_f32(*v)).collect())
            .collect();
        Ok(CombineOutput { combined })
    }
}

fn wait_combine_slot(
    heap: &RankHeap,
    local_e: u32,
    owner: u32,
    slot: u32,
    budget: u32,
) -> Result<Message, DispatchError> {
    let mut tries = 0u32;
    loop {
        if let Some(msg) = heap.take_combine_slot(local_e, owner, slot) {
            return Ok(msg);
        }
        tries += 1;
        if tries > budget {
            return Err(ProtocolError::SpinBudgetExhausted {
                what: "combine_slot",
                expert: local_e,
                src_rank: Some(owner),
            }
            .into());
        }
        std::hint::spin_loop();
    }
}
