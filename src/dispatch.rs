//! Dispatch kernel: scatters each rank's tokens to the experts
//! their top-k routing picked.
//!
//! Grid shape for the send phase is one block per global expert `e`, a
//! one-task-per-shard convention; the receive phase
//! redefines the grid to one block per `(local_expert, src_rank)` pair, so
//! it runs as its own `thread::scope` rather than reusing the send phase's
//! barrier.

use std::collections::HashSet;
use std::sync::Mutex;
use std::thread;

use tracing::{debug, trace};

use crate::count;
use crate::diagnostics;
use crate::error::{DispatchError, ProtocolError};
use crate::fabric::Fabric;
use crate::fp8::{channel_amax, derive_scale, pack_ue8m0, quantize_channel, Fp8E4M3};
use crate::barrier::GridBarrier;
use crate::config::{Fp8Config, LaunchConfig, ScaleKind, FP8_CHANNEL_WIDTH};
use crate::message::{Message, MessageHeader, Payload, ScaleVec};
use crate::phases::Phases;
use crate::state_machine::PairState;
use crate::token::TokenInput;

/// Runs the requested phases of dispatch for `rank`'s own kernel launch.
/// Results land in the symmetric heap (`fabric.heap(owner)`); callers read
/// them back through [`crate::heap::RankHeap`]'s packed-array accessors.
pub fn dispatch(
    fabric: &Fabric,
    rank: u32,
    phases: Phases,
    tokens: &[TokenInput],
) -> Result<(), DispatchError> {
    debug!(rank, tokens = tokens.len(), "dispatch launch");
    if phases.contains(Phases::SEND) {
        send_phase(fabric, rank, tokens)?;
    }
    if phases.contains(Phases::RECV) {
        recv_phase(fabric, rank)?;
    }
    Ok(())
}

fn send_phase(fabric: &Fabric, rank: u32, tokens: &[TokenInput]) -> Result<(), DispatchError> {
    let e_count = fabric.topology().global_experts();
    let barrier = GridBarrier::new(e_count as usize);
    let skip_first = fabric.toggles().skip_grid_sync;
    let sent: Mutex<HashSet<(u32, usize)>> = Mutex::new(HashSet::new());

    thread::scope(|scope| -> Result<(), DispatchError> {
        let handles: Vec<_> = (0..e_count)
            .map(|e| {
                let barrier = &barrier;
                let sent = &sent;
                scope.spawn(move || -> Result<(), DispatchError> {
                    send_block(fabric, rank, e, tokens, barrier, skip_first, sent)
                })
            })
            .collect();
        handles
            .into_iter()
            .map(|h| h.join().expect("dispatch send block panicked"))
            .collect::<Result<Vec<()>, DispatchError>>()?;
        Ok(())
    })?;

    if fabric.config().enable_token_drop_detector {
        let sent = sent.into_inner().expect("send phase threads already joined");
        run_token_drop_detector(fabric, rank, tokens, &sent)?;
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn send_block(
    fabric: &Fabric,
    rank: u32,
    e: u32,
    tokens: &[TokenInput],
    barrier: &GridBarrier,
    skip_first: bool,
    sent: &Mutex<HashSet<(u32, usize)>>,
) -> Result<(), DispatchError> {
    let topo = fabric.topology();
    let owner = topo.expert_owner(e);
    let local_e = topo.local_expert_index(e);

    if fabric.pair_states(owner).state(local_e, rank) == PairState::Idle {
        let _ = fabric.pair_states(owner).transition(local_e, rank, PairState::Sending);
    }

    // A block that hits a fatal error (e.g. slot capacity overflow) still
    // rendezvous at every barrier below instead of returning immediately;
    // otherwise the other `e_count - 1` blocks would wait forever for a
    // peer that already bailed out.
    let send_result = send_tokens(fabric, rank, e, owner, local_e, tokens, sent);

    // Sync point 1: every block has finished issuing its sends.
    if !skip_first {
        barrier.wait();
        diagnostics::record_grid_sync();
    }
    if e == 0 {
        // Last warp of block 0 clears this rank's own next-iteration scratch.
        fabric.heap(rank).clear_next_clean();
    }
    // Sync point 2: the clear above is visible before anyone posts a count.
    barrier.wait();
    diagnostics::record_grid_sync();

    let n = fabric.slots().final_count(e, rank);
    if fabric.toggles().verbose_debug {
        trace!(rank, e, owner, n, "posting dispatch count");
    }
    fabric.heap(owner).post_count(local_e, rank, count::encode(n));

    // Sync point 3: every count is posted before the host moves to receive.
    barrier.wait();
    diagnostics::record_grid_sync();

    if fabric.pair_states(owner).state(local_e, rank) == PairState::Sending {
        let _ = fabric
            .pair_states(owner)
            .transition(local_e, rank, PairState::CountPosted);
    }
    send_result
}

fn send_tokens(
    fabric: &Fabric,
    rank: u32,
    e: u32,
    owner: u32,
    local_e: u32,
    tokens: &[TokenInput],
    sent: &Mutex<HashSet<(u32, usize)>>,
) -> Result<(), DispatchError> {
    let topo = fabric.topology();
    let cfg = fabric.config();
    for (token_idx, token) in tokens.iter().enumerate() {
        if topo.is_pure_ep() && topo.pure_ep_owner(token_idx as u64) != rank {
            // Pure EP duplicate suppression: only the owning rank sends.
            continue;
        }
        for (routed_e, _weight) in token.routes() {
            if routed_e != e {
                continue;
            }
            let slot = fabric.slots().reserve(e, rank)?;
            let payload = stage_payload(cfg, &token.payload);
            let msg = Message {
                header: MessageHeader::new(token_idx as u32),
                payload,
            };
            fabric.transport().choose(rank, owner);
            fabric.heap(owner).write_dispatch_slot(local_e, rank, slot, msg);
            fabric.heap(owner).sync_info[local_e as usize].record_expected(rank, 1);
            sent.lock()
                .expect("send-tracking mutex poisoned")
                .insert((e, token_idx));
        }
    }
    Ok(())
}

/// Optional per-128-channel FP8 quantization before the transport put.
fn stage_payload(cfg: &LaunchConfig, payload: &[half::bf16]) -> Payload {
    match cfg.fp8 {
        None => Payload::Bf16(payload.to_vec()),
        Some(Fp8Config { scale_kind }) => {
            let width = FP8_CHANNEL_WIDTH as usize;
            let num_channels = Payload::num_scale_channels(payload.len());
            let mut values = vec![Fp8E4M3(0); payload.len()];
            let mut scale_invs = Vec::with_capacity(num_channels);
            for c in 0..num_channels {
                let start = c * width;
                let end = (start + width).min(payload.len());
                let channel = &payload[start..end];
                let amax = channel_amax(channel);
                let (scale, scale_inv) = derive_scale(amax);
                quantize_channel(channel, scale, &mut values[start..end]);
                scale_invs.push(scale_inv);
            }
            let scales = match scale_kind {
                ScaleKind::Float => ScaleVec::Float(scale_invs),
                ScaleKind::PackedUe8m0 => {
                    ScaleVec::PackedUe8m0(scale_invs.iter().map(|s| pack_ue8m0(*s)).collect())
                }
            };
            Payload::Fp8 { values, scales }
        }
    }
}

fn run_token_drop_detector(
    fabric: &Fabric,
    rank: u32,
    tokens: &[TokenInput],
    sent: &HashSet<(u32, usize)>,
) -> Result<(), DispatchError> {
    let topk: Vec<Vec<i32>> = tokens.iter().map(|t| t.topk.clone()).collect();
    let ranks = fabric.topology().ranks();
    let dropped =
        diagnostics::detect_token_drops(&topk, rank, ranks, |expert, token_idx| {
            sent.contains(&(expert, token_idx))
        });
    if let Some((_, expert)) = dropped.first() {
        return Err(ProtocolError::TokenDrop {
            expert: *expert as u32,
            sent: 0,
            expected: dropped.len() as u64,
        }
        .into());
    }
    Ok(())
}

fn recv_phase(fabric: &Fabric, rank: u32) -> Result<(), DispatchError> {
    let topo = fabric.topology();
    let l = topo.local_experts();
    let r = topo.ranks();

    thread::scope(|scope| -> Result<(), DispatchError> {
        let handles: Vec<_> = (0..l)
            .flat_map(|local_e| (0..r).map(move |src| (local_e, src)))
            .map(|(local_e, src)| scope.spawn(move || recv_block(fabric, rank, local_e, src)))
            .collect();
        handles
            .into_iter()
            .map(|h| h.join().expect("dispatch recv block panicked"))
            .collect::<Result<Vec<()>, DispatchError>>()?;
        Ok(())
    })
}

fn recv_block(fabric: &Fabric, rank: u32, local_e: u32, src_rank: u32) -> Result<(), DispatchError> {
    let heap = fabric.heap(rank);
    let budget = fabric.config().spin_retry_budget;
    let mut tries = 0u32;
    let n = loop {
        let raw = heap.load_count(local_e, src_rank);
        if let Some(n) = count::decode(raw) {
            break n;
        }
        tries += 1;
        if tries > budget {
            return Err(ProtocolError::SpinBudgetExhausted {
                what: "recv_count",
                expert: local_e,
                src_rank: Some(src_rank),
            }
            .into());
        }
        std::hint::spin_loop();
    };

    if fabric.pair_states(rank).state(local_e, src_rank) == PairState::CountPosted {
        let _ = fabric
            .pair_states(rank)
            .transition(local_e, src_rank, PairState::CountObserved);
    }

    let begin = heap.reserve_packed_range(local_e, n)?;
    heap.set_layout(local_e, src_rank, n, begin);
    for i in 0..n {
        let msg = heap
            .take_dispatch_slot(local_e, src_rank, i)
            .expect("message must already be staged once its count was posted");
        heap.write_packed(local_e, begin + i, msg.header.source_token_index, msg.payload);
    }
    heap.sync_info[local_e as usize].record_received(src_rank, n as u64);

    if fabric.pair_states(rank).state(local_e, src_rank) == PairState::CountObserved {
        let _ = fabric
            .pair_states(rank)
            .transition(local_e, src_rank, PairState::Draining);
        let _ = fabric.pair_states(rank).transition(local_e, src_rank, PairState::Done);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LaunchConfig;
    use crate::topology::Topology;
    use half::bf16;

    fn token(hidden: usize, experts: &[i32]) -> TokenInput {
        TokenInput::new(
            vec![bf16::from_f32(1.0); hidden],
            experts.to_vec(),
            vec![1.0; experts.len()],
        )
    }

    #[test]
    fn single_rank_pure_ep_round_trips_without_drops() {
        let topo = Topology::new(1, 1, 1).unwrap();
        let cfg = LaunchConfig::new(128, 4, 1).unwrap();
        let fabric = Fabric::new(topo, cfg, 4);
        let tokens = vec![token(128, &[0]), token(128, &[0])];

        dispatch(&fabric, 0, Phases::ALL, &tokens).unwrap();

        assert_eq!(fabric.heap(0).layout(0, 0), (2, 0));
        assert_eq!(fabric.heap(0).read_packed_src(0, 0), 0);
        assert_eq!(fabric.heap(0).read_packed_src(0, 1), 1);
    }

    #[test]
    fn zero_token_pair_still_sets_layout() {
        // Single rank owning two local experts; every token routes to
        // expert 0, so expert 1's pair must still reach layout (0, 0)
        // rather than being left unset.
        let topo = Topology::new(1, 2, 2).unwrap();
        let cfg = LaunchConfig::new(128, 4, 1).unwrap();
        let fabric = Fabric::new(topo, cfg, 4);
        let tokens = vec![token(128, &[0]), token(128, &[0])];

        dispatch(&fabric, 0, Phases::ALL, &tokens).unwrap();

        assert_eq!(fabric.heap(0).layout(1, 0), (0, 0));
    }

    #[test]
    fn capacity_overflow_is_reported() {
        let topo = Topology::new(1, 1, 1).unwrap();
        let cfg = LaunchConfig::new(128, 1, 1).unwrap();
        let fabric = Fabric::new(topo, cfg, 4);
        let tokens = vec![token(128, &[0]), token(128, &[0])];

        let err = dispatch(&fabric, 0, Phases::SEND, &tokens).unwrap_err();
        assert!(matches!(err, DispatchError::Capacity(_)));
    }

    #[test]
    fn capacity_overflow_aborts_with_multiple_expert_blocks() {
        // E=4 means the send-phase barrier has more than one party; a
        // regression here would hang instead of erroring, since the only
        // overflowing block (expert 0) must still rendezvous with the
        // other three before this call returns.
        let topo = Topology::new(1, 4, 4).unwrap();
        let cfg = LaunchConfig::new(128, 1, 1).unwrap();
        let fabric = Fabric::new(topo, cfg, 4);
        let tokens = vec![token(128, &[0]), token(128, &[0])];

        let err = dispatch(&fabric, 0, Phases::SEND, &tokens).unwrap_err();
        assert!(matches!(err, DispatchError::Capacity(_)));
    }

    #[test]
    fn split_phases_match_combined_call() {
        let topo = Topology::new(1, 1, 1).unwrap();
        let cfg = LaunchConfig::new(128, 4, 1).unwrap();

        let combined = Fabric::new(topo, cfg, 4);
        let tokens = vec![token(128, &[0]), token(128, &[0])];
        dispatch(&combined, 0, Phases::ALL, &tokens).unwrap();

        let split = Fabric::new(topo, cfg, 4);
        dispatch(&split, 0, Phases::SEND, &tokens).unwrap();
        dispatch(&split, 0, Phases::RECV, &tokens).unwrap();

        assert_eq!(combined.heap(0).layout(0, 0), split.heap(0).layout(0, 0));
    }
}
