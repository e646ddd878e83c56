//! Symmetric-heap regions.
//!
//! Real NVSHMEM gives every rank the same offset into every peer's
//! registered region. Here that's realized as one `RankHeap` per rank,
//! reachable by any other rank through [`crate::fabric::Fabric`] — the
//! same "every participant can be addressed identically" property, minus
//! the actual RDMA wire.
//!
//! Per-slot interior mutability (`Vec<Mutex<Option<T>>>`, one mutex per
//! slot rather than one mutex for the whole array) is what lets disjoint
//! `(expert, rank, slot)` writers proceed without contending each other,
//! mirroring the "counter/slot is the sole owner" disjointness invariant
//! the protocol relies on, without reaching for `unsafe`.

use std::sync::atomic::{AtomicI64, AtomicU32, AtomicU64, Ordering};
use std::sync::Mutex;

use crate::config::LaunchConfig;
use crate::error::CapacityError;
use crate::message::{Message, Payload};
use crate::sync_info::ExpertSyncInfo;
use crate::topology::Topology;

/// Packs `(num_tokens, begin_offset)` into the 64-bit `layout_range` word
///.
pub fn pack_layout(num: u32, begin: u32) -> u64 {
    ((num as u64) << 32) | begin as u64
}

pub fn unpack_layout(word: u64) -> (u32, u32) {
    ((word >> 32) as u32, word as u32)
}

/// One rank's share of the symmetric heap.
pub struct RankHeap {
    topo: Topology,
    cfg: LaunchConfig,

    /// `[L][R][S_max]` dispatch staging slots, senders write here via
    /// P2P store or IBGDA put.
    dispatch_staging: Vec<Mutex<Option<Message>>>,
    /// `[L][R]` signed count-handshake words.
    recv_count: Vec<AtomicI64>,
    /// `[L]` bump allocator for the packed receive arrays.
    packed_cursor: Vec<AtomicU32>,
    /// `[L][R]` number of messages received for this pair.
    packed_recv_count: Vec<AtomicU32>,
    /// `[L][R]` `pack(num, begin)` into the packed arrays below.
    layout_range: Vec<AtomicU64>,
    /// `[L][R*S_max]` packed payloads, indexed by `(l, begin + i)`.
    packed_recv_x: Vec<Mutex<Option<Payload>>>,
    /// `[L][R*S_max]` packed source-token indices, same indexing.
    packed_recv_src_info: Vec<Mutex<u32>>,

    /// `[L][R][S_max]` combine staging slots, mirrors dispatch layout.
    combine_staging: Vec<Mutex<Option<Message>>>,
    /// `[L]` arrival counters, the sole combine-receive signal.
    recv_flag: Vec<AtomicU32>,

    /// One [`ExpertSyncInfo`] per locally-owned global expert.
    pub sync_info: Vec<ExpertSyncInfo>,

    /// FP32 Pure-EP reduction scratch, `[num_combined_tokens][hidden_dim]`.
    fp32_workspace: Mutex<Vec<f32>>,

    /// Ephemeral scratch cleared between iterations.
    next_clean: Mutex<Vec<u8>>,
}

impl RankHeap {
    pub fn new(topo: Topology, cfg: LaunchConfig, max_combined_tokens: usize) -> Self {
        let l = topo.local_experts() as usize;
        let r = topo.ranks() as usize;
        let s_max = cfg.slot_capacity as usize;

        Self {
            topo,
            cfg,
            dispatch_staging: (0..l * r * s_max).map(|_| Mutex::new(None)).collect(),
            recv_count: (0..l * r).map(|_| AtomicI64::new(0)).collect(),
            packed_cursor: (0..l).map(|_| AtomicU32::new(0)).collect(),
            packed_recv_count: (0..l * r).map(|_| AtomicU32::new(0)).collect(),
            layout_range: (0..l * r).map(|_| AtomicU64::new(0)).collect(),
            packed_recv_x: (0..l * r * s_max).map(|_| Mutex::new(None)).collect(),
            packed_recv_src_info: (0..l * r * s_max).map(|_| Mutex::new(0)).collect(),
            combine_staging: (0..l * r * s_max).map(|_| Mutex::new(None)).collect(),
            recv_flag: (0..l).map(|_| AtomicU32::new(0)).collect(),
            sync_info: (0..l).map(|_| ExpertSyncInfo::new(topo.ranks())).collect(),
            fp32_workspace: Mutex::new(vec![0.0; max_combined_tokens * cfg.hidden_dim as usize]),
            next_clean: Mutex::new(vec![0u8; cfg.hidden_dim as usize]),
        }
    }

    fn slot_capacity(&self) -> usize {
        self.cfg.slot_capacity as usize
    }

    fn pair_index(&self, local_expert: u32, src_rank: u32) -> usize {
        local_expert as usize * self.topo.ranks() as usize + src_rank as usize
    }

    fn dispatch_slot_index(&self, local_expert: u32, src_rank: u32, slot: u32) -> usize {
        self.pair_index(local_expert, src_rank) * self.slot_capacity() + slot as usize
    }

    // ---- dispatch staging (SEND writes, RECV reads) ----

    pub fn write_dispatch_slot(&self, local_expert: u32, src_rank: u32, slot: u32, msg: Message) {
        let idx = self.dispatch_slot_index(local_expert, src_rank, slot);
        *self.dispatch_staging[idx].lock().unwrap() = Some(msg);
    }

    pub fn take_dispatch_slot(&self, local_expert: u32, src_rank: u32, slot: u32) -> Option<Message> {
        let idx = self.dispatch_slot_index(local_expert, src_rank, slot);
        self.dispatch_staging[idx].lock().unwrap().take()
    }

    // ---- count handshake ----

    pub fn post_count(&self, local_expert: u32, src_rank: u32, delta: i64) {
        let idx = self.pair_index(local_expert, src_rank);
        self.recv_count[idx].fetch_add(delta, Ordering::AcqRel);
    }

    pub fn load_count(&self, local_expert: u32, src_rank: u32) -> i64 {
        self.recv_count[self.pair_index(local_expert, src_rank)].load(Ordering::Acquire)
    }

    // ---- packed receive arrays ----

    /// Atomically reserves `n` contiguous packed slots for local expert
    /// `local_expert`, returning the begin offset.
    pub fn reserve_packed_range(&self, local_expert: u32, n: u32) -> Result<u32, CapacityError> {
        let begin = self.packed_cursor[local_expert as usize].fetch_add(n, Ordering::AcqRel);
        let capacity = self.topo.ranks() * self.cfg.slot_capacity;
        if begin + n > capacity {
            return Err(CapacityError::RecvSlotOverflow {
                expert: local_expert,
                src_rank: u32::MAX,
                capacity,
            });
        }
        Ok(begin)
    }

    pub fn set_layout(&self, local_expert: u32, src_rank: u32, n: u32, begin: u32) {
        let idx = self.pair_index(local_expert, src_rank);
        self.layout_range[idx].store(pack_layout(n, begin), Ordering::Release);
        self.packed_recv_count[idx].store(n, Ordering::Release);
    }

    pub fn layout(&self, local_expert: u32, src_rank: u32) -> (u32, u32) {
        unpack_layout(self.layout_range[self.pair_index(local_expert, src_rank)].load(Ordering::Acquire))
    }

    pub fn packed_recv_count(&self, local_expert: u32, src_rank: u32) -> u32 {
        self.packed_recv_count[self.pair_index(local_expert, src_rank)].load(Ordering::Acquire)
    }

    fn packed_index(&self, local_expert: u32, offset: u32) -> usize {
        local_expert as usize * self.topo.ranks() as usize * self.slot_capacity() + offset as usize
    }

    pub fn write_packed(&self, local_expert: u32, offset: u32, src_token: u32, payload: Payload) {
        let idx = self.packed_index(local_expert, offset);
        *self.packed_recv_src_info[idx].lock().unwrap() = src_token;
        *self.packed_recv_x[idx].lock().unwrap() = Some(payload);
    }

    pub fn read_packed_src(&self, local_expert: u32, offset: u32) -> u32 {
        *self.packed_recv_src_info[self.packed_index(local_expert, offset)].lock().unwrap()
    }

    pub fn read_packed_payload(&self, local_expert: u32, offset: u32) -> Option<Payload> {
        self.packed_recv_x[self.packed_index(local_expert, offset)].lock().unwrap().clone()
    }

    // ---- combine staging + flag ----

    pub fn write_combine_slot(&self, local_expert: u32, src_rank: u32, slot: u32, msg: Message) {
        let idx = self.dispatch_slot_index(local_expert, src_rank, slot);
        *self.combine_staging[idx].lock().unwrap() = Some(msg);
    }

    pub fn take_combine_slot(&self, local_expert: u32, src_rank: u32, slot: u32) -> Option<Message> {
        let idx = self.dispatch_slot_index(local_expert, src_rank, slot);
        self.combine_staging[idx].lock().unwrap().take()
    }

    pub fn bump_recv_flag(&self, local_expert: u32, delta: u32) {
        self.recv_flag[local_expert as usize].fetch_add(delta, Ordering::AcqRel);
    }

    pub fn recv_flag(&self, local_expert: u32) -> u32 {
        self.recv_flag[local_expert as usize].load(Ordering::Acquire)
    }

    pub fn reset_recv_flag(&self, local_expert: u32) {
        self.recv_flag[local_expert as usize].store(0, Ordering::Release);
    }

    // ---- fp32 reduction workspace ----

    pub fn zero_workspace(&self) {
        let mut ws = self.fp32_workspace.lock().unwrap();
        ws.iter_mut().for_each(|v| *v = 0.0);
    }

    pub fn add_to_workspace(&self, token: usize, hidden_dim: usize, values: &[f32]) -> Result<(), CapacityError> {
        let mut ws = self.fp32_workspace.lock().unwrap();
        let start = token * hidden_dim;
        let end = start + hidden_dim;
        if end > ws.len() {
            return Err(CapacityError::WorkspaceTooSmall {
                needed: end,
                have: ws.len(),
            });
        }
        for (dst, src) in ws[start..end].iter_mut().zip(values.iter()) {
            *dst += src;
        }
        Ok(())
    }

    pub fn read_workspace(&self, token: usize, hidden_dim: usize) -> Vec<f32> {
        let ws = self.fp32_workspace.lock().unwrap();
        let start = token * hidden_dim;
        ws[start..start + hidden_dim].to_vec()
    }

    /// Cleared by the last warp of block 0 at the end of dispatch's send
    /// phase — scratch for the *next* iteration, owned
    /// exclusively by this rank.
    pub fn clear_next_clean(&self) {
        self.next_clean.lock().unwrap().iter_mut().for_each(|b| *b = 0);
    }

    // ---- cleaner ----

    /// Zeroes the two ephemeral scratch regions the cleaner owns, and every
    /// provided [`ExpertSyncInfo`]. The count buffer is deliberately *not*
    /// in scope here.
    pub fn clean_scratch(&self) {
        self.next_clean.lock().unwrap().iter_mut().for_each(|b| *b = 0);
        self.zero_workspace();
        for info in &self.sync_info {
            info.reset();
        }
    }

    /// Resets everything needed to start a fresh dispatch+combine
    /// iteration: slot-indexed staging, packed cursors/layout, and the
    /// count buffer — which is excluded from [`Self::clean_scratch`]
    /// precisely so it can be reset here, after combine has consumed it,
    /// rather than between dispatch's send and receive phases.
    pub fn reset_for_next_iteration(&self) {
        for s in &self.dispatch_staging {
            *s.lock().unwrap() = None;
        }
        for c in &self.recv_count {
            c.store(0, Ordering::Relaxed);
        }
        for c in &self.packed_cursor {
            c.store(0, Ordering::Relaxed);
        }
        for c in &self.packed_recv_count {
            c.store(0, Ordering::Relaxed);
        }
        for l in &self.layout_range {
            l.store(0, Ordering::Relaxed);
        }
        for s in &self.combine_staging {
            *s.lock().unwrap() = None;
        }
        for f in &self.recv_flag {
            f.store(0, Ordering::Relaxed);
        }
    }
}
