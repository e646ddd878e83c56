//! Error taxonomy: Capacity, Protocol, Parameter.
//!
//! Kernels never return errors on real hardware — a fatal condition aborts
//! the launch. This crate simulates launches as ordinary function calls, so
//! the same "abort" is rendered as a typed [`DispatchError`] returned from
//! the call, letting tests assert on *which* invariant broke instead of
//! just observing a crash.

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DispatchError {
    #[error(transparent)]
    Capacity(#[from] CapacityError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Parameter(#[from] ParameterError),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CapacityError {
    #[error("send slot overflow: expert {expert} rank {rank} exceeded capacity {capacity}")]
    SendSlotOverflow {
        expert: u32,
        rank: u32,
        capacity: u32,
    },
    #[error("receive slot overflow: expert {expert} src_rank {src_rank} exceeded capacity {capacity}")]
    RecvSlotOverflow {
        expert: u32,
        src_rank: u32,
        capacity: u32,
    },
    #[error("workspace too small: needed {needed} have {have}")]
    WorkspaceTooSmall { needed: usize, have: usize },
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("observed token drop for expert {expert}: sent {sent} < expected {expected}")]
    TokenDrop {
        expert: u32,
        sent: u64,
        expected: u64,
    },
    #[error("spin budget exhausted waiting on {what} for expert {expert} src_rank {src_rank:?}")]
    SpinBudgetExhausted {
        what: &'static str,
        expert: u32,
        src_rank: Option<u32>,
    },
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParameterError {
    #[error("num_topk {0} outside [1, {1}]")]
    TopkOutOfRange(u32, u32),
    #[error("hidden_dim {0} is not a power-of-two multiple of 128")]
    UnalignedHiddenDim(u32),
    #[error("non-positive count for {field}")]
    NonPositiveCount { field: &'static str },
    #[error("invalid topology: ranks={ranks} global_experts={global_experts} local_experts={local_experts}")]
    InvalidTopology {
        ranks: u32,
        global_experts: u32,
        local_experts: u32,
    },
}
