//! Rank/expert ownership math and Pure-EP detection.

use crate::error::{DispatchError, ParameterError};

/// Static cluster shape: `R` ranks, `E` global experts, `L = E / R` local
/// experts per rank.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Topology {
    ranks: u32,
    global_experts: u32,
    local_experts: u32,
}

impl Topology {
    /// Builds a topology, checking `global_experts % local_experts == 0`
    /// and that expert ownership tiles evenly across ranks.
    pub fn new(ranks: u32, global_experts: u32, local_experts: u32) -> Result<Self, DispatchError> {
        if ranks == 0 || global_experts == 0 || local_experts == 0 {
            return Err(ParameterError::NonPositiveCount {
                field: "ranks/global_experts/local_experts",
            }
            .into());
        }
        if global_experts % local_experts != 0 {
            return Err(ParameterError::InvalidTopology {
                ranks,
                global_experts,
                local_experts,
            }
            .into());
        }
        let owners = global_experts / local_experts;
        if owners != ranks {
            // mixed-EP topologies are allowed as long as experts still
            // tile evenly across the rank count; only the "every rank
            // owns experts" assumption in Pure EP requires owners == ranks.
            if global_experts % ranks != 0 {
                return Err(ParameterError::InvalidTopology {
                    ranks,
                    global_experts,
                    local_experts,
                }
                .into());
            }
        }
        Ok(Self {
            ranks,
            global_experts,
            local_experts,
        })
    }

    pub fn ranks(&self) -> u32 {
        self.ranks
    }

    pub fn global_experts(&self) -> u32 {
        self.global_experts
    }

    pub fn local_experts(&self) -> u32 {
        self.local_experts
    }

    /// The rank that owns global expert `e`: `e / L`.
    pub fn expert_owner(&self, e: u32) -> u32 {
        e / self.local_experts
    }

    /// `e`'s index among the experts local to its owner: `e mod L`.
    pub fn local_expert_index(&self, e: u32) -> u32 {
        e % self.local_experts
    }

    /// Pure EP holds when `R = E / L`: every rank holds the full token
    /// batch and a token's sender is determined solely by
    /// `token_idx mod R`.
    pub fn is_pure_ep(&self) -> bool {
        self.ranks == self.global_experts / self.local_experts
    }

    /// In Pure EP mode, the single rank responsible for sending `token_idx`.
    pub fn pure_ep_owner(&self, token_idx: u64) -> u32 {
        (token_idx % self.ranks as u64) as u32
    }
}
