//! Launch configuration and environment toggles.

use std::env;

use crate::error::{DispatchError, ParameterError};

/// Maximum number of top-k routing entries a token may carry.
pub const MAX_TOPK: u32 = 9;

/// Channel width used for per-128-channel FP8 amax/scale computation.
pub const FP8_CHANNEL_WIDTH: u32 = 128;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScaleKind {
    Float,
    PackedUe8m0,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fp8Config {
    pub scale_kind: ScaleKind,
}

/// Per-launch configuration: hidden dimension, per-(expert, src-rank) slot
/// capacity, top-k width, and optional FP8 staging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LaunchConfig {
    pub hidden_dim: u32,
    pub slot_capacity: u32,
    pub max_topk: u32,
    pub fp8: Option<Fp8Config>,
    /// The token-drop detector is an O(E·T·K) defensive scan, not a
    /// protocol requirement. Off by default.
    pub enable_token_drop_detector: bool,
    /// Bounded retry budget for spin-polls on counts/flags.
    pub spin_retry_budget: u32,
}

impl LaunchConfig {
    pub fn new(hidden_dim: u32, slot_capacity: u32, max_topk: u32) -> Result<Self, DispatchError> {
        if hidden_dim == 0 || hidden_dim % 128 != 0 || !hidden_dim.is_power_of_two() {
            return Err(ParameterError::UnalignedHiddenDim(hidden_dim).into());
        }
        if max_topk == 0 || max_topk > MAX_TOPK {
            return Err(ParameterError::TopkOutOfRange(max_topk, MAX_TOPK).into());
        }
        if slot_capacity == 0 {
            return Err(ParameterError::NonPositiveCount {
                field: "slot_capacity",
            }
            .into());
        }
        Ok(Self {
            hidden_dim,
            slot_capacity,
            max_topk,
            fp8: None,
            enable_token_drop_detector: false,
            spin_retry_budget: 1 << 20,
        })
    }

    pub fn with_fp8(mut self, scale_kind: ScaleKind) -> Self {
        self.fp8 = Some(Fp8Config { scale_kind });
        self
    }

    pub fn with_token_drop_detector(mut self, enabled: bool) -> Self {
        self.enable_token_drop_detector = enabled;
        self
    }

    pub fn with_spin_retry_budget(mut self, budget: u32) -> Self {
        self.spin_retry_budget = budget;
        self
    }
}

/// Debug toggles read from the environment at [`crate::fabric::Fabric`]
/// construction. Programmatic overrides exist so tests never
/// have to mutate process-global env state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RuntimeToggles {
    /// `DEEPEP_SKIP_GRID_SYNC` — elides the post-send grid sync. Single-node
    /// debug only; never set this when real cross-node senders are in flight.
    pub skip_grid_sync: bool,
    /// `DEEPEP_VERBOSE_DEBUG` — enables per-pair trace logging.
    pub verbose_debug: bool,
}

impl RuntimeToggles {
    pub fn from_env() -> Self {
        Self {
            skip_grid_sync: env_flag("DEEPEP_SKIP_GRID_SYNC"),
            verbose_debug: env_flag("DEEPEP_VERBOSE_DEBUG"),
        }
    }
}

fn env_flag(name: &str) -> bool {
    match env::var(name) {
        Ok(v) => matches!(v.as_str(), "1" | "true" | "TRUE" | "yes"),
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_unaligned_hidden_dim() {
        assert!(LaunchConfig::new(130, 4, 1).is_err());
    }

    #[test]
    fn rejects_topk_out_of_range() {
        assert!(LaunchConfig::new(128, 4, 0).is_err());
        assert!(LaunchConfig::new(128, 4, 10).is_err());
    }

    #[test]
    fn accepts_valid_config() {
        let cfg = LaunchConfig::new(128, 4, 1).unwrap();
        assert_eq!(cfg.hidden_dim, 128);
        assert!(!cfg.enable_token_drop_detector);
    }
}
