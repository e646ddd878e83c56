//! Host-side token batch representation.
//!
//! Real NVSHMEM kernels read `x`, `topk_idx`, `topk_weights` straight out of
//! device tensors. This crate has no tensor dependency, so a token is just
//! its hidden vector plus routing metadata, `Vec`-backed.

use half::bf16;

use crate::config::MAX_TOPK;

/// One token's hidden-dim activation and its top-k routing decision.
/// `topk` entries beyond `num_topk` (or any `-1` entry) are padding and
/// must be skipped, matching the `topk_idx` padding convention.
#[derive(Debug, Clone, PartialEq)]
pub struct TokenInput {
    pub payload: Vec<bf16>,
    pub topk: Vec<i32>,
    pub topk_weights: Vec<f32>,
}

impl TokenInput {
    pub fn new(payload: Vec<bf16>, topk: Vec<i32>, topk_weights: Vec<f32>) -> Self {
        debug_assert!(topk.len() <= MAX_TOPK as usize);
        debug_assert_eq!(topk.len(), topk_weights.len());
        Self {
            payload,
            topk,
            topk_weights,
        }
    }

    /// Iterates the `(expert, weight)` pairs for non-padding routes.
    pub fn routes(&self) -> impl Iterator<Item = (u32, f32)> + '_ {
        self.topk
            .iter()
            .zip(self.topk_weights.iter())
            .filter(|(e, _)| **e >= 0)
            .map(|(e, w)| (*e as u32, *w))
    }
}

/// Output of [`crate::combine::combine`]: one reconstructed hidden vector
/// per input token, in the same order.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct CombineOutput {
    pub combined: Vec<Vec<bf16>>,
}

impl CombineOutput {
    pub fn empty() -> Self {
        Self {
            combined: Vec::new(),
        }
    }
}
