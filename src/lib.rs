//! A host-simulated, GPU-free re-creation of a symmetric-heap MoE
//! dispatch/combine exchange: tokens are scattered to the experts their
//! top-k routing picked, and expert outputs are gathered back and
//! weighted-summed, using nothing but atomics and spin-polling over a
//! process-wide "symmetric heap" in place of NVSHMEM/IBGDA.
//!
//! [`fabric::Fabric`] is the entry point: build a [`topology::Topology`]
//! and a [`config::LaunchConfig`], construct a `Fabric`, then drive
//! [`dispatch::dispatch`] and [`combine::combine`] from one thread per
//! rank.

pub mod barrier;
pub mod cleaner;
pub mod combine;
pub mod config;
pub mod count;
pub mod diagnostics;
pub mod dispatch;
pub mod error;
pub mod fabric;
pub mod fp8;
pub mod heap;
pub mod message;
pub mod phases;
pub mod slot;
pub mod state_machine;
pub mod sync_info;
pub mod token;
pub mod topology;
pub mod transport;

pub use config::LaunchConfig;
pub use error::DispatchError;
pub use fabric::Fabric;
pub use phases::Phases;
pub use token::{CombineOutput, TokenInput};
pub use topology::Topology;
