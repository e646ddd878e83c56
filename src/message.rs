//! Wire message codec.
//!
//! On the wire: `header (16 B) || payload`. The first 4 bytes of the header
//! are the sender's source token index; the remaining 12 are reserved and
//! kept zeroed.

use half::bf16;

use crate::config::FP8_CHANNEL_WIDTH;
use crate::fp8::Fp8E4M3;

pub const HEADER_BYTES: usize = 16;

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, bytemuck::Pod, bytemuck::Zeroable)]
pub struct MessageHeader {
    pub source_token_index: u32,
    _reserved: [u8; 12],
}

impl MessageHeader {
    pub fn new(source_token_index: u32) -> Self {
        Self {
            source_token_index,
            _reserved: [0; 12],
        }
    }

    pub fn encode(&self) -> [u8; HEADER_BYTES] {
        let mut buf = [0u8; HEADER_BYTES];
        buf.copy_from_slice(bytemuck::bytes_of(self));
        buf
    }

    pub fn decode(bytes: &[u8; HEADER_BYTES]) -> Self {
        *bytemuck::from_bytes(bytes)
    }
}

/// Payload carried after the header. `Bf16` is the always-available case;
/// `Fp8` additionally carries one scale per [`FP8_CHANNEL_WIDTH`]-wide
/// channel, in either plain-float or packed-UE8M0 form.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Bf16(Vec<bf16>),
    Fp8 {
        values: Vec<Fp8E4M3>,
        scales: ScaleVec,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub enum ScaleVec {
    Float(Vec<f32>),
    PackedUe8m0(Vec<u8>),
}

impl Payload {
    pub fn hidden_dim(&self) -> usize {
        match self {
            Payload::Bf16(v) => v.len(),
            Payload::Fp8 { values, .. } => values.len(),
        }
    }

    pub fn num_scale_channels(hidden_dim: usize) -> usize {
        hidden_dim.div_ceil(FP8_CHANNEL_WIDTH as usize)
    }
}

/// One dispatch or combine message: header plus payload.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub header: MessageHeader,
    pub payload: Payload,
}

impl Message {
    pub fn new_bf16(source_token_index: u32, payload: Vec<bf16>) -> Self {
        Self {
            header: MessageHeader::new(source_token_index),
            payload: Payload::Bf16(payload),
        }
    }

    /// Approximate wire size in bytes, used for slot-region sizing.
    pub fn wire_size(hidden_dim: usize, fp8: bool, ue8m0: bool) -> usize {
        let payload_bytes = if fp8 {
            let scale_bytes = if ue8m0 { 1 } else { 4 };
            hidden_dim + Payload::num_scale_channels(hidden_dim) * scale_bytes
        } else {
            hidden_dim * 2
        };
        HEADER_BYTES + payload_bytes
    }
}
