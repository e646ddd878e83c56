//! FP8 E4M3 staging.
//!
//! Real NVSHMEM kernels do this conversion in registers, warp-cooperatively.
//! Here it's a scalar per-channel pass; the *numerics* (amax, saturating
//! round, scale/scale_inv pair) are what actually matters for correctness,
//! so those are preserved exactly.

use half::bf16;

/// 1 sign bit, 4 exponent bits, 3 mantissa bits, bias 7. Max finite magnitude 448.0.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fp8E4M3(pub u8);

const E4M3_MAX: f32 = 448.0;
const E4M3_EXP_BIAS: i32 = 7;
const E4M3_MANTISSA_BITS: u32 = 3;

impl Fp8E4M3 {
    /// Saturating convert from f32. Values beyond ±448 clamp to ±448;
    /// NaN maps to the largest-magnitude value with the input's sign.
    pub fn from_f32_saturating(value: f32) -> Self {
        if value.is_nan() {
            return Self(if value.is_sign_negative() { 0xFB } else { 0x7B });
        }
        let sign = if value.is_sign_negative() { 1u8 } else { 0u8 };
        let mag = value.abs().min(E4M3_MAX);
        if mag == 0.0 {
            return Self(sign << 7);
        }
        let exp = mag.log2().floor() as i32;
        let biased_exp = (exp + E4M3_EXP_BIAS).clamp(0, 0b1111);
        let scale = 2f32.powi(biased_exp - E4M3_EXP_BIAS);
        let mantissa_frac = (mag / scale - 1.0).clamp(0.0, 0.999_999);
        let mantissa = (mantissa_frac * (1 << E4M3_MANTISSA_BITS) as f32).round() as u8;
        let mantissa = mantissa.min((1 << E4M3_MANTISSA_BITS) - 1);
        Self((sign << 7) | ((biased_exp as u8) << E4M3_MANTISSA_BITS) | mantissa)
    }

    pub fn to_f32(self) -> f32 {
        let bits = self.0;
        let sign = if bits & 0x80 != 0 { -1.0 } else { 1.0 };
        let biased_exp = (bits >> E4M3_MANTISSA_BITS) & 0b1111;
        let mantissa = bits & 0b111;
        if biased_exp == 0 && mantissa == 0 {
            return sign * 0.0;
        }
        let exp = biased_exp as i32 - E4M3_EXP_BIAS;
        let frac = 1.0 + mantissa as f32 / (1 << E4M3_MANTISSA_BITS) as f32;
        sign * frac * 2f32.powi(exp)
    }
}

/// Per-128-channel amax/scale derivation. `channel` is a
/// slice of `FP8_CHANNEL_WIDTH` bf16 values from one token's payload.
pub fn channel_amax(channel: &[bf16]) -> f32 {
    channel
        .iter()
        .map(|v| v.to_f32().abs())
        .fold(0.0f32, f32::max)
}

/// Derives `(scale, scale_inv)` so that `value * scale` lands inside the
/// FP8 E4M3 representable range, and `value * scale * scale_inv == value`
/// (within fp32 rounding).
pub fn derive_scale(amax: f32) -> (f32, f32) {
    if amax <= 0.0 {
        return (1.0, 1.0);
    }
    let scale = E4M3_MAX / amax;
    (scale, 1.0 / scale)
}

/// Converts one channel of bf16 values to FP8 using the given scale, writing
/// into `out` (must be the same length as `channel`).
pub fn quantize_channel(channel: &[bf16], scale: f32, out: &mut [Fp8E4M3]) {
    debug_assert_eq!(channel.len(), out.len());
    for (src, dst) in channel.iter().zip(out.iter_mut()) {
        *dst = Fp8E4M3::from_f32_saturating(src.to_f32() * scale);
    }
}

/// Converts a channel of FP8 bytes back to bf16 using `scale_inv`.
pub fn dequantize_channel(channel: &[Fp8E4M3], scale_inv: f32, out: &mut [bf16]) {
    debug_assert_eq!(channel.len(), out.len());
    for (src, dst) in channel.iter().zip(out.iter_mut()) {
        *dst = bf16::from_f32(src.to_f32() * scale_inv);
    }
}

/// Packs a `float` scale into the UE8M0 representation (unsigned 8-bit
/// power-of-two exponent only, no mantissa): `round(log2(scale))`, clamped
/// to `[0, 255]` and biased so 0 means `2^-127`.
pub fn pack_ue8m0(scale: f32) -> u8 {
    if scale <= 0.0 {
        return 0;
    }
    let exp = scale.log2().round().clamp(-127.0, 128.0);
    (exp + 127.0) as u8
}

pub fn unpack_ue8m0(packed: u8) -> f32 {
    2f32.powi(packed as i32 - 127)
}
