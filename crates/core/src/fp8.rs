//! FP8 E4M3 (OCP "fn" flavour) codec used for quantized KV caches and
//! fp8 attention outputs.
//!
//! Layout: 1 sign bit, 4 exponent bits (bias 7), 3 mantissa bits. There are
//! no infinities; `S.1111.111` is NaN and the largest finite magnitude is 448.
//! Encoding saturates instead of overflowing.

/// Largest finite E4M3 magnitude.
pub const E4M3_MAX: f32 = 448.0;

const NAN_BITS: u8 = 0x7F;
const MAX_BITS: u8 = 0x7E;

pub fn e4m3_to_f32(bits: u8) -> f32 {
    let sign = if bits & 0x80 != 0 { -1.0f32 } else { 1.0 };
    let exp = ((bits >> 3) & 0x0F) as i32;
    let man = (bits & 0x07) as f32;
    if exp == 0x0F && bits & 0x07 == 0x07 {
        return f32::NAN;
    }
    if exp == 0 {
        sign * man * 2f32.powi(-9)
    } else {
        sign * (1.0 + man / 8.0) * 2f32.powi(exp - 7)
    }
}

/// Round-to-nearest-even encode with saturation to ±448.
pub fn f32_to_e4m3(value: f32) -> u8 {
    if value.is_nan() {
        return NAN_BITS;
    }
    let sign = if value.is_sign_negative() { 0x80u8 } else { 0 };
    let magnitude = value.abs().min(E4M3_MAX);

    if magnitude < 2f32.powi(-6) {
        // Subnormal range: uniform steps of 2^-9; a carry into 8 lands exactly
        // on the smallest normal encoding.
        let steps = (magnitude * 2f32.powi(9)).round_ties_even() as u8;
        return sign | steps;
    }

    let mut exponent = ((magnitude.to_bits() >> 23) & 0xFF) as i32 - 127;
    let mantissa = magnitude / 2f32.powi(exponent) - 1.0;
    let mut quantized = (mantissa * 8.0).round_ties_even() as u32;
    if quantized == 8 {
        exponent += 1;
        quantized = 0;
    }
    let biased = exponent + 7;
    if biased > 15 || (biased == 15 && quantized >= 7) {
        return sign | MAX_BITS;
    }
    sign | ((biased as u8) << 3) | quantized as u8
}

/// Dequantizes a byte slice with a per-tensor scale.
pub fn decode_scaled(bytes: &[u8], scale: f32) -> Vec<f32> {
    bytes.iter().map(|&b| e4m3_to_f32(b) * scale).collect()
}

/// Quantizes `values / scale` into E4M3 bytes.
pub fn encode_scaled(values: &[f32], scale: f32) -> Vec<u8> {
    let inv = 1.0 / scale;
    values.iter().map(|&v| f32_to_e4m3(v * inv)).collect()
}
