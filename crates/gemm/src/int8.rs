//! int8 operand encoding and symmetric quantizers.
//!
//! candle has no `i8` dtype. int8 operands are either `U8` tensors whose bytes
//! are two's-complement `i8` values or `I64` tensors whose values already lie
//! in `[-128, 127]`. Quantizers emit the `U8` form.

use candle_core::{DType, Device, Tensor};
use opkit_core::{dtype::ensure_float, host::read_f32, OpError, Result};

/// Largest magnitude produced by the symmetric quantizers.
pub const QMAX: f32 = 127.0;

/// Reads an int8 operand as signed bytes.
pub fn decode_int8(tensor: &Tensor, name: &str) -> Result<Vec<i8>> {
    let flat = tensor.flatten_all()?;
    match flat.dtype() {
        DType::U8 => Ok(flat.to_vec1::<u8>()?.into_iter().map(|b| b as i8).collect()),
        DType::I64 => flat
            .to_vec1::<i64>()?
            .into_iter()
            .map(|v| {
                i8::try_from(v).map_err(|_| {
                    OpError::dtype(format!("{name} holds {v}, outside the int8 range"))
                })
            })
            .collect(),
        other => Err(OpError::dtype(format!(
            "{name} must be an int8 tensor (u8 bytes or i64 values), got {other:?}"
        ))),
    }
}

/// Packs signed bytes into a `U8` tensor.
pub fn encode_int8(values: &[i8], dims: &[usize], device: &Device) -> Result<Tensor> {
    let bytes: Vec<u8> = values.iter().map(|&v| v as u8).collect();
    Ok(Tensor::from_vec(bytes, dims, device)?)
}

/// Quantizes each `width`-wide row with scale `max|row| / 127`; all-zero rows
/// get scale 1.
fn quantize_rows(values: &[f32], width: usize) -> (Vec<i8>, Vec<f32>) {
    let mut quantized = Vec::with_capacity(values.len());
    let mut scales = Vec::with_capacity(values.len() / width.max(1));
    for row in values.chunks(width.max(1)) {
        let amax = row.iter().fold(0.0f32, |acc, v| acc.max(v.abs()));
        let scale = if amax > 0.0 { amax / QMAX } else { 1.0 };
        quantized.extend(row.iter().map(|v| (v / scale).round().clamp(-QMAX, QMAX) as i8));
        scales.push(scale);
    }
    (quantized, scales)
}

/// Per-token quantization of `x` (`[.., K]`): returns `xq` with the same dims
/// and an `F32` scale shaped `[.., 1]`.
pub fn quantize_per_token(x: &Tensor) -> Result<(Tensor, Tensor)> {
    ensure_float(x.dtype(), "x")?;
    let dims = x.dims().to_vec();
    let Some(&width) = dims.last() else {
        return Err(OpError::shape("x must have at least one dim"));
    };
    let (q, scales) = quantize_rows(&read_f32(x)?, width);
    let mut scale_dims = dims.clone();
    if let Some(last) = scale_dims.last_mut() {
        *last = 1;
    }
    Ok((
        encode_int8(&q, &dims, x.device())?,
        Tensor::from_vec(scales, scale_dims, x.device())?,
    ))
}

/// Per-output-channel quantization of weights `w` (`[B, N, K]`): returns
/// `wq` and an `F32` scale shaped `[B, 1, N]`.
pub fn quantize_per_channel(w: &Tensor) -> Result<(Tensor, Tensor)> {
    ensure_float(w.dtype(), "w")?;
    let (b, n, k) = w.dims3().map_err(|_| OpError::shape(format!("w must be [B, N, K], got {:?}", w.dims())))?;
    let (q, scales) = quantize_rows(&read_f32(w)?, k);
    Ok((
        encode_int8(&q, &[b, n, k], w.device())?,
        Tensor::from_vec(scales, (b, 1, n), w.device())?,
    ))
}
