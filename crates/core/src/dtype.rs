//! Dtype rules shared by every operator.
//!
//! Operands arrive in any float dtype and host kernels accumulate in `f32`
//! (see [`crate::host`]). [`promote`] settles the result dtype of mixed-dtype
//! binary operators.

use candle_core::DType;

use crate::error::{OpError, Result};

/// Float dtypes accepted by the float kernels.
pub const FLOAT_DTYPES: [DType; 4] = [DType::F16, DType::BF16, DType::F32, DType::F64];

pub fn is_float(dtype: DType) -> bool {
    FLOAT_DTYPES.contains(&dtype)
}

/// Rejects non-float dtypes with a descriptive error.
pub fn ensure_float(dtype: DType, what: &str) -> Result<()> {
    if is_float(dtype) {
        Ok(())
    } else {
        Err(OpError::dtype(format!(
            "{what} must be a float tensor (f16, bf16, f32, f64), got {dtype:?}"
        )))
    }
}

/// Result dtype of a binary operator over two float dtypes.
///
/// The wider type wins; `f16` combined with `bf16` widens to `f32` because
/// neither half format represents the other.
pub fn promote(lhs: DType, rhs: DType) -> Result<DType> {
    ensure_float(lhs, "lhs")?;
    ensure_float(rhs, "rhs")?;
    if lhs == rhs {
        return Ok(lhs);
    }
    let rank = |dtype: DType| match dtype {
        DType::F64 => 3,
        DType::F32 => 2,
        _ => 1,
    };
    let promoted = match (rank(lhs), rank(rhs)) {
        (1, 1) => DType::F32,
        (a, b) if a >= b => lhs,
        _ => rhs,
    };
    Ok(promoted)
}
