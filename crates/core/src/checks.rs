//! Shape, dtype and device assertions shared by operator entry points.
//!
//! Each helper returns [`OpError`] with the operand name embedded so callers
//! can propagate with `?` and still tell the user which argument was wrong.

use candle_core::{DType, Tensor};

use crate::error::{OpError, Result};

/// Returns the dims of `tensor` after checking its rank.
pub fn expect_rank<'a>(tensor: &'a Tensor, rank: usize, name: &str) -> Result<&'a [usize]> {
    let dims = tensor.dims();
    if dims.len() == rank {
        Ok(dims)
    } else {
        Err(OpError::shape(format!(
            "{name} must have rank {rank}, got shape {dims:?}"
        )))
    }
}

/// Ensures a tensor matches the expected dimensions exactly.
pub fn expect_shape(tensor: &Tensor, expected: &[usize], name: &str) -> Result<()> {
    let actual = tensor.dims();
    if actual == expected {
        Ok(())
    } else {
        Err(OpError::shape(format!(
            "{name}: expected shape {expected:?}, got {actual:?}"
        )))
    }
}

/// Checks the tensor dtype is one of the allowed values.
pub fn expect_dtype_in(tensor: &Tensor, allowed: &[DType], name: &str) -> Result<()> {
    let dtype = tensor.dtype();
    if allowed.contains(&dtype) {
        Ok(())
    } else {
        Err(OpError::dtype(format!(
            "{name}: expected dtype in {allowed:?}, got {dtype:?}"
        )))
    }
}

/// Integer dtypes accepted for index-like operands (positions, block tables).
pub fn expect_index_dtype(tensor: &Tensor, name: &str) -> Result<()> {
    expect_dtype_in(tensor, &[DType::U8, DType::U32, DType::I64], name)
}

pub fn expect_same_device(tensors: &[(&Tensor, &str)]) -> Result<()> {
    let Some(((first, first_name), rest)) = tensors.split_first() else {
        return Ok(());
    };
    for (tensor, name) in rest {
        if !first.device().same_device(tensor.device()) {
            return Err(OpError::shape(format!(
                "{name} must reside on the same device as {first_name}"
            )));
        }
    }
    Ok(())
}

/// Checks that `dims[axis]` equals `expected`.
pub fn expect_dim(dims: &[usize], axis: usize, expected: usize, name: &str) -> Result<()> {
    match dims.get(axis) {
        Some(&actual) if actual == expected => Ok(()),
        Some(&actual) => Err(OpError::shape(format!(
            "{name}: dim {axis} must be {expected}, got {actual} (shape {dims:?})"
        ))),
        None => Err(OpError::shape(format!(
            "{name}: missing dim {axis} (shape {dims:?})"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn rank_and_dim_checks_name_the_operand() {
        let t = Tensor::zeros((2, 3, 4), DType::F32, &Device::Cpu).unwrap();
        assert_eq!(expect_rank(&t, 3, "x").unwrap(), &[2, 3, 4]);
        let err = expect_rank(&t, 4, "query").unwrap_err().to_string();
        assert!(err.contains("query"), "{err}");
        assert!(expect_dim(t.dims(), 1, 3, "x").is_ok());
        assert!(expect_dim(t.dims(), 5, 3, "x").is_err());
    }

    #[test]
    fn dtype_checks_reject_unlisted_types() {
        let t = Tensor::zeros(4, DType::F16, &Device::Cpu).unwrap();
        assert!(expect_dtype_in(&t, &[DType::F16, DType::BF16], "x").is_ok());
        assert!(expect_index_dtype(&t, "positions").is_err());
    }
}
