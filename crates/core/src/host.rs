//! Host staging between candle tensors and the `f32` buffers kernels work on.
//!
//! Out-of-place operators read their operands into flat host vectors, run the
//! kernel, then rebuild a tensor in the requested dtype on the caller's
//! device. In-place operators instead receive the `CpuStorage` directly from
//! candle and go through [`with_f32_slice_mut`].
//!
//! Every kernel computes in `f32`. Half operands widen losslessly; `f64`
//! operands are narrowed to `f32` for the kernel and widened on write-back, so
//! `f64` results carry `f32` precision.

use candle_core::{backend::BackendStorage, CpuStorage, DType, Device, DeviceLocation, Layout, Tensor};
use half::{bf16, f16};

use crate::error::{OpError, Result};

/// Reads any float tensor as a flat `f32` vector.
pub fn read_f32(tensor: &Tensor) -> Result<Vec<f32>> {
    let flat = tensor.flatten_all()?;
    let flat = if flat.dtype() == DType::F32 {
        flat
    } else {
        flat.to_dtype(DType::F32)?
    };
    Ok(flat.to_vec1::<f32>()?)
}

/// Reads an integer tensor (positions, offsets, block tables) as `i64`.
pub fn read_indices(tensor: &Tensor, name: &str) -> Result<Vec<i64>> {
    if !tensor.dtype().is_int() {
        return Err(OpError::dtype(format!(
            "{name} must be an integer tensor, got {:?}",
            tensor.dtype()
        )));
    }
    let flat = tensor.flatten_all()?;
    let flat = if flat.dtype() == DType::I64 {
        flat
    } else {
        flat.to_dtype(DType::I64)?
    };
    Ok(flat.to_vec1::<i64>()?)
}

/// Builds a tensor of `dtype` on `device` from a host `f32` buffer.
pub fn write_f32(data: Vec<f32>, dims: &[usize], dtype: DType, device: &Device) -> Result<Tensor> {
    let staged = Tensor::from_vec(data, dims, &Device::Cpu)?;
    let staged = if dtype == DType::F32 {
        staged
    } else {
        staged.to_dtype(dtype)?
    };
    if device.is_cpu() {
        Ok(staged)
    } else {
        log::debug!("host staging: uploading {:?} result to {:?}", dims, device.location());
        Ok(staged.to_device(device)?)
    }
}

/// Stable textual identifier for a device, used in cache keys.
pub fn device_key(device: &Device) -> String {
    match device.location() {
        DeviceLocation::Cpu => "cpu".to_owned(),
        DeviceLocation::Cuda { gpu_id } => format!("cuda{gpu_id}"),
        DeviceLocation::Metal { gpu_id } => format!("metal{gpu_id}"),
    }
}

/// Start/end offsets of a contiguous layout, or an error naming the op.
pub fn contiguous_range(layout: &Layout, op: &'static str) -> candle_core::Result<(usize, usize)> {
    layout.contiguous_offsets().ok_or_else(|| {
        candle_core::Error::Msg(format!("{op}: in-place operand must be contiguous"))
    })
}

/// Runs `f` over an `f32` view of a contiguous float storage and writes the
/// result back in the storage's own dtype.
///
/// `f32` storage is mutated directly; half and `f64` storages round-trip
/// through a temporary `f32` buffer, which narrows `f64` values.
pub fn with_f32_slice_mut<F>(
    storage: &mut CpuStorage,
    layout: &Layout,
    op: &'static str,
    f: F,
) -> candle_core::Result<()>
where
    F: FnOnce(&mut [f32]) -> candle_core::Result<()>,
{
    let (start, end) = contiguous_range(layout, op)?;
    match storage {
        CpuStorage::F32(values) => f(&mut values[start..end]),
        CpuStorage::F16(values) => {
            let slice = &mut values[start..end];
            let mut buf: Vec<f32> = slice.iter().map(|v| v.to_f32()).collect();
            f(&mut buf)?;
            for (dst, src) in slice.iter_mut().zip(buf) {
                *dst = f16::from_f32(src);
            }
            Ok(())
        }
        CpuStorage::BF16(values) => {
            let slice = &mut values[start..end];
            let mut buf: Vec<f32> = slice.iter().map(|v| v.to_f32()).collect();
            f(&mut buf)?;
            for (dst, src) in slice.iter_mut().zip(buf) {
                *dst = bf16::from_f32(src);
            }
            Ok(())
        }
        CpuStorage::F64(values) => {
            let slice = &mut values[start..end];
            let mut buf: Vec<f32> = slice.iter().map(|&v| v as f32).collect();
            f(&mut buf)?;
            for (dst, src) in slice.iter_mut().zip(buf) {
                *dst = src as f64;
            }
            Ok(())
        }
        other => Err(candle_core::Error::Msg(format!(
            "{op}: unsupported dtype {:?}",
            other.dtype()
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn staging_preserves_values_and_dtype() -> Result<()> {
        let t = Tensor::from_vec(vec![1.0f32, -2.0, 3.5, 4.25], (2, 2), &Device::Cpu)?
            .to_dtype(DType::BF16)?;
        let data = read_f32(&t)?;
        assert_eq!(data, vec![1.0, -2.0, 3.5, 4.25]);
        let back = write_f32(data, t.dims(), DType::BF16, &Device::Cpu)?;
        assert_eq!(back.dtype(), DType::BF16);
        assert_eq!(back.dims(), &[2, 2]);
        Ok(())
    }

    #[test]
    fn f64_in_place_updates_carry_f32_precision() -> Result<()> {
        let fine = 1.0 + 1e-12;
        let mut storage = CpuStorage::F64(vec![fine, 0.5]);
        let layout = Layout::contiguous(2);
        with_f32_slice_mut(&mut storage, &layout, "scale", |values| {
            values.iter_mut().for_each(|v| *v *= 2.0);
            Ok(())
        })?;
        let CpuStorage::F64(values) = storage else {
            panic!("storage changed dtype");
        };
        // 1 + 1e-12 is not representable in f32
        assert_eq!(values, vec![2.0, 1.0]);
        Ok(())
    }

    #[test]
    fn index_reads_reject_floats() -> Result<()> {
        let ids = Tensor::from_vec(vec![3u32, 0, 7], 3, &Device::Cpu)?;
        assert_eq!(read_indices(&ids, "ids")?, vec![3, 0, 7]);
        let floats = Tensor::zeros(3, DType::F32, &Device::Cpu)?;
        assert!(read_indices(&floats, "ids").is_err());
        Ok(())
    }

    #[test]
    fn transposed_views_are_read_in_logical_order() -> Result<()> {
        let t = Tensor::from_vec(vec![1.0f32, 2.0, 3.0, 4.0, 5.0, 6.0], (2, 3), &Device::Cpu)?;
        assert_eq!(read_f32(&t.t()?)?, vec![1.0, 4.0, 2.0, 5.0, 3.0, 6.0]);
        Ok(())
    }
}
