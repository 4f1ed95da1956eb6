//! Pointwise activations evaluated in `f32` (`f64` for `f64` inputs).
//!
//! * **sigmoid** `1 / (1 + exp(-x))`
//! * **tanh**
//! * **gelu_tanh** `0.5 * x * (1 + tanh(sqrt(2/pi) * (x + 0.044715 * x^3)))`,
//!   the approximation used by GPT-style feed-forward blocks.

use candle_core::{backend::BackendStorage, CpuStorage, CustomOp1, Device, Layout, Shape, Tensor};
use half::{bf16, f16};
use opkit_core::{dtype::ensure_float, host::contiguous_range, testing::log_call, Result};

const SQRT_2_OVER_PI: f64 = 0.797_884_560_802_865_4;
const GELU_COEFF: f64 = 0.044_715;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryKind {
    Sigmoid,
    Tanh,
    GeluTanh,
}

impl UnaryKind {
    pub fn name(self) -> &'static str {
        match self {
            UnaryKind::Sigmoid => "sigmoid",
            UnaryKind::Tanh => "tanh",
            UnaryKind::GeluTanh => "gelu_tanh",
        }
    }

    #[inline]
    pub fn eval_f32(self, x: f32) -> f32 {
        match self {
            UnaryKind::Sigmoid => 1.0 / (1.0 + (-x).exp()),
            UnaryKind::Tanh => x.tanh(),
            UnaryKind::GeluTanh => {
                let inner = SQRT_2_OVER_PI as f32 * (x + GELU_COEFF as f32 * x * x * x);
                0.5 * x * (1.0 + inner.tanh())
            }
        }
    }

    #[inline]
    pub fn eval_f64(self, x: f64) -> f64 {
        match self {
            UnaryKind::Sigmoid => 1.0 / (1.0 + (-x).exp()),
            UnaryKind::Tanh => x.tanh(),
            UnaryKind::GeluTanh => {
                let inner = SQRT_2_OVER_PI * (x + GELU_COEFF * x * x * x);
                0.5 * x * (1.0 + inner.tanh())
            }
        }
    }
}

struct UnaryOp(UnaryKind);

impl CustomOp1 for UnaryOp {
    fn name(&self) -> &'static str {
        self.0.name()
    }

    fn cpu_fwd(&self, storage: &CpuStorage, layout: &Layout) -> candle_core::Result<(CpuStorage, Shape)> {
        let kind = self.0;
        let (start, end) = contiguous_range(layout, kind.name())?;
        let out = match storage {
            CpuStorage::F32(v) => CpuStorage::F32(v[start..end].iter().map(|&x| kind.eval_f32(x)).collect()),
            CpuStorage::F64(v) => CpuStorage::F64(v[start..end].iter().map(|&x| kind.eval_f64(x)).collect()),
            CpuStorage::F16(v) => CpuStorage::F16(
                v[start..end]
                    .iter()
                    .map(|x| f16::from_f32(kind.eval_f32(x.to_f32())))
                    .collect(),
            ),
            CpuStorage::BF16(v) => CpuStorage::BF16(
                v[start..end]
                    .iter()
                    .map(|x| bf16::from_f32(kind.eval_f32(x.to_f32())))
                    .collect(),
            ),
            other => {
                return Err(candle_core::Error::Msg(format!(
                    "{}: unsupported dtype {:?}",
                    kind.name(),
                    other.dtype()
                )))
            }
        };
        Ok((out, layout.shape().clone()))
    }
}

pub fn unary(kind: UnaryKind, x: &Tensor) -> Result<Tensor> {
    log_call(kind.name(), &[("x", x)]);
    ensure_float(x.dtype(), "x")?;
    let staged = x.to_device(&Device::Cpu)?.contiguous()?;
    let out = staged.apply_op1_no_bwd(&UnaryOp(kind))?;
    if x.device().is_cpu() {
        Ok(out)
    } else {
        Ok(out.to_device(x.device())?)
    }
}

pub fn sigmoid(x: &Tensor) -> Result<Tensor> {
    unary(UnaryKind::Sigmoid, x)
}

pub fn tanh(x: &Tensor) -> Result<Tensor> {
    unary(UnaryKind::Tanh, x)
}

pub fn gelu_tanh(x: &Tensor) -> Result<Tensor> {
    unary(UnaryKind::GeluTanh, x)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::DType;
    use opkit_core::OpError;

    #[test]
    fn sigmoid_matches_candle_reference() -> Result<()> {
        let input = Tensor::from_slice(&[-3.0f32, -1.0, 0.0, 0.5, 2.0], (5,), &Device::Cpu)?;
        let ours = sigmoid(&input)?;
        let one = Tensor::ones_like(&input)?;
        let reference = one.broadcast_div(&(input.neg()?.exp()? + 1.0)?)?;
        let diff = ours.sub(&reference)?.abs()?.max_all()?.to_vec0::<f32>()?;
        assert!(diff < 1e-6);
        Ok(())
    }

    #[test]
    fn gelu_tanh_agrees_with_candle_gelu() -> Result<()> {
        let input = Tensor::from_slice(&[-2.5f32, -0.5, 0.0, 1.0, 3.0], (5,), &Device::Cpu)?;
        let ours = gelu_tanh(&input)?;
        let reference = input.gelu()?;
        let diff = ours.sub(&reference)?.abs()?.max_all()?.to_vec0::<f32>()?;
        assert!(diff < 1e-5, "diff {diff}");
        Ok(())
    }

    #[test]
    fn half_inputs_keep_their_dtype() -> Result<()> {
        let input = Tensor::from_slice(&[0.25f32, -4.0], (2,), &Device::Cpu)?.to_dtype(DType::BF16)?;
        let out = tanh(&input)?;
        assert_eq!(out.dtype(), DType::BF16);
        let values = out.to_dtype(DType::F32)?.to_vec1::<f32>()?;
        assert!((values[0] - 0.25f32.tanh()).abs() < 1e-2);
        Ok(())
    }

    #[test]
    fn integer_inputs_are_rejected() -> Result<()> {
        let input = Tensor::from_slice(&[1u32, 2], (2,), &Device::Cpu)?;
        assert!(matches!(sigmoid(&input), Err(OpError::UnsupportedDType { .. })));
        Ok(())
    }
}
