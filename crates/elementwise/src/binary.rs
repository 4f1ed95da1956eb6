//! Broadcasting arithmetic (`add`, `sub`, `mul`, `div`) and their in-place
//! forms.
//!
//! Out-of-place operators broadcast both operands to the common shape, promote
//! them to a shared float dtype and run a contiguous [`CustomOp2`]. In-place
//! operators cast and broadcast the right-hand side to the target and mutate
//! the target's CPU storage through [`InplaceOp2`].

use candle_core::{CpuStorage, CustomOp2, Device, InplaceOp2, Layout, Shape, Tensor};
use half::{bf16, f16};
use opkit_core::{
    checks::expect_same_device,
    dtype::{ensure_float, promote},
    host::contiguous_range,
    testing::log_call,
    OpError, Result,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryKind {
    Add,
    Sub,
    Mul,
    Div,
}

impl BinaryKind {
    pub fn name(self) -> &'static str {
        match self {
            BinaryKind::Add => "add",
            BinaryKind::Sub => "sub",
            BinaryKind::Mul => "mul",
            BinaryKind::Div => "div",
        }
    }

    pub fn inplace_name(self) -> &'static str {
        match self {
            BinaryKind::Add => "add_",
            BinaryKind::Sub => "sub_",
            BinaryKind::Mul => "mul_",
            BinaryKind::Div => "div_",
        }
    }

    #[inline]
    fn eval_f32(self, a: f32, b: f32) -> f32 {
        match self {
            BinaryKind::Add => a + b,
            BinaryKind::Sub => a - b,
            BinaryKind::Mul => a * b,
            BinaryKind::Div => a / b,
        }
    }

    #[inline]
    fn eval_f64(self, a: f64, b: f64) -> f64 {
        match self {
            BinaryKind::Add => a + b,
            BinaryKind::Sub => a - b,
            BinaryKind::Mul => a * b,
            BinaryKind::Div => a / b,
        }
    }
}

struct BinaryOp(BinaryKind);

fn zip_map<T: Copy, U>(lhs: &[T], rhs: &[T], f: impl Fn(T, T) -> U) -> Vec<U> {
    lhs.iter().zip(rhs).map(|(&a, &b)| f(a, b)).collect()
}

fn zip_assign<T: Copy>(dst: &mut [T], src: &[T], f: impl Fn(T, T) -> T) {
    for (d, &s) in dst.iter_mut().zip(src) {
        *d = f(*d, s);
    }
}

fn dtype_mismatch(op: &str) -> candle_core::Error {
    candle_core::Error::Msg(format!("{op}: operands must share one float dtype"))
}

impl CustomOp2 for BinaryOp {
    fn name(&self) -> &'static str {
        self.0.name()
    }

    fn cpu_fwd(
        &self,
        s1: &CpuStorage,
        l1: &Layout,
        s2: &CpuStorage,
        l2: &Layout,
    ) -> candle_core::Result<(CpuStorage, Shape)> {
        let kind = self.0;
        let (a0, a1) = contiguous_range(l1, kind.name())?;
        let (b0, b1) = contiguous_range(l2, kind.name())?;
        let out = match (s1, s2) {
            (CpuStorage::F32(a), CpuStorage::F32(b)) => {
                CpuStorage::F32(zip_map(&a[a0..a1], &b[b0..b1], |x, y| kind.eval_f32(x, y)))
            }
            (CpuStorage::F64(a), CpuStorage::F64(b)) => {
                CpuStorage::F64(zip_map(&a[a0..a1], &b[b0..b1], |x, y| kind.eval_f64(x, y)))
            }
            (CpuStorage::F16(a), CpuStorage::F16(b)) => CpuStorage::F16(zip_map(
                &a[a0..a1],
                &b[b0..b1],
                |x, y| f16::from_f32(kind.eval_f32(x.to_f32(), y.to_f32())),
            )),
            (CpuStorage::BF16(a), CpuStorage::BF16(b)) => CpuStorage::BF16(zip_map(
                &a[a0..a1],
                &b[b0..b1],
                |x, y| bf16::from_f32(kind.eval_f32(x.to_f32(), y.to_f32())),
            )),
            _ => return Err(dtype_mismatch(kind.name())),
        };
        Ok((out, l1.shape().clone()))
    }
}

impl InplaceOp2 for BinaryOp {
    fn name(&self) -> &'static str {
        self.0.inplace_name()
    }

    fn cpu_fwd(
        &self,
        s1: &mut CpuStorage,
        l1: &Layout,
        s2: &CpuStorage,
        l2: &Layout,
    ) -> candle_core::Result<()> {
        let kind = self.0;
        let (a0, a1) = contiguous_range(l1, kind.inplace_name())?;
        let (b0, b1) = contiguous_range(l2, kind.inplace_name())?;
        match (s1, s2) {
            (CpuStorage::F32(a), CpuStorage::F32(b)) => {
                zip_assign(&mut a[a0..a1], &b[b0..b1], |x, y| kind.eval_f32(x, y))
            }
            (CpuStorage::F64(a), CpuStorage::F64(b)) => {
                zip_assign(&mut a[a0..a1], &b[b0..b1], |x, y| kind.eval_f64(x, y))
            }
            (CpuStorage::F16(a), CpuStorage::F16(b)) => zip_assign(&mut a[a0..a1], &b[b0..b1], |x, y| {
                f16::from_f32(kind.eval_f32(x.to_f32(), y.to_f32()))
            }),
            (CpuStorage::BF16(a), CpuStorage::BF16(b)) => {
                zip_assign(&mut a[a0..a1], &b[b0..b1], |x, y| {
                    bf16::from_f32(kind.eval_f32(x.to_f32(), y.to_f32()))
                })
            }
            _ => return Err(dtype_mismatch(kind.inplace_name())),
        }
        Ok(())
    }
}

/// Out-of-place broadcasting arithmetic.
pub fn binary(kind: BinaryKind, a: &Tensor, b: &Tensor) -> Result<Tensor> {
    log_call(kind.name(), &[("a", a), ("b", b)]);
    expect_same_device(&[(a, "a"), (b, "b")])?;
    let dtype = promote(a.dtype(), b.dtype())?;
    let shape = a
        .shape()
        .broadcast_shape_binary_op(b.shape(), kind.name())
        .map_err(|_| {
            OpError::shape(format!(
                "{}: shapes {:?} and {:?} do not broadcast",
                kind.name(),
                a.dims(),
                b.dims()
            ))
        })?;

    let stage = |t: &Tensor| -> Result<Tensor> {
        Ok(t
            .to_device(&Device::Cpu)?
            .to_dtype(dtype)?
            .broadcast_as(shape.clone())?
            .contiguous()?)
    };
    let lhs = stage(a)?;
    let rhs = stage(b)?;
    let out = lhs.apply_op2_no_bwd(&rhs, &BinaryOp(kind))?;

    let device = a.device();
    if device.is_cpu() {
        Ok(out)
    } else {
        log::debug!("{}: uploading result to {:?}", kind.name(), device.location());
        Ok(out.to_device(device)?)
    }
}

/// In-place arithmetic on `a`; returns a handle sharing `a`'s storage.
pub fn binary_(kind: BinaryKind, a: &Tensor, b: &Tensor) -> Result<Tensor> {
    log_call(kind.inplace_name(), &[("a", a), ("b", b)]);
    ensure_float(a.dtype(), "a")?;
    ensure_float(b.dtype(), "b")?;
    if !a.device().is_cpu() {
        return Err(OpError::UnsupportedDevice {
            op: kind.inplace_name(),
        });
    }
    if !a.is_contiguous() {
        return Err(OpError::argument("a", "in-place target must be contiguous"));
    }
    let rhs = b
        .to_device(&Device::Cpu)?
        .to_dtype(a.dtype())?
        .broadcast_as(a.shape().clone())
        .map_err(|_| {
            OpError::shape(format!(
                "{}: {:?} does not broadcast to {:?}",
                kind.inplace_name(),
                b.dims(),
                a.dims()
            ))
        })?
        .contiguous()?;
    a.inplace_op2(&rhs, &BinaryOp(kind))?;
    Ok(a.clone())
}

pub fn add(a: &Tensor, b: &Tensor) -> Result<Tensor> {
    binary(BinaryKind::Add, a, b)
}

pub fn sub(a: &Tensor, b: &Tensor) -> Result<Tensor> {
    binary(BinaryKind::Sub, a, b)
}

pub fn mul(a: &Tensor, b: &Tensor) -> Result<Tensor> {
    binary(BinaryKind::Mul, a, b)
}

pub fn div(a: &Tensor, b: &Tensor) -> Result<Tensor> {
    binary(BinaryKind::Div, a, b)
}

pub fn add_(a: &Tensor, b: &Tensor) -> Result<Tensor> {
    binary_(BinaryKind::Add, a, b)
}

pub fn sub_(a: &Tensor, b: &Tensor) -> Result<Tensor> {
    binary_(BinaryKind::Sub, a, b)
}

pub fn mul_(a: &Tensor, b: &Tensor) -> Result<Tensor> {
    binary_(BinaryKind::Mul, a, b)
}

pub fn div_(a: &Tensor, b: &Tensor) -> Result<Tensor> {
    binary_(BinaryKind::Div, a, b)
}
