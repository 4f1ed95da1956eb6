//! Batched int8 GEMM with per-token and per-channel scales.
//!
//! `Y[b, m, n] = (sum_k XQ[b, m, k] * WQ[b, n, k]) * x_scale[b, m] * w_scale[b, n] + bias[n]`
//!
//! The reduction is split into `2^split_k` partitions. Each partition
//! accumulates exactly in `i32`; partial results are scaled and summed in
//! `f32`, so a larger `split_k` changes rounding but never overflows.

use candle_core::{DType, Tensor};
use opkit_core::{
    checks::{expect_rank, expect_same_device, expect_shape},
    dtype::ensure_float,
    host::{read_f32, write_f32},
    testing::log_call,
    OpError, Result,
};
use rayon::prelude::*;

use crate::instances::{heuristic, instance, KernelInstance};
use crate::int8::decode_int8;
use crate::tuned::{ProblemSize, TunedGemmTable};

/// Output dtypes the kernel can write.
pub const OUTPUT_DTYPES: [DType; 3] = [DType::BF16, DType::F16, DType::F32];

struct Operands {
    x: Vec<i8>,
    w: Vec<i8>,
    x_scale: Vec<f32>,
    w_scale: Vec<f32>,
    /// Expanded to `[B, N]`.
    bias: Option<Vec<f32>>,
}

fn prepare(
    xq: &Tensor,
    wq: &Tensor,
    x_scale: &Tensor,
    w_scale: &Tensor,
    out_dtype: DType,
) -> Result<(ProblemSize, Operands)> {
    expect_same_device(&[(xq, "xq"), (wq, "wq"), (x_scale, "x_scale"), (w_scale, "w_scale")])?;
    let xd = expect_rank(xq, 3, "xq")?;
    let wd = expect_rank(wq, 3, "wq")?;
    let (b, m, k) = (xd[0], xd[1], xd[2]);
    let n = wd[1];
    if wd[0] != b || wd[2] != k {
        return Err(OpError::shape(format!(
            "wq {wd:?} must be [B, N, K] matching xq {xd:?}"
        )));
    }
    if k == 0 {
        return Err(OpError::shape("reduction dim K must be positive"));
    }
    expect_shape(x_scale, &[b, m, 1], "x_scale")?;
    expect_shape(w_scale, &[b, 1, n], "w_scale")?;
    ensure_float(x_scale.dtype(), "x_scale")?;
    ensure_float(w_scale.dtype(), "w_scale")?;
    if !OUTPUT_DTYPES.contains(&out_dtype) {
        return Err(OpError::dtype(format!(
            "output dtype must be one of {OUTPUT_DTYPES:?}, got {out_dtype:?}"
        )));
    }
    Ok((
        ProblemSize { b, m, n, k },
        Operands {
            x: decode_int8(xq, "xq")?,
            w: decode_int8(wq, "wq")?,
            x_scale: read_f32(x_scale)?,
            w_scale: read_f32(w_scale)?,
            bias: None,
        },
    ))
}

/// Expands a `[N]`, `[1, N]` or `[B, 1, N]` bias to `[B, N]`.
fn expand_bias(bias: &Tensor, size: ProblemSize) -> Result<Vec<f32>> {
    ensure_float(bias.dtype(), "bias")?;
    let values = read_f32(bias)?;
    let ProblemSize { b, n, .. } = size;
    match bias.dims() {
        [len] | [1, len] if *len == n => Ok(values.repeat(b)),
        [bb, 1, len] if *bb == b && *len == n => Ok(values),
        other => Err(OpError::shape(format!(
            "bias must be [N], [1, N] or [B, 1, N] with N = {n}, B = {b}; got {other:?}"
        ))),
    }
}

fn k_partitions(split_k: u32, k: usize) -> Result<usize> {
    let k_batch = 1usize.checked_shl(split_k).filter(|_| split_k < 31);
    match k_batch {
        Some(k_batch) if k_batch <= k => Ok(k_batch),
        _ => Err(OpError::argument(
            "split_k",
            format!("2^{split_k} partitions exceed the reduction length {k}"),
        )),
    }
}

/// Kernel instance plus the split-K a tuned entry asked for.
#[derive(Debug, Clone, Copy)]
pub struct KernelChoice {
    pub instance: &'static KernelInstance,
    /// `None` on a heuristic pick; the caller's `split_k` then applies.
    pub split_k: Option<u32>,
}

/// Chooses the kernel for `size` from `table`, falling back to the heuristic.
pub fn select_instance_in(table: &TunedGemmTable, size: ProblemSize) -> KernelChoice {
    let tuned = table
        .lookup(size)
        .and_then(|entry| instance(entry.kernel_id).map(|inst| (inst, entry.split_k)));
    match tuned {
        Some((inst, split_k)) => {
            log::debug!("a8w8 {size:?}: tuned kernel {} split_k={split_k}", inst.name());
            KernelChoice {
                instance: inst,
                split_k: Some(split_k),
            }
        }
        None => {
            let inst = heuristic(size.m, size.n, size.k);
            log::debug!("a8w8 {size:?}: heuristic kernel {}", inst.name());
            KernelChoice {
                instance: inst,
                split_k: None,
            }
        }
    }
}

/// [`select_instance_in`] over the globally configured tuned table.
pub fn select_instance(size: ProblemSize) -> KernelChoice {
    select_instance_in(TunedGemmTable::global(), size)
}

/// Resolves the instance and reduction partition count. A tuned hit
/// overrides the requested `split_k`.
fn plan(table: &TunedGemmTable, size: ProblemSize, split_k: u32) -> Result<(&'static KernelInstance, usize)> {
    let choice = select_instance_in(table, size);
    let split_k = choice.split_k.unwrap_or(split_k);
    Ok((choice.instance, k_partitions(split_k, size.k)?))
}

#[inline]
fn dot_i8(a: &[i8], b: &[i8]) -> i32 {
    a.iter().zip(b).map(|(&x, &y)| x as i32 * y as i32).sum()
}

fn run_kernel(inst: &KernelInstance, ops: &Operands, size: ProblemSize, k_batch: usize) -> Vec<f32> {
    let ProblemSize { b, m, n, k } = size;
    let mut out = vec![0f32; b * m * n];
    if out.is_empty() {
        return out;
    }
    let k_chunk = k.div_ceil(k_batch);
    let (m_tile, n_tile, k_tile) = (inst.m_per_block.max(1), inst.n_per_block.max(1), inst.k_per_block.max(1));

    out.par_chunks_mut(m * n).enumerate().for_each(|(bi, batch_out)| {
        batch_out
            .par_chunks_mut(m_tile * n)
            .enumerate()
            .for_each(|(tile, rows)| {
                let mut acc = vec![0i32; n_tile];
                for (r, row_out) in rows.chunks_mut(n).enumerate() {
                    let token = bi * m + tile * m_tile + r;
                    let x_row = &ops.x[token * k..(token + 1) * k];
                    let xs = ops.x_scale[token];
                    for n0 in (0..n).step_by(n_tile) {
                        let n1 = (n0 + n_tile).min(n);
                        for part in 0..k_batch {
                            let ks = part * k_chunk;
                            let ke = ((part + 1) * k_chunk).min(k);
                            if ks >= ke {
                                continue;
                            }
                            acc[..n1 - n0].iter_mut().for_each(|a| *a = 0);
                            for k0 in (ks..ke).step_by(k_tile) {
                                let k1 = (k0 + k_tile).min(ke);
                                for (j, a) in acc[..n1 - n0].iter_mut().enumerate() {
                                    let channel = bi * n + n0 + j;
                                    let w_row = &ops.w[channel * k..(channel + 1) * k];
                                    *a += dot_i8(&x_row[k0..k1], &w_row[k0..k1]);
                                }
                            }
                            for (j, &a) in acc[..n1 - n0].iter().enumerate() {
                                row_out[n0 + j] += a as f32 * xs * ops.w_scale[bi * n + n0 + j];
                            }
                        }
                    }
                    if let Some(bias) = &ops.bias {
                        for (y, &bv) in row_out.iter_mut().zip(&bias[bi * n..(bi + 1) * n]) {
                            *y += bv;
                        }
                    }
                }
            });
    });
    out
}

fn execute(
    inst: &KernelInstance,
    ops: &Operands,
    size: ProblemSize,
    k_batch: usize,
    out_dtype: DType,
    device: &candle_core::Device,
) -> Result<Tensor> {
    let out = run_kernel(inst, ops, size, k_batch);
    write_f32(out, &[size.b, size.m, size.n], out_dtype, device)
}

/// int8 batched GEMM; the kernel instance comes from the tuned table or the
/// size heuristic. A tuned entry's `split_k` replaces the `split_k` argument.
#[allow(clippy::too_many_arguments)]
pub fn batched_gemm_a8w8(
    xq: &Tensor,
    wq: &Tensor,
    x_scale: &Tensor,
    w_scale: &Tensor,
    out_dtype: DType,
    bias: Option<&Tensor>,
    split_k: u32,
) -> Result<Tensor> {
    log_call(
        "batched_gemm_a8w8",
        &[("xq", xq), ("wq", wq), ("x_scale", x_scale), ("w_scale", w_scale)],
    );
    let (size, mut ops) = prepare(xq, wq, x_scale, w_scale, out_dtype)?;
    if let Some(bias) = bias {
        ops.bias = Some(expand_bias(bias, size)?);
    }
    let (inst, k_batch) = plan(TunedGemmTable::global(), size, split_k)?;
    execute(inst, &ops, size, k_batch, out_dtype, xq.device())
}

/// Runs the explicitly selected `kernel_id` without bias, for tuning sweeps.
pub fn batched_gemm_a8w8_tune(
    xq: &Tensor,
    wq: &Tensor,
    x_scale: &Tensor,
    w_scale: &Tensor,
    out_dtype: DType,
    kernel_id: u32,
    split_k: u32,
) -> Result<Tensor> {
    log_call(
        "batched_gemm_a8w8_tune",
        &[("xq", xq), ("wq", wq), ("x_scale", x_scale), ("w_scale", w_scale)],
    );
    let inst = instance(kernel_id)
        .ok_or_else(|| OpError::argument("kernel_id", format!("no kernel instance with id {kernel_id}")))?;
    let (size, ops) = prepare(xq, wq, x_scale, w_scale, out_dtype)?;
    let k_batch = k_partitions(split_k, size.k)?;
    execute(inst, &ops, size, k_batch, out_dtype, xq.device())
}
