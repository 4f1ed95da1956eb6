//! Fused expert evaluation:
//! `out[m] = Σ_j w[m, j] · (gelu_tanh(x[m] · w1[e]ᵀ) · w2[e]ᵀ)` with
//! `e = ids[m, j]`.
//!
//! Tokens are processed in chunks. Each chunk picks a [`MoeKernelConfig`]
//! for its token count; the routed slots are grouped per expert into blocks
//! of `BLOCK_SIZE_M` by [`align_slots`] and `GROUP_SIZE_M` blocks run as one
//! parallel task.

use candle_core::{CpuStorage, InplaceOp1, Layout, Tensor};
use elementwise::UnaryKind;
use opkit_core::{
    checks::{expect_index_dtype, expect_rank, expect_same_device, expect_shape},
    dtype::ensure_float,
    host::{read_f32, read_indices, with_f32_slice_mut, write_f32},
    testing::log_call,
    OpError, Result,
};
use quant_gemm::decode_int8;
use rayon::prelude::*;

use crate::{
    align::align_slots,
    config::{config_dtype_str, select_config, MoeKernelConfig},
    routing::RoutingMethod,
};

/// Tokens evaluated per chunk.
pub const DEFAULT_CHUNK_SIZE: usize = 65536;

/// Optional behaviour of [`fused_experts`].
#[derive(Debug, Clone)]
pub struct ExpertOptions {
    /// Weights are int8 (`U8` bytes or `I64` values) dequantized with
    /// per-output-channel scales `w1_scale [E, N]` and `w2_scale [E, K]`.
    pub int8_w8a16: bool,
    pub w1_scale: Option<Tensor>,
    pub w2_scale: Option<Tensor>,
    pub chunk_size: usize,
    /// Replaces the tuned or default kernel config.
    pub override_config: Option<MoeKernelConfig>,
    /// Write the result into `hidden`.
    pub inplace: bool,
}

impl Default for ExpertOptions {
    fn default() -> Self {
        Self {
            int8_w8a16: false,
            w1_scale: None,
            w2_scale: None,
            chunk_size: DEFAULT_CHUNK_SIZE,
            override_config: None,
            inplace: false,
        }
    }
}

impl ExpertOptions {
    pub fn int8_w8a16(w1_scale: Tensor, w2_scale: Tensor) -> Self {
        Self {
            int8_w8a16: true,
            w1_scale: Some(w1_scale),
            w2_scale: Some(w2_scale),
            ..Self::default()
        }
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size;
        self
    }

    pub fn with_config(mut self, config: MoeKernelConfig) -> Self {
        self.override_config = Some(config);
        self
    }

    /// Forces `BLOCK_SIZE_M`, keeping the rest of any override.
    pub fn with_block_size(mut self, block_size: usize) -> Self {
        let base = self.override_config.unwrap_or_default();
        self.override_config = Some(MoeKernelConfig {
            block_size_m: block_size,
            ..base
        });
        self
    }

    pub fn in_place(mut self) -> Self {
        self.inplace = true;
        self
    }
}

/// Expert weights `[E, rows, cols]` as `f32`, dequantized when needed.
fn expert_weights(
    w: &Tensor,
    name: &'static str,
    scale: Option<&Tensor>,
    scale_name: &'static str,
    int8: bool,
) -> Result<Vec<f32>> {
    let dims = expect_rank(w, 3, name)?;
    let (e, rows, cols) = (dims[0], dims[1], dims[2]);
    if !int8 {
        ensure_float(w.dtype(), name)?;
        return read_f32(w);
    }
    let scale = scale.ok_or_else(|| OpError::argument(scale_name, "required for int8_w8a16 weights"))?;
    ensure_float(scale.dtype(), scale_name)?;
    if scale.dims() != [e, rows] && scale.dims() != [e, rows, 1] {
        return Err(OpError::shape(format!(
            "{scale_name} {:?} must be [{e}, {rows}] or [{e}, {rows}, 1]",
            scale.dims()
        )));
    }
    let scales = read_f32(scale)?;
    let q = decode_int8(w, name)?;
    Ok(q
        .chunks(cols.max(1))
        .zip(&scales)
        .flat_map(|(row, &s)| row.iter().map(move |&v| v as f32 * s))
        .collect())
}

/// `out = weights · x` walked in `row_tile x col_tile` tiles.
fn matvec(weights: &[f32], rows: usize, cols: usize, x: &[f32], out: &mut [f32], config: &MoeKernelConfig) {
    let (row_tile, col_tile) = (config.block_size_n, config.block_size_k);
    for r0 in (0..rows).step_by(row_tile) {
        let r1 = (r0 + row_tile).min(rows);
        let tile_out = &mut out[r0..r1];
        tile_out.iter_mut().for_each(|y| *y = 0.0);
        for c0 in (0..cols).step_by(col_tile) {
            let c1 = (c0 + col_tile).min(cols);
            for (r, y) in tile_out.iter_mut().enumerate() {
                let row = &weights[(r0 + r) * cols..(r0 + r + 1) * cols];
                *y += row[c0..c1].iter().zip(&x[c0..c1]).map(|(w, v)| w * v).sum::<f32>();
            }
        }
    }
}

struct WriteBack<'a> {
    values: &'a [f32],
}

impl InplaceOp1 for WriteBack<'_> {
    fn name(&self) -> &'static str {
        "fused_experts_"
    }

    fn cpu_fwd(&self, storage: &mut CpuStorage, layout: &Layout) -> candle_core::Result<()> {
        with_f32_slice_mut(storage, layout, "fused_experts_", |dst| {
            if dst.len() != self.values.len() {
                return Err(candle_core::Error::Msg(format!(
                    "fused_experts_: {} results for {} hidden values",
                    self.values.len(),
                    dst.len()
                )));
            }
            dst.copy_from_slice(self.values);
            Ok(())
        })
    }
}

fn check_in_place_target(hidden: &Tensor) -> Result<()> {
    if !hidden.device().is_cpu() {
        return Err(OpError::UnsupportedDevice { op: "fused_experts_" });
    }
    if !hidden.is_contiguous() {
        return Err(OpError::argument("hidden", "in-place target must be contiguous"));
    }
    Ok(())
}

/// Evaluates the routed experts for `hidden [M, K]`.
///
/// `w1 [E, N, K]`, `w2 [E, K, N]`, `topk_weights`/`topk_ids` `[M, topk]`.
/// The output keeps the dtype of `hidden`. With `opts.inplace` the result is
/// also written into `hidden` and the returned tensor shares its storage.
pub fn fused_experts(
    hidden: &Tensor,
    w1: &Tensor,
    w2: &Tensor,
    topk_weights: &Tensor,
    topk_ids: &Tensor,
    opts: &ExpertOptions,
) -> Result<Tensor> {
    if opts.inplace {
        fused_experts_(hidden, w1, w2, topk_weights, topk_ids, opts)?;
        return Ok(hidden.clone());
    }
    let (out, dims) = evaluate("fused_experts", hidden, w1, w2, topk_weights, topk_ids, opts)?;
    write_f32(out, &dims, hidden.dtype(), hidden.device())
}

/// [`fused_experts`] overwriting `hidden` with the result.
pub fn fused_experts_(
    hidden: &Tensor,
    w1: &Tensor,
    w2: &Tensor,
    topk_weights: &Tensor,
    topk_ids: &Tensor,
    opts: &ExpertOptions,
) -> Result<()> {
    check_in_place_target(hidden)?;
    let (out, _) = evaluate("fused_experts_", hidden, w1, w2, topk_weights, topk_ids, opts)?;
    hidden.inplace_op1(&WriteBack { values: &out })?;
    Ok(())
}

fn evaluate(
    op: &'static str,
    hidden: &Tensor,
    w1: &Tensor,
    w2: &Tensor,
    topk_weights: &Tensor,
    topk_ids: &Tensor,
    opts: &ExpertOptions,
) -> Result<(Vec<f32>, [usize; 2])> {
    log_call(
        op,
        &[
            ("hidden", hidden),
            ("w1", w1),
            ("w2", w2),
            ("topk_weights", topk_weights),
            ("topk_ids", topk_ids),
        ],
    );
    expect_same_device(&[(hidden, "hidden"), (w1, "w1"), (w2, "w2"), (topk_ids, "topk_ids")])?;
    ensure_float(hidden.dtype(), "hidden")?;
    let hd = expect_rank(hidden, 2, "hidden")?;
    let (m, k) = (hd[0], hd[1]);
    let w1d = expect_rank(w1, 3, "w1")?;
    let (e, n) = (w1d[0], w1d[1]);
    if w1d[2] != k {
        return Err(OpError::shape(format!("w1 {w1d:?} must be [E, N, {k}]")));
    }
    expect_shape(w2, &[e, k, n], "w2")?;
    expect_index_dtype(topk_ids, "topk_ids")?;
    let td = expect_rank(topk_ids, 2, "topk_ids")?;
    let topk = td[1];
    if td[0] != m {
        return Err(OpError::shape(format!("topk_ids {td:?} must have {m} rows")));
    }
    expect_shape(topk_weights, td, "topk_weights")?;
    ensure_float(topk_weights.dtype(), "topk_weights")?;
    if opts.chunk_size == 0 {
        return Err(OpError::argument("chunk_size", "must be positive"));
    }
    if let Some(config) = &opts.override_config {
        config.validate()?;
    }
    let dtype_str = config_dtype_str(opts.int8_w8a16, hidden.dtype());

    let w1v = expert_weights(w1, "w1", opts.w1_scale.as_ref(), "w1_scale", opts.int8_w8a16)?;
    let w2v = expert_weights(w2, "w2", opts.w2_scale.as_ref(), "w2_scale", opts.int8_w8a16)?;
    let x = read_f32(hidden)?;
    let weights = read_f32(topk_weights)?;
    let ids = read_indices(topk_ids, "topk_ids")?
        .into_iter()
        .map(|id| match usize::try_from(id) {
            Ok(id) if id < e => Ok(id),
            _ => Err(OpError::argument("topk_ids", format!("expert {id} outside 0..{e}"))),
        })
        .collect::<Result<Vec<_>>>()?;

    let mut out = vec![0f32; m * k];
    let gelu = UnaryKind::GeluTanh;
    for start in (0..m).step_by(opts.chunk_size) {
        let end = (start + opts.chunk_size).min(m);
        let chunk_ids = &ids[start * topk..end * topk];
        let config = select_config(end - start, e, n, dtype_str, opts.override_config.as_ref());
        let blocks = align_slots(chunk_ids, config.block_size_m, e)?;
        let num_blocks = blocks.num_blocks();
        log::debug!("{op} chunk {start}..{end}: {num_blocks} blocks, {config:?}");

        let eval_block = |b: usize| {
            let (expert, slots) = blocks.block(b);
            let w1e = &w1v[expert * n * k..(expert + 1) * n * k];
            let w2e = &w2v[expert * k * n..(expert + 1) * k * n];
            let mut act = vec![0f32; n];
            slots
                .iter()
                .map(|&slot| {
                    let token = start + slot / topk;
                    matvec(w1e, n, k, &x[token * k..(token + 1) * k], &mut act, &config);
                    act.iter_mut().for_each(|v| *v = gelu.eval_f32(*v));
                    let mut y = vec![0f32; k];
                    matvec(w2e, k, n, &act, &mut y, &config);
                    let route = weights[start * topk + slot];
                    y.iter_mut().for_each(|v| *v *= route);
                    (slot, y)
                })
                .collect::<Vec<_>>()
        };

        // (slot within chunk, weighted expert output)
        let group = config.group_size_m;
        let partials: Vec<(usize, Vec<f32>)> = (0..num_blocks.div_ceil(group))
            .into_par_iter()
            .flat_map_iter(|g| (g * group..((g + 1) * group).min(num_blocks)).flat_map(&eval_block))
            .collect();

        for (slot, y) in partials {
            let token = start + slot / topk;
            for (acc, v) in out[token * k..(token + 1) * k].iter_mut().zip(y) {
                *acc += v;
            }
        }
    }
    Ok((out, [m, k]))
}

/// Routes `gating [M, E]` with `routing` and evaluates the chosen experts.
#[allow(clippy::too_many_arguments)]
pub fn fused_moe(
    hidden: &Tensor,
    w1: &Tensor,
    w2: &Tensor,
    gating: &Tensor,
    topk: usize,
    renormalize: bool,
    routing: &RoutingMethod,
    opts: &ExpertOptions,
) -> Result<Tensor> {
    let hd = expect_rank(hidden, 2, "hidden")?;
    let e = expect_rank(w1, 3, "w1")?[0];
    expect_shape(gating, &[hd[0], e], "gating")?;
    let (weights, ids) = routing.route(gating, topk, renormalize)?;
    fused_experts(hidden, w1, w2, &weights, &ids, opts)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};

    #[test]
    fn single_expert_matches_dense_formula() -> Result<()> {
        let device = Device::Cpu;
        let hidden = Tensor::from_vec(vec![1.0f32, -1.0], (1, 2), &device)?;
        // E = 1, N = 1, K = 2
        let w1 = Tensor::from_vec(vec![0.5f32, 0.25], (1, 1, 2), &device)?;
        let w2 = Tensor::from_vec(vec![2.0f32, -4.0], (1, 2, 1), &device)?;
        let weights = Tensor::from_vec(vec![0.5f32], (1, 1), &device)?;
        let ids = Tensor::from_vec(vec![0u32], (1, 1), &device)?;
        let out = fused_experts(&hidden, &w1, &w2, &weights, &ids, &ExpertOptions::default())?;
        let g = UnaryKind::GeluTanh.eval_f32(0.25);
        let out = out.to_vec2::<f32>()?;
        assert!((out[0][0] - 0.5 * 2.0 * g).abs() < 1e-6);
        assert!((out[0][1] + 0.5 * 4.0 * g).abs() < 1e-6);
        Ok(())
    }

    #[test]
    fn int8_weights_need_scales() -> Result<()> {
        let device = Device::Cpu;
        let hidden = Tensor::zeros((1, 2), DType::F32, &device)?;
        let w1 = Tensor::zeros((1, 1, 2), DType::U8, &device)?;
        let w2 = Tensor::zeros((1, 2, 1), DType::U8, &device)?;
        let weights = Tensor::ones((1, 1), DType::F32, &device)?;
        let ids = Tensor::zeros((1, 1), DType::U32, &device)?;
        let opts = ExpertOptions {
            int8_w8a16: true,
            ..ExpertOptions::default()
        };
        assert!(matches!(
            fused_experts(&hidden, &w1, &w2, &weights, &ids, &opts),
            Err(OpError::InvalidArgument { arg: "w1_scale", .. })
        ));
        Ok(())
    }

    #[test]
    fn tiled_matvec_covers_ragged_edges() {
        // 3 x 5 weights, tiles of 2 rows x 2 cols
        let weights: Vec<f32> = (0..15).map(|v| v as f32).collect();
        let x = [1.0f32, -1.0, 2.0, 0.5, 1.0];
        let tiles = MoeKernelConfig {
            block_size_n: 2,
            block_size_k: 2,
            ..MoeKernelConfig::default()
        };
        let mut out = [f32::NAN; 3];
        matvec(&weights, 3, 5, &x, &mut out, &tiles);
        let want: Vec<f32> = weights.chunks(5).map(|row| row.iter().zip(&x).map(|(w, v)| w * v).sum()).collect();
        assert_eq!(out.to_vec(), want);
    }

    #[test]
    fn block_size_override_keeps_other_fields() {
        let tiles = MoeKernelConfig {
            block_size_n: 8,
            ..MoeKernelConfig::default()
        };
        let opts = ExpertOptions::default().with_config(tiles).with_block_size(4);
        let config = opts.override_config.unwrap();
        assert_eq!((config.block_size_m, config.block_size_n), (4, 8));
    }
}
