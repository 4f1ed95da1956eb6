//! Position-indexed rotary embedding applied in place to query/key buffers.
//!
//! `query` is `[.., num_heads * head_size]` and `key` is
//! `[.., num_kv_heads * head_size]`, with one leading entry per element of
//! `positions`. `cos_cache`/`sin_cache` are `[max_position, rot_dim / 2]`
//! and always hold the front half of each row, expanded per style.

use candle_core::{CpuStorage, InplaceOp1, Layout, Tensor};
use opkit_core::{
    checks::{expect_index_dtype, expect_rank},
    dtype::ensure_float,
    host::{read_indices, with_f32_slice_mut},
    testing::log_call,
    OpError, Result,
};

use crate::kernel::{rotate_tokens_in_place, AngleTable, Direction, Segment};
use crate::style::{validate_rotary_width, RopeOptions, RotateStyle};

struct RotaryInPlace<'a> {
    name: &'static str,
    table: &'a AngleTable,
    rows: &'a [usize],
    head_size: usize,
    offset: usize,
    style: RotateStyle,
}

impl InplaceOp1 for RotaryInPlace<'_> {
    fn name(&self) -> &'static str {
        self.name
    }

    fn cpu_fwd(&self, storage: &mut CpuStorage, layout: &Layout) -> candle_core::Result<()> {
        with_f32_slice_mut(storage, layout, self.name, |values| {
            let heads = values.len() / (self.rows.len() * self.head_size).max(1);
            let segment = Segment {
                offset: self.offset,
                table: self.table,
                rows: self.rows,
            };
            rotate_tokens_in_place(values, heads, self.head_size, &[segment], self.style, Direction::Forward);
            Ok(())
        })
    }
}

fn check_target(tensor: &Tensor, name: &'static str, op: &'static str, tokens: usize, head_size: usize) -> Result<()> {
    ensure_float(tensor.dtype(), name)?;
    if !tensor.device().is_cpu() {
        return Err(OpError::UnsupportedDevice { op });
    }
    if !tensor.is_contiguous() {
        return Err(OpError::argument(name, "in-place rotary target must be contiguous"));
    }
    let width = tensor.dims().last().copied().unwrap_or(0);
    if width == 0 || width % head_size != 0 || tensor.elem_count() != tokens * width {
        return Err(OpError::shape(format!(
            "{name} {:?} must be [.., heads * {head_size}] with {tokens} tokens",
            tensor.dims()
        )));
    }
    Ok(())
}

fn rows_from(positions: &Tensor, offsets: Option<&Tensor>) -> Result<Vec<usize>> {
    expect_index_dtype(positions, "positions")?;
    let mut rows = read_indices(positions, "positions")?;
    if let Some(offsets) = offsets {
        expect_index_dtype(offsets, "cos_sin_cache_offsets")?;
        let offsets = read_indices(offsets, "cos_sin_cache_offsets")?;
        if offsets.len() != rows.len() {
            return Err(OpError::shape(format!(
                "cos_sin_cache_offsets has {} entries for {} tokens",
                offsets.len(),
                rows.len()
            )));
        }
        for (row, off) in rows.iter_mut().zip(offsets) {
            *row = row.checked_add(off).ok_or_else(|| {
                OpError::argument("cos_sin_cache_offsets", format!("position {row} + offset {off} overflows"))
            })?;
        }
    }
    rows.into_iter()
        .map(|row| {
            usize::try_from(row).map_err(|_| OpError::argument("positions", format!("negative cache row {row}")))
        })
        .collect()
}

#[allow(clippy::too_many_arguments)]
fn apply(
    op: &'static str,
    positions: &Tensor,
    offsets: Option<&Tensor>,
    query: &Tensor,
    key: &Tensor,
    head_size: usize,
    cos_cache: &Tensor,
    sin_cache: &Tensor,
    is_neox: bool,
    is_nope_first: bool,
    rot_dim: Option<usize>,
) -> Result<()> {
    if head_size == 0 {
        return Err(OpError::argument("head_size", "must be positive"));
    }
    expect_rank(cos_cache, 2, "cos_cache")?;
    expect_rank(sin_cache, 2, "sin_cache")?;
    let style = if is_neox { RotateStyle::Neox } else { RotateStyle::GptJ };
    let opts = RopeOptions::new(style)
        .reuse_freqs_front_part(true)
        .nope_first(is_nope_first);
    let table = AngleTable::from_cos_sin(cos_cache, sin_cache, &opts)?;
    if let Some(rot_dim) = rot_dim {
        if rot_dim != table.rot() {
            return Err(OpError::shape(format!(
                "rot_dim {rot_dim} disagrees with cache width {} (rot_dim / 2 expected)",
                table.rot() / 2
            )));
        }
    }
    validate_rotary_width(table.rot(), head_size)?;

    let rows = rows_from(positions, offsets)?;
    table.check_rows(&rows, "positions")?;
    check_target(query, "query", op, rows.len(), head_size)?;
    check_target(key, "key", op, rows.len(), head_size)?;

    let kernel = RotaryInPlace {
        name: op,
        table: &table,
        rows: &rows,
        head_size,
        offset: opts.rotary_offset(head_size, table.rot()),
        style,
    };
    query.inplace_op1(&kernel)?;
    key.inplace_op1(&kernel)?;
    Ok(())
}

/// Rotates `query` and `key` in place using row `positions[t]` of the caches.
#[allow(clippy::too_many_arguments)]
pub fn rotary_embedding(
    positions: &Tensor,
    query: &Tensor,
    key: &Tensor,
    head_size: usize,
    cos_cache: &Tensor,
    sin_cache: &Tensor,
    is_neox: bool,
    is_nope_first: bool,
) -> Result<()> {
    log_call(
        "rotary_embedding",
        &[("positions", positions), ("query", query), ("key", key), ("cos_cache", cos_cache)],
    );
    apply(
        "rotary_embedding",
        positions,
        None,
        query,
        key,
        head_size,
        cos_cache,
        sin_cache,
        is_neox,
        is_nope_first,
        None,
    )
}

/// [`rotary_embedding`] reading row `positions[t] + cos_sin_cache_offsets[t]`,
/// for batches that pack several scaled caches into one table.
#[allow(clippy::too_many_arguments)]
pub fn batched_rotary_embedding(
    positions: &Tensor,
    query: &Tensor,
    key: &Tensor,
    head_size: usize,
    cos_cache: &Tensor,
    sin_cache: &Tensor,
    is_neox: bool,
    is_nope_first: bool,
    rot_dim: usize,
    cos_sin_cache_offsets: &Tensor,
) -> Result<()> {
    log_call(
        "batched_rotary_embedding",
        &[
            ("positions", positions),
            ("query", query),
            ("key", key),
            ("cos_cache", cos_cache),
            ("offsets", cos_sin_cache_offsets),
        ],
    );
    apply(
        "batched_rotary_embedding",
        positions,
        Some(cos_sin_cache_offsets),
        query,
        key,
        head_size,
        cos_cache,
        sin_cache,
        is_neox,
        is_nope_first,
        Some(rot_dim),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rope_cached_fwd;
    use candle_core::{DType, Device};

    fn caches(rows: usize, half: usize) -> (Tensor, Tensor) {
        let angles: Vec<f32> = (0..rows * half).map(|i| i as f32 * 0.11).collect();
        let angles = Tensor::from_vec(angles, (rows, half), &Device::Cpu).unwrap();
        (angles.cos().unwrap(), angles.sin().unwrap())
    }

    #[test]
    fn overflowing_offsets_are_rejected() -> Result<()> {
        let device = Device::Cpu;
        let positions = Tensor::from_vec(vec![i64::MAX, 1], 2, &device)?;
        let offsets = Tensor::from_vec(vec![1i64, 2], 2, &device)?;
        assert!(matches!(
            rows_from(&positions, Some(&offsets)),
            Err(OpError::InvalidArgument { arg: "cos_sin_cache_offsets", .. })
        ));
        let positions = Tensor::from_vec(vec![3i64, 1], 2, &device)?;
        assert_eq!(rows_from(&positions, Some(&offsets))?, vec![4, 3]);
        Ok(())
    }

    #[test]
    fn matches_out_of_place_cached_variant() -> Result<()> {
        let device = Device::Cpu;
        let (tokens, heads, head_size) = (3usize, 2usize, 8usize);
        let (cos, sin) = caches(6, 2);
        let data: Vec<f32> = (0..tokens * heads * head_size).map(|i| (i as f32 * 0.3).sin()).collect();
        let query = Tensor::from_vec(data.clone(), (tokens, heads * head_size), &device)?;
        let key = Tensor::from_vec(data[..tokens * head_size].to_vec(), (tokens, head_size), &device)?;
        let positions = Tensor::from_vec(vec![4i64, 0, 2], tokens, &device)?;

        let reference_input = Tensor::from_vec(data, (tokens, 1, heads, head_size), &device)?;
        let rows = Tensor::from_vec(vec![4u32, 0, 2], tokens, &device)?;
        let cos_rows = cos.index_select(&rows, 0)?.reshape((tokens, 1, 1, 2))?;
        let sin_rows = sin.index_select(&rows, 0)?.reshape((tokens, 1, 1, 2))?;
        let opts = RopeOptions::new(RotateStyle::GptJ).reuse_freqs_front_part(true).nope_first(true);
        let expected = rope_cached_fwd(&reference_input, &cos_rows, &sin_rows, &opts)?;

        rotary_embedding(&positions, &query, &key, head_size, &cos, &sin, false, true)?;
        let diff = (query.reshape((tokens, 1, heads, head_size))? - expected)?
            .abs()?
            .max_all()?
            .to_vec0::<f32>()?;
        assert!(diff < 1e-6);
        Ok(())
    }

    #[test]
    fn batched_offsets_shift_rows() -> Result<()> {
        let device = Device::Cpu;
        let (cos, sin) = caches(8, 2);
        let base = Tensor::from_vec((0..2 * 4).map(|i| i as f32).collect::<Vec<_>>(), (2, 4), &device)?;
        let (q1, k1) = (base.copy()?, base.copy()?);
        let (q2, k2) = (base.copy()?, base.copy()?);

        let positions = Tensor::from_vec(vec![1i64, 2], 2, &device)?;
        let offsets = Tensor::from_vec(vec![3i64, 3], 2, &device)?;
        batched_rotary_embedding(&positions, &q1, &k1, 4, &cos, &sin, true, false, 4, &offsets)?;
        let shifted = Tensor::from_vec(vec![4i64, 5], 2, &device)?;
        rotary_embedding(&shifted, &q2, &k2, 4, &cos, &sin, true, false)?;
        assert_eq!(q1.to_vec2::<f32>()?, q2.to_vec2::<f32>()?);
        assert_eq!(k1.to_vec2::<f32>()?, k2.to_vec2::<f32>()?);

        assert!(batched_rotary_embedding(&positions, &q1, &k1, 4, &cos, &sin, true, false, 8, &offsets).is_err());
        Ok(())
    }

    #[test]
    fn rejects_positions_beyond_the_cache() -> Result<()> {
        let device = Device::Cpu;
        let (cos, sin) = caches(2, 2);
        let q = Tensor::zeros((1, 4), DType::F32, &device)?;
        let k = Tensor::zeros((1, 4), DType::F32, &device)?;
        let positions = Tensor::from_vec(vec![2i64], 1, &device)?;
        assert!(matches!(
            rotary_embedding(&positions, &q, &k, 4, &cos, &sin, true, false),
            Err(OpError::InvalidArgument { .. })
        ));
        Ok(())
    }
}
