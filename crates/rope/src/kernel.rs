//! Host rotation kernel shared by every layout.
//!
//! Every supported layout stores one token's heads contiguously
//! (`[.., heads, head_dim]`), so each variant reduces to: pick a table row per
//! token, then rotate one or more channel segments of every head with that
//! row. Tables are expanded to the full rotated width once up front.

use candle_core::Tensor;
use opkit_core::{dtype::ensure_float, host::read_f32, OpError, Result};
use rayon::prelude::*;

use crate::style::{RopeOptions, RotateStyle};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Forward,
    Backward,
}

/// Expanded cos/sin rows, `rot` values each.
#[derive(Debug, Clone, PartialEq)]
pub struct AngleTable {
    rows: usize,
    rot: usize,
    cos: Vec<f32>,
    sin: Vec<f32>,
}

impl AngleTable {
    /// Builds the table from raw rotation angles.
    pub fn from_freqs(freqs: &Tensor, opts: &RopeOptions) -> Result<Self> {
        ensure_float(freqs.dtype(), "freqs")?;
        let width = last_dim(freqs, "freqs")?;
        let raw = read_f32(freqs)?;
        let angles = expand(&raw, width, opts);
        Ok(Self {
            rows: row_count(&raw, width),
            rot: opts.rotary_width(width),
            cos: angles.iter().map(|a| a.cos()).collect(),
            sin: angles.iter().map(|a| a.sin()).collect(),
        })
    }

    /// Builds the table from precomputed cosine and sine tensors.
    pub fn from_cos_sin(cos: &Tensor, sin: &Tensor, opts: &RopeOptions) -> Result<Self> {
        ensure_float(cos.dtype(), "cos")?;
        ensure_float(sin.dtype(), "sin")?;
        if cos.dims() != sin.dims() {
            return Err(OpError::shape(format!(
                "cos {:?} and sin {:?} must share a shape",
                cos.dims(),
                sin.dims()
            )));
        }
        let width = last_dim(cos, "cos")?;
        let raw_cos = read_f32(cos)?;
        let raw_sin = read_f32(sin)?;
        Ok(Self {
            rows: row_count(&raw_cos, width),
            rot: opts.rotary_width(width),
            cos: expand(&raw_cos, width, opts),
            sin: expand(&raw_sin, width, opts),
        })
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn rot(&self) -> usize {
        self.rot
    }

    #[inline]
    pub fn row(&self, idx: usize) -> (&[f32], &[f32]) {
        let start = idx * self.rot;
        (&self.cos[start..start + self.rot], &self.sin[start..start + self.rot])
    }

    /// Rejects row indices the table does not cover.
    pub fn check_rows(&self, rows: &[usize], what: &'static str) -> Result<()> {
        match rows.iter().find(|&&row| row >= self.rows) {
            Some(row) => Err(OpError::argument(
                what,
                format!("row {row} is outside a table of {} rows", self.rows),
            )),
            None => Ok(()),
        }
    }
}

fn last_dim(table: &Tensor, name: &str) -> Result<usize> {
    table
        .dims()
        .last()
        .copied()
        .filter(|&w| w > 0)
        .ok_or_else(|| OpError::shape(format!("{name} must have a non-empty last dim")))
}

fn row_count(raw: &[f32], width: usize) -> usize {
    raw.len() / width
}

/// Expands `width`-wide rows to the rotated width implied by `opts`.
fn expand(raw: &[f32], width: usize, opts: &RopeOptions) -> Vec<f32> {
    if !opts.reuse_freqs_front_part {
        return raw.to_vec();
    }
    let mut out = Vec::with_capacity(raw.len() * 2);
    for row in raw.chunks_exact(width) {
        match opts.style {
            RotateStyle::Neox => {
                out.extend_from_slice(row);
                out.extend_from_slice(row);
            }
            RotateStyle::GptJ => {
                for &v in row {
                    out.push(v);
                    out.push(v);
                }
            }
        }
    }
    out
}

/// Rotates one `rot`-wide slice in place.
///
/// Forward computes `y = x * cos + rotate(x) * sin`; backward applies the
/// adjoint of that linear map to an incoming gradient.
#[inline]
pub fn rotate_slice(values: &mut [f32], cos: &[f32], sin: &[f32], style: RotateStyle, direction: Direction) {
    let rot = cos.len();
    for j in 0..rot / 2 {
        let (a, b) = style.pair(j, rot);
        let (xa, xb) = (values[a], values[b]);
        match direction {
            Direction::Forward => {
                values[a] = xa * cos[a] - xb * sin[a];
                values[b] = xb * cos[b] + xa * sin[b];
            }
            Direction::Backward => {
                values[a] = xa * cos[a] + xb * sin[b];
                values[b] = xb * cos[b] - xa * sin[a];
            }
        }
    }
}

/// A channel range rotated with one table, one row per token.
pub struct Segment<'a> {
    pub offset: usize,
    pub table: &'a AngleTable,
    pub rows: &'a [usize],
}

/// Rotates every head of every token in `data` (`[tokens, heads, head_dim]`).
pub fn rotate_tokens_in_place(
    data: &mut [f32],
    heads: usize,
    head_dim: usize,
    segments: &[Segment<'_>],
    style: RotateStyle,
    direction: Direction,
) {
    let token_width = heads * head_dim;
    if token_width == 0 {
        return;
    }
    data.par_chunks_mut(token_width)
        .enumerate()
        .for_each(|(token, chunk)| {
            for segment in segments {
                let (cos, sin) = segment.table.row(segment.rows[token]);
                let rot = segment.table.rot();
                for head in chunk.chunks_exact_mut(head_dim) {
                    let slice = &mut head[segment.offset..segment.offset + rot];
                    rotate_slice(slice, cos, sin, style, direction);
                }
            }
        });
}

/// `(heads, head_dim)` from the two trailing dims of a rotary operand.
pub fn head_geometry(input: &Tensor, name: &str) -> Result<(usize, usize)> {
    let dims = input.dims();
    if dims.len() < 2 {
        return Err(OpError::shape(format!(
            "{name} needs [.., heads, head_dim] dims, got {dims:?}"
        )));
    }
    Ok((dims[dims.len() - 2], dims[dims.len() - 1]))
}

/// Stages `input` on the host, rotates it and rebuilds a tensor with the
/// input's dtype and device.
pub fn rotate_tensor(
    input: &Tensor,
    name: &str,
    segments: &[Segment<'_>],
    style: RotateStyle,
    direction: Direction,
) -> Result<Tensor> {
    ensure_float(input.dtype(), name)?;
    let (heads, head_dim) = head_geometry(input, name)?;
    let tokens = input.elem_count() / (heads * head_dim).max(1);
    for segment in segments {
        if segment.rows.len() != tokens {
            return Err(OpError::shape(format!(
                "{name}: {} table rows supplied for {tokens} tokens",
                segment.rows.len()
            )));
        }
        if segment.offset + segment.table.rot() > head_dim {
            return Err(OpError::shape(format!(
                "{name}: rotated channels {}..{} exceed head dim {head_dim}",
                segment.offset,
                segment.offset + segment.table.rot()
            )));
        }
    }
    let mut data = read_f32(input)?;
    rotate_tokens_in_place(&mut data, heads, head_dim, segments, style, direction);
    opkit_core::host::write_f32(data, input.dims(), input.dtype(), input.device())
}
