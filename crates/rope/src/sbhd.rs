//! Rotary variants over `[s, b, h, d]` operands.
//!
//! Tables are laid out `[rows, 1, 1, r or r/2]`. The plain and cached
//! variants read row `s` for every batch entry; the position variants read
//! row `positions[s, b]` (plus `offsets[s, b]`).

use candle_core::Tensor;
use opkit_core::{
    checks::{expect_rank, expect_shape},
    host::read_indices,
    testing::log_call,
    OpError, Result,
};

use crate::kernel::{head_geometry, rotate_tensor, AngleTable, Direction, Segment};
use crate::style::{validate_rotary_width, RopeOptions};

fn sbhd_dims(t: &Tensor, name: &str) -> Result<(usize, usize, usize, usize)> {
    let dims = expect_rank(t, 4, name)?;
    Ok((dims[0], dims[1], dims[2], dims[3]))
}

/// Checks a `[rows, 1, 1, width]` table.
pub(crate) fn check_row_table(table: &Tensor, name: &str) -> Result<()> {
    let dims = expect_rank(table, 4, name)?;
    if dims[1] != 1 || dims[2] != 1 {
        return Err(OpError::shape(format!(
            "{name} must be laid out [rows, 1, 1, width], got {dims:?}"
        )));
    }
    Ok(())
}

fn sequence_rows(seq: usize, batch: usize) -> Vec<usize> {
    (0..seq).flat_map(|s| std::iter::repeat(s).take(batch)).collect()
}

/// Table rows from `positions` (and optional `offsets`), both `[s, b]`.
pub(crate) fn indexed_rows(positions: &Tensor, offsets: Option<&Tensor>, dims: &[usize]) -> Result<Vec<usize>> {
    expect_shape(positions, dims, "positions")?;
    let mut rows = read_indices(positions, "positions")?;
    if let Some(offsets) = offsets {
        expect_shape(offsets, dims, "offsets")?;
        for (row, off) in rows.iter_mut().zip(read_indices(offsets, "offsets")?) {
            *row = row
                .checked_add(off)
                .ok_or_else(|| OpError::argument("offsets", format!("position {row} + offset {off} overflows")))?;
        }
    }
    rows.into_iter()
        .map(|row| {
            usize::try_from(row)
                .map_err(|_| OpError::argument("positions", format!("negative table row {row}")))
        })
        .collect()
}

fn rotate_rows(
    input: &Tensor,
    name: &str,
    table: &AngleTable,
    rows: &[usize],
    opts: &RopeOptions,
    direction: Direction,
) -> Result<Tensor> {
    let (_, head_dim) = head_geometry(input, name)?;
    validate_rotary_width(table.rot(), head_dim)?;
    let segment = Segment {
        offset: opts.rotary_offset(head_dim, table.rot()),
        table,
        rows,
    };
    rotate_tensor(input, name, &[segment], opts.style, direction)
}

fn check_pair(x: &Tensor, y: &Tensor) -> Result<(usize, usize)> {
    let (sx, bx, _, dx) = sbhd_dims(x, "x")?;
    let (sy, by, _, dy) = sbhd_dims(y, "y")?;
    if (sx, bx, dx) != (sy, by, dy) {
        return Err(OpError::shape(format!(
            "x {:?} and y {:?} must share s, b and d",
            x.dims(),
            y.dims()
        )));
    }
    Ok((sx, bx))
}

fn single(
    input: &Tensor,
    name: &str,
    table: Result<AngleTable>,
    opts: &RopeOptions,
    direction: Direction,
) -> Result<Tensor> {
    let (s, b, _, _) = sbhd_dims(input, name)?;
    let table = table?;
    let rows = sequence_rows(s, b);
    table.check_rows(&rows, "freqs")?;
    rotate_rows(input, name, &table, &rows, opts, direction)
}

fn pair(
    x: &Tensor,
    y: &Tensor,
    table: Result<AngleTable>,
    rows: Option<Vec<usize>>,
    opts: &RopeOptions,
    direction: Direction,
) -> Result<(Tensor, Tensor)> {
    let (s, b) = check_pair(x, y)?;
    let table = table?;
    let (rows, arg) = match rows {
        Some(rows) => (rows, "positions"),
        None => (sequence_rows(s, b), "freqs"),
    };
    table.check_rows(&rows, arg)?;
    Ok((
        rotate_rows(x, "x", &table, &rows, opts, direction)?,
        rotate_rows(y, "y", &table, &rows, opts, direction)?,
    ))
}

fn angle_table(freqs: &Tensor, opts: &RopeOptions) -> Result<AngleTable> {
    check_row_table(freqs, "freqs")?;
    AngleTable::from_freqs(freqs, opts)
}

fn cos_sin_table(cos: &Tensor, sin: &Tensor, opts: &RopeOptions) -> Result<AngleTable> {
    check_row_table(cos, "cos")?;
    check_row_table(sin, "sin")?;
    AngleTable::from_cos_sin(cos, sin, opts)
}

pub fn rope_fwd(input: &Tensor, freqs: &Tensor, opts: &RopeOptions) -> Result<Tensor> {
    log_call("rope_fwd", &[("input", input), ("freqs", freqs)]);
    single(input, "input", angle_table(freqs, opts), opts, Direction::Forward)
}

pub fn rope_bwd(output_grads: &Tensor, freqs: &Tensor, opts: &RopeOptions) -> Result<Tensor> {
    log_call("rope_bwd", &[("output_grads", output_grads), ("freqs", freqs)]);
    single(output_grads, "output_grads", angle_table(freqs, opts), opts, Direction::Backward)
}

/// Rotates two operands that share `s`, `b` and `d` with one table.
pub fn rope_2c_fwd(x: &Tensor, y: &Tensor, freqs: &Tensor, opts: &RopeOptions) -> Result<(Tensor, Tensor)> {
    log_call("rope_2c_fwd", &[("x", x), ("y", y), ("freqs", freqs)]);
    pair(x, y, angle_table(freqs, opts), None, opts, Direction::Forward)
}

pub fn rope_2c_bwd(
    grad_x: &Tensor,
    grad_y: &Tensor,
    freqs: &Tensor,
    opts: &RopeOptions,
) -> Result<(Tensor, Tensor)> {
    log_call("rope_2c_bwd", &[("grad_x", grad_x), ("grad_y", grad_y), ("freqs", freqs)]);
    pair(grad_x, grad_y, angle_table(freqs, opts), None, opts, Direction::Backward)
}

pub fn rope_cached_fwd(input: &Tensor, cos: &Tensor, sin: &Tensor, opts: &RopeOptions) -> Result<Tensor> {
    log_call("rope_cached_fwd", &[("input", input), ("cos", cos), ("sin", sin)]);
    single(input, "input", cos_sin_table(cos, sin, opts), opts, Direction::Forward)
}

pub fn rope_cached_bwd(output_grads: &Tensor, cos: &Tensor, sin: &Tensor, opts: &RopeOptions) -> Result<Tensor> {
    log_call("rope_cached_bwd", &[("output_grads", output_grads), ("cos", cos), ("sin", sin)]);
    single(
        output_grads,
        "output_grads",
        cos_sin_table(cos, sin, opts),
        opts,
        Direction::Backward,
    )
}

pub fn rope_cached_2c_fwd(
    x: &Tensor,
    y: &Tensor,
    cos: &Tensor,
    sin: &Tensor,
    opts: &RopeOptions,
) -> Result<(Tensor, Tensor)> {
    log_call("rope_cached_2c_fwd", &[("x", x), ("y", y), ("cos", cos), ("sin", sin)]);
    pair(x, y, cos_sin_table(cos, sin, opts), None, opts, Direction::Forward)
}

pub fn rope_cached_2c_bwd(
    grad_x: &Tensor,
    grad_y: &Tensor,
    cos: &Tensor,
    sin: &Tensor,
    opts: &RopeOptions,
) -> Result<(Tensor, Tensor)> {
    log_call(
        "rope_cached_2c_bwd",
        &[("grad_x", grad_x), ("grad_y", grad_y), ("cos", cos), ("sin", sin)],
    );
    pair(grad_x, grad_y, cos_sin_table(cos, sin, opts), None, opts, Direction::Backward)
}

/// Like [`rope_cached_2c_fwd`], reading table row `positions[s, b]`.
pub fn rope_cached_positions_2c_fwd(
    x: &Tensor,
    y: &Tensor,
    cos: &Tensor,
    sin: &Tensor,
    positions: &Tensor,
    opts: &RopeOptions,
) -> Result<(Tensor, Tensor)> {
    log_call(
        "rope_cached_positions_2c_fwd",
        &[("x", x), ("y", y), ("cos", cos), ("sin", sin), ("positions", positions)],
    );
    let (s, b) = check_pair(x, y)?;
    let rows = indexed_rows(positions, None, &[s, b])?;
    pair(x, y, cos_sin_table(cos, sin, opts), Some(rows), opts, Direction::Forward)
}

/// Like [`rope_cached_positions_2c_fwd`], reading row `positions + offsets`.
pub fn rope_cached_positions_offsets_2c_fwd(
    x: &Tensor,
    y: &Tensor,
    cos: &Tensor,
    sin: &Tensor,
    positions: &Tensor,
    offsets: &Tensor,
    opts: &RopeOptions,
) -> Result<(Tensor, Tensor)> {
    log_call(
        "rope_cached_positions_offsets_2c_fwd",
        &[
            ("x", x),
            ("y", y),
            ("cos", cos),
            ("sin", sin),
            ("positions", positions),
            ("offsets", offsets),
        ],
    );
    let (s, b) = check_pair(x, y)?;
    let rows = indexed_rows(positions, Some(offsets), &[s, b])?;
    pair(x, y, cos_sin_table(cos, sin, opts), Some(rows), opts, Direction::Forward)
}
