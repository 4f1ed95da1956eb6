//! Two-dimensional rotary embedding for image patches laid out `[b, H*W, h, d]`.
//!
//! The rotated region is split in two: the first half rotates with the row
//! (`s / W`) tables and the second half with the column (`s % W`) tables.

use candle_core::Tensor;
use opkit_core::{checks::expect_rank, testing::log_call, OpError, Result};

use crate::kernel::{head_geometry, rotate_tensor, AngleTable, Direction, Segment};
use crate::style::{validate_rotary_width, RopeOptions};

/// Cos/sin tables for both image axes.
#[derive(Debug, Clone, Copy)]
pub struct GridTables<'a> {
    /// `[1, H', 1, width]`
    pub cos_h: &'a Tensor,
    pub sin_h: &'a Tensor,
    /// `[1, 1, W', width]`
    pub cos_w: &'a Tensor,
    pub sin_w: &'a Tensor,
}

fn check_axis_table(table: &Tensor, name: &str, axis: usize) -> Result<()> {
    let dims = expect_rank(table, 4, name)?;
    let unit_axes_ok = (0..3).filter(|&i| i != axis).all(|i| dims[i] == 1);
    if unit_axes_ok {
        Ok(())
    } else {
        Err(OpError::shape(format!(
            "{name}: only dim {axis} may exceed 1 among the leading dims, got {dims:?}"
        )))
    }
}

fn run(
    input: &Tensor,
    name: &str,
    tables: GridTables<'_>,
    img_height: usize,
    img_width: usize,
    opts: &RopeOptions,
    direction: Direction,
) -> Result<Tensor> {
    let dims = expect_rank(input, 4, name)?;
    let (batch, seq) = (dims[0], dims[1]);
    if img_height == 0 || img_width == 0 || seq != img_height * img_width {
        return Err(OpError::shape(format!(
            "{name}: sequence dim {seq} must equal img_height * img_width ({img_height} * {img_width})"
        )));
    }
    let (_, head_dim) = head_geometry(input, name)?;

    check_axis_table(tables.cos_h, "cos_h", 1)?;
    check_axis_table(tables.sin_h, "sin_h", 1)?;
    check_axis_table(tables.cos_w, "cos_w", 2)?;
    check_axis_table(tables.sin_w, "sin_w", 2)?;
    let height = AngleTable::from_cos_sin(tables.cos_h, tables.sin_h, opts)?;
    let width = AngleTable::from_cos_sin(tables.cos_w, tables.sin_w, opts)?;
    validate_rotary_width(height.rot(), head_dim)?;
    validate_rotary_width(width.rot(), head_dim)?;
    let rot = height.rot() + width.rot();
    if rot > head_dim {
        return Err(OpError::shape(format!(
            "{name}: rotated width {rot} exceeds head dim {head_dim}"
        )));
    }
    if height.rows() < img_height || width.rows() < img_width {
        return Err(OpError::argument(
            "img_height",
            format!(
                "tables cover {}x{} positions, image is {img_height}x{img_width}",
                height.rows(),
                width.rows()
            ),
        ));
    }

    let mut row_of = Vec::with_capacity(batch * seq);
    let mut col_of = Vec::with_capacity(batch * seq);
    for _ in 0..batch {
        for s in 0..seq {
            row_of.push(s / img_width);
            col_of.push(s % img_width);
        }
    }

    let base = opts.rotary_offset(head_dim, rot);
    let segments = [
        Segment {
            offset: base,
            table: &height,
            rows: &row_of,
        },
        Segment {
            offset: base + height.rot(),
            table: &width,
            rows: &col_of,
        },
    ];
    rotate_tensor(input, name, &segments, opts.style, direction)
}

pub fn rope_2d_fwd(
    input: &Tensor,
    tables: GridTables<'_>,
    img_height: usize,
    img_width: usize,
    opts: &RopeOptions,
) -> Result<Tensor> {
    log_call(
        "rope_2d_fwd",
        &[
            ("input", input),
            ("cos_h", tables.cos_h),
            ("sin_h", tables.sin_h),
            ("cos_w", tables.cos_w),
            ("sin_w", tables.sin_w),
        ],
    );
    run(input, "input", tables, img_height, img_width, opts, Direction::Forward)
}

pub fn rope_2d_bwd(
    output_grads: &Tensor,
    tables: GridTables<'_>,
    img_height: usize,
    img_width: usize,
    opts: &RopeOptions,
) -> Result<Tensor> {
    log_call(
        "rope_2d_bwd",
        &[
            ("output_grads", output_grads),
            ("cos_h", tables.cos_h),
            ("sin_h", tables.sin_h),
            ("cos_w", tables.cos_w),
            ("sin_w", tables.sin_w),
        ],
    );
    run(output_grads, "output_grads", tables, img_height, img_width, opts, Direction::Backward)
}
