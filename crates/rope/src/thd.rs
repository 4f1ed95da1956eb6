//! Rotary embedding over sequence-packed `[t, h, d]` operands.
//!
//! Sequences are concatenated along `t`; `cu_seqlens[i]..cu_seqlens[i + 1]`
//! spans sequence `i`, and each token reads the table row of its position
//! within its own sequence.

use candle_core::Tensor;
use opkit_core::{
    checks::expect_rank,
    host::read_indices,
    testing::log_call,
    OpError, Result,
};

use crate::kernel::{head_geometry, rotate_tensor, AngleTable, Direction, Segment};
use crate::sbhd::check_row_table;
use crate::style::{validate_rotary_width, RopeOptions};

/// Per-token row index derived from cumulative sequence lengths.
pub fn packed_rows(cu_seqlens: &Tensor, tokens: usize) -> Result<Vec<usize>> {
    expect_rank(cu_seqlens, 1, "cu_seqlens")?;
    let bounds = read_indices(cu_seqlens, "cu_seqlens")?;
    match (bounds.first(), bounds.last()) {
        (Some(&0), Some(&last)) if last >= 0 && last as usize == tokens => {}
        _ => {
            return Err(OpError::argument(
                "cu_seqlens",
                format!("must start at 0 and end at {tokens}, got {bounds:?}"),
            ))
        }
    }
    let mut rows = Vec::with_capacity(tokens);
    for window in bounds.windows(2) {
        let (start, end) = (window[0], window[1]);
        if end < start {
            return Err(OpError::argument(
                "cu_seqlens",
                format!("must be non-decreasing, got {bounds:?}"),
            ));
        }
        rows.extend(0..(end - start) as usize);
    }
    Ok(rows)
}

fn run(
    input: &Tensor,
    name: &str,
    cu_seqlens: &Tensor,
    freqs: &Tensor,
    opts: &RopeOptions,
    direction: Direction,
) -> Result<Tensor> {
    let dims = expect_rank(input, 3, name)?;
    let tokens = dims[0];
    let (_, head_dim) = head_geometry(input, name)?;
    check_row_table(freqs, "freqs")?;
    let table = AngleTable::from_freqs(freqs, opts)?;
    validate_rotary_width(table.rot(), head_dim)?;
    let rows = packed_rows(cu_seqlens, tokens)?;
    table.check_rows(&rows, "freqs")?;
    let segment = Segment {
        offset: opts.rotary_offset(head_dim, table.rot()),
        table: &table,
        rows: &rows,
    };
    rotate_tensor(input, name, &[segment], opts.style, direction)
}

pub fn rope_thd_fwd(input: &Tensor, cu_seqlens: &Tensor, freqs: &Tensor, opts: &RopeOptions) -> Result<Tensor> {
    log_call("rope_thd_fwd", &[("input", input), ("cu_seqlens", cu_seqlens), ("freqs", freqs)]);
    run(input, "input", cu_seqlens, freqs, opts, Direction::Forward)
}

pub fn rope_thd_bwd(
    output_grads: &Tensor,
    cu_seqlens: &Tensor,
    freqs: &Tensor,
    opts: &RopeOptions,
) -> Result<Tensor> {
    log_call(
        "rope_thd_bwd",
        &[("output_grads", output_grads), ("cu_seqlens", cu_seqlens), ("freqs", freqs)],
    );
    run(output_grads, "output_grads", cu_seqlens, freqs, opts, Direction::Backward)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{rope_fwd, RotateStyle};
    use candle_core::Device;

    #[test]
    fn rows_restart_per_sequence() -> Result<()> {
        let cu = Tensor::from_vec(vec![0u32, 3, 3, 5], 4, &Device::Cpu)?;
        assert_eq!(packed_rows(&cu, 5)?, vec![0, 1, 2, 0, 1]);
        let bad_end = Tensor::from_vec(vec![0u32, 3], 2, &Device::Cpu)?;
        assert!(packed_rows(&bad_end, 5).is_err());
        let decreasing = Tensor::from_vec(vec![0i64, 4, 2, 5], 4, &Device::Cpu)?;
        assert!(packed_rows(&decreasing, 5).is_err());
        Ok(())
    }

    #[test]
    fn packed_sequences_match_per_sequence_sbhd() -> Result<()> {
        let device = Device::Cpu;
        let data: Vec<f32> = (0..5 * 2 * 8).map(|i| (i as f32 * 0.21).cos()).collect();
        let packed = Tensor::from_vec(data, (5, 2, 8), &device)?;
        let freqs = Tensor::from_vec((0..4 * 4).map(|i| i as f32 * 0.05).collect::<Vec<_>>(), (4, 1, 1, 4), &device)?;
        let cu = Tensor::from_vec(vec![0i64, 2, 5], 3, &device)?;
        let opts = RopeOptions::new(RotateStyle::Neox).reuse_freqs_front_part(true);
        let out = rope_thd_fwd(&packed, &cu, &freqs, &opts)?;

        // second sequence alone, as [s, 1, h, d]
        let second = packed.narrow(0, 2, 3)?.unsqueeze(1)?;
        let expected = rope_fwd(&second, &freqs, &opts)?.squeeze(1)?;
        let got = out.narrow(0, 2, 3)?;
        let diff = (got - expected)?.abs()?.max_all()?.to_vec0::<f32>()?;
        assert!(diff < 1e-6);
        Ok(())
    }
}
