//! Paged attention over block-organized key/value caches.
//!
//! Each sequence attends with one query token to its `context_len` cached
//! tokens, located through its row of `block_tables`. The context is cut
//! into partitions of `partition_size` tokens; every partition reports its
//! max logit, exp sum and normalized partial output, and the final output
//! merges them with the usual `exp(max_p - max)` rescaling.

pub mod partition;

use candle_core::{DType, Device, Tensor};
use opkit_core::{
    checks::{expect_index_dtype, expect_rank, expect_same_device},
    dtype::ensure_float,
    fp8,
    host::{read_f32, read_indices, write_f32},
    testing::log_call,
    OpError, Result,
};
use rayon::prelude::*;

use crate::core::PagedAttentionConfig;
use crate::kv_cache::{read_cache, CacheLayout};
use partition::{combine_partitions, CacheView, HeadTask, PartitionStats};

/// Results of [`paged_attention`].
#[derive(Debug, Clone)]
pub struct PagedAttentionOutput {
    /// `[num_seqs, num_heads, head_size]` in the query dtype, or `U8` FP8
    /// bytes when an output scale was given.
    pub out: Tensor,
    /// `[num_seqs, num_heads, num_partitions]` `F32`.
    pub exp_sums: Tensor,
    /// `[num_seqs, num_heads, num_partitions]` `F32`.
    pub max_logits: Tensor,
    /// `[num_seqs, num_heads, num_partitions, head_size]` `F32`.
    pub tmp_out: Tensor,
}

/// Validated host copy of the sequence tables.
pub(crate) struct SequenceTables {
    pub context_lens: Vec<usize>,
    /// Per sequence, only the blocks its context covers.
    pub blocks: Vec<Vec<usize>>,
}

pub(crate) fn read_sequence_tables(
    block_tables: &Tensor,
    context_lens: &Tensor,
    num_seqs: usize,
    layout: &CacheLayout,
    max_context_len: usize,
) -> Result<SequenceTables> {
    expect_index_dtype(block_tables, "block_tables")?;
    expect_index_dtype(context_lens, "context_lens")?;
    let bt = expect_rank(block_tables, 2, "block_tables")?;
    if bt[0] != num_seqs {
        return Err(OpError::shape(format!(
            "block_tables has {} rows for {num_seqs} sequences",
            bt[0]
        )));
    }
    let max_blocks = bt[1];
    let lens = read_indices(context_lens, "context_lens")?;
    if lens.len() != num_seqs {
        return Err(OpError::shape(format!(
            "context_lens has {} entries for {num_seqs} sequences",
            lens.len()
        )));
    }
    let table = read_indices(block_tables, "block_tables")?;

    let mut out = SequenceTables {
        context_lens: Vec::with_capacity(num_seqs),
        blocks: Vec::with_capacity(num_seqs),
    };
    for (seq, &len) in lens.iter().enumerate() {
        let len = usize::try_from(len)
            .map_err(|_| OpError::argument("context_lens", format!("sequence {seq} has negative length {len}")))?;
        if len > max_context_len {
            return Err(OpError::argument(
                "context_lens",
                format!("sequence {seq} has {len} tokens, above max_context_len {max_context_len}"),
            ));
        }
        let used = len.div_ceil(layout.block_size);
        if used > max_blocks {
            return Err(OpError::argument(
                "context_lens",
                format!("sequence {seq} needs {used} blocks but block_tables holds {max_blocks}"),
            ));
        }
        let row = &table[seq * max_blocks..seq * max_blocks + used];
        let blocks = row
            .iter()
            .map(|&id| match usize::try_from(id) {
                Ok(id) if id < layout.num_blocks => Ok(id),
                _ => Err(OpError::argument(
                    "block_tables",
                    format!("sequence {seq} references block {id} of {}", layout.num_blocks),
                )),
            })
            .collect::<Result<Vec<_>>>()?;
        out.context_lens.push(len);
        out.blocks.push(blocks);
    }
    Ok(out)
}

pub(crate) fn read_alibi(alibi_slopes: Option<&Tensor>, num_heads: usize) -> Result<Option<Vec<f32>>> {
    let Some(slopes) = alibi_slopes else {
        return Ok(None);
    };
    ensure_float(slopes.dtype(), "alibi_slopes")?;
    if slopes.dims() != [num_heads] {
        return Err(OpError::shape(format!(
            "alibi_slopes {:?} must be [{num_heads}]",
            slopes.dims()
        )));
    }
    Ok(Some(read_f32(slopes)?))
}

fn read_out_scale(fp8_out_scale: Option<&Tensor>) -> Result<Option<f32>> {
    let Some(scale) = fp8_out_scale else {
        return Ok(None);
    };
    let values = read_f32(scale)?;
    match values.as_slice() {
        [s] if *s > 0.0 => Ok(Some(*s)),
        _ => Err(OpError::argument("fp8_out_scale", "must be a single positive value")),
    }
}

/// Query `[num_seqs, num_heads, head_size]` checked against the cache layout.
pub(crate) fn query_dims(query: &Tensor, layout: &CacheLayout, config: &PagedAttentionConfig) -> Result<(usize, usize)> {
    ensure_float(query.dtype(), "query")?;
    let qd = expect_rank(query, 3, "query")?;
    let (num_seqs, num_heads, head_size) = (qd[0], qd[1], qd[2]);
    if head_size != layout.head_size {
        return Err(OpError::shape(format!(
            "query head_size {head_size} != cache head_size {}",
            layout.head_size
        )));
    }
    if layout.num_kv_heads != config.num_kv_heads {
        return Err(OpError::shape(format!(
            "caches hold {} kv heads, config says {}",
            layout.num_kv_heads, config.num_kv_heads
        )));
    }
    if layout.block_size != config.block_size {
        return Err(OpError::shape(format!(
            "caches use block size {}, config says {}",
            layout.block_size, config.block_size
        )));
    }
    config.validate(num_heads)?;
    Ok((num_seqs, num_heads))
}

/// Paged attention; see the module docs for the reduction.
///
/// With `fp8_out_scale` the output holds FP8 E4M3 bytes of `value / scale`.
#[allow(clippy::too_many_arguments)]
pub fn paged_attention(
    query: &Tensor,
    key_cache: &Tensor,
    value_cache: &Tensor,
    block_tables: &Tensor,
    context_lens: &Tensor,
    alibi_slopes: Option<&Tensor>,
    fp8_out_scale: Option<&Tensor>,
    config: &PagedAttentionConfig,
) -> Result<PagedAttentionOutput> {
    log_call(
        "paged_attention",
        &[
            ("query", query),
            ("key_cache", key_cache),
            ("value_cache", value_cache),
            ("block_tables", block_tables),
            ("context_lens", context_lens),
        ],
    );
    expect_same_device(&[
        (query, "query"),
        (key_cache, "key_cache"),
        (value_cache, "value_cache"),
        (block_tables, "block_tables"),
        (context_lens, "context_lens"),
    ])?;
    let layout = CacheLayout::from_caches(key_cache, value_cache)?;
    let (num_seqs, num_heads) = query_dims(query, &layout, config)?;
    let head_size = layout.head_size;
    let tables = read_sequence_tables(block_tables, context_lens, num_seqs, &layout, config.max_context_len)?;
    let slopes = read_alibi(alibi_slopes, num_heads)?;
    let out_scale = read_out_scale(fp8_out_scale)?;

    let keys = read_cache(key_cache, "key_cache", config.kv_cache_dtype, config.k_scale)?;
    let values = read_cache(value_cache, "value_cache", config.kv_cache_dtype, config.v_scale)?;
    let q = read_f32(query)?;
    let cache = CacheView {
        layout,
        keys: &keys,
        values: &values,
    };

    let num_partitions = config.num_partitions();
    let group = num_heads / config.num_kv_heads;
    log::debug!(
        "paged_attention: seqs={num_seqs} heads={num_heads} kv_heads={} partitions={num_partitions} cache={}",
        config.num_kv_heads,
        config.kv_cache_dtype
    );

    let heads: Vec<(Vec<PartitionStats>, Vec<f32>)> = (0..num_seqs * num_heads)
        .into_par_iter()
        .map(|idx| {
            let (seq, head) = (idx / num_heads, idx % num_heads);
            let task = HeadTask {
                query: &q[idx * head_size..(idx + 1) * head_size],
                kv_head: head / group,
                blocks: &tables.blocks[seq],
                context_len: tables.context_lens[seq],
                scale: config.scale,
                alibi_slope: slopes.as_ref().map(|s| s[head]),
            };
            let parts: Vec<PartitionStats> = (0..num_partitions)
                .map(|p| task.partition(&cache, p * config.partition_size, (p + 1) * config.partition_size))
                .collect();
            let out = combine_partitions(&parts, head_size);
            (parts, out)
        })
        .collect();

    let mut out = Vec::with_capacity(num_seqs * num_heads * head_size);
    let mut exp_sums = Vec::with_capacity(num_seqs * num_heads * num_partitions);
    let mut max_logits = Vec::with_capacity(exp_sums.capacity());
    let mut tmp_out = Vec::with_capacity(exp_sums.capacity() * head_size);
    for (parts, head_out) in heads {
        out.extend(head_out);
        for part in parts {
            exp_sums.push(part.exp_sum);
            max_logits.push(part.max_logit);
            tmp_out.extend(part.out);
        }
    }

    let device = query.device();
    let out = match out_scale {
        Some(scale) => encode_fp8_output(&out, &[num_seqs, num_heads, head_size], scale, device)?,
        None => write_f32(out, &[num_seqs, num_heads, head_size], query.dtype(), device)?,
    };
    Ok(PagedAttentionOutput {
        out,
        exp_sums: write_f32(exp_sums, &[num_seqs, num_heads, num_partitions], DType::F32, device)?,
        max_logits: write_f32(max_logits, &[num_seqs, num_heads, num_partitions], DType::F32, device)?,
        tmp_out: write_f32(
            tmp_out,
            &[num_seqs, num_heads, num_partitions, head_size],
            DType::F32,
            device,
        )?,
    })
}

fn encode_fp8_output(values: &[f32], dims: &[usize], scale: f32, device: &Device) -> Result<Tensor> {
    let bytes = fp8::encode_scaled(values, scale);
    Ok(Tensor::from_vec(bytes, dims, &Device::Cpu)?.to_device(device)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::KvCacheDtype;
    use crate::kv_cache::reshape_and_cache;

    fn single_sequence(context: usize) -> Result<(Tensor, Tensor, Tensor, Tensor, Tensor)> {
        let device = Device::Cpu;
        let layout = CacheLayout::new(4, 1, 4, 2, 2)?;
        let (kc, vc) = layout.allocate(DType::F32, &device)?;
        if context > 0 {
            let key = Tensor::arange(0f32, (context * 4) as f32, &device)?.reshape((context, 1, 4))?;
            let key = (key * 0.1)?;
            let value = key.cos()?;
            let slots = Tensor::arange(0i64, context as i64, &device)?;
            reshape_and_cache(&key, &value, &kc, &vc, &slots, KvCacheDtype::Auto, 1.0, 1.0)?;
        }
        let query = Tensor::ones((1, 2, 4), DType::F32, &device)?;
        let tables = Tensor::from_vec(vec![0u32, 1, 2, 3], (1, 4), &device)?;
        let lens = Tensor::from_vec(vec![context as u32], 1, &device)?;
        Ok((query, kc, vc, tables, lens))
    }

    #[test]
    fn zero_context_yields_zero_output() -> Result<()> {
        let (q, kc, vc, bt, lens) = single_sequence(0)?;
        let cfg = PagedAttentionConfig::new(1, 0.5, 2, 8).with_partition_size(4);
        let res = paged_attention(&q, &kc, &vc, &bt, &lens, None, None, &cfg)?;
        assert_eq!(res.out.flatten_all()?.to_vec1::<f32>()?, vec![0.0; 8]);
        assert_eq!(res.exp_sums.dims(), &[1, 2, 2]);
        assert!(res
            .max_logits
            .flatten_all()?
            .to_vec1::<f32>()?
            .iter()
            .all(|v| *v == f32::NEG_INFINITY));
        Ok(())
    }

    #[test]
    fn partition_size_does_not_change_the_output() -> Result<()> {
        let (q, kc, vc, bt, lens) = single_sequence(5)?;
        let coarse = PagedAttentionConfig::new(1, 0.5, 2, 8).with_partition_size(8);
        let fine = coarse.clone().with_partition_size(2);
        let a = paged_attention(&q, &kc, &vc, &bt, &lens, None, None, &coarse)?;
        let b = paged_attention(&q, &kc, &vc, &bt, &lens, None, None, &fine)?;
        let diff = (a.out - b.out)?.abs()?.max_all()?.to_vec0::<f32>()?;
        assert!(diff < 1e-6);
        assert_eq!(b.tmp_out.dims(), &[1, 2, 4, 4]);
        // the last fine partition is empty
        assert_eq!(b.exp_sums.get(0)?.get(0)?.to_vec1::<f32>()?[3], 0.0);
        Ok(())
    }

    #[test]
    fn contract_violations_are_reported() -> Result<()> {
        let (q, kc, vc, bt, lens) = single_sequence(3)?;
        let cfg = PagedAttentionConfig::new(1, 0.5, 2, 8).with_partition_size(3);
        assert!(matches!(
            paged_attention(&q, &kc, &vc, &bt, &lens, None, None, &cfg),
            Err(OpError::InvalidArgument { arg: "partition_size", .. })
        ));
        let short = PagedAttentionConfig::new(1, 0.5, 2, 2).with_partition_size(2);
        assert!(paged_attention(&q, &kc, &vc, &bt, &lens, None, None, &short).is_err());
        let bad_tables = Tensor::from_vec(vec![0u32, 9, 0, 0], (1, 4), &Device::Cpu)?;
        let cfg = PagedAttentionConfig::new(1, 0.5, 2, 8).with_partition_size(4);
        assert!(matches!(
            paged_attention(&q, &kc, &vc, &bad_tables, &lens, None, None, &cfg),
            Err(OpError::InvalidArgument { arg: "block_tables", .. })
        ));
        let fp8 = cfg.clone().with_kv_cache_dtype(KvCacheDtype::Fp8E4m3);
        assert!(matches!(
            paged_attention(&q, &kc, &vc, &bt, &lens, None, None, &fp8),
            Err(OpError::UnsupportedDType { .. })
        ));
        Ok(())
    }

    #[test]
    fn fp8_output_is_scaled() -> Result<()> {
        let (q, kc, vc, bt, lens) = single_sequence(4)?;
        let cfg = PagedAttentionConfig::new(1, 0.5, 2, 8).with_partition_size(4);
        let plain = paged_attention(&q, &kc, &vc, &bt, &lens, None, None, &cfg)?;
        let scale = Tensor::new(&[0.5f32], &Device::Cpu)?;
        let quant = paged_attention(&q, &kc, &vc, &bt, &lens, None, Some(&scale), &cfg)?;
        assert_eq!(quant.out.dtype(), DType::U8);
        let decoded = fp8::decode_scaled(&quant.out.flatten_all()?.to_vec1::<u8>()?, 0.5);
        for (a, b) in decoded.iter().zip(plain.out.flatten_all()?.to_vec1::<f32>()?) {
            assert!((a - b).abs() <= 0.07 * b.abs() + 1e-3, "{a} vs {b}");
        }
        Ok(())
    }
}
