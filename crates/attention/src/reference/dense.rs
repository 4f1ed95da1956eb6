//! Dense attention over gathered cache contents, used to validate
//! [`paged_attention`](crate::paged_attention).
//!
//! Keys and values are gathered into contiguous `[num_kv_heads, ctx,
//! head_size]` tensors per sequence and attended with candle's matmul and
//! softmax, so the reduction shares no code with the partitioned kernel.

use candle_core::{DType, Device, Tensor};
use candle_nn::ops::softmax_last_dim;
use opkit_core::{checks::expect_same_device, host::read_f32, Result};

use crate::core::PagedAttentionConfig;
use crate::kv_cache::{read_cache, CacheLayout};
use crate::paged::{query_dims, read_alibi, read_sequence_tables};

/// Gathers `[num_kv_heads, ctx, head_size]` keys and values of one sequence.
fn gather_sequence(
    layout: &CacheLayout,
    keys: &[f32],
    values: &[f32],
    blocks: &[usize],
    ctx: usize,
    device: &Device,
) -> Result<(Tensor, Tensor)> {
    let CacheLayout {
        num_kv_heads,
        head_size,
        block_size,
        ..
    } = *layout;
    let mut k = Vec::with_capacity(num_kv_heads * ctx * head_size);
    let mut v = Vec::with_capacity(k.capacity());
    for head in 0..num_kv_heads {
        for token in 0..ctx {
            let (block, offset) = (blocks[token / block_size], token % block_size);
            for dim in 0..head_size {
                k.push(keys[layout.key_index(block, head, offset, dim)]);
                v.push(values[layout.value_index(block, head, offset, dim)]);
            }
        }
    }
    Ok((
        Tensor::from_vec(k, (num_kv_heads, ctx, head_size), device)?,
        Tensor::from_vec(v, (num_kv_heads, ctx, head_size), device)?,
    ))
}

/// `[num_seqs, num_heads, head_size]` attention output in the query dtype.
#[allow(clippy::too_many_arguments)]
pub fn reference_paged_attention(
    query: &Tensor,
    key_cache: &Tensor,
    value_cache: &Tensor,
    block_tables: &Tensor,
    context_lens: &Tensor,
    alibi_slopes: Option<&Tensor>,
    config: &PagedAttentionConfig,
) -> Result<Tensor> {
    expect_same_device(&[(query, "query"), (key_cache, "key_cache"), (value_cache, "value_cache")])?;
    let layout = CacheLayout::from_caches(key_cache, value_cache)?;
    let (num_seqs, num_heads) = query_dims(query, &layout, config)?;
    let tables = read_sequence_tables(block_tables, context_lens, num_seqs, &layout, config.max_context_len)?;
    let slopes = read_alibi(alibi_slopes, num_heads)?;
    let keys = read_cache(key_cache, "key_cache", config.kv_cache_dtype, config.k_scale)?;
    let values = read_cache(value_cache, "value_cache", config.kv_cache_dtype, config.v_scale)?;

    let device = Device::Cpu;
    let kvh = config.num_kv_heads;
    let group = num_heads / kvh;
    let head_size = layout.head_size;
    let q = Tensor::from_vec(read_f32(query)?, (num_seqs, num_heads, head_size), &device)?;

    let mut outputs = Vec::with_capacity(num_seqs);
    for seq in 0..num_seqs {
        let ctx = tables.context_lens[seq];
        if ctx == 0 {
            outputs.push(Tensor::zeros((num_heads, head_size), DType::F32, &device)?);
            continue;
        }
        let (k, v) = gather_sequence(&layout, &keys, &values, &tables.blocks[seq], ctx, &device)?;
        let q_seq = q.get(seq)?.reshape((kvh, group, head_size))?;
        let mut scores = (q_seq.matmul(&k.transpose(1, 2)?.contiguous()?)? * config.scale as f64)?;
        if let Some(slopes) = &slopes {
            let bias: Vec<f32> = slopes
                .iter()
                .flat_map(|&s| (0..ctx).map(move |t| s * (t as f32 - ctx as f32 + 1.0)))
                .collect();
            scores = (scores + Tensor::from_vec(bias, (kvh, group, ctx), &device)?)?;
        }
        let probs = softmax_last_dim(&scores)?;
        outputs.push(probs.matmul(&v)?.reshape((num_heads, head_size))?);
    }
    let out = Tensor::stack(&outputs, 0)?.to_dtype(query.dtype())?;
    Ok(out.to_device(query.device())?)
}
