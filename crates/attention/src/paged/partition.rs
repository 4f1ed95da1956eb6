//! Per-head partitioned softmax reduction.

use crate::kv_cache::CacheLayout;

/// Softmax statistics of one partition of one head.
#[derive(Debug, Clone, PartialEq)]
pub struct PartitionStats {
    pub max_logit: f32,
    pub exp_sum: f32,
    /// `Σ exp(l - max) · v / exp_sum`, `head_size` wide.
    pub out: Vec<f32>,
}

impl PartitionStats {
    pub fn empty(head_size: usize) -> Self {
        Self {
            max_logit: f32::NEG_INFINITY,
            exp_sum: 0.0,
            out: vec![0.0; head_size],
        }
    }
}

/// Dequantized caches plus the geometry needed to address them.
pub(crate) struct CacheView<'a> {
    pub layout: CacheLayout,
    pub keys: &'a [f32],
    pub values: &'a [f32],
}

/// One (sequence, head) problem.
pub(crate) struct HeadTask<'a> {
    pub query: &'a [f32],
    pub kv_head: usize,
    /// Physical blocks of the sequence, in logical order.
    pub blocks: &'a [usize],
    pub context_len: usize,
    pub scale: f32,
    pub alibi_slope: Option<f32>,
}

impl HeadTask<'_> {
    fn logit(&self, cache: &CacheView<'_>, token: usize) -> f32 {
        let bs = cache.layout.block_size;
        let block = self.blocks[token / bs];
        let offset = token % bs;
        let dot: f32 = self
            .query
            .iter()
            .enumerate()
            .map(|(d, &q)| q * cache.keys[cache.layout.key_index(block, self.kv_head, offset, d)])
            .sum();
        let bias = self
            .alibi_slope
            .map_or(0.0, |slope| slope * (token as f32 - self.context_len as f32 + 1.0));
        self.scale * dot + bias
    }

    /// Reduces context tokens `[start, end)`.
    pub fn partition(&self, cache: &CacheView<'_>, start: usize, end: usize) -> PartitionStats {
        let head_size = cache.layout.head_size;
        let end = end.min(self.context_len);
        if start >= end {
            return PartitionStats::empty(head_size);
        }
        let logits: Vec<f32> = (start..end).map(|t| self.logit(cache, t)).collect();
        let max_logit = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
        let mut exp_sum = 0.0f32;
        let mut out = vec![0.0f32; head_size];
        let bs = cache.layout.block_size;
        for (token, &l) in (start..end).zip(&logits) {
            let weight = (l - max_logit).exp();
            exp_sum += weight;
            let block = self.blocks[token / bs];
            let offset = token % bs;
            for (d, acc) in out.iter_mut().enumerate() {
                *acc += weight * cache.values[cache.layout.value_index(block, self.kv_head, offset, d)];
            }
        }
        let inv = 1.0 / exp_sum;
        out.iter_mut().for_each(|v| *v *= inv);
        PartitionStats {
            max_logit,
            exp_sum,
            out,
        }
    }
}

/// Merges partitions by rescaling each with `exp(max_p - max)`.
pub fn combine_partitions(parts: &[PartitionStats], head_size: usize) -> Vec<f32> {
    let global_max = parts.iter().map(|p| p.max_logit).fold(f32::NEG_INFINITY, f32::max);
    let mut out = vec![0.0f32; head_size];
    if global_max == f32::NEG_INFINITY {
        return out;
    }
    let mut total = 0.0f32;
    for part in parts.iter().filter(|p| p.exp_sum > 0.0) {
        let weight = part.exp_sum * (part.max_logit - global_max).exp();
        total += weight;
        for (acc, &v) in out.iter_mut().zip(&part.out) {
            *acc += weight * v;
        }
    }
    let inv = 1.0 / total;
    out.iter_mut().for_each(|v| *v *= inv);
    out
}
