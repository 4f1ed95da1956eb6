//! Index math for block-organized key/value caches.
//!
//! * key cache: `[num_blocks, num_kv_heads, head_size / x, block_size, x]`,
//!   so `x` consecutive channels of one token are adjacent in memory,
//! * value cache: `[num_blocks, num_kv_heads, head_size, block_size]`.
//!
//! A flat slot `s` addresses token `s % block_size` of block `s / block_size`.

use candle_core::{DType, Device, Tensor};
use opkit_core::{checks::expect_rank, OpError, Result};

/// Bytes packed per key-cache vector.
const KEY_VECTOR_BYTES: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheLayout {
    pub num_blocks: usize,
    pub num_kv_heads: usize,
    pub head_size: usize,
    pub block_size: usize,
    /// Channels packed together in the key cache.
    pub x: usize,
}

impl CacheLayout {
    pub fn new(num_blocks: usize, num_kv_heads: usize, head_size: usize, block_size: usize, x: usize) -> Result<Self> {
        if block_size == 0 || num_kv_heads == 0 || head_size == 0 {
            return Err(OpError::shape(format!(
                "cache layout needs positive kv heads, head size and block size, got \
                 heads={num_kv_heads} head_size={head_size} block_size={block_size}"
            )));
        }
        if x == 0 || head_size % x != 0 {
            return Err(OpError::shape(format!(
                "head_size {head_size} is not a multiple of the key vector width {x}"
            )));
        }
        Ok(Self {
            num_blocks,
            num_kv_heads,
            head_size,
            block_size,
            x,
        })
    }

    /// Layout whose key vectors pack 16 bytes of `dtype`.
    pub fn for_dtype(
        num_blocks: usize,
        num_kv_heads: usize,
        head_size: usize,
        block_size: usize,
        dtype: DType,
    ) -> Result<Self> {
        let x = (KEY_VECTOR_BYTES / dtype.size_in_bytes()).clamp(1, head_size.max(1));
        Self::new(num_blocks, num_kv_heads, head_size, block_size, x)
    }

    /// Reads the layout back from a pair of cache tensors.
    pub fn from_caches(key_cache: &Tensor, value_cache: &Tensor) -> Result<Self> {
        let kd = expect_rank(key_cache, 5, "key_cache")?;
        let vd = expect_rank(value_cache, 4, "value_cache")?;
        let layout = Self::new(kd[0], kd[1], kd[2] * kd[4], kd[3], kd[4])?;
        if vd != layout.value_shape() {
            return Err(OpError::shape(format!(
                "value_cache {vd:?} does not match key_cache {kd:?}; expected {:?}",
                layout.value_shape()
            )));
        }
        Ok(layout)
    }

    pub fn key_shape(&self) -> [usize; 5] {
        [
            self.num_blocks,
            self.num_kv_heads,
            self.head_size / self.x,
            self.block_size,
            self.x,
        ]
    }

    pub fn value_shape(&self) -> [usize; 4] {
        [self.num_blocks, self.num_kv_heads, self.head_size, self.block_size]
    }

    pub fn num_slots(&self) -> usize {
        self.num_blocks * self.block_size
    }

    /// `(block, token_in_block)` of a flat slot.
    pub fn split_slot(&self, slot: usize) -> (usize, usize) {
        (slot / self.block_size, slot % self.block_size)
    }

    #[inline]
    pub fn key_index(&self, block: usize, head: usize, token: usize, dim: usize) -> usize {
        let vectors = self.head_size / self.x;
        (((block * self.num_kv_heads + head) * vectors + dim / self.x) * self.block_size + token) * self.x
            + dim % self.x
    }

    #[inline]
    pub fn value_index(&self, block: usize, head: usize, token: usize, dim: usize) -> usize {
        ((block * self.num_kv_heads + head) * self.head_size + dim) * self.block_size + token
    }

    /// Zeroed key and value caches.
    pub fn allocate(&self, dtype: DType, device: &Device) -> Result<(Tensor, Tensor)> {
        log::info!(
            "kv-cache init: blocks={} kv_heads={} head_size={} block_size={} x={} dtype={:?}",
            self.num_blocks,
            self.num_kv_heads,
            self.head_size,
            self.block_size,
            self.x,
            dtype
        );
        Ok((
            Tensor::zeros(&self.key_shape()[..], dtype, device)?,
            Tensor::zeros(&self.value_shape()[..], dtype, device)?,
        ))
    }
}
