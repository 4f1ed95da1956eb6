//! Configuration shared by the paged attention operator and cache writers.

use std::{fmt, str::FromStr};

use candle_core::DType;
use opkit_core::{dtype::is_float, OpError, OpsConfig, Result};

/// Storage format of the key/value caches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum KvCacheDtype {
    /// Caches hold the query's float dtype.
    #[default]
    Auto,
    /// Caches hold `U8` bytes of FP8 E4M3 values, dequantized with
    /// `k_scale`/`v_scale`.
    Fp8E4m3,
}

impl KvCacheDtype {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Auto => "auto",
            Self::Fp8E4m3 => "fp8_e4m3",
        }
    }

    pub fn is_fp8(&self) -> bool {
        matches!(self, Self::Fp8E4m3)
    }

    /// Checks that a cache tensor's dtype agrees with this storage format.
    pub fn check_cache(&self, cache_dtype: DType, name: &str) -> Result<()> {
        match self {
            Self::Auto if is_float(cache_dtype) => Ok(()),
            Self::Fp8E4m3 if cache_dtype == DType::U8 => Ok(()),
            _ => Err(OpError::dtype(format!(
                "{name} is {cache_dtype:?}, inconsistent with kv_cache_dtype '{}'",
                self.as_str()
            ))),
        }
    }
}

impl FromStr for KvCacheDtype {
    type Err = OpError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "auto" => Ok(Self::Auto),
            "fp8" | "fp8_e4m3" => Ok(Self::Fp8E4m3),
            other => Err(OpError::argument(
                "kv_cache_dtype",
                format!("unknown cache dtype '{other}' (expected auto, fp8 or fp8_e4m3)"),
            )),
        }
    }
}

impl fmt::Display for KvCacheDtype {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Scalar arguments of [`paged_attention`](crate::paged_attention).
#[derive(Debug, Clone, PartialEq)]
pub struct PagedAttentionConfig {
    pub num_kv_heads: usize,
    /// Multiplier applied to `q·k` before the softmax.
    pub scale: f32,
    /// Tokens per cache block.
    pub block_size: usize,
    /// Upper bound on every `context_lens` entry; fixes the partition count.
    pub max_context_len: usize,
    pub kv_cache_dtype: KvCacheDtype,
    pub k_scale: f32,
    pub v_scale: f32,
    /// Context tokens reduced per partition; a multiple of `block_size`.
    pub partition_size: usize,
}

impl PagedAttentionConfig {
    /// Auto cache dtype, unit kv scales and the globally configured
    /// partition size.
    pub fn new(num_kv_heads: usize, scale: f32, block_size: usize, max_context_len: usize) -> Self {
        Self {
            num_kv_heads,
            scale,
            block_size,
            max_context_len,
            kv_cache_dtype: KvCacheDtype::Auto,
            k_scale: 1.0,
            v_scale: 1.0,
            partition_size: OpsConfig::global().partition_size,
        }
    }

    pub fn with_kv_cache_dtype(mut self, kv_cache_dtype: KvCacheDtype) -> Self {
        self.kv_cache_dtype = kv_cache_dtype;
        self
    }

    pub fn with_kv_scales(mut self, k_scale: f32, v_scale: f32) -> Self {
        self.k_scale = k_scale;
        self.v_scale = v_scale;
        self
    }

    pub fn with_partition_size(mut self, partition_size: usize) -> Self {
        self.partition_size = partition_size;
        self
    }

    /// `ceil(max_context_len / partition_size)`.
    pub fn num_partitions(&self) -> usize {
        self.max_context_len.div_ceil(self.partition_size.max(1))
    }

    pub fn validate(&self, num_heads: usize) -> Result<()> {
        if self.block_size == 0 {
            return Err(OpError::argument("block_size", "must be positive"));
        }
        if self.partition_size == 0 || self.partition_size % self.block_size != 0 {
            return Err(OpError::argument(
                "partition_size",
                format!(
                    "{} must be a positive multiple of block_size {}",
                    self.partition_size, self.block_size
                ),
            ));
        }
        if self.num_kv_heads == 0 || num_heads % self.num_kv_heads != 0 {
            return Err(OpError::argument(
                "num_kv_heads",
                format!("{num_heads} query heads cannot be grouped over {} kv heads", self.num_kv_heads),
            ));
        }
        if self.kv_cache_dtype.is_fp8() && !(self.k_scale > 0.0 && self.v_scale > 0.0) {
            return Err(OpError::argument("k_scale", "fp8 caches need positive k/v scales"));
        }
        Ok(())
    }
}
