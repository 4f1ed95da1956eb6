//! Host reference operators for LLM inference on candle tensors.
//!
//! Each concern lives in its own crate; this facade re-exports them along
//! with the most used entry points.

pub use attention;
pub use elementwise;
pub use moe;
pub use opkit_core as core;
pub use quant_gemm as gemm;
pub use rope;

pub use attention::{
    paged_attention, reference_paged_attention, reshape_and_cache, BlockAllocator, BlockTable, CacheLayout,
    KvCacheDtype, PagedAttentionConfig, PagedAttentionOutput,
};
pub use moe::{fused_experts, fused_experts_, fused_moe, ExpertOptions, MoeKernelConfig, RoutingMethod};
pub use opkit_core::{OpError, OpsConfig, Result};
pub use quant_gemm::{batched_gemm_a8w8, batched_gemm_a8w8_tune, TunedGemmTable};
pub use rope::{rotary_embedding, RopeConfig, RopeOptions, RotateStyle};

/// Sizes a global rayon pool for the host kernels; `0` keeps rayon's default.
pub fn init_thread_pool(num_threads: usize) -> Result<()> {
    if num_threads == 0 {
        return Ok(());
    }
    rayon::ThreadPoolBuilder::new()
        .num_threads(num_threads)
        .build_global()
        .map_err(|err| OpError::Config(format!("thread pool: {err}")))?;
    log::info!("host kernels use {num_threads} threads");
    Ok(())
}
