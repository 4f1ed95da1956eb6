//! Mixture-of-experts building blocks: gating top-k, block alignment of the
//! routed tokens, and a fused two-layer expert MLP with tuned kernel configs.

pub mod align;
pub mod config;
pub mod experts;
pub mod routing;

pub use align::{align_slots, moe_align_block_size, AlignedTokens, ExpertBlocks};
pub use config::{
    config_dtype_str, config_file_name, select_config, select_config_in, MoeConfigTable, MoeKernelConfig,
};
pub use experts::{fused_experts, fused_experts_, fused_moe, ExpertOptions, DEFAULT_CHUNK_SIZE};
pub use routing::{fused_topk, grouped_topk, RoutingFn, RoutingMethod};
