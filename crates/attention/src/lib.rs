//! Paged attention over block-organized key/value caches.
//!
//! The caches follow the layout described in [`kv_cache::CacheLayout`]:
//! keys are `[num_blocks, num_kv_heads, head_size / x, block_size, x]` and
//! values `[num_blocks, num_kv_heads, head_size, block_size]`. Sequences
//! locate their tokens through a block table row; [`kv_cache::BlockAllocator`]
//! and [`kv_cache::BlockTable`] manage those rows, and
//! [`reshape_and_cache`] writes new tokens into their slots.
//!
//! Reductions are performed in `f32` on the host. Caches may hold the query's
//! float dtype or FP8 E4M3 bytes.

pub mod core;
pub mod kv_cache;
pub mod paged;
pub mod reference;

pub use crate::core::{KvCacheDtype, PagedAttentionConfig};
pub use kv_cache::{reshape_and_cache, BlockAllocator, BlockTable, CacheLayout};
pub use paged::{paged_attention, PagedAttentionOutput};
pub use reference::reference_paged_attention;
