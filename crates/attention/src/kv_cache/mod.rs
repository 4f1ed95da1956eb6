//! Block-organized key/value caches: layout, writers and block bookkeeping.

pub mod allocator;
pub mod block_table;
pub mod layout;
pub mod storage;
pub mod writer;

#[cfg(test)]
mod tests;

pub use allocator::{BlockAllocator, BlockAllocatorStats, BlockId};
pub use block_table::BlockTable;
pub use layout::CacheLayout;
pub use storage::{cache_storage_dtype, read_cache};
pub use writer::reshape_and_cache;
