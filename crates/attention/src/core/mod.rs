//! Types shared by the paged attention operator and the cache writers.

pub mod config;

pub use config::{KvCacheDtype, PagedAttentionConfig};
