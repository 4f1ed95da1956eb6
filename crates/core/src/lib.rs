//! Shared plumbing for the opkit operator crates.
//!
//! Operators stage their operands through host `f32` buffers ([`host`]),
//! validate shapes with [`checks`], and report failures as [`OpError`].

pub mod checks;
pub mod config;
pub mod dtype;
pub mod dump;
pub mod error;
pub mod fp8;
pub mod host;
pub mod testing;

pub use config::{OpsConfig, PerfConfig};
pub use error::{OpError, Result};
