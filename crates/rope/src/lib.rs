//! Rotary position embedding operators.
//!
//! All variants pair channels either NEOX-style (`i`, `i + r/2`) or GPT-J
//! style (`2i`, `2i + 1`) and keep the non-rotated channels untouched:
//!
//! * [`sbhd`] for `[s, b, h, d]` operands, with angle or cos/sin tables and
//!   optional per-token positions,
//! * [`thd`] for sequence-packed `[t, h, d]` operands,
//! * [`grid`] for 2-D image patches,
//! * [`pos_encoding`] for in-place `query`/`key` rotation,
//! * [`tables`] to build and cache the angle tables themselves.

pub mod grid;
pub mod kernel;
pub mod pos_encoding;
pub mod sbhd;
pub mod style;
pub mod tables;
pub mod thd;

pub use grid::{rope_2d_bwd, rope_2d_fwd, GridTables};
pub use pos_encoding::{batched_rotary_embedding, rotary_embedding};
pub use sbhd::{
    rope_2c_bwd, rope_2c_fwd, rope_bwd, rope_cached_2c_bwd, rope_cached_2c_fwd, rope_cached_bwd,
    rope_cached_fwd, rope_cached_positions_2c_fwd, rope_cached_positions_offsets_2c_fwd, rope_fwd,
};
pub use style::{RopeOptions, RotateStyle};
pub use tables::{cos_sin_tables, freqs_table, RopeConfig, RopeScaling};
pub use thd::{rope_thd_bwd, rope_thd_fwd};
