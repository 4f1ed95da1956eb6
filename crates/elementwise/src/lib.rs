//! Elementwise arithmetic and activations registered as candle custom ops.
//!
//! Functions without a trailing underscore allocate a new tensor; `add_`,
//! `sub_`, `mul_` and `div_` mutate their first operand.

pub mod binary;
pub mod unary;

pub use binary::{add, add_, binary, binary_, div, div_, mul, mul_, sub, sub_, BinaryKind};
pub use unary::{gelu_tanh, sigmoid, tanh, unary, UnaryKind};
