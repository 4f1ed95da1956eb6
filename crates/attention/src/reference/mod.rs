//! Dense reference implementations.
//!
//! These paths favour clarity over performance and serve as the baseline for
//! validating the paged kernel.

pub mod dense;

pub use dense::reference_paged_attention;
