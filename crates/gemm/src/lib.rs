//! int8 batched GEMM (`a8w8`) with per-token activation scales, per-channel
//! weight scales, optional bias and split-K reduction.
//!
//! Kernel instances are chosen per problem size from a tuned table when one
//! is configured, otherwise from a size heuristic.

pub mod batched;
pub mod instances;
pub mod int8;
pub mod tuned;

pub use batched::{
    batched_gemm_a8w8, batched_gemm_a8w8_tune, select_instance, select_instance_in, KernelChoice, OUTPUT_DTYPES,
};
pub use instances::{heuristic, instance, KernelInstance, KERNEL_INSTANCES};
pub use int8::{decode_int8, encode_int8, quantize_per_channel, quantize_per_token, QMAX};
pub use tuned::{ProblemSize, TunedEntry, TunedGemmTable};
