//! Registry of GEMM kernel instances.
//!
//! Each instance fixes the tile shape the host kernel walks: `m_per_block`
//! output rows are computed together, `n_per_block` output columns share one
//! pass over the reduction, and `k_per_block` reduction elements are consumed
//! per inner step.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KernelInstance {
    pub id: u32,
    pub block_size: u32,
    pub m_per_block: usize,
    pub n_per_block: usize,
    pub k_per_block: usize,
}

impl KernelInstance {
    const fn new(id: u32, block_size: u32, m: usize, n: usize, k: usize) -> Self {
        Self {
            id,
            block_size,
            m_per_block: m,
            n_per_block: n,
            k_per_block: k,
        }
    }

    pub fn name(&self) -> String {
        format!(
            "a8w8_batched_{}x{}x{}x{}",
            self.block_size, self.m_per_block, self.n_per_block, self.k_per_block
        )
    }
}

pub const KERNEL_INSTANCES: &[KernelInstance] = &[
    KernelInstance::new(0, 256, 128, 128, 64),
    KernelInstance::new(1, 256, 128, 64, 64),
    KernelInstance::new(2, 256, 64, 128, 64),
    KernelInstance::new(3, 256, 64, 64, 128),
    KernelInstance::new(4, 128, 32, 64, 128),
    KernelInstance::new(5, 128, 16, 64, 256),
    KernelInstance::new(6, 64, 16, 32, 256),
    KernelInstance::new(7, 64, 16, 16, 512),
];

pub fn instance(id: u32) -> Option<&'static KernelInstance> {
    KERNEL_INSTANCES.iter().find(|inst| inst.id == id)
}

/// Size-based fallback when no tuned entry exists: skinny problems favour
/// short M tiles with deep K steps, large ones square tiles.
pub fn heuristic(m: usize, n: usize, k: usize) -> &'static KernelInstance {
    let id = if m <= 16 {
        if n <= 512 {
            7
        } else if k >= 2048 {
            5
        } else {
            6
        }
    } else if m <= 32 {
        4
    } else if m <= 64 {
        3
    } else if m <= 128 {
        if n > m {
            2
        } else {
            1
        }
    } else {
        0
    };
    // ids above are all registered
    &KERNEL_INSTANCES[id]
}
