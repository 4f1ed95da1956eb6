//! Reference-counted allocator over the physical blocks of a cache.
//!
//! Blocks leave the free list on [`BlockAllocator::allocate`] with a reference
//! count of one. [`BlockAllocator::fork`] lets another sequence share them
//! (prefix sharing) and [`BlockAllocator::free`] drops one reference, returning
//! a block to the free list when its count reaches zero.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

use opkit_core::{OpError, Result};

use crate::kv_cache::CacheLayout;

/// Index of a physical cache block.
pub type BlockId = u32;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BlockAllocatorStats {
    pub total_blocks: usize,
    pub allocated_blocks: usize,
    pub free_blocks: usize,
    pub block_size: usize,
    pub total_allocations: usize,
    pub total_frees: usize,
    pub peak_usage: usize,
}

#[derive(Debug)]
struct AllocatorState {
    block_size: usize,
    free_list: VecDeque<BlockId>,
    ref_counts: Vec<u32>,
    total_allocations: usize,
    total_frees: usize,
    peak_usage: usize,
}

impl AllocatorState {
    fn new(total_blocks: usize, block_size: usize) -> Self {
        Self {
            block_size,
            free_list: (0..total_blocks as BlockId).collect(),
            ref_counts: vec![0; total_blocks],
            total_allocations: 0,
            total_frees: 0,
            peak_usage: 0,
        }
    }

    fn total_blocks(&self) -> usize {
        self.ref_counts.len()
    }

    fn allocated(&self) -> usize {
        self.total_blocks() - self.free_list.len()
    }

    fn check_live(&self, blocks: &[BlockId], op: &str) -> Result<()> {
        for &id in blocks {
            match self.ref_counts.get(id as usize) {
                None => {
                    return Err(OpError::argument(
                        "block",
                        format!("{op}: block {id} outside the {} cache blocks", self.total_blocks()),
                    ))
                }
                Some(0) => {
                    return Err(OpError::argument("block", format!("{op}: block {id} is not allocated")))
                }
                Some(_) => {}
            }
        }
        Ok(())
    }
}

/// Thread-safe handle; clones share the same pool.
#[derive(Debug, Clone)]
pub struct BlockAllocator {
    state: Arc<Mutex<AllocatorState>>,
}

impl BlockAllocator {
    pub fn new(total_blocks: usize, block_size: usize) -> Result<Self> {
        if block_size == 0 {
            return Err(OpError::argument("block_size", "must be positive"));
        }
        if total_blocks > BlockId::MAX as usize {
            return Err(OpError::argument("total_blocks", format!("{total_blocks} exceeds the block id range")));
        }
        Ok(Self {
            state: Arc::new(Mutex::new(AllocatorState::new(total_blocks, block_size))),
        })
    }

    /// Allocator covering every block of `layout`.
    pub fn for_layout(layout: &CacheLayout) -> Result<Self> {
        Self::new(layout.num_blocks, layout.block_size)
    }

    fn state(&self) -> MutexGuard<'_, AllocatorState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Takes `count` blocks off the free list, all or nothing.
    pub fn allocate(&self, count: usize) -> Result<Vec<BlockId>> {
        if count == 0 {
            return Ok(Vec::new());
        }
        let mut state = self.state();
        if state.free_list.len() < count {
            return Err(OpError::argument(
                "count",
                format!(
                    "cannot allocate {count} blocks: only {} of {} free",
                    state.free_list.len(),
                    state.total_blocks()
                ),
            ));
        }
        let blocks: Vec<BlockId> = state.free_list.drain(..count).collect();
        for &id in &blocks {
            state.ref_counts[id as usize] = 1;
        }
        state.total_allocations += 1;
        state.peak_usage = state.peak_usage.max(state.allocated());
        log::debug!("allocated blocks {blocks:?}, {} free", state.free_list.len());
        Ok(blocks)
    }

    /// Adds a reference to each allocated block.
    pub fn fork(&self, blocks: &[BlockId]) -> Result<()> {
        let mut state = self.state();
        state.check_live(blocks, "fork")?;
        for &id in blocks {
            state.ref_counts[id as usize] += 1;
        }
        Ok(())
    }

    /// Drops one reference per block; blocks reaching zero become free.
    pub fn free(&self, blocks: &[BlockId]) -> Result<()> {
        if blocks.is_empty() {
            return Ok(());
        }
        let mut state = self.state();
        // a block listed twice must hold two references
        let mut released: Vec<BlockId> = blocks.to_vec();
        released.sort_unstable();
        for run in released.chunk_by(|a, b| a == b) {
            state.check_live(&run[..1], "free")?;
            let held = state.ref_counts[run[0] as usize] as usize;
            if held < run.len() {
                return Err(OpError::argument(
                    "block",
                    format!("free: block {} released {} times with {held} references", run[0], run.len()),
                ));
            }
        }
        let state = &mut *state;
        for &id in blocks {
            let count = &mut state.ref_counts[id as usize];
            *count -= 1;
            if *count == 0 {
                state.free_list.push_back(id);
            }
        }
        state.total_frees += 1;
        Ok(())
    }

    pub fn ref_count(&self, block: BlockId) -> u32 {
        self.state().ref_counts.get(block as usize).copied().unwrap_or(0)
    }

    pub fn block_size(&self) -> usize {
        self.state().block_size
    }

    pub fn total_blocks(&self) -> usize {
        self.state().total_blocks()
    }

    pub fn free_block_count(&self) -> usize {
        self.state().free_list.len()
    }

    pub fn can_allocate(&self, count: usize) -> bool {
        self.free_block_count() >= count
    }

    pub fn stats(&self) -> BlockAllocatorStats {
        let state = self.state();
        BlockAllocatorStats {
            total_blocks: state.total_blocks(),
            allocated_blocks: state.allocated(),
            free_blocks: state.free_list.len(),
            block_size: state.block_size,
            total_allocations: state.total_allocations,
            total_frees: state.total_frees,
            peak_usage: state.peak_usage,
        }
    }

    /// Returns every block to the free list and clears the counters.
    pub fn reset(&self) {
        let mut state = self.state();
        let (total, block_size) = (state.total_blocks(), state.block_size);
        *state = AllocatorState::new(total, block_size);
    }
}
