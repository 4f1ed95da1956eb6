//! Per-sequence mapping from logical to physical cache blocks.

use candle_core::{Device, Tensor};
use opkit_core::{OpError, Result};

use crate::kv_cache::{BlockAllocator, BlockId};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockTable {
    pub blocks: Vec<BlockId>,
    pub num_tokens: usize,
    pub block_size: usize,
}

impl BlockTable {
    pub fn new(block_size: usize) -> Self {
        Self {
            blocks: Vec::new(),
            num_tokens: 0,
            block_size,
        }
    }

    pub fn num_blocks(&self) -> usize {
        self.blocks.len()
    }

    pub fn blocks_needed(num_tokens: usize, block_size: usize) -> usize {
        num_tokens.div_ceil(block_size)
    }

    pub fn additional_blocks_needed(&self, additional_tokens: usize) -> usize {
        Self::blocks_needed(self.num_tokens + additional_tokens, self.block_size).saturating_sub(self.blocks.len())
    }

    /// Grows the sequence by `count` tokens, allocating blocks as needed, and
    /// returns the flat cache slots of the new tokens.
    pub fn append_tokens(&mut self, count: usize, allocator: &BlockAllocator) -> Result<Vec<i64>> {
        if allocator.block_size() != self.block_size {
            return Err(OpError::argument(
                "allocator",
                format!("block size {} != table block size {}", allocator.block_size(), self.block_size),
            ));
        }
        let needed = self.additional_blocks_needed(count);
        self.blocks.extend(allocator.allocate(needed)?);
        let start = self.num_tokens;
        self.num_tokens += count;
        (start..self.num_tokens)
            .map(|pos| {
                self.slot(pos)
                    .map(|slot| slot as i64)
                    .ok_or_else(|| OpError::shape(format!("token {pos} has no block")))
            })
            .collect()
    }

    pub fn get_block(&self, logical_idx: usize) -> Option<BlockId> {
        self.blocks.get(logical_idx).copied()
    }

    /// Flat cache slot of token `token_pos`.
    pub fn slot(&self, token_pos: usize) -> Option<usize> {
        let block = self.get_block(token_pos / self.block_size)?;
        Some(block as usize * self.block_size + token_pos % self.block_size)
    }

    /// A copy sharing every block, with the allocator's reference counts bumped.
    pub fn fork(&self, allocator: &BlockAllocator) -> Result<Self> {
        allocator.fork(&self.blocks)?;
        Ok(self.clone())
    }

    /// Releases this sequence's references.
    pub fn release(&mut self, allocator: &BlockAllocator) -> Result<()> {
        allocator.free(&self.blocks)?;
        self.blocks.clear();
        self.num_tokens = 0;
        Ok(())
    }

    /// `[num_seqs, max_blocks]` `U32` table, unused entries padded with 0.
    pub fn to_tensor(tables: &[BlockTable], device: &Device) -> Result<Tensor> {
        let width = tables.iter().map(BlockTable::num_blocks).max().unwrap_or(0).max(1);
        let mut flat = vec![0u32; tables.len() * width];
        for (row, table) in flat.chunks_mut(width).zip(tables) {
            row[..table.blocks.len()].copy_from_slice(&table.blocks);
        }
        Ok(Tensor::from_vec(flat, (tables.len(), width), device)?)
    }

    /// `[num_seqs]` `U32` context lengths.
    pub fn context_lens(tables: &[BlockTable], device: &Device) -> Result<Tensor> {
        let lens = tables
            .iter()
            .map(|t| {
                u32::try_from(t.num_tokens).map_err(|_| {
                    OpError::argument("context_lens", format!("{} tokens do not fit in u32", t.num_tokens))
                })
            })
            .collect::<Result<Vec<u32>>>()?;
        Ok(Tensor::from_vec(lens, tables.len(), device)?)
    }
}
