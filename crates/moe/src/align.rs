//! Groups routed token slots by expert and pads each expert's run to a
//! multiple of the GEMM block size.
//!
//! A slot is `token * topk + j` in the flattened `topk_ids`. Padding entries
//! hold the sentinel `M * topk`.

use candle_core::{Device, Tensor};
use opkit_core::{checks::expect_index_dtype, host::read_indices, OpError, Result};

/// Host form of the alignment used by the expert kernels.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExpertBlocks {
    pub block_size: usize,
    /// Slots sorted by expert, each expert padded with [`Self::sentinel`].
    pub sorted_token_ids: Vec<usize>,
    /// Expert of each `block_size` run of `sorted_token_ids`.
    pub expert_ids: Vec<usize>,
    /// Real (non-padding) slots in each block.
    pub token_nums: Vec<usize>,
    pub sentinel: usize,
}

impl ExpertBlocks {
    pub fn num_tokens_post_padded(&self) -> usize {
        self.sorted_token_ids.len()
    }

    pub fn num_blocks(&self) -> usize {
        self.expert_ids.len()
    }

    /// `(expert, real slots)` of block `idx`.
    pub fn block(&self, idx: usize) -> (usize, &[usize]) {
        let start = idx * self.block_size;
        (
            self.expert_ids[idx],
            &self.sorted_token_ids[start..start + self.token_nums[idx]],
        )
    }
}

pub fn align_slots(ids: &[usize], block_size: usize, num_experts: usize) -> Result<ExpertBlocks> {
    if block_size == 0 {
        return Err(OpError::argument("block_size", "must be positive"));
    }
    let sentinel = ids.len();
    let mut per_expert: Vec<Vec<usize>> = vec![Vec::new(); num_experts];
    for (slot, &expert) in ids.iter().enumerate() {
        per_expert
            .get_mut(expert)
            .ok_or_else(|| OpError::argument("topk_ids", format!("expert {expert} >= num_experts {num_experts}")))?
            .push(slot);
    }
    let mut blocks = ExpertBlocks {
        block_size,
        sorted_token_ids: Vec::with_capacity(sentinel + num_experts * (block_size - 1)),
        expert_ids: Vec::new(),
        token_nums: Vec::new(),
        sentinel,
    };
    for (expert, slots) in per_expert.into_iter().enumerate() {
        for chunk in slots.chunks(block_size) {
            blocks.sorted_token_ids.extend_from_slice(chunk);
            blocks
                .sorted_token_ids
                .extend(std::iter::repeat(sentinel).take(block_size - chunk.len()));
            blocks.expert_ids.push(expert);
            blocks.token_nums.push(chunk.len());
        }
    }
    Ok(blocks)
}

/// Tensor outputs of [`moe_align_block_size`], all `U32`.
#[derive(Debug, Clone)]
pub struct AlignedTokens {
    pub sorted_token_ids: Tensor,
    pub expert_ids: Tensor,
    pub token_nums: Tensor,
    pub num_tokens_post_padded: usize,
}

fn u32_tensor(values: &[usize], name: &'static str, device: &Device) -> Result<Tensor> {
    let values = values
        .iter()
        .map(|&v| u32::try_from(v).map_err(|_| OpError::argument(name, format!("{v} does not fit in u32"))))
        .collect::<Result<Vec<u32>>>()?;
    let len = values.len();
    Ok(Tensor::from_vec(values, len, device)?)
}

/// Aligns `topk_ids` (`[M, topk]`) for block GEMMs of `block_size` rows.
pub fn moe_align_block_size(topk_ids: &Tensor, block_size: usize, num_experts: usize) -> Result<AlignedTokens> {
    expect_index_dtype(topk_ids, "topk_ids")?;
    let ids = read_indices(topk_ids, "topk_ids")?
        .into_iter()
        .map(|id| usize::try_from(id).map_err(|_| OpError::argument("topk_ids", format!("negative expert id {id}"))))
        .collect::<Result<Vec<_>>>()?;
    let blocks = align_slots(&ids, block_size, num_experts)?;
    let device = topk_ids.device();
    Ok(AlignedTokens {
        sorted_token_ids: u32_tensor(&blocks.sorted_token_ids, "sorted_token_ids", device)?,
        expert_ids: u32_tensor(&blocks.expert_ids, "expert_ids", device)?,
        token_nums: u32_tensor(&blocks.token_nums, "token_nums", device)?,
        num_tokens_post_padded: blocks.num_tokens_post_padded(),
    })
}
