//! Top-k expert selection from gating logits.
//!
//! Scores are the softmax of each gating row over experts. Selections are
//! ordered by descending score with ties going to the lower expert id.

use candle_core::{Device, Tensor};
use opkit_core::{checks::expect_rank, dtype::ensure_float, host::read_f32, OpError, Result};

/// Signature of a caller-provided router: `(gating, topk, renormalize)` to
/// `(weights, ids)`.
pub type RoutingFn = fn(&Tensor, usize, bool) -> Result<(Tensor, Tensor)>;

/// How [`fused_moe`](crate::fused_moe) picks experts.
#[derive(Debug, Clone, Copy, Default)]
pub enum RoutingMethod {
    #[default]
    TopK,
    /// Restrict each token to the `topk_group` expert groups holding its best
    /// scores before taking the top-k.
    Grouped { num_expert_group: usize, topk_group: usize },
    Custom(RoutingFn),
}

impl RoutingMethod {
    pub fn route(&self, gating: &Tensor, topk: usize, renormalize: bool) -> Result<(Tensor, Tensor)> {
        match *self {
            Self::TopK => fused_topk(gating, topk, renormalize),
            Self::Grouped {
                num_expert_group,
                topk_group,
            } => grouped_topk(gating, topk, renormalize, num_expert_group, topk_group),
            Self::Custom(route) => route(gating, topk, renormalize),
        }
    }
}

fn softmax_in_place(row: &mut [f32]) {
    let max = row.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let mut sum = 0.0;
    for v in row.iter_mut() {
        *v = (*v - max).exp();
        sum += *v;
    }
    row.iter_mut().for_each(|v| *v /= sum);
}

/// Indices of the `k` largest values, largest first, lower index on ties.
fn top_indices(values: &[f32], k: usize) -> Vec<usize> {
    let mut order: Vec<usize> = (0..values.len()).collect();
    order.sort_by(|&a, &b| values[b].total_cmp(&values[a]).then(a.cmp(&b)));
    order.truncate(k);
    order
}

fn gating_scores(gating: &Tensor, topk: usize) -> Result<(usize, usize, Vec<f32>)> {
    ensure_float(gating.dtype(), "gating")?;
    let dims = expect_rank(gating, 2, "gating")?;
    let (m, e) = (dims[0], dims[1]);
    if topk == 0 || topk > e {
        return Err(OpError::argument("topk", format!("{topk} must be in 1..={e}")));
    }
    let mut scores = read_f32(gating)?;
    for row in scores.chunks_mut(e) {
        softmax_in_place(row);
    }
    Ok((m, e, scores))
}

fn finish(
    picks: Vec<(Vec<usize>, Vec<f32>)>,
    m: usize,
    topk: usize,
    renormalize: bool,
    device: &Device,
) -> Result<(Tensor, Tensor)> {
    let mut weights = Vec::with_capacity(m * topk);
    let mut ids = Vec::with_capacity(m * topk);
    for (experts, mut w) in picks {
        if renormalize {
            let sum: f32 = w.iter().sum();
            if sum > 0.0 {
                w.iter_mut().for_each(|v| *v /= sum);
            }
        }
        weights.extend(w);
        for e in experts {
            let id = u32::try_from(e)
                .map_err(|_| OpError::argument("topk_ids", format!("expert {e} does not fit in u32")))?;
            ids.push(id);
        }
    }
    Ok((
        Tensor::from_vec(weights, (m, topk), device)?,
        Tensor::from_vec(ids, (m, topk), device)?,
    ))
}

/// Softmax top-k routing: `(weights F32 [M, k], ids U32 [M, k])`.
pub fn fused_topk(gating: &Tensor, topk: usize, renormalize: bool) -> Result<(Tensor, Tensor)> {
    let (m, e, scores) = gating_scores(gating, topk)?;
    let picks = scores
        .chunks(e.max(1))
        .take(m)
        .map(|row| {
            let experts = top_indices(row, topk);
            let w = experts.iter().map(|&i| row[i]).collect();
            (experts, w)
        })
        .collect();
    finish(picks, m, topk, renormalize, gating.device())
}

/// Grouped routing: experts are split into `num_expert_group` contiguous
/// groups, each group is scored by its best expert, and only experts of the
/// `topk_group` best groups stay eligible.
pub fn grouped_topk(
    gating: &Tensor,
    topk: usize,
    renormalize: bool,
    num_expert_group: usize,
    topk_group: usize,
) -> Result<(Tensor, Tensor)> {
    let (m, e, scores) = gating_scores(gating, topk)?;
    if num_expert_group == 0 || e % num_expert_group != 0 {
        return Err(OpError::argument(
            "num_expert_group",
            format!("{e} experts cannot be split into {num_expert_group} groups"),
        ));
    }
    if topk_group == 0 || topk_group > num_expert_group {
        return Err(OpError::argument(
            "topk_group",
            format!("{topk_group} must be in 1..={num_expert_group}"),
        ));
    }
    let per_group = e / num_expert_group;
    let picks = scores
        .chunks(e.max(1))
        .take(m)
        .map(|row| {
            let group_scores: Vec<f32> = row
                .chunks(per_group)
                .map(|g| g.iter().copied().fold(f32::NEG_INFINITY, f32::max))
                .collect();
            let keep = top_indices(&group_scores, topk_group);
            let masked: Vec<f32> = row
                .iter()
                .enumerate()
                .map(|(i, &s)| if keep.contains(&(i / per_group)) { s } else { 0.0 })
                .collect();
            let experts = top_indices(&masked, topk);
            let w = experts.iter().map(|&i| masked[i]).collect();
            (experts, w)
        })
        .collect();
    finish(picks, m, topk, renormalize, gating.device())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn picks_highest_scores_with_low_id_ties() -> Result<()> {
        let gating = Tensor::from_vec(vec![1.0f32, 3.0, 3.0, 0.0], (1, 4), &Device::Cpu)?;
        let (w, ids) = fused_topk(&gating, 2, false)?;
        assert_eq!(ids.to_vec2::<u32>()?, vec![vec![1, 2]]);
        let w = w.to_vec2::<f32>()?;
        let denom = 1f32.exp() + 2.0 * 3f32.exp() + 1.0;
        assert!((w[0][0] - 3f32.exp() / denom).abs() < 1e-6);

        let (w, _) = fused_topk(&gating, 2, true)?;
        assert!(w.to_vec2::<f32>()?[0].iter().all(|v| (v - 0.5).abs() < 1e-6));
        Ok(())
    }

    #[test]
    fn grouped_routing_masks_losing_groups() -> Result<()> {
        // groups {0,1} and {2,3}; the second group holds the best expert
        let gating = Tensor::from_vec(vec![2.0f32, 1.9, 2.5, -3.0], (1, 4), &Device::Cpu)?;
        let (w, ids) = grouped_topk(&gating, 2, true, 2, 1)?;
        assert_eq!(ids.to_vec2::<u32>()?, vec![vec![2, 3]]);
        let w = w.to_vec2::<f32>()?;
        assert!((w[0][0] + w[0][1] - 1.0).abs() < 1e-6);
        assert!(w[0][0] > 0.99, "{w:?}");
        assert_eq!(
            grouped_topk(&gating, 2, false, 2, 2)?.1.to_vec2::<u32>()?,
            fused_topk(&gating, 2, false)?.1.to_vec2::<u32>()?
        );
        Ok(())
    }

    #[test]
    fn invalid_arguments() -> Result<()> {
        let gating = Tensor::zeros((2, 6), candle_core::DType::F32, &Device::Cpu)?;
        assert!(fused_topk(&gating, 7, false).is_err());
        assert!(grouped_topk(&gating, 2, false, 4, 1).is_err());
        assert!(grouped_topk(&gating, 2, false, 3, 4).is_err());
        Ok(())
    }
}
