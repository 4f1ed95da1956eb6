use candle_core::{DType, Device, IndexOp, Tensor};
use moe::{
    fused_experts, fused_experts_, fused_moe, fused_topk, moe_align_block_size, ExpertOptions, MoeKernelConfig,
    RoutingMethod,
};
use opkit_core::{testing::check_allclose, Result};
use proptest::prelude::*;
use quant_gemm::quantize_per_channel;

/// Dense candle evaluation of every routed expert.
fn reference(hidden: &Tensor, w1: &Tensor, w2: &Tensor, weights: &Tensor, ids: &Tensor) -> Result<Tensor> {
    let (m, _) = hidden.dims2()?;
    let ids = ids.to_vec2::<u32>()?;
    let weights = weights.to_vec2::<f32>()?;
    let mut rows = Vec::with_capacity(m);
    for (t, (ids, weights)) in ids.iter().zip(&weights).enumerate() {
        let x = hidden.i(t..t + 1)?;
        let mut acc = x.zeros_like()?;
        for (&e, &w) in ids.iter().zip(weights) {
            let h = x.matmul(&w1.i(e as usize)?.t()?)?.gelu()?;
            let y = h.matmul(&w2.i(e as usize)?.t()?)?;
            acc = (acc + (y * w as f64)?)?;
        }
        rows.push(acc);
    }
    Ok(Tensor::cat(&rows, 0)?)
}

fn problem(m: usize, k: usize, n: usize, e: usize, seed: u64) -> Result<(Tensor, Tensor, Tensor, Tensor)> {
    let device = Device::Cpu;
    let gen = |len: usize, salt: u64, amp: f32| -> Vec<f32> {
        (0..len)
            .map(|i| {
                let v = ((i as u64 * 2654435761 + seed * 97 + salt) % 1000) as f32 / 1000.0;
                (v - 0.5) * amp
            })
            .collect()
    };
    let hidden = Tensor::from_vec(gen(m * k, 1, 2.0), (m, k), &device)?;
    let w1 = Tensor::from_vec(gen(e * n * k, 2, 0.5), (e, n, k), &device)?;
    let w2 = Tensor::from_vec(gen(e * k * n, 3, 0.5), (e, k, n), &device)?;
    let gating = Tensor::from_vec(gen(m * e, 4, 4.0), (m, e), &device)?;
    Ok((hidden, w1, w2, gating))
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    #[test]
    fn fused_experts_match_dense_reference(
        m in 1usize..24,
        e in 2usize..6,
        topk in 1usize..3,
        block in prop::sample::select(vec![1usize, 4, 16]),
        seed in 0u64..1000,
    ) {
        let (hidden, w1, w2, gating) = problem(m, 8, 12, e, seed).unwrap();
        let (weights, ids) = fused_topk(&gating, topk.min(e), true).unwrap();
        let opts = ExpertOptions::default().with_block_size(block).with_chunk_size(5);
        let got = fused_experts(&hidden, &w1, &w2, &weights, &ids, &opts).unwrap();
        let want = reference(&hidden, &w1, &w2, &weights, &ids).unwrap();
        let report = check_allclose(&got, &want, 1e-4, 1e-5, "fused_experts").unwrap();
        prop_assert!(report.passed, "{report:?}");
    }
}

#[test]
fn fused_moe_routes_then_evaluates() -> Result<()> {
    let (hidden, w1, w2, gating) = problem(6, 8, 16, 4, 7)?;
    let got = fused_moe(&hidden, &w1, &w2, &gating, 2, false, &RoutingMethod::TopK, &ExpertOptions::default())?;
    let (weights, ids) = fused_topk(&gating, 2, false)?;
    let want = reference(&hidden, &w1, &w2, &weights, &ids)?;
    assert!(check_allclose(&got, &want, 1e-4, 1e-5, "fused_moe")?.passed);
    Ok(())
}

#[test]
fn grouped_routing_stays_inside_kept_groups() -> Result<()> {
    let (hidden, w1, w2, gating) = problem(5, 8, 8, 8, 3)?;
    let routing = RoutingMethod::Grouped {
        num_expert_group: 4,
        topk_group: 1,
    };
    let (_, ids) = routing.route(&gating, 2, true)?;
    for row in ids.to_vec2::<u32>()? {
        assert_eq!(row[0] / 2, row[1] / 2, "{row:?} spans two groups");
    }
    let out = fused_moe(&hidden, &w1, &w2, &gating, 2, true, &routing, &ExpertOptions::default())?;
    assert_eq!(out.dims(), &[5, 8]);
    Ok(())
}

#[test]
fn int8_weights_track_float_weights() -> Result<()> {
    let (hidden, w1, w2, gating) = problem(4, 16, 8, 3, 11)?;
    let (weights, ids) = fused_topk(&gating, 2, true)?;
    let (e, n, k) = w1.dims3()?;
    // per-output-channel scales come back as [E, 1, rows]
    let (q1, s1) = quantize_per_channel(&w1)?;
    let (q2, s2) = quantize_per_channel(&w2)?;
    let opts = ExpertOptions::int8_w8a16(s1.reshape((e, n))?, s2.reshape((e, k))?);
    let got = fused_experts(&hidden, &q1, &q2, &weights, &ids, &opts)?;
    let want = fused_experts(&hidden, &w1, &w2, &weights, &ids, &ExpertOptions::default())?;
    assert!(check_allclose(&got, &want, 5e-2, 2e-2, "int8_w8a16")?.passed);
    Ok(())
}

#[test]
fn bf16_hidden_keeps_its_dtype() -> Result<()> {
    let (hidden, w1, w2, gating) = problem(3, 8, 8, 2, 5)?;
    let out = fused_moe(
        &hidden.to_dtype(DType::BF16)?,
        &w1,
        &w2,
        &gating,
        1,
        false,
        &RoutingMethod::TopK,
        &ExpertOptions::default(),
    )?;
    assert_eq!(out.dtype(), DType::BF16);
    Ok(())
}

#[test]
fn align_tensor_export_pads_every_expert_run() -> Result<()> {
    let ids = Tensor::from_vec(vec![0u32, 0, 0, 2, 2], (5, 1), &Device::Cpu)?;
    let aligned = moe_align_block_size(&ids, 4, 3)?;
    assert_eq!(aligned.num_tokens_post_padded, 8);
    assert_eq!(aligned.sorted_token_ids.to_vec1::<u32>()?, vec![0, 1, 2, 5, 3, 4, 5, 5]);
    assert_eq!(aligned.expert_ids.to_vec1::<u32>()?, vec![0, 2]);
    assert_eq!(aligned.token_nums.to_vec1::<u32>()?, vec![3, 2]);
    Ok(())
}

#[test]
fn out_of_range_expert_is_rejected() -> Result<()> {
    let (hidden, w1, w2, _) = problem(2, 8, 8, 2, 1)?;
    let weights = Tensor::ones((2, 1), DType::F32, &Device::Cpu)?;
    let ids = Tensor::from_vec(vec![0u32, 5], (2, 1), &Device::Cpu)?;
    assert!(fused_experts(&hidden, &w1, &w2, &weights, &ids, &ExpertOptions::default()).is_err());
    Ok(())
}

#[test]
fn small_tiles_and_groups_match_reference() -> Result<()> {
    let (hidden, w1, w2, gating) = problem(9, 20, 12, 4, 13)?;
    let (weights, ids) = fused_topk(&gating, 2, true)?;
    let config = MoeKernelConfig {
        block_size_m: 2,
        block_size_n: 5,
        block_size_k: 3,
        group_size_m: 3,
    };
    let got = fused_experts(&hidden, &w1, &w2, &weights, &ids, &ExpertOptions::default().with_config(config))?;
    let want = reference(&hidden, &w1, &w2, &weights, &ids)?;
    let report = check_allclose(&got, &want, 1e-4, 1e-5, "tiled fused_experts")?;
    assert!(report.passed, "{report:?}");
    Ok(())
}

#[test]
fn zero_sized_override_is_rejected() -> Result<()> {
    let (hidden, w1, w2, gating) = problem(2, 8, 8, 2, 1)?;
    let (weights, ids) = fused_topk(&gating, 1, false)?;
    let config = MoeKernelConfig {
        block_size_k: 0,
        ..MoeKernelConfig::default()
    };
    let opts = ExpertOptions::default().with_config(config);
    assert!(fused_experts(&hidden, &w1, &w2, &weights, &ids, &opts).is_err());
    Ok(())
}

#[test]
fn in_place_matches_out_of_place() -> Result<()> {
    let (hidden, w1, w2, gating) = problem(7, 8, 12, 3, 17)?;
    let (weights, ids) = fused_topk(&gating, 2, true)?;
    let want = fused_experts(&hidden, &w1, &w2, &weights, &ids, &ExpertOptions::default())?;

    let target = hidden.copy()?;
    fused_experts_(&target, &w1, &w2, &weights, &ids, &ExpertOptions::default())?;
    assert_eq!(target.to_vec2::<f32>()?, want.to_vec2::<f32>()?);
    // the source operand is untouched
    assert_ne!(hidden.to_vec2::<f32>()?, want.to_vec2::<f32>()?);

    let half = hidden.to_dtype(DType::BF16)?;
    let expected = fused_experts(&half, &w1, &w2, &weights, &ids, &ExpertOptions::default())?;
    let returned = fused_moe(
        &half,
        &w1,
        &w2,
        &gating,
        2,
        true,
        &RoutingMethod::TopK,
        &ExpertOptions::default().in_place(),
    )?;
    assert_eq!(half.dtype(), DType::BF16);
    assert_eq!(half.to_dtype(DType::F32)?.to_vec2::<f32>()?, expected.to_dtype(DType::F32)?.to_vec2::<f32>()?);
    assert_eq!(returned.to_dtype(DType::F32)?.to_vec2::<f32>()?, expected.to_dtype(DType::F32)?.to_vec2::<f32>()?);
    Ok(())
}

#[test]
fn in_place_needs_a_contiguous_target() -> Result<()> {
    let (hidden, w1, w2, gating) = problem(4, 4, 8, 2, 2)?;
    let (weights, ids) = fused_topk(&gating, 1, false)?;
    // [4, 4] transposed keeps the shape but not the layout
    let strided = hidden.t()?;
    assert!(fused_experts_(&strided, &w1, &w2, &weights, &ids, &ExpertOptions::default()).is_err());
    Ok(())
}
