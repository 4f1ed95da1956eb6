use candle_core::{DType, Device, Tensor};
use opkit_core::{testing::check_allclose, OpError, Result};
use quant_gemm::{
    batched_gemm_a8w8, batched_gemm_a8w8_tune, encode_int8, quantize_per_channel, quantize_per_token,
    KERNEL_INSTANCES,
};
use rand::{rngs::StdRng, Rng, SeedableRng};

struct Problem {
    xq: Tensor,
    wq: Tensor,
    x_scale: Tensor,
    w_scale: Tensor,
}

fn random_problem(b: usize, m: usize, n: usize, k: usize, seed: u64) -> Result<Problem> {
    let device = Device::Cpu;
    let mut rng = StdRng::seed_from_u64(seed);
    let mut int8 = |len: usize| -> Vec<i8> { (0..len).map(|_| rng.gen_range(-128i16..=127) as i8).collect() };
    let x = int8(b * m * k);
    let w = int8(b * n * k);
    let mut rng = StdRng::seed_from_u64(seed ^ 0x5eed);
    let x_scale: Vec<f32> = (0..b * m).map(|_| rng.gen_range(0.001f32..0.1)).collect();
    let w_scale: Vec<f32> = (0..b * n).map(|_| rng.gen_range(0.001f32..0.1)).collect();
    Ok(Problem {
        xq: encode_int8(&x, &[b, m, k], &device)?,
        wq: encode_int8(&w, &[b, n, k], &device)?,
        x_scale: Tensor::from_vec(x_scale, (b, m, 1), &device)?,
        w_scale: Tensor::from_vec(w_scale, (b, 1, n), &device)?,
    })
}

fn as_f32(int8: &Tensor) -> Result<Tensor> {
    let values: Vec<f32> = quant_gemm::decode_int8(int8, "operand")?.into_iter().map(f32::from).collect();
    Ok(Tensor::from_vec(values, int8.dims(), int8.device())?)
}

fn reference(p: &Problem) -> Result<Tensor> {
    let x = as_f32(&p.xq)?;
    let w = as_f32(&p.wq)?;
    let acc = x.matmul(&w.transpose(1, 2)?.contiguous()?)?;
    Ok(acc.broadcast_mul(&p.x_scale)?.broadcast_mul(&p.w_scale)?)
}

#[test]
fn matches_dequantized_matmul() -> Result<()> {
    for (i, &(b, m, n, k)) in [(1, 1, 16, 64), (2, 17, 33, 96), (3, 40, 8, 300)].iter().enumerate() {
        let p = random_problem(b, m, n, k, i as u64)?;
        let y = batched_gemm_a8w8(&p.xq, &p.wq, &p.x_scale, &p.w_scale, DType::F32, None, 0)?;
        assert_eq!(y.dims(), &[b, m, n]);
        let report = check_allclose(&y, &reference(&p)?, 1e-5, 1e-5, "a8w8 vs matmul")?;
        assert!(report.passed, "{report:?}");
    }
    Ok(())
}

#[test]
fn split_k_only_changes_rounding() -> Result<()> {
    let p = random_problem(2, 24, 40, 256, 7)?;
    let whole = batched_gemm_a8w8(&p.xq, &p.wq, &p.x_scale, &p.w_scale, DType::F32, None, 0)?;
    for split_k in 1..=4 {
        let split = batched_gemm_a8w8(&p.xq, &p.wq, &p.x_scale, &p.w_scale, DType::F32, None, split_k)?;
        let report = check_allclose(&split, &whole, 1e-4, 1e-4, "split-K")?;
        assert!(report.passed, "split_k {split_k}: {report:?}");
    }
    Ok(())
}

#[test]
fn every_kernel_instance_agrees() -> Result<()> {
    let p = random_problem(1, 33, 70, 600, 11)?;
    let expected = reference(&p)?;
    for inst in KERNEL_INSTANCES {
        let y = batched_gemm_a8w8_tune(&p.xq, &p.wq, &p.x_scale, &p.w_scale, DType::F32, inst.id, 1)?;
        let report = check_allclose(&y, &expected, 1e-4, 1e-4, &inst.name())?;
        assert!(report.passed, "{}: {report:?}", inst.name());
    }
    Ok(())
}

#[test]
fn bias_is_broadcast_over_rows() -> Result<()> {
    let p = random_problem(2, 5, 6, 32, 3)?;
    let device = Device::Cpu;
    let plain = batched_gemm_a8w8(&p.xq, &p.wq, &p.x_scale, &p.w_scale, DType::F32, None, 0)?;
    let bias = Tensor::arange(0f32, 6.0, &device)?;
    for shaped in [bias.clone(), bias.reshape((1, 6))?] {
        let y = batched_gemm_a8w8(&p.xq, &p.wq, &p.x_scale, &p.w_scale, DType::F32, Some(&shaped), 0)?;
        let expected = plain.broadcast_add(&bias)?;
        let report = check_allclose(&y, &expected, 1e-6, 1e-6, "bias")?;
        assert!(report.passed, "{report:?}");
    }
    Ok(())
}

#[test]
fn low_precision_outputs_round_the_f32_result() -> Result<()> {
    let p = random_problem(1, 8, 8, 64, 5)?;
    let full = batched_gemm_a8w8(&p.xq, &p.wq, &p.x_scale, &p.w_scale, DType::F32, None, 0)?;
    for dtype in [DType::BF16, DType::F16] {
        let y = batched_gemm_a8w8(&p.xq, &p.wq, &p.x_scale, &p.w_scale, dtype, None, 0)?;
        assert_eq!(y.dtype(), dtype);
        let report = check_allclose(&y.to_dtype(DType::F32)?, &full, 1e-2, 1e-2, "narrow output")?;
        assert!(report.passed, "{dtype:?}: {report:?}");
    }
    Ok(())
}

#[test]
fn quantized_activations_approximate_the_float_matmul() -> Result<()> {
    let device = Device::Cpu;
    let x = Tensor::randn(0f32, 1.0, (2, 8, 64), &device)?;
    let w = Tensor::randn(0f32, 1.0, (2, 12, 64), &device)?;
    let (xq, x_scale) = quantize_per_token(&x)?;
    let (wq, w_scale) = quantize_per_channel(&w)?;
    assert_eq!(x_scale.dims(), &[2, 8, 1]);
    assert_eq!(w_scale.dims(), &[2, 1, 12]);
    let y = batched_gemm_a8w8(&xq, &wq, &x_scale, &w_scale, DType::F32, None, 0)?;
    let expected = x.matmul(&w.transpose(1, 2)?.contiguous()?)?;
    let report = check_allclose(&y, &expected, 5e-2, 0.3, "quantized vs float")?;
    assert!(report.passed, "{report:?}");
    Ok(())
}

#[test]
fn operand_shapes_are_validated() -> Result<()> {
    let p = random_problem(2, 4, 4, 16, 1)?;
    let device = Device::Cpu;
    let bad_scale = Tensor::ones((2, 4), DType::F32, &device)?;
    assert!(matches!(
        batched_gemm_a8w8(&p.xq, &p.wq, &bad_scale, &p.w_scale, DType::F32, None, 0),
        Err(OpError::InvalidShape { .. })
    ));
    let short_w = encode_int8(&[0; 2 * 4 * 8], &[2, 4, 8], &device)?;
    assert!(batched_gemm_a8w8(&p.xq, &short_w, &p.x_scale, &p.w_scale, DType::F32, None, 0).is_err());
    let float_x = Tensor::zeros((2, 4, 16), DType::F32, &device)?;
    assert!(matches!(
        batched_gemm_a8w8(&float_x, &p.wq, &p.x_scale, &p.w_scale, DType::F32, None, 0),
        Err(OpError::UnsupportedDType { .. })
    ));
    assert!(matches!(
        batched_gemm_a8w8(&p.xq, &p.wq, &p.x_scale, &p.w_scale, DType::F32, None, 31),
        Err(OpError::InvalidArgument { .. })
    ));
    Ok(())
}
