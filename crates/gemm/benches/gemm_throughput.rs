use candle_core::{DType, Device, Tensor};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use quant_gemm::{batched_gemm_a8w8, encode_int8};
use rand::{rngs::StdRng, Rng, SeedableRng};

fn operands(b: usize, m: usize, n: usize, k: usize) -> (Tensor, Tensor, Tensor, Tensor) {
    let device = Device::Cpu;
    let mut rng = StdRng::seed_from_u64(0);
    let mut int8 = |len: usize| -> Vec<i8> { (0..len).map(|_| rng.gen::<i8>()).collect() };
    let xq = encode_int8(&int8(b * m * k), &[b, m, k], &device).expect("xq");
    let wq = encode_int8(&int8(b * n * k), &[b, n, k], &device).expect("wq");
    let x_scale = Tensor::full(0.01f32, (b, m, 1), &device).expect("x_scale");
    let w_scale = Tensor::full(0.02f32, (b, 1, n), &device).expect("w_scale");
    (xq, wq, x_scale, w_scale)
}

fn bench_a8w8(c: &mut Criterion) {
    let mut group = c.benchmark_group("batched_gemm_a8w8");
    group.sample_size(20);
    for &(b, m, n, k) in &[(4usize, 1usize, 1024usize, 1024usize), (4, 64, 512, 1024), (1, 256, 256, 2048)] {
        let (xq, wq, xs, ws) = operands(b, m, n, k);
        group.throughput(Throughput::Elements((2 * b * m * n * k) as u64));
        for split_k in [0u32, 2] {
            let id = BenchmarkId::new(format!("{b}x{m}x{n}x{k}"), format!("split_k={split_k}"));
            group.bench_function(id, |bench| {
                bench.iter(|| {
                    black_box(
                        batched_gemm_a8w8(&xq, &wq, &xs, &ws, DType::BF16, None, split_k).expect("a8w8"),
                    )
                });
            });
        }
    }
    group.finish();
}

criterion_group!(benches, bench_a8w8);
criterion_main!(benches);
