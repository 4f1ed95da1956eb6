use attention::{
    paged_attention, reshape_and_cache, BlockAllocator, BlockTable, CacheLayout, KvCacheDtype, PagedAttentionConfig,
};
use candle_core::{DType, Device, Tensor};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

struct Inputs {
    query: Tensor,
    key_cache: Tensor,
    value_cache: Tensor,
    block_tables: Tensor,
    context_lens: Tensor,
    config: PagedAttentionConfig,
}

fn build(num_seqs: usize, context: usize, kv_cache_dtype: KvCacheDtype) -> Inputs {
    let device = Device::Cpu;
    let (heads, kv_heads, head_size, block_size) = (16usize, 4usize, 128usize, 16usize);
    let storage = match kv_cache_dtype {
        KvCacheDtype::Auto => DType::F32,
        KvCacheDtype::Fp8E4m3 => DType::U8,
    };
    let num_blocks = num_seqs * context.div_ceil(block_size);
    let layout = CacheLayout::for_dtype(num_blocks, kv_heads, head_size, block_size, storage).expect("layout");
    let (key_cache, value_cache) = layout.allocate(storage, &device).expect("caches");
    let allocator = BlockAllocator::for_layout(&layout).expect("allocator");
    let mut tables = Vec::with_capacity(num_seqs);
    for _ in 0..num_seqs {
        let mut table = BlockTable::new(block_size);
        let slots = table.append_tokens(context, &allocator).expect("slots");
        let kv = Tensor::randn(0f32, 1.0, (context, kv_heads, head_size), &device).expect("kv");
        let slots = Tensor::from_vec(slots, context, &device).expect("slot tensor");
        reshape_and_cache(&kv, &kv, &key_cache, &value_cache, &slots, kv_cache_dtype, 0.05, 0.05).expect("write");
        tables.push(table);
    }
    Inputs {
        query: Tensor::randn(0f32, 1.0, (num_seqs, heads, head_size), &device).expect("query"),
        key_cache,
        value_cache,
        block_tables: BlockTable::to_tensor(&tables, &device).expect("tables"),
        context_lens: BlockTable::context_lens(&tables, &device).expect("lens"),
        config: PagedAttentionConfig::new(kv_heads, 1.0 / (head_size as f32).sqrt(), block_size, context)
            .with_partition_size(256)
            .with_kv_cache_dtype(kv_cache_dtype)
            .with_kv_scales(0.05, 0.05),
    }
}

fn bench_paged(c: &mut Criterion) {
    let mut group = c.benchmark_group("paged_attention");
    group.sample_size(20);
    for kv_cache_dtype in [KvCacheDtype::Auto, KvCacheDtype::Fp8E4m3] {
        for &(seqs, context) in &[(8usize, 512usize), (4, 2048)] {
            let inputs = build(seqs, context, kv_cache_dtype);
            group.throughput(Throughput::Elements((seqs * context) as u64));
            let id = BenchmarkId::new(kv_cache_dtype.as_str(), format!("{seqs}x{context}"));
            group.bench_function(id, |b| {
                b.iter(|| {
                    black_box(
                        paged_attention(
                            &inputs.query,
                            &inputs.key_cache,
                            &inputs.value_cache,
                            &inputs.block_tables,
                            &inputs.context_lens,
                            None,
                            None,
                            &inputs.config,
                        )
                        .expect("paged_attention"),
                    )
                });
            });
        }
    }
    group.finish();
}

criterion_group!(benches, bench_paged);
criterion_main!(benches);
