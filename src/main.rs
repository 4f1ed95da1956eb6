use std::path::PathBuf;

use anyhow::Context;

use candle_core::{DType, Device, Tensor};
use clap::{Args, Parser, Subcommand, ValueEnum};
use opkit::{
    core::testing::{describe_tensor, run_perftest, PerfStats},
    gemm::{quantize_per_channel, quantize_per_token},
    BlockAllocator, BlockTable, CacheLayout, ExpertOptions, KvCacheDtype, OpError, OpsConfig,
    PagedAttentionConfig, Result, RoutingMethod, RopeConfig, TunedGemmTable,
};
use tracing_subscriber::EnvFilter;

fn main() {
    init_logging();
    if let Err(err) = run() {
        eprintln!("opkit failed: {err:#}");
        std::process::exit(1);
    }
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Host reference operators for LLM inference", long_about = None)]
struct Cli {
    #[arg(
        short,
        long,
        global = true,
        value_name = "PATH",
        help = "Operator config file (TOML or JSON); OPKIT_* variables still apply"
    )]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Load, validate and print the operator configuration.
    CheckConfig,
    /// Time one operator on random CPU tensors.
    Bench(BenchArgs),
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum BenchOp {
    Gemm,
    PagedAttention,
    Rope,
    Moe,
}

#[derive(Args, Debug)]
struct BenchArgs {
    #[arg(value_enum)]
    op: BenchOp,
    #[arg(long, default_value_t = 16, help = "Tokens (GEMM rows, sequences for paged attention)")]
    tokens: usize,
    #[arg(long, default_value_t = 1)]
    batch: usize,
    #[arg(long, default_value_t = 512)]
    hidden: usize,
    #[arg(long, default_value_t = 1024, help = "Expert intermediate width")]
    intermediate: usize,
    #[arg(long, default_value_t = 8)]
    heads: usize,
    #[arg(long, default_value_t = 8)]
    kv_heads: usize,
    #[arg(long, default_value_t = 64)]
    head_size: usize,
    #[arg(long, default_value_t = 16)]
    block_size: usize,
    #[arg(long, default_value_t = 256)]
    context_len: usize,
    #[arg(long, default_value = "auto")]
    kv_cache_dtype: KvCacheDtype,
    #[arg(long, default_value_t = 8)]
    experts: usize,
    #[arg(long, default_value_t = 2)]
    topk: usize,
    #[arg(long, default_value_t = 0, help = "log2 of the K partitions")]
    split_k: u32,
    #[arg(long, help = "Timed iterations (defaults to perf.iters)")]
    iters: Option<usize>,
    #[arg(long, help = "Untimed iterations (defaults to perf.warmup)")]
    warmup: Option<usize>,
}

fn init_logging() {
    let filter = EnvFilter::try_from_env("OPKIT_LOG")
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new("info"));
    // a subscriber installed by an embedding process wins
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

fn load_config(path: Option<&PathBuf>) -> anyhow::Result<OpsConfig> {
    let Some(path) = path else {
        return Ok(OpsConfig::from_env()?);
    };
    let mut config =
        OpsConfig::from_path(path).with_context(|| format!("loading operator config {}", path.display()))?;
    config.apply_env_overrides()?;
    config.validate()?;
    Ok(config)
}

fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = load_config(cli.config.as_ref())?.install()?;
    opkit::init_thread_pool(config.num_threads)?;

    match cli.command {
        Command::CheckConfig => check_config(config),
        Command::Bench(args) => {
            let iters = args.iters.unwrap_or(config.perf.iters);
            let warmup = args.warmup.unwrap_or(config.perf.warmup);
            let (out, stats) = match args.op {
                BenchOp::Gemm => bench_gemm(&args, iters, warmup)?,
                BenchOp::PagedAttention => bench_paged_attention(&args, iters, warmup)?,
                BenchOp::Rope => bench_rope(&args, iters, warmup)?,
                BenchOp::Moe => bench_moe(&args, iters, warmup)?,
            };
            println!(
                "{:?}: {} iters, avg {:.2} us, min {:.2} us, output {}",
                args.op,
                stats.iters,
                stats.avg_us,
                stats.min_us,
                describe_tensor(&out)
            );
            Ok(())
        }
    }
}

fn check_config(config: &OpsConfig) -> anyhow::Result<()> {
    println!("num_threads       = {}", config.num_threads);
    println!("partition_size    = {}", config.partition_size);
    println!("log_args          = {}", config.log_args);
    println!("perf.iters        = {}", config.perf.iters);
    println!("perf.warmup       = {}", config.perf.warmup);
    match &config.gemm_tuned_config {
        Some(path) => {
            let table = TunedGemmTable::from_path(path)
                .with_context(|| format!("loading tuned GEMM table {}", path.display()))?;
            println!("gemm_tuned_config = {} ({} entries)", path.display(), table.len());
        }
        None => println!("gemm_tuned_config = none"),
    }
    println!("config ok");
    Ok(())
}

fn randn(dims: &[usize]) -> Result<Tensor> {
    Ok(Tensor::randn(0f32, 1f32, dims, &Device::Cpu)?)
}

fn bench_gemm(args: &BenchArgs, iters: usize, warmup: usize) -> Result<(Tensor, PerfStats)> {
    let (xq, x_scale) = quantize_per_token(&randn(&[args.batch, args.tokens, args.hidden])?)?;
    let (wq, w_scale) = quantize_per_channel(&randn(&[args.batch, args.hidden, args.hidden])?)?;
    run_perftest(iters, warmup, || {
        opkit::batched_gemm_a8w8(&xq, &wq, &x_scale, &w_scale, DType::BF16, None, args.split_k)
    })
}

fn bench_paged_attention(args: &BenchArgs, iters: usize, warmup: usize) -> Result<(Tensor, PerfStats)> {
    let blocks_per_seq = BlockTable::blocks_needed(args.context_len, args.block_size);
    let cache_dtype = if args.kv_cache_dtype.is_fp8() { DType::U8 } else { DType::F32 };
    let layout = CacheLayout::for_dtype(
        args.tokens * blocks_per_seq,
        args.kv_heads,
        args.head_size,
        args.block_size,
        cache_dtype,
    )?;
    let (key_cache, value_cache) = random_caches(&layout, cache_dtype)?;

    let allocator = BlockAllocator::for_layout(&layout)?;
    let mut tables = Vec::with_capacity(args.tokens);
    for _ in 0..args.tokens {
        let mut table = BlockTable::new(args.block_size);
        table.append_tokens(args.context_len, &allocator)?;
        tables.push(table);
    }
    let block_tables = BlockTable::to_tensor(&tables, &Device::Cpu)?;
    let context_lens = BlockTable::context_lens(&tables, &Device::Cpu)?;
    let query = randn(&[args.tokens, args.heads, args.head_size])?;
    let config = PagedAttentionConfig::new(
        args.kv_heads,
        (args.head_size as f32).powf(-0.5),
        args.block_size,
        args.context_len,
    )
    .with_kv_cache_dtype(args.kv_cache_dtype);

    run_perftest(iters, warmup, || {
        let out = opkit::paged_attention(
            &query,
            &key_cache,
            &value_cache,
            &block_tables,
            &context_lens,
            None,
            None,
            &config,
        )?;
        Ok(out.out)
    })
}

fn random_caches(layout: &CacheLayout, dtype: DType) -> Result<(Tensor, Tensor)> {
    let key = randn(&layout.key_shape())?;
    let value = randn(&layout.value_shape())?;
    if dtype != DType::U8 {
        return Ok((key, value));
    }
    let encode = |t: Tensor| -> Result<Tensor> {
        let bytes = opkit::core::fp8::encode_scaled(&t.flatten_all()?.to_vec1::<f32>()?, 1.0);
        Ok(Tensor::from_vec(bytes, t.dims(), &Device::Cpu)?)
    };
    Ok((encode(key)?, encode(value)?))
}

fn bench_rope(args: &BenchArgs, iters: usize, warmup: usize) -> Result<(Tensor, PerfStats)> {
    let rope = RopeConfig {
        head_dim: args.head_size,
        ..RopeConfig::default()
    };
    let (cos, sin) = opkit::rope::cos_sin_tables(args.tokens.max(1), &rope, &Device::Cpu)?;
    let tokens = u32::try_from(args.tokens)
        .map_err(|_| OpError::argument("tokens", format!("{} does not fit in u32", args.tokens)))?;
    let positions = Tensor::arange(0u32, tokens, &Device::Cpu)?;
    let width = args.heads * args.head_size;
    let query = randn(&[args.tokens, width])?;
    let key = randn(&[args.tokens, args.kv_heads * args.head_size])?;
    run_perftest(iters, warmup, || {
        opkit::rotary_embedding(&positions, &query, &key, args.head_size, &cos, &sin, true, false)?;
        Ok(query.clone())
    })
}

fn bench_moe(args: &BenchArgs, iters: usize, warmup: usize) -> Result<(Tensor, PerfStats)> {
    if args.topk > args.experts {
        return Err(OpError::argument("topk", "cannot exceed --experts"));
    }
    let hidden = randn(&[args.tokens, args.hidden])?;
    let w1 = (randn(&[args.experts, args.intermediate, args.hidden])? * 0.05)?;
    let w2 = (randn(&[args.experts, args.hidden, args.intermediate])? * 0.05)?;
    let gating = randn(&[args.tokens, args.experts])?;
    let opts = ExpertOptions::default();
    run_perftest(iters, warmup, || {
        opkit::fused_moe(&hidden, &w1, &w2, &gating, args.topk, true, &RoutingMethod::TopK, &opts)
    })
}
