//! Numerical comparison and timing helpers for tests, benches and the CLI.

use std::time::Instant;

use candle_core::Tensor;

use crate::config::OpsConfig;
use crate::error::{OpError, Result};
use crate::host::read_f32;

/// Outcome of [`check_allclose`].
#[derive(Debug, Clone, PartialEq)]
pub struct AllcloseReport {
    pub passed: bool,
    pub mismatched: usize,
    pub total: usize,
    pub max_delta: f32,
}

impl AllcloseReport {
    pub fn mismatch_ratio(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.mismatched as f64 / self.total as f64
        }
    }
}

/// Elementwise `|a - b| <= atol + rtol * |b|` comparison.
///
/// Failures are logged with up to eight offending pairs when more than 1% of
/// elements disagree, otherwise only the summary line is logged.
pub fn check_allclose(a: &Tensor, b: &Tensor, rtol: f32, atol: f32, msg: &str) -> Result<AllcloseReport> {
    if a.dims() != b.dims() {
        return Err(OpError::shape(format!(
            "{msg}: cannot compare shapes {:?} and {:?}",
            a.dims(),
            b.dims()
        )));
    }
    let lhs = read_f32(a)?;
    let rhs = read_f32(b)?;

    let mut mismatched = Vec::new();
    let mut max_delta = 0.0f32;
    for (idx, (&x, &y)) in lhs.iter().zip(rhs.iter()).enumerate() {
        let delta = (x - y).abs();
        let both_nan = x.is_nan() && y.is_nan();
        let close = both_nan || x == y || delta <= atol + rtol * y.abs();
        if !close {
            if delta.is_nan() || delta > max_delta {
                max_delta = delta;
            }
            mismatched.push(idx);
        }
    }

    let report = AllcloseReport {
        passed: mismatched.is_empty(),
        mismatched: mismatched.len(),
        total: lhs.len(),
        max_delta,
    };

    if report.passed {
        log::info!("{msg}[allclose atol={atol} rtol={rtol} passed]");
    } else {
        if report.mismatch_ratio() > 0.01 {
            let shown: Vec<(usize, f32, f32)> = mismatched
                .iter()
                .take(8)
                .map(|&idx| (idx, lhs[idx], rhs[idx]))
                .collect();
            log::info!(
                "{msg}[allclose atol={atol} rtol={rtol} failed] shape={:?} first mismatches (index, a, b): {shown:?}",
                a.dims()
            );
        } else {
            log::info!("{msg}[allclose atol={atol} rtol={rtol} warning] a and b are not all close");
        }
        log::info!(
            "{msg} max delta {} over {:.1}% ({} of {}) elements",
            report.max_delta,
            report.mismatch_ratio() * 100.0,
            report.mismatched,
            report.total
        );
    }
    Ok(report)
}

/// Timing summary returned by [`run_perftest`].
#[derive(Debug, Clone, PartialEq)]
pub struct PerfStats {
    pub iters: usize,
    pub avg_us: f64,
    pub min_us: f64,
}

/// Runs `f` `warmup` times untimed, then `iters` timed iterations.
///
/// Returns the last result with the measured statistics. Host kernels are
/// synchronous, so wall-clock time is the kernel time.
pub fn run_perftest<T, F>(iters: usize, warmup: usize, mut f: F) -> Result<(T, PerfStats)>
where
    F: FnMut() -> Result<T>,
{
    if iters == 0 {
        return Err(OpError::argument("iters", "must run at least one iteration"));
    }
    for _ in 0..warmup {
        f()?;
    }
    let mut total = 0.0f64;
    let mut min_us = f64::INFINITY;
    let mut last = None;
    for _ in 0..iters {
        let start = Instant::now();
        let value = f()?;
        let elapsed = start.elapsed().as_secs_f64() * 1e6;
        total += elapsed;
        min_us = min_us.min(elapsed);
        last = Some(value);
    }
    let stats = PerfStats {
        iters,
        avg_us: total / iters as f64,
        min_us,
    };
    log::info!("avg: {:.2} us/iter (min {:.2})", stats.avg_us, stats.min_us);
    let value = last.ok_or_else(|| OpError::argument("iters", "no iteration produced a value"))?;
    Ok((value, stats))
}

/// [`run_perftest`] with iteration counts from [`OpsConfig::global`].
pub fn run_perftest_default<T, F>(f: F) -> Result<(T, PerfStats)>
where
    F: FnMut() -> Result<T>,
{
    let perf = &OpsConfig::global().perf;
    run_perftest(perf.iters, perf.warmup, f)
}

/// One-line description of a tensor operand: shape, dtype, device.
pub fn describe_tensor(tensor: &Tensor) -> String {
    format!("{:?} {:?} {:?}", tensor.dims(), tensor.dtype(), tensor.device().location())
}

/// Logs operator operands when `log_args` is enabled in the global config.
pub fn log_call(op: &str, args: &[(&str, &Tensor)]) {
    if !OpsConfig::global().log_args {
        return;
    }
    let rendered: Vec<String> = args
        .iter()
        .map(|(name, tensor)| format!("{name:<16} = {}", describe_tensor(tensor)))
        .collect();
    log::info!("calling {op}(\n    {}\n)", rendered.join(",\n    "));
}
