//! Angle and cos/sin table builders with a shared bounded cache.
//!
//! Tables are f32 and shaped `[max_seq_len, rotate_dim / 2]`, i.e. the front
//! half of each row, so they feed the `reuse_freqs_front_part` variants and
//! [`rotary_embedding`](crate::rotary_embedding) directly.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, OnceLock};

use candle_core::{Device, Tensor};
use opkit_core::{host::device_key, OpError, Result};

const TABLE_CACHE_CAPACITY: usize = 16;

static TABLE_CACHE_HITS: AtomicUsize = AtomicUsize::new(0);
static TABLE_CACHE_MISSES: AtomicUsize = AtomicUsize::new(0);

/// Current `(hits, misses)` counters of the shared table cache.
pub fn table_cache_counters() -> (usize, usize) {
    (
        TABLE_CACHE_HITS.load(Ordering::Relaxed),
        TABLE_CACHE_MISSES.load(Ordering::Relaxed),
    )
}

pub fn reset_table_cache_stats() {
    TABLE_CACHE_HITS.store(0, Ordering::Relaxed);
    TABLE_CACHE_MISSES.store(0, Ordering::Relaxed);
}

/// Angles plus their cosines and sines, all `[max_seq_len, rotate_dim / 2]`.
#[derive(Debug, Clone)]
pub struct RopeTables {
    pub freqs: Tensor,
    pub cos: Tensor,
    pub sin: Tensor,
}

/// Everything a built table depends on. Floats are keyed by bit pattern.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TableKey {
    pub max_seq_len: usize,
    pub rotate_dim: usize,
    theta_bits: u32,
    scaling: ScalingKey,
    pub device: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum ScalingKey {
    None,
    Ntk(u32),
    Linear(u32),
}

impl TableKey {
    pub fn new(max_seq_len: usize, cfg: &RopeConfig, device: &Device) -> Self {
        let scaling = match cfg.scaling {
            RopeScaling::None => ScalingKey::None,
            RopeScaling::Ntk { alpha } => ScalingKey::Ntk(alpha.to_bits()),
            RopeScaling::Linear { scale } => ScalingKey::Linear(scale.to_bits()),
        };
        Self {
            max_seq_len,
            rotate_dim: cfg.rotate_dim(),
            theta_bits: cfg.rope_theta.to_bits(),
            scaling,
            device: device_key(device),
        }
    }
}

/// Bounded map evicting the least recently used key.
struct TableCache {
    capacity: usize,
    clock: u64,
    entries: HashMap<TableKey, (u64, RopeTables)>,
}

impl TableCache {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            clock: 0,
            entries: HashMap::with_capacity(capacity + 1),
        }
    }

    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    fn get(&mut self, key: &TableKey) -> Option<RopeTables> {
        let now = self.tick();
        let (used, tables) = self.entries.get_mut(key)?;
        *used = now;
        Some(tables.clone())
    }

    fn insert(&mut self, key: TableKey, value: RopeTables) {
        let now = self.tick();
        self.entries.insert(key, (now, value));
        while self.entries.len() > self.capacity {
            let Some(stale) = self
                .entries
                .iter()
                .min_by_key(|(_, (used, _))| *used)
                .map(|(key, _)| key.clone())
            else {
                break;
            };
            self.entries.remove(&stale);
        }
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}

fn table_cache() -> MutexGuard<'static, TableCache> {
    static CACHE: OnceLock<Mutex<TableCache>> = OnceLock::new();
    CACHE
        .get_or_init(|| Mutex::new(TableCache::new(TABLE_CACHE_CAPACITY)))
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Number of geometries currently cached.
pub fn cached_table_count() -> usize {
    table_cache().len()
}

/// Position scaling applied when building tables.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub enum RopeScaling {
    #[default]
    None,
    /// NTK-aware scaling: the base becomes `theta * alpha^(r / (r - 2))`.
    Ntk { alpha: f32 },
    /// Position interpolation: position `p` is read as `p / scale`.
    Linear { scale: f32 },
}

/// Geometry of a rotary table.
#[derive(Debug, Clone, PartialEq)]
pub struct RopeConfig {
    pub head_dim: usize,
    /// Base θ of the frequency spectrum.
    pub rope_theta: f32,
    /// Rotated width; `None` rotates the whole head.
    pub rotate_dim: Option<usize>,
    pub scaling: RopeScaling,
}

impl Default for RopeConfig {
    fn default() -> Self {
        Self {
            head_dim: 0,
            rope_theta: 10_000.0,
            rotate_dim: None,
            scaling: RopeScaling::None,
        }
    }
}

impl RopeConfig {
    pub fn rotate_dim(&self) -> usize {
        self.rotate_dim.unwrap_or(self.head_dim)
    }

    pub fn validate(&self) -> Result<()> {
        let rot = self.rotate_dim();
        if rot < 2 || rot % 2 != 0 || rot > self.head_dim {
            return Err(OpError::shape(format!(
                "rotate_dim {rot} must be even, at least 2 and at most head_dim {}",
                self.head_dim
            )));
        }
        if !(self.rope_theta > 0.0) {
            return Err(OpError::argument("rope_theta", "must be positive"));
        }
        match self.scaling {
            RopeScaling::Ntk { alpha } if !(alpha >= 1.0) => Err(OpError::argument(
                "scaling",
                format!("NTK alpha must be >= 1, got {alpha}"),
            )),
            RopeScaling::Linear { scale } if !(scale >= 1.0) => Err(OpError::argument(
                "scaling",
                format!("interpolation scale must be >= 1, got {scale}"),
            )),
            _ => Ok(()),
        }
    }
}

fn build_tables(max_seq_len: usize, cfg: &RopeConfig, device: &Device) -> Result<RopeTables> {
    let rot = cfg.rotate_dim();
    let half = rot / 2;
    let mut base = cfg.rope_theta as f64;
    let mut position_scale = 1.0f64;
    match cfg.scaling {
        RopeScaling::None => {}
        RopeScaling::Ntk { alpha } => {
            base *= (alpha as f64).powf(rot as f64 / (rot as f64 - 2.0).max(1.0));
        }
        RopeScaling::Linear { scale } => position_scale = 1.0 / scale as f64,
    }

    let inv_freqs: Vec<f64> = (0..half)
        .map(|i| base.powf(-((2 * i) as f64) / rot as f64))
        .collect();

    let mut freqs = Vec::with_capacity(max_seq_len * half);
    for pos in 0..max_seq_len {
        let pos = pos as f64 * position_scale;
        freqs.extend(inv_freqs.iter().map(|inv| pos * inv));
    }
    let cos: Vec<f32> = freqs.iter().map(|a| a.cos() as f32).collect();
    let sin: Vec<f32> = freqs.iter().map(|a| a.sin() as f32).collect();
    let freqs: Vec<f32> = freqs.into_iter().map(|a| a as f32).collect();

    Ok(RopeTables {
        freqs: Tensor::from_vec(freqs, (max_seq_len, half), device)?,
        cos: Tensor::from_vec(cos, (max_seq_len, half), device)?,
        sin: Tensor::from_vec(sin, (max_seq_len, half), device)?,
    })
}

/// Returns cached tables for this geometry, building them on a miss.
pub fn rope_tables(max_seq_len: usize, cfg: &RopeConfig, device: &Device) -> Result<RopeTables> {
    if max_seq_len == 0 {
        return Err(OpError::argument("max_seq_len", "must be non-zero"));
    }
    cfg.validate()?;

    let key = TableKey::new(max_seq_len, cfg, device);
    if let Some(tables) = table_cache().get(&key) {
        TABLE_CACHE_HITS.fetch_add(1, Ordering::Relaxed);
        log::debug!("rope table cache hit: {key:?}");
        return Ok(tables);
    }
    TABLE_CACHE_MISSES.fetch_add(1, Ordering::Relaxed);
    log::debug!("rope table cache miss: {key:?}");

    let tables = build_tables(max_seq_len, cfg, device)?;
    let mut cache = table_cache();
    if let Some(existing) = cache.get(&key) {
        return Ok(existing);
    }
    cache.insert(key, tables.clone());
    Ok(tables)
}

/// Angle table shaped `[max_seq_len, 1, 1, rotate_dim / 2]` for the sbhd and
/// thd variants.
pub fn freqs_table(max_seq_len: usize, cfg: &RopeConfig, device: &Device) -> Result<Tensor> {
    let tables = rope_tables(max_seq_len, cfg, device)?;
    let half = cfg.rotate_dim() / 2;
    Ok(tables.freqs.reshape((max_seq_len, 1, 1, half))?)
}

/// `(cos, sin)` shaped `[max_seq_len, rotate_dim / 2]`.
pub fn cos_sin_tables(max_seq_len: usize, cfg: &RopeConfig, device: &Device) -> Result<(Tensor, Tensor)> {
    let tables = rope_tables(max_seq_len, cfg, device)?;
    Ok((tables.cos, tables.sin))
}
