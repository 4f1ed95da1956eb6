//! Tuned fused-MoE kernel configs.
//!
//! Offline tuning writes one JSON file per `(E, N, dtype)` named
//! `E={E},N={N},device_name=host[,dtype={dtype}].json`, mapping a grid of
//! token counts to a config:
//!
//! ```json
//! {"1": {"BLOCK_SIZE_M": 16, "BLOCK_SIZE_N": 128, "BLOCK_SIZE_K": 128, "GROUP_SIZE_M": 1},
//!  "64": {"BLOCK_SIZE_M": 64, "BLOCK_SIZE_N": 128, "BLOCK_SIZE_K": 128, "GROUP_SIZE_M": 8}}
//! ```
//!
//! A call with `M` tokens uses the grid point nearest to `M`. Files live in
//! `moe_config_dir` of [`OpsConfig`]; without one the size default applies.

use std::{
    collections::{BTreeMap, HashMap},
    fs,
    path::{Path, PathBuf},
    sync::{Arc, Mutex, OnceLock},
};

use candle_core::DType;
use opkit_core::{OpError, OpsConfig, Result};
use serde::{Deserialize, Serialize};

/// Device tag baked into config file names.
pub const DEVICE_NAME: &str = "host";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MoeKernelConfig {
    /// Routed slots per aligned block.
    #[serde(rename = "BLOCK_SIZE_M")]
    pub block_size_m: usize,
    /// Output rows per tile of an expert matvec.
    #[serde(rename = "BLOCK_SIZE_N")]
    pub block_size_n: usize,
    /// Reduction elements per tile of an expert matvec.
    #[serde(rename = "BLOCK_SIZE_K")]
    pub block_size_k: usize,
    /// Blocks evaluated by one parallel task.
    #[serde(rename = "GROUP_SIZE_M")]
    pub group_size_m: usize,
}

impl Default for MoeKernelConfig {
    fn default() -> Self {
        Self {
            block_size_m: 64,
            block_size_n: 128,
            block_size_k: 128,
            group_size_m: 8,
        }
    }
}

impl MoeKernelConfig {
    /// Untuned config for `tokens` routed over `num_experts`.
    pub fn default_for(tokens: usize, num_experts: usize) -> Self {
        if tokens <= num_experts {
            Self {
                block_size_m: 16,
                group_size_m: 1,
                ..Self::default()
            }
        } else {
            Self::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        let fields = [
            ("BLOCK_SIZE_M", self.block_size_m),
            ("BLOCK_SIZE_N", self.block_size_n),
            ("BLOCK_SIZE_K", self.block_size_k),
            ("GROUP_SIZE_M", self.group_size_m),
        ];
        let zero: Vec<&str> = fields.iter().filter(|(_, v)| *v == 0).map(|(name, _)| *name).collect();
        if zero.is_empty() {
            Ok(())
        } else {
            Err(OpError::Config(format!("{} must be positive", zero.join(", "))))
        }
    }
}

/// `dtype` component of a config file name.
pub fn config_dtype_str(int8_w8a16: bool, dtype: DType) -> Option<&'static str> {
    if int8_w8a16 {
        Some("int8_w8a16")
    } else if dtype == DType::F32 {
        Some("float32")
    } else {
        None
    }
}

pub fn config_file_name(num_experts: usize, n: usize, dtype: Option<&str>) -> String {
    let selector = dtype.map(|d| format!(",dtype={d}")).unwrap_or_default();
    format!("E={num_experts},N={n},device_name={DEVICE_NAME}{selector}.json")
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct MoeConfigTable {
    configs: BTreeMap<usize, MoeKernelConfig>,
}

impl MoeConfigTable {
    pub fn from_entries(entries: impl IntoIterator<Item = (usize, MoeKernelConfig)>) -> Result<Self> {
        let configs: BTreeMap<usize, MoeKernelConfig> = entries.into_iter().collect();
        let errors: Vec<String> = configs
            .iter()
            .filter_map(|(m, config)| config.validate().err().map(|err| format!("M={m}: {err}")))
            .collect();
        if !errors.is_empty() {
            return Err(OpError::Config(errors.join("; ")));
        }
        Ok(Self { configs })
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)?;
        let raw: HashMap<String, MoeKernelConfig> = serde_json::from_str(&contents)
            .map_err(|err| OpError::Config(format!("{}: {err}", path.display())))?;
        let entries = raw
            .into_iter()
            .map(|(key, config)| match key.trim().parse::<usize>() {
                Ok(m) => Ok((m, config)),
                Err(err) => Err(OpError::Config(format!("{}: token count {key:?}: {err}", path.display()))),
            })
            .collect::<Result<Vec<_>>>()?;
        let table = Self::from_entries(entries)?;
        log::info!("using MoE configuration from {} ({} entries)", path.display(), table.len());
        Ok(table)
    }

    /// Table for `(E, N, dtype)` under `dir`; `Ok(None)` when no file exists.
    pub fn load_for(dir: &Path, num_experts: usize, n: usize, dtype: Option<&str>) -> Result<Option<Self>> {
        let path = dir.join(config_file_name(num_experts, n, dtype));
        if !path.is_file() {
            log::info!("no tuned MoE config at {}", path.display());
            return Ok(None);
        }
        Self::from_path(&path).map(Some)
    }

    /// Config of the grid point closest to `tokens`; ties go to the smaller.
    pub fn nearest(&self, tokens: usize) -> Option<&MoeKernelConfig> {
        let below = self.configs.range(..=tokens).next_back();
        let above = self.configs.range(tokens..).next();
        match (below, above) {
            (Some((&lo, low)), Some((&hi, high))) => Some(if tokens - lo <= hi - tokens { low } else { high }),
            (Some((_, config)), None) | (None, Some((_, config))) => Some(config),
            (None, None) => None,
        }
    }

    pub fn len(&self) -> usize {
        self.configs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.configs.is_empty()
    }
}

/// Picks the config for `tokens`: the override, else the nearest tuned
/// entry of `table`, else [`MoeKernelConfig::default_for`].
pub fn select_config_in(
    table: Option<&MoeConfigTable>,
    tokens: usize,
    num_experts: usize,
    override_config: Option<&MoeKernelConfig>,
) -> MoeKernelConfig {
    if let Some(config) = override_config {
        return *config;
    }
    table
        .and_then(|table| table.nearest(tokens))
        .copied()
        .unwrap_or_else(|| MoeKernelConfig::default_for(tokens, num_experts))
}

/// [`select_config_in`] over the table for `(E, N, dtype)` found in the
/// global `moe_config_dir`.
pub fn select_config(
    tokens: usize,
    num_experts: usize,
    n: usize,
    dtype: Option<&str>,
    override_config: Option<&MoeKernelConfig>,
) -> MoeKernelConfig {
    if override_config.is_some() {
        return select_config_in(None, tokens, num_experts, override_config);
    }
    let table = OpsConfig::global()
        .moe_config_dir
        .as_deref()
        .and_then(|dir| cached_table(dir, num_experts, n, dtype));
    select_config_in(table.as_deref(), tokens, num_experts, None)
}

type TableCache = HashMap<PathBuf, Option<Arc<MoeConfigTable>>>;

/// Loads each file once per process. Broken files are logged and skipped.
fn cached_table(dir: &Path, num_experts: usize, n: usize, dtype: Option<&str>) -> Option<Arc<MoeConfigTable>> {
    static TABLES: OnceLock<Mutex<TableCache>> = OnceLock::new();
    let path = dir.join(config_file_name(num_experts, n, dtype));
    let mut tables = TABLES
        .get_or_init(Default::default)
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner());
    tables
        .entry(path)
        .or_insert_with(|| match MoeConfigTable::load_for(dir, num_experts, n, dtype) {
            Ok(table) => table.map(Arc::new),
            Err(err) => {
                log::warn!("ignoring tuned MoE config in {}: {err}", dir.display());
                None
            }
        })
        .clone()
}
