//! Process-wide operator configuration.
//!
//! Values come from three layers, later layers winning:
//! 1. built-in defaults,
//! 2. an optional TOML or JSON file ([`OpsConfig::from_path`]),
//! 3. `OPKIT_*` environment variables ([`OpsConfig::apply_env_overrides`]):
//!    - `OPKIT_NUM_THREADS`: worker threads for host kernels (`0` = rayon default),
//!    - `OPKIT_PARTITION_SIZE`: default paged-attention partition size,
//!    - `OPKIT_GEMM_TUNED_CONFIG`: path to a tuned int8 GEMM table,
//!    - `OPKIT_MOE_CONFIG_DIR`: directory of tuned fused-MoE configs,
//!    - `OPKIT_PERF_ITERS` / `OPKIT_PERF_WARMUP`: perftest iteration counts,
//!    - `OPKIT_LOG_ARGS`: `1` logs operand shapes/dtypes on every operator call.

use std::{
    env, fs,
    path::{Path, PathBuf},
    sync::OnceLock,
};

use serde::Deserialize;

use crate::error::{OpError, Result};

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct OpsConfig {
    pub num_threads: usize,
    pub partition_size: usize,
    pub gemm_tuned_config: Option<PathBuf>,
    /// Holds `E=..,N=..,device_name=..[,dtype=..].json` files.
    pub moe_config_dir: Option<PathBuf>,
    pub log_args: bool,
    pub perf: PerfConfig,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct PerfConfig {
    pub iters: usize,
    pub warmup: usize,
}

impl Default for PerfConfig {
    fn default() -> Self {
        Self {
            iters: 101,
            warmup: 5,
        }
    }
}

impl Default for OpsConfig {
    fn default() -> Self {
        Self {
            num_threads: 0,
            partition_size: 256,
            gemm_tuned_config: None,
            moe_config_dir: None,
            log_args: false,
            perf: PerfConfig::default(),
        }
    }
}

impl OpsConfig {
    /// Parses a config file, choosing the format from its extension.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)?;
        let mut config: OpsConfig = match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => serde_json::from_str(&contents)
                .map_err(|err| OpError::Config(format!("{}: {err}", path.display())))?,
            Some("toml") | None => toml::from_str(&contents)
                .map_err(|err| OpError::Config(format!("{}: {err}", path.display())))?,
            Some(other) => {
                return Err(OpError::Config(format!(
                    "unsupported configuration extension '{other}'"
                )))
            }
        };

        let base = path.parent().unwrap_or_else(|| Path::new("."));
        for relative in [config.gemm_tuned_config.as_mut(), config.moe_config_dir.as_mut()]
            .into_iter()
            .flatten()
        {
            if relative.is_relative() {
                *relative = base.join(&*relative);
            }
        }
        config.validate()?;
        Ok(config)
    }

    /// Defaults plus environment overrides.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    pub fn apply_env_overrides(&mut self) -> Result<()> {
        if let Some(value) = env_usize("OPKIT_NUM_THREADS")? {
            self.num_threads = value;
        }
        if let Some(value) = env_usize("OPKIT_PARTITION_SIZE")? {
            self.partition_size = value;
        }
        if let Ok(path) = env::var("OPKIT_GEMM_TUNED_CONFIG") {
            if !path.trim().is_empty() {
                self.gemm_tuned_config = Some(PathBuf::from(path));
            }
        }
        if let Ok(dir) = env::var("OPKIT_MOE_CONFIG_DIR") {
            if !dir.trim().is_empty() {
                self.moe_config_dir = Some(PathBuf::from(dir));
            }
        }
        if let Some(value) = env_usize("OPKIT_PERF_ITERS")? {
            self.perf.iters = value;
        }
        if let Some(value) = env_usize("OPKIT_PERF_WARMUP")? {
            self.perf.warmup = value;
        }
        if let Ok(flag) = env::var("OPKIT_LOG_ARGS") {
            self.log_args = matches!(flag.trim(), "1" | "true" | "yes" | "on");
        }
        Ok(())
    }

    /// Collects every problem so a broken file is fixed in one pass.
    pub fn validate(&self) -> Result<()> {
        let mut errors = Vec::new();
        if self.partition_size == 0 {
            errors.push("partition_size must be greater than 0".to_string());
        }
        if self.perf.iters < 2 {
            errors.push("perf.iters must be at least 2".to_string());
        }
        if let Some(path) = &self.gemm_tuned_config {
            if path.as_os_str().is_empty() {
                errors.push("gemm_tuned_config must not be empty".to_string());
            }
        }
        if let Some(dir) = &self.moe_config_dir {
            if dir.as_os_str().is_empty() {
                errors.push("moe_config_dir must not be empty".to_string());
            }
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(OpError::Config(errors.join("; ")))
        }
    }

    /// Lazily resolved process-wide config (defaults + environment) unless
    /// [`OpsConfig::install`] ran first.
    ///
    /// An invalid environment falls back to defaults after logging the error.
    pub fn global() -> &'static OpsConfig {
        GLOBAL.get_or_init(|| match OpsConfig::from_env() {
            Ok(config) => {
                config.log_summary();
                config
            }
            Err(err) => {
                log::warn!("ignoring OPKIT_* overrides: {err}");
                OpsConfig::default()
            }
        })
    }

    /// Makes `self` the process-wide config. Fails once any operator has
    /// already resolved [`OpsConfig::global`].
    pub fn install(self) -> Result<&'static OpsConfig> {
        self.validate()?;
        GLOBAL
            .set(self)
            .map_err(|_| OpError::Config("operator config already initialized".to_string()))?;
        let config = Self::global();
        config.log_summary();
        Ok(config)
    }

    fn log_summary(&self) {
        log::info!(
            "opkit config: threads={} partition_size={} tuned_gemm={:?} moe_configs={:?} log_args={}",
            self.num_threads,
            self.partition_size,
            self.gemm_tuned_config,
            self.moe_config_dir,
            self.log_args
        );
    }
}

static GLOBAL: OnceLock<OpsConfig> = OnceLock::new();

fn env_usize(key: &'static str) -> Result<Option<usize>> {
    match env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse::<usize>()
            .map(Some)
            .map_err(|err| OpError::Config(format!("{key}={raw:?}: {err}"))),
        Err(_) => Ok(None),
    }
}
