//! Tuned kernel selection keyed by problem size.
//!
//! A tuned table lists `(b, m, n, k) -> (kernel_id, split_k)` entries, written
//! by offline tuning runs and loaded from TOML or JSON:
//!
//! ```toml
//! [[entry]]
//! b = 16
//! m = 128
//! n = 1536
//! k = 7168
//! kernel_id = 3
//! split_k = 1
//! ```

use std::{collections::HashMap, fs, path::Path, sync::OnceLock};

use opkit_core::{OpError, OpsConfig, Result};
use serde::{Deserialize, Serialize};

use crate::instances::instance;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProblemSize {
    pub b: usize,
    pub m: usize,
    pub n: usize,
    pub k: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunedEntry {
    pub b: usize,
    pub m: usize,
    pub n: usize,
    pub k: usize,
    pub kernel_id: u32,
    #[serde(default)]
    pub split_k: u32,
}

impl TunedEntry {
    pub fn size(&self) -> ProblemSize {
        ProblemSize {
            b: self.b,
            m: self.m,
            n: self.n,
            k: self.k,
        }
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct TunedFile {
    #[serde(default)]
    entry: Vec<TunedEntry>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct TunedGemmTable {
    entries: HashMap<ProblemSize, TunedEntry>,
}

impl TunedGemmTable {
    pub fn from_entries(entries: impl IntoIterator<Item = TunedEntry>) -> Result<Self> {
        let entries: Vec<TunedEntry> = entries.into_iter().collect();
        let mut errors = Vec::new();
        for e in &entries {
            if instance(e.kernel_id).is_none() {
                errors.push(format!("{:?}: unknown kernel_id {}", e.size(), e.kernel_id));
            }
            if (1usize << e.split_k.min(31)) > e.k {
                errors.push(format!("{:?}: split_k {} partitions K too finely", e.size(), e.split_k));
            }
        }
        if !errors.is_empty() {
            return Err(OpError::Config(errors.join("; ")));
        }
        Ok(Self {
            entries: entries.into_iter().map(|e| (e.size(), e)).collect(),
        })
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)?;
        let file: TunedFile = match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => serde_json::from_str(&contents)
                .map_err(|err| OpError::Config(format!("{}: {err}", path.display())))?,
            Some("toml") | None => toml::from_str(&contents)
                .map_err(|err| OpError::Config(format!("{}: {err}", path.display())))?,
            Some(other) => {
                return Err(OpError::Config(format!(
                    "unsupported tuned table extension '{other}'"
                )))
            }
        };
        let table = Self::from_entries(file.entry)?;
        log::info!("loaded {} tuned a8w8 GEMM entries from {}", table.len(), path.display());
        Ok(table)
    }

    pub fn lookup(&self, size: ProblemSize) -> Option<&TunedEntry> {
        self.entries.get(&size)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Table named by `gemm_tuned_config` in the global config, loaded once.
    ///
    /// A missing or malformed file is logged and treated as an empty table.
    pub fn global() -> &'static TunedGemmTable {
        static GLOBAL: OnceLock<TunedGemmTable> = OnceLock::new();
        GLOBAL.get_or_init(|| match &OpsConfig::global().gemm_tuned_config {
            Some(path) => TunedGemmTable::from_path(path).unwrap_or_else(|err| {
                log::warn!("ignoring tuned GEMM table {}: {err}", path.display());
                TunedGemmTable::default()
            }),
            None => TunedGemmTable::default(),
        })
    }
}
