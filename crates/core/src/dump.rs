//! Raw tensor dumps for debugging kernel mismatches.
//!
//! `tensor_dump` writes `<dir>/<name>.bin` holding the contiguous
//! little-endian element bytes and `<dir>/<name>.meta` holding a small JSON
//! document with dtype and shape. `tensor_load` reverses the pair.

use std::{
    fs,
    path::{Path, PathBuf},
    str::FromStr,
};

use candle_core::{DType, Device, Tensor};
use serde::{Deserialize, Serialize};

use crate::error::{OpError, Result};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DumpMeta {
    pub dtype: String,
    pub shape: Vec<usize>,
}

/// Writes `tensor` next to its metadata and returns the `.bin` path.
pub fn tensor_dump(tensor: &Tensor, name: &str, dir: impl AsRef<Path>) -> Result<PathBuf> {
    let dir = dir.as_ref();
    fs::create_dir_all(dir)?;
    let bin_path = dir.join(format!("{name}.bin"));
    let meta_path = dir.join(format!("{name}.meta"));

    let bytes = tensor_bytes(&tensor.to_device(&Device::Cpu)?)?;
    fs::write(&bin_path, bytes)?;

    let meta = DumpMeta {
        dtype: tensor.dtype().as_str().to_owned(),
        shape: tensor.dims().to_vec(),
    };
    let json = serde_json::to_string_pretty(&meta)
        .map_err(|err| OpError::Config(format!("encoding dump metadata: {err}")))?;
    fs::write(&meta_path, json)?;
    log::info!("tensor_dump: {name} {:?} {:?} -> {}", meta.shape, tensor.dtype(), bin_path.display());
    Ok(bin_path)
}

/// Loads a dump written by [`tensor_dump`]. `path` may name either file of
/// the pair or the shared stem.
pub fn tensor_load(path: impl AsRef<Path>) -> Result<Tensor> {
    let path = path.as_ref();
    let bin_path = path.with_extension("bin");
    let meta_path = path.with_extension("meta");

    let meta_raw = fs::read_to_string(&meta_path)?;
    let meta: DumpMeta = serde_json::from_str(&meta_raw)
        .map_err(|err| OpError::Config(format!("{}: {err}", meta_path.display())))?;
    let dtype = DType::from_str(&meta.dtype)
        .map_err(|_| OpError::dtype(format!("unknown dump dtype '{}'", meta.dtype)))?;

    let bytes = fs::read(&bin_path)?;
    let expected = meta.shape.iter().product::<usize>() * dtype.size_in_bytes();
    if bytes.len() != expected {
        return Err(OpError::shape(format!(
            "{}: expected {expected} bytes for {:?} {}, found {}",
            bin_path.display(),
            meta.shape,
            meta.dtype,
            bytes.len()
        )));
    }
    Ok(Tensor::from_raw_buffer(&bytes, dtype, &meta.shape, &Device::Cpu)?)
}

fn tensor_bytes(tensor: &Tensor) -> Result<Vec<u8>> {
    let flat = tensor.flatten_all()?;
    let bytes = match flat.dtype() {
        DType::U8 => flat.to_vec1::<u8>()?,
        DType::U32 => flat.to_vec1::<u32>()?.iter().flat_map(|v| v.to_le_bytes()).collect(),
        DType::I64 => flat.to_vec1::<i64>()?.iter().flat_map(|v| v.to_le_bytes()).collect(),
        DType::F16 => flat
            .to_vec1::<half::f16>()?
            .iter()
            .flat_map(|v| v.to_le_bytes())
            .collect(),
        DType::BF16 => flat
            .to_vec1::<half::bf16>()?
            .iter()
            .flat_map(|v| v.to_le_bytes())
            .collect(),
        DType::F32 => flat.to_vec1::<f32>()?.iter().flat_map(|v| v.to_le_bytes()).collect(),
        DType::F64 => flat.to_vec1::<f64>()?.iter().flat_map(|v| v.to_le_bytes()).collect(),
        #[allow(unreachable_patterns)]
        other => return Err(OpError::dtype(format!("cannot dump {other:?} tensors"))),
    };
    Ok(bytes)
}
