//! Host views of cache tensors as `f32`.

use candle_core::{DType, Tensor};
use opkit_core::{fp8, host::read_f32, Result};

use crate::core::KvCacheDtype;

/// Reads a whole cache as `f32`, dequantizing FP8 bytes with `scale`.
pub fn read_cache(cache: &Tensor, name: &str, kv_cache_dtype: KvCacheDtype, scale: f32) -> Result<Vec<f32>> {
    kv_cache_dtype.check_cache(cache.dtype(), name)?;
    match kv_cache_dtype {
        KvCacheDtype::Auto => read_f32(cache),
        KvCacheDtype::Fp8E4m3 => {
            let bytes = cache.flatten_all()?.to_vec1::<u8>()?;
            Ok(fp8::decode_scaled(&bytes, scale))
        }
    }
}

/// Storage dtype of a cache given the dtype of the tensors written into it.
pub fn cache_storage_dtype(kv_cache_dtype: KvCacheDtype, compute: DType) -> DType {
    match kv_cache_dtype {
        KvCacheDtype::Auto => compute,
        KvCacheDtype::Fp8E4m3 => DType::U8,
    }
}
