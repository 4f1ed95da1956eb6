//! Scatters freshly projected keys and values into block caches.

use candle_core::{backend::BackendStorage, CpuStorage, InplaceOp1, Layout, Tensor};
use opkit_core::{
    checks::{expect_index_dtype, expect_rank, expect_same_device},
    dtype::ensure_float,
    fp8::f32_to_e4m3,
    host::{contiguous_range, read_f32, read_indices, with_f32_slice_mut},
    testing::log_call,
    OpError, Result,
};

use crate::core::KvCacheDtype;
use crate::kv_cache::CacheLayout;

#[derive(Clone, Copy)]
enum Target {
    Key,
    Value,
}

struct CacheWrite<'a> {
    target: Target,
    layout: CacheLayout,
    /// `[num_tokens, num_kv_heads, head_size]` source values.
    source: &'a [f32],
    /// `(token, slot)` pairs with negative slots already dropped.
    slots: &'a [(usize, usize)],
    /// Present for FP8 caches.
    fp8_scale: Option<f32>,
}

impl CacheWrite<'_> {
    fn op_name(&self) -> &'static str {
        match self.target {
            Target::Key => "reshape_and_cache.key",
            Target::Value => "reshape_and_cache.value",
        }
    }

    fn scatter<T>(&self, dst: &mut [T], encode: impl Fn(f32) -> T) {
        let CacheLayout {
            num_kv_heads,
            head_size,
            ..
        } = self.layout;
        for &(token, slot) in self.slots {
            let (block, offset) = self.layout.split_slot(slot);
            for head in 0..num_kv_heads {
                let src = &self.source[(token * num_kv_heads + head) * head_size..][..head_size];
                for (dim, &v) in src.iter().enumerate() {
                    let idx = match self.target {
                        Target::Key => self.layout.key_index(block, head, offset, dim),
                        Target::Value => self.layout.value_index(block, head, offset, dim),
                    };
                    dst[idx] = encode(v);
                }
            }
        }
    }
}

impl InplaceOp1 for CacheWrite<'_> {
    fn name(&self) -> &'static str {
        self.op_name()
    }

    fn cpu_fwd(&self, storage: &mut CpuStorage, layout: &Layout) -> candle_core::Result<()> {
        match (self.fp8_scale, storage) {
            (Some(scale), CpuStorage::U8(bytes)) => {
                let (start, end) = contiguous_range(layout, self.op_name())?;
                let inv = 1.0 / scale;
                self.scatter(&mut bytes[start..end], |v| f32_to_e4m3(v * inv));
                Ok(())
            }
            (Some(_), other) => Err(candle_core::Error::Msg(format!(
                "{}: fp8 cache must be u8, got {:?}",
                self.op_name(),
                other.dtype()
            ))),
            (None, storage) => with_f32_slice_mut(storage, layout, self.op_name(), |values| {
                self.scatter(values, |v| v);
                Ok(())
            }),
        }
    }
}

fn check_cache_target(cache: &Tensor, name: &'static str) -> Result<()> {
    if !cache.device().is_cpu() {
        return Err(OpError::UnsupportedDevice {
            op: "reshape_and_cache",
        });
    }
    if !cache.is_contiguous() {
        return Err(OpError::argument(name, "cache must be contiguous"));
    }
    Ok(())
}

/// Writes `key`/`value` (`[num_tokens, num_kv_heads, head_size]`) into the
/// caches at the flat `slot_mapping[t]` slots; negative slots are skipped.
///
/// FP8 caches store `value / k_scale` (resp. `v_scale`) as E4M3 bytes.
#[allow(clippy::too_many_arguments)]
pub fn reshape_and_cache(
    key: &Tensor,
    value: &Tensor,
    key_cache: &Tensor,
    value_cache: &Tensor,
    slot_mapping: &Tensor,
    kv_cache_dtype: KvCacheDtype,
    k_scale: f32,
    v_scale: f32,
) -> Result<()> {
    log_call(
        "reshape_and_cache",
        &[
            ("key", key),
            ("value", value),
            ("key_cache", key_cache),
            ("slot_mapping", slot_mapping),
        ],
    );
    expect_same_device(&[(key, "key"), (value, "value"), (key_cache, "key_cache"), (value_cache, "value_cache")])?;
    let layout = CacheLayout::from_caches(key_cache, value_cache)?;
    let kd = expect_rank(key, 3, "key")?;
    if kd[1] != layout.num_kv_heads || kd[2] != layout.head_size {
        return Err(OpError::shape(format!(
            "key {kd:?} must be [num_tokens, {}, {}]",
            layout.num_kv_heads, layout.head_size
        )));
    }
    if value.dims() != kd {
        return Err(OpError::shape(format!(
            "value {:?} must match key {kd:?}",
            value.dims()
        )));
    }
    ensure_float(key.dtype(), "key")?;
    ensure_float(value.dtype(), "value")?;
    kv_cache_dtype.check_cache(key_cache.dtype(), "key_cache")?;
    kv_cache_dtype.check_cache(value_cache.dtype(), "value_cache")?;
    if kv_cache_dtype.is_fp8() && !(k_scale > 0.0 && v_scale > 0.0) {
        return Err(OpError::argument("k_scale", "fp8 caches need positive k/v scales"));
    }
    check_cache_target(key_cache, "key_cache")?;
    check_cache_target(value_cache, "value_cache")?;

    expect_index_dtype(slot_mapping, "slot_mapping")?;
    let raw = read_indices(slot_mapping, "slot_mapping")?;
    if raw.len() != kd[0] {
        return Err(OpError::shape(format!(
            "slot_mapping has {} entries for {} tokens",
            raw.len(),
            kd[0]
        )));
    }
    let mut slots = Vec::with_capacity(raw.len());
    for (token, slot) in raw.into_iter().enumerate() {
        if slot < 0 {
            continue;
        }
        let slot = slot as usize;
        if slot >= layout.num_slots() {
            return Err(OpError::argument(
                "slot_mapping",
                format!("slot {slot} outside the {} cache slots", layout.num_slots()),
            ));
        }
        slots.push((token, slot));
    }
    if slots.is_empty() {
        return Ok(());
    }

    let keys = read_f32(key)?;
    let values = read_f32(value)?;
    let fp8 = kv_cache_dtype.is_fp8();
    key_cache.inplace_op1(&CacheWrite {
        target: Target::Key,
        layout,
        source: &keys,
        slots: &slots,
        fp8_scale: fp8.then_some(k_scale),
    })?;
    value_cache.inplace_op1(&CacheWrite {
        target: Target::Value,
        layout,
        source: &values,
        slots: &slots,
        fp8_scale: fp8.then_some(v_scale),
    })?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv_cache::read_cache;
    use candle_core::{DType, Device};

    #[test]
    fn writes_land_at_their_slots() -> Result<()> {
        let device = Device::Cpu;
        let layout = CacheLayout::new(2, 1, 4, 2, 2)?;
        let (kc, vc) = layout.allocate(DType::F32, &device)?;
        let key = Tensor::from_vec(vec![1f32, 2., 3., 4., 5., 6., 7., 8.], (2, 1, 4), &device)?;
        let value = (&key * 10.0)?;
        let slots = Tensor::from_vec(vec![3i64, -1], 2, &device)?;
        reshape_and_cache(&key, &value, &kc, &vc, &slots, KvCacheDtype::Auto, 1.0, 1.0)?;

        let keys = read_f32(&kc)?;
        let values = read_f32(&vc)?;
        for dim in 0..4 {
            assert_eq!(keys[layout.key_index(1, 0, 1, dim)], (dim + 1) as f32);
            assert_eq!(values[layout.value_index(1, 0, 1, dim)], 10.0 * (dim + 1) as f32);
        }
        // token 1 had a negative slot
        assert_eq!(keys.iter().filter(|&&v| v != 0.0).count(), 4);
        Ok(())
    }

    #[test]
    fn fp8_caches_store_scaled_bytes() -> Result<()> {
        let device = Device::Cpu;
        let layout = CacheLayout::new(1, 1, 16, 1, 16)?;
        let (kc, vc) = layout.allocate(DType::U8, &device)?;
        let key = Tensor::from_vec((0..16).map(|i| i as f32 * 0.5).collect::<Vec<_>>(), (1, 1, 16), &device)?;
        let slots = Tensor::from_vec(vec![0u32], 1, &device)?;
        reshape_and_cache(&key, &key, &kc, &vc, &slots, KvCacheDtype::Fp8E4m3, 0.5, 2.0)?;
        let keys = read_cache(&kc, "key_cache", KvCacheDtype::Fp8E4m3, 0.5)?;
        assert_eq!(keys, read_f32(&key)?);
        let values = read_cache(&vc, "value_cache", KvCacheDtype::Fp8E4m3, 2.0)?;
        assert!((values[2] - 1.0).abs() < 1e-6);
        Ok(())
    }

    #[test]
    fn rejects_bad_slots_and_dtypes() -> Result<()> {
        let device = Device::Cpu;
        let layout = CacheLayout::new(1, 1, 4, 2, 2)?;
        let (kc, vc) = layout.allocate(DType::F32, &device)?;
        let key = Tensor::zeros((1, 1, 4), DType::F32, &device)?;
        let slots = Tensor::from_vec(vec![2i64], 1, &device)?;
        assert!(matches!(
            reshape_and_cache(&key, &key, &kc, &vc, &slots, KvCacheDtype::Auto, 1.0, 1.0),
            Err(OpError::InvalidArgument { arg: "slot_mapping", .. })
        ));
        let slots = Tensor::from_vec(vec![0i64], 1, &device)?;
        assert!(matches!(
            reshape_and_cache(&key, &key, &kc, &vc, &slots, KvCacheDtype::Fp8E4m3, 1.0, 1.0),
            Err(OpError::UnsupportedDType { .. })
        ));
        Ok(())
    }
}
