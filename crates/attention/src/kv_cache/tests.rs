use super::{reshape_and_cache, BlockAllocator, BlockTable, CacheLayout};
use crate::core::KvCacheDtype;
use candle_core::{DType, Device, Tensor};
use opkit_core::host::read_f32;
use proptest::prelude::*;
use static_assertions::assert_impl_all;

assert_impl_all!(BlockAllocator: Send, Sync, Clone);
assert_impl_all!(CacheLayout: Send, Sync, Copy);
assert_impl_all!(BlockTable: Send, Sync);

/// Reads token `slot` of one head back out of both caches.
fn gather(layout: &CacheLayout, keys: &[f32], values: &[f32], slot: usize, head: usize) -> (Vec<f32>, Vec<f32>) {
    let (block, offset) = layout.split_slot(slot);
    let k = (0..layout.head_size)
        .map(|d| keys[layout.key_index(block, head, offset, d)])
        .collect();
    let v = (0..layout.head_size)
        .map(|d| values[layout.value_index(block, head, offset, d)])
        .collect();
    (k, v)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn scattered_tokens_read_back(
        block_size in 1usize..5,
        num_kv_heads in 1usize..3,
        tokens in 1usize..10,
        seed in any::<u64>(),
    ) {
        let device = Device::Cpu;
        let head_size = 8;
        let layout = CacheLayout::new(tokens.div_ceil(block_size) + 1, num_kv_heads, head_size, block_size, 4).unwrap();
        let (kc, vc) = layout.allocate(DType::F32, &device).unwrap();

        // distinct slots from a seeded rotation of the slot range
        let slots: Vec<i64> = (0..tokens)
            .map(|t| ((t as u64 + seed) % layout.num_slots() as u64) as i64)
            .collect();
        let len = tokens * num_kv_heads * head_size;
        let key = Tensor::from_vec((0..len).map(|i| i as f32).collect::<Vec<_>>(), (tokens, num_kv_heads, head_size), &device).unwrap();
        let value = key.neg().unwrap();
        let slot_mapping = Tensor::from_vec(slots.clone(), tokens, &device).unwrap();
        reshape_and_cache(&key, &value, &kc, &vc, &slot_mapping, KvCacheDtype::Auto, 1.0, 1.0).unwrap();

        let (keys, values) = (read_f32(&kc).unwrap(), read_f32(&vc).unwrap());
        for (t, &slot) in slots.iter().enumerate() {
            for head in 0..num_kv_heads {
                let (k, v) = gather(&layout, &keys, &values, slot as usize, head);
                let base = (t * num_kv_heads + head) * head_size;
                let expected: Vec<f32> = (base..base + head_size).map(|i| i as f32).collect();
                prop_assert_eq!(&k, &expected);
                prop_assert_eq!(v, expected.iter().map(|x| -x).collect::<Vec<_>>());
            }
        }
    }
}

#[test]
fn block_tables_drive_the_writer() {
    let device = Device::Cpu;
    let layout = CacheLayout::for_dtype(6, 1, 4, 2, DType::F32).unwrap();
    let (kc, vc) = layout.allocate(DType::BF16, &device).unwrap();
    let alloc = BlockAllocator::for_layout(&layout).unwrap();

    let mut first = BlockTable::new(2);
    let mut second = BlockTable::new(2);
    let s1 = first.append_tokens(3, &alloc).unwrap();
    let s2 = second.append_tokens(2, &alloc).unwrap();
    let slots: Vec<i64> = s1.iter().chain(&s2).copied().collect();
    assert_eq!(slots, vec![0, 1, 2, 4, 5]);

    let key = Tensor::ones((5, 1, 4), DType::BF16, &device).unwrap();
    let slot_mapping = Tensor::from_vec(slots, 5, &device).unwrap();
    reshape_and_cache(&key, &key, &kc, &vc, &slot_mapping, KvCacheDtype::Auto, 1.0, 1.0).unwrap();
    let written = read_f32(&kc).unwrap().iter().filter(|&&v| v == 1.0).count();
    assert_eq!(written, 5 * 4);
    assert_eq!(alloc.stats().allocated_blocks, 3);
}
