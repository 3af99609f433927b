//! Key routing: MurmurHash3 (x64, 128-bit) feeding Lamping & Veach's jump
//! consistent hash.
//!
//! Every node must compute the same bucket index for the same key and the
//! same bucket count, so both functions are pure and platform independent
//! (little-endian block reads, wrapping 64-bit arithmetic).

use crate::{Result, StorageError};

const C1: u64 = 0x87c3_7b91_1142_53d5;
const C2: u64 = 0x4cf5_ad43_2745_937f;
const JUMP_MULTIPLIER: u64 = 2_862_933_555_777_941_757;

/// Maps `key` to a bucket in `[0, num_buckets)`.
pub fn bucket_index(key: &str, num_buckets: i64) -> Result<usize> {
    let hash = murmur3_x64_64(key.as_bytes(), 0);
    jump_consistent_hash(hash, num_buckets)
}

/// Jump consistent hash. Fails when `num_buckets <= 0`.
pub fn jump_consistent_hash(mut key: u64, num_buckets: i64) -> Result<usize> {
    if num_buckets <= 0 {
        return Err(StorageError::Routing(format!(
            "number of buckets must be greater than 0, got {}",
            num_buckets
        )));
    }

    let mut b: i64 = -1;
    let mut j: i64 = 0;
    while j < num_buckets {
        b = j;
        key = key.wrapping_mul(JUMP_MULTIPLIER).wrapping_add(1);
        j = ((b + 1) as f64 * ((1u64 << 31) as f64 / ((key >> 33) + 1) as f64)) as i64;
    }

    Ok(b as usize)
}

/// Lower 64 bits of MurmurHash3 x64_128.
pub fn murmur3_x64_64(data: &[u8], seed: u32) -> u64 {
    let len = data.len();
    let nblocks = len / 16;

    let mut h1 = seed as u64;
    let mut h2 = seed as u64;

    for block in data[..nblocks * 16].chunks_exact(16) {
        let mut k1 = read_u64_le(&block[..8]);
        let mut k2 = read_u64_le(&block[8..]);

        k1 = k1.wrapping_mul(C1).rotate_left(31).wrapping_mul(C2);
        h1 ^= k1;
        h1 = h1
            .rotate_left(27)
            .wrapping_add(h2)
            .wrapping_mul(5)
            .wrapping_add(0x52dc_e729);

        k2 = k2.wrapping_mul(C2).rotate_left(33).wrapping_mul(C1);
        h2 ^= k2;
        h2 = h2
            .rotate_left(31)
            .wrapping_add(h1)
            .wrapping_mul(5)
            .wrapping_add(0x3849_5ab5);
    }

    let tail = &data[nblocks * 16..];
    let mut k1: u64 = 0;
    let mut k2: u64 = 0;

    if tail.len() > 8 {
        for (i, byte) in tail[8..].iter().enumerate() {
            k2 ^= (*byte as u64) << (8 * i);
        }
        k2 = k2.wrapping_mul(C2).rotate_left(33).wrapping_mul(C1);
        h2 ^= k2;
    }
    if !tail.is_empty() {
        for (i, byte) in tail[..tail.len().min(8)].iter().enumerate() {
            k1 ^= (*byte as u64) << (8 * i);
        }
        k1 = k1.wrapping_mul(C1).rotate_left(31).wrapping_mul(C2);
        h1 ^= k1;
    }

    h1 ^= len as u64;
    h2 ^= len as u64;

    h1 = h1.wrapping_add(h2);
    h2 = h2.wrapping_add(h1);

    h1 = fmix64(h1);
    h2 = fmix64(h2);

    h1.wrapping_add(h2)
}

fn fmix64(mut k: u64) -> u64 {
    k ^= k >> 33;
    k = k.wrapping_mul(0xff51_afd7_ed55_8ccd);
    k ^= k >> 33;
    k = k.wrapping_mul(0xc4ce_b9fe_1a85_ec53);
    k ^= k >> 33;
    k
}

fn read_u64_le(bytes: &[u8]) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(bytes);
    u64::from_le_bytes(buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn rejects_non_positive_bucket_counts() {
        assert!(bucket_index("key", 0).is_err());
        assert!(bucket_index("key", -3).is_err());
        assert!(jump_consistent_hash(42, 0).is_err());
    }

    #[test]
    fn single_bucket_always_zero() {
        for key in ["", "a", "hello world", "0123456789abcdef0123"] {
            assert_eq!(bucket_index(key, 1).unwrap(), 0);
        }
    }

    #[test]
    fn zero_hash_lands_in_first_bucket() {
        for n in [1, 2, 10, 1000] {
            assert_eq!(jump_consistent_hash(0, n).unwrap(), 0);
        }
    }

    #[test]
    fn empty_input_hashes_to_zero() {
        assert_eq!(murmur3_x64_64(b"", 0), 0);
    }

    #[test]
    fn tail_bytes_affect_the_hash() {
        // 16-byte block plus every tail length
        let data = b"abcdefghijklmnopqrstuvwxyz0123456789";
        let mut seen = std::collections::HashSet::new();
        for len in 0..=data.len() {
            seen.insert(murmur3_x64_64(&data[..len], 0));
        }
        assert_eq!(seen.len(), data.len() + 1);
    }

    #[test]
    fn spreads_keys_across_buckets() {
        let mut counts = [0usize; 8];
        for i in 0..8000 {
            let idx = bucket_index(&format!("key-{}", i), 8).unwrap();
            counts[idx] += 1;
        }
        for count in counts {
            assert!(count > 700 && count < 1300, "unbalanced bucket: {}", count);
        }
    }

    #[test]
    fn growth_moves_roughly_one_in_n_plus_one() {
        let n = 10;
        let total = 10_000;
        let moved = (0..total)
            .filter(|i| {
                let key = format!("user:{}", i);
                bucket_index(&key, n).unwrap() != bucket_index(&key, n + 1).unwrap()
            })
            .count();
        // expected ~ total / (n + 1) = 909
        assert!(moved > 700 && moved < 1100, "moved {}", moved);
    }

    proptest! {
        #[test]
        fn index_is_deterministic_and_in_range(key in ".*", n in 1i64..5000) {
            let first = bucket_index(&key, n).unwrap();
            let second = bucket_index(&key, n).unwrap();
            prop_assert_eq!(first, second);
            prop_assert!((first as i64) < n);
        }

        #[test]
        fn growth_only_moves_keys_to_the_new_bucket(key in ".*", n in 1i64..2000) {
            let before = bucket_index(&key, n).unwrap();
            let after = bucket_index(&key, n + 1).unwrap();
            prop_assert!(after == before || after as i64 == n);
        }
    }
}
