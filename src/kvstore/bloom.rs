//! Probabilistic membership filters used to prune KV reads.
//!
//! `BloomFilter` is a plain k-hash filter; `DeletableBloomFilter` adds a
//! coarse collision-region bitmap so elements whose bits saw no collision
//! can be removed again. Neither ever reports a stored element as absent.

use xxhash_rust::xxh3::xxh3_64_with_seed;

const SEED_A: u64 = 0x9E37_79B9_7F4A_7C15;
const SEED_B: u64 = 0xC2B2_AE3D_27D4_EB4F;

fn optimal_m(n: usize, fp_rate: f64) -> u64 {
    let ln2 = std::f64::consts::LN_2;
    let m = -(n as f64) * fp_rate.ln() / (ln2 * ln2);
    (m.ceil() as u64).max(64)
}

fn optimal_k(n: usize, m: u64) -> u32 {
    let k = (m as f64 / n as f64) * std::f64::consts::LN_2;
    (k.round() as u32).max(1)
}

#[derive(Debug)]
struct BitSet {
    words: Vec<u64>,
    len: u64,
}

impl BitSet {
    fn new(len: u64) -> BitSet {
        BitSet {
            words: vec![0u64; len.div_ceil(64) as usize],
            len,
        }
    }

    #[inline]
    fn set(&mut self, i: u64) -> bool {
        let was = self.get(i);
        self.words[(i / 64) as usize] |= 1 << (i % 64);
        was
    }

    #[inline]
    fn clear(&mut self, i: u64) {
        self.words[(i / 64) as usize] &= !(1 << (i % 64));
    }

    #[inline]
    fn get(&self, i: u64) -> bool {
        self.words[(i / 64) as usize] & (1 << (i % 64)) != 0
    }
}

fn bit_indices(data: &[u8], k: u32, m: u64) -> impl Iterator<Item = u64> {
    let h1 = xxh3_64_with_seed(data, SEED_A);
    let h2 = xxh3_64_with_seed(data, SEED_B) | 1;
    (0..k as u64).map(move |i| h1.wrapping_add(i.wrapping_mul(h2)) % m)
}

/// A fixed-size bloom filter for roughly `n` elements at the given false
/// positive rate.
#[derive(Debug)]
pub struct BloomFilter {
    bits: BitSet,
    k: u32,
}

impl BloomFilter {
    pub fn new(n: usize, fp_rate: f64) -> BloomFilter {
        let m = optimal_m(n, fp_rate);
        BloomFilter {
            bits: BitSet::new(m),
            k: optimal_k(n, m),
        }
    }

    pub fn add(&mut self, data: &[u8]) {
        for i in bit_indices(data, self.k, self.bits.len) {
            self.bits.set(i);
        }
    }

    /// "Possibly present" / "definitely absent".
    pub fn test(&self, data: &[u8]) -> bool {
        bit_indices(data, self.k, self.bits.len).all(|i| self.bits.get(i))
    }
}

/// A bloom filter supporting best-effort removal.
///
/// The bit array is split into `r` regions; a region is marked collided
/// once two insertions set the same bit in it. Removal clears only bits
/// in collision-free regions, so false negatives can never be introduced
/// (a remove may simply fail to take full effect).
#[derive(Debug)]
pub struct DeletableBloomFilter {
    bits: BitSet,
    collisions: BitSet,
    regions: u64,
    k: u32,
}

impl DeletableBloomFilter {
    pub fn new(n: usize, regions: u64, fp_rate: f64) -> DeletableBloomFilter {
        let m = optimal_m(n, fp_rate);
        let regions = regions.max(1);
        DeletableBloomFilter {
            bits: BitSet::new(m),
            collisions: BitSet::new(regions),
            regions,
            k: optimal_k(n, m),
        }
    }

    #[inline]
    fn region(&self, i: u64) -> u64 {
        // m does not necessarily divide evenly; scale instead
        (i as u128 * self.regions as u128 / self.bits.len as u128) as u64
    }

    pub fn add(&mut self, data: &[u8]) {
        for i in bit_indices(data, self.k, self.bits.len) {
            if self.bits.set(i) {
                let region = self.region(i);
                self.collisions.set(region);
            }
        }
    }

    pub fn test(&self, data: &[u8]) -> bool {
        bit_indices(data, self.k, self.bits.len).all(|i| self.bits.get(i))
    }

    /// Removes the element if present, clearing only bits whose region is
    /// collision-free. Returns whether the element tested present.
    pub fn test_and_remove(&mut self, data: &[u8]) -> bool {
        if !self.test(data) {
            return false;
        }
        let indices: Vec<u64> = bit_indices(data, self.k, self.bits.len).collect();
        for i in indices {
            let region = self.region(i);
            if !self.collisions.get(region) {
                self.bits.clear(i);
            }
        }
        true
    }
}
