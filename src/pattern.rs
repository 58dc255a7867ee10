//! The data pattern catalog.
//!
//! Each pattern is a named, deterministic sequence of 32-bit words with a
//! power-of-two period dividing one checksum block, plus the precomputed
//! Adler-style checksum of one block filled with it. The catalog is
//! immutable after construction; workers reference patterns by index.

use crate::adler::{self, AdlerChecksum};
use crate::util::WyRand;
use crate::{BLOCK_SIZE, WORD_SIZE};

pub struct Pattern {
    name: &'static str,
    data: Vec<u32>,
    crc: AdlerChecksum,
}

impl Pattern {
    fn new(name: &'static str, data: Vec<u32>) -> Self {
        assert!(data.len().is_power_of_two());
        assert!(data.len() <= BLOCK_SIZE / 4);

        let mut block = vec![0u64; BLOCK_SIZE / WORD_SIZE];
        for (i, w) in block.iter_mut().enumerate() {
            let lo = data[(2 * i) & (data.len() - 1)] as u64;
            let hi = data[(2 * i + 1) & (data.len() - 1)] as u64;
            *w = lo | hi << 32;
        }
        let crc = adler::calculate_checksum(&block);
        Self { name, data, crc }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// The `i`-th 32-bit word of the (repeating) sequence.
    #[inline(always)]
    pub fn word(&self, i: usize) -> u32 {
        self.data[i & (self.data.len() - 1)]
    }

    /// The `i`-th 64-bit word a filled region holds at word index `i`.
    #[inline(always)]
    pub fn word64(&self, i: usize) -> u64 {
        self.word(2 * i) as u64 | (self.word(2 * i + 1) as u64) << 32
    }

    /// Precomputed checksum of one block filled with this pattern.
    pub fn crc(&self) -> &AdlerChecksum {
        &self.crc
    }
}

pub struct PatternList {
    patterns: Vec<Pattern>,
}

impl Default for PatternList {
    fn default() -> Self {
        Self::new()
    }
}

impl PatternList {
    pub fn new() -> Self {
        let mut patterns = Vec::new();

        patterns.push(Pattern::new("just_zero", vec![0x0000_0000]));
        patterns.push(Pattern::new("just_one", vec![0xffff_ffff]));
        patterns.push(Pattern::new("just_five", vec![0x5555_5555]));
        patterns.push(Pattern::new("just_a", vec![0xaaaa_aaaa]));
        patterns.push(Pattern::new("five_a", vec![0x5555_5555, 0xaaaa_aaaa]));
        patterns.push(Pattern::new("zero_one", vec![0x0000_0000, 0xffff_ffff]));
        patterns.push(Pattern::new("five_a8", vec![0x5a5a_5a5a, 0xa5a5_a5a5]));
        patterns.push(Pattern::new("one_zero8", vec![0xff00_ff00, 0x00ff_00ff]));
        patterns.push(Pattern::new("checker8", vec![0x0f0f_0f0f, 0xf0f0_f0f0]));
        patterns.push(Pattern::new("word_stripe", vec![0x0000_ffff, 0xffff_0000]));
        patterns.push(Pattern::new("walking_ones", walking(false)));
        patterns.push(Pattern::new("walking_zeros", walking(true)));
        patterns.push(Pattern::new("long_mix", long_mix()));

        Self { patterns }
    }

    pub fn size(&self) -> usize {
        self.patterns.len()
    }

    pub fn get(&self, index: usize) -> &Pattern {
        &self.patterns[index]
    }

    pub fn iter(&self) -> impl Iterator<Item = &Pattern> {
        self.patterns.iter()
    }

    /// Uniform-random pattern index.
    pub fn random_index(&self, rng: &mut WyRand) -> usize {
        rng.range(0..self.patterns.len() as u64) as usize
    }

    pub fn find(&self, name: &str) -> Option<usize> {
        self.patterns.iter().position(|p| p.name == name)
    }
}

/// A single bit walking up then back down, optionally inverted.
fn walking(invert: bool) -> Vec<u32> {
    let mut v = Vec::with_capacity(64);
    for bit in 0..32 {
        v.push(1u32 << bit);
    }
    for bit in (0..32).rev() {
        v.push(1u32 << bit);
    }
    if invert {
        for w in &mut v {
            *w = !*w;
        }
    }
    v
}

/// A fixed pseudorandom sequence spanning a full checksum block.
fn long_mix() -> Vec<u32> {
    let mut rng = WyRand::new(0xbeef);
    (0..BLOCK_SIZE / 4).map(|_| rng.gen() as u32).collect()
}

#[cfg(test)]
mod test {
    use super::PatternList;
    use crate::adler;
    use crate::{BLOCK_SIZE, WORD_SIZE};

    #[test]
    fn filled_block_matches_precomputed_checksum() {
        let patterns = PatternList::new();
        for p in patterns.iter() {
            let block: Vec<u64> = (0..BLOCK_SIZE / WORD_SIZE).map(|i| p.word64(i)).collect();
            assert_eq!(&adler::calculate_checksum(&block), p.crc(), "{}", p.name());
        }
    }

    #[test]
    fn periods_divide_a_block() {
        let patterns = PatternList::new();
        for p in patterns.iter() {
            // word(i) must repeat with the block, so per-block checksums of
            // a filled page all equal the precomputed one.
            for i in 0..64 {
                assert_eq!(p.word(i), p.word(i + BLOCK_SIZE / 4), "{}", p.name());
            }
        }
    }

    #[test]
    fn names_are_unique_and_findable() {
        let patterns = PatternList::new();
        for (i, p) in patterns.iter().enumerate() {
            assert_eq!(patterns.find(p.name()), Some(i));
        }
    }

    #[test]
    fn random_index_in_range() {
        let patterns = PatternList::new();
        let mut rng = crate::util::WyRand::new(7);
        for _ in 0..100 {
            assert!(patterns.random_index(&mut rng) < patterns.size());
        }
    }
}
