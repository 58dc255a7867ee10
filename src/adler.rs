//! Adler-style checksum kernels.
//!
//! Four 64-bit accumulators `(a1, b1)` and `(a2, b2)` are updated over the
//! low and high 32-bit halves of alternating 64-bit words: even word
//! indices feed stream 1, odd indices stream 2. This is deliberately
//! incompatible with standard Adler-32; it is a fast integrity check, not
//! an interchange format.
//!
//! The tagged variants implement address tagging: every word at an 8-word
//! aligned position holds its own virtual address instead of pattern data.
//! A tag miscompare indicates an address/decoder fault rather than a data
//! fault and is surfaced separately from checksum mismatches.

use core::fmt;

use crate::pattern::Pattern;

/// One checksum may cover at most this many bytes.
pub const MAX_CHECKSUM_BYTES: usize = 512 * 1024;

/// Spacing of tag-bearing words in tag mode (one per 64-byte cache line).
pub const TAG_INTERVAL: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AdlerChecksum {
    a1: u64,
    a2: u64,
    b1: u64,
    b2: u64,
}

impl AdlerChecksum {
    pub fn new(a1: u64, a2: u64, b1: u64, b2: u64) -> Self {
        Self { a1, a2, b1, b2 }
    }
}

impl fmt::Display for AdlerChecksum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let AdlerChecksum { a1, a2, b1, b2 } = self;
        write!(f, "0x{a1:016x} 0x{a2:016x} 0x{b1:016x} 0x{b2:016x}")
    }
}

/// A word whose tag did not equal its own address.
#[derive(Debug, Clone, Copy)]
pub struct TagFault {
    /// Index of the word within the checked slice.
    pub word_index: usize,
    /// The value actually read.
    pub actual: u64,
    /// The expected tag (the word's own virtual address).
    pub expected: u64,
}

#[inline(always)]
fn addr_to_tag(words: &[u64], i: usize) -> u64 {
    unsafe { words.as_ptr().add(i) as u64 }
}

/// Checksum of a plain (untagged) data region.
pub fn calculate_checksum(data: &[u64]) -> AdlerChecksum {
    assert!(data.len() * crate::WORD_SIZE <= MAX_CHECKSUM_BYTES);
    assert!(data.len() % 2 == 0);

    let (mut a1, mut a2, mut b1, mut b2) = (1u64, 1u64, 0u64, 0u64);
    let mut i = 0;
    while i < data.len() {
        let w = data[i];
        a1 = a1.wrapping_add(w & 0xffff_ffff);
        b1 = b1.wrapping_add(a1);
        a1 = a1.wrapping_add(w >> 32);
        b1 = b1.wrapping_add(a1);
        i += 1;

        let w = data[i];
        a2 = a2.wrapping_add(w & 0xffff_ffff);
        b2 = b2.wrapping_add(a2);
        a2 = a2.wrapping_add(w >> 32);
        b2 = b2.wrapping_add(a2);
        i += 1;
    }
    AdlerChecksum { a1, a2, b1, b2 }
}

/// Word-wise copy that updates the source-stream checksum on the fly.
pub fn adler_memcpy(dst: &mut [u64], src: &[u64]) -> AdlerChecksum {
    assert!(src.len() == dst.len());
    assert!(src.len() * crate::WORD_SIZE <= MAX_CHECKSUM_BYTES);
    assert!(src.len() % 2 == 0);

    let (mut a1, mut a2, mut b1, mut b2) = (1u64, 1u64, 0u64, 0u64);
    let mut i = 0;
    while i < src.len() {
        let w = src[i];
        a1 = a1.wrapping_add(w & 0xffff_ffff);
        b1 = b1.wrapping_add(a1);
        a1 = a1.wrapping_add(w >> 32);
        b1 = b1.wrapping_add(a1);
        dst[i] = w;
        i += 1;

        let w = src[i];
        a2 = a2.wrapping_add(w & 0xffff_ffff);
        b2 = b2.wrapping_add(a2);
        a2 = a2.wrapping_add(w >> 32);
        b2 = b2.wrapping_add(a2);
        dst[i] = w;
        i += 1;
    }
    AdlerChecksum { a1, a2, b1, b2 }
}

#[inline(always)]
fn accumulate_pattern(pattern: &Pattern, i: usize, a: &mut u64, b: &mut u64) {
    *a = a.wrapping_add(pattern.word(i << 1) as u64);
    *b = b.wrapping_add(*a);
    *a = a.wrapping_add(pattern.word((i << 1) + 1) as u64);
    *b = b.wrapping_add(*a);
}

/// Checksum of a tagged region.
///
/// Tag-bearing words are verified against their own address (faults are
/// pushed onto `faults`) and the *pattern's* words feed the checksum in
/// their place, so the result is comparable to the pattern's precomputed
/// checksum.
pub fn adler_addr_crc(src: &[u64], pattern: &Pattern, faults: &mut Vec<TagFault>) -> AdlerChecksum {
    assert!(src.len() * crate::WORD_SIZE <= MAX_CHECKSUM_BYTES);
    assert!(src.len() % 2 == 0);

    let (mut a1, mut a2, mut b1, mut b2) = (1u64, 1u64, 0u64, 0u64);
    let mut i = 0;
    while i < src.len() {
        if i % TAG_INTERVAL == 0 {
            let actual = src[i];
            let tag = addr_to_tag(src, i);
            if actual != tag {
                faults.push(TagFault {
                    word_index: i,
                    actual,
                    expected: tag,
                });
            }
            accumulate_pattern(pattern, i, &mut a1, &mut b1);
        } else {
            let w = src[i];
            a1 = a1.wrapping_add(w & 0xffff_ffff);
            b1 = b1.wrapping_add(a1);
            a1 = a1.wrapping_add(w >> 32);
            b1 = b1.wrapping_add(a1);
        }
        i += 1;

        let w = src[i];
        a2 = a2.wrapping_add(w & 0xffff_ffff);
        b2 = b2.wrapping_add(a2);
        a2 = a2.wrapping_add(w >> 32);
        b2 = b2.wrapping_add(a2);
        i += 1;
    }
    AdlerChecksum { a1, a2, b1, b2 }
}

/// Copy with tag verification on both sides.
///
/// Source and destination tags are checked against their own addresses,
/// then each destination tag word is rewritten to the *destination*
/// address so the tag invariant holds at the new location. Non-tag words
/// are copied verbatim while feeding the checksum.
pub fn adler_addr_memcpy(
    dst: &mut [u64],
    src: &[u64],
    pattern: &Pattern,
    src_faults: &mut Vec<TagFault>,
    dst_faults: &mut Vec<TagFault>,
) -> AdlerChecksum {
    assert!(src.len() == dst.len());
    assert!(src.len() * crate::WORD_SIZE <= MAX_CHECKSUM_BYTES);
    assert!(src.len() % 2 == 0);

    let (mut a1, mut a2, mut b1, mut b2) = (1u64, 1u64, 0u64, 0u64);
    let mut i = 0;
    while i < src.len() {
        if i % TAG_INTERVAL == 0 {
            let sv = src[i];
            let dv = dst[i];
            let src_tag = addr_to_tag(src, i);
            let dst_tag = addr_to_tag(dst, i);
            if sv != src_tag {
                src_faults.push(TagFault {
                    word_index: i,
                    actual: sv,
                    expected: src_tag,
                });
            }
            if dv != dst_tag {
                dst_faults.push(TagFault {
                    word_index: i,
                    actual: dv,
                    expected: dst_tag,
                });
            }
            accumulate_pattern(pattern, i, &mut a1, &mut b1);
            dst[i] = dst_tag;
        } else {
            let w = src[i];
            a1 = a1.wrapping_add(w & 0xffff_ffff);
            b1 = b1.wrapping_add(a1);
            a1 = a1.wrapping_add(w >> 32);
            b1 = b1.wrapping_add(a1);
            dst[i] = w;
        }
        i += 1;

        let w = src[i];
        a2 = a2.wrapping_add(w & 0xffff_ffff);
        b2 = b2.wrapping_add(a2);
        a2 = a2.wrapping_add(w >> 32);
        b2 = b2.wrapping_add(a2);
        dst[i] = w;
        i += 1;
    }
    AdlerChecksum { a1, a2, b1, b2 }
}

/// Stamp the tag words of a region with their own addresses.
pub fn tag_words(words: &mut [u64]) {
    let mut i = 0;
    while i < words.len() {
        words[i] = addr_to_tag(words, i);
        i += TAG_INTERVAL;
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::pattern::PatternList;

    fn filled(pattern: &Pattern, words: usize) -> Vec<u64> {
        (0..words)
            .map(|i| pattern.word(2 * i) as u64 | (pattern.word(2 * i + 1) as u64) << 32)
            .collect()
    }

    #[test]
    fn checksum_is_deterministic() {
        let data: Vec<u64> = (0..512u64).map(|i| i.wrapping_mul(0x9e3779b9)).collect();
        assert_eq!(calculate_checksum(&data), calculate_checksum(&data));
    }

    #[test]
    fn single_byte_flip_changes_checksum() {
        let patterns = PatternList::new();
        for p in patterns.iter() {
            let mut data = filled(p, 512);
            let reference = calculate_checksum(&data);
            for byte in [0usize, 7, 2048, 4095] {
                let word = byte / 8;
                let shift = (byte % 8) * 8;
                data[word] ^= 0x01 << shift;
                assert_ne!(calculate_checksum(&data), reference, "pattern {}", p.name());
                data[word] ^= 0x01 << shift;
            }
            assert_eq!(calculate_checksum(&data), reference);
        }
    }

    #[test]
    fn memcpy_copies_and_matches_plain_checksum() {
        let data: Vec<u64> = (0..512u64).map(|i| i ^ 0x5555_aaaa_5555_aaaa).collect();
        let mut dst = vec![0u64; 512];
        let crc = adler_memcpy(&mut dst, &data);
        assert_eq!(dst, data);
        assert_eq!(crc, calculate_checksum(&data));
    }

    #[test]
    fn tagged_crc_matches_pattern_checksum() {
        let patterns = PatternList::new();
        let p = patterns.get(2);
        let plain = filled(p, 512);
        let reference = calculate_checksum(&plain);

        let mut tagged = plain.clone();
        tag_words(&mut tagged);
        let mut faults = Vec::new();
        let crc = adler_addr_crc(&tagged, p, &mut faults);
        assert!(faults.is_empty());
        assert_eq!(crc, reference);
    }

    #[test]
    fn corrupted_tag_is_reported() {
        let patterns = PatternList::new();
        let p = patterns.get(0);
        let mut tagged = filled(p, 512);
        tag_words(&mut tagged);
        tagged[TAG_INTERVAL] ^= 1 << 40;

        let mut faults = Vec::new();
        adler_addr_crc(&tagged, p, &mut faults);
        assert_eq!(faults.len(), 1);
        assert_eq!(faults[0].word_index, TAG_INTERVAL);
        assert_eq!(faults[0].actual ^ (1 << 40), faults[0].expected);
    }

    #[test]
    fn tagged_memcpy_retargets_tags() {
        let patterns = PatternList::new();
        let p = patterns.get(1);
        let mut src = filled(p, 512);
        tag_words(&mut src);
        let mut dst = vec![0u64; 512];
        tag_words(&mut dst);

        let mut sf = Vec::new();
        let mut df = Vec::new();
        let crc = adler_addr_memcpy(&mut dst, &src, p, &mut sf, &mut df);
        assert!(sf.is_empty() && df.is_empty());
        assert_eq!(crc, calculate_checksum(&filled(p, 512)));

        // Destination tags must now point at the destination.
        let mut check = Vec::new();
        adler_addr_crc(&dst, p, &mut check);
        assert!(check.is_empty());
    }
}
