//! Fingerprint derivation — the single seam between user keys and the
//! index.
//!
//! The store never hashes keys anywhere else: the engine computes one
//! 64-bit seeded fingerprint per key and every layer below works on that.
//! The high 8 bits select one of the 256 sub-indexes; the low 32 bits are
//! the in-table key.  Any keyed hash yielding 64 uniform bits would do —
//! xxh3 is what the surrounding storage stack uses.

use xxhash_rust::xxh3::xxh3_64_with_seed;

/// 64-bit keyed fingerprint of a user key.
#[inline]
pub fn fingerprint(seed: u64, key: &[u8]) -> u64 {
    xxh3_64_with_seed(key, seed)
}

/// Sub-index selected by a fingerprint (its high byte).
#[inline]
pub fn sub_index(fingerprint: u64) -> usize {
    (fingerprint >> 56) as usize
}

/// In-table key of a fingerprint (its low 32 bits).
#[inline]
pub fn low32(fingerprint: u64) -> u32 {
    fingerprint as u32
}
