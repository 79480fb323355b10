//! Slot codec — the persisted record behind one index address.
//!
//! A slot holds every (key, value) pair whose fingerprint collides on the
//! same index entry.  Pairs keep insertion order; re-adding an existing key
//! overwrites its value in place, removing a key compacts the remainder
//! without reordering.
//!
//! # On-disk layout (all fields little-endian)
//!
//! ```text
//! Offset        Size  Field
//!    0             4  total_len    bytes after this field up to and
//!                                  including checksum (LE u32)
//!    4             4  pair_count   (LE u32)
//!    8           8×n  (key_len, value_len) per pair (LE u32 each)
//!    8+8n          …  key_0 | value_0 | … | key_{n-1} | value_{n-1}
//!    …             4  checksum     CRC32 of pair_count..last value byte
//!    …             …  zero padding to a 16-byte multiple
//! ```
//!
//! The emitted stream, leading 4 bytes included, is always a multiple of
//! 16 bytes; the stored `total_len` excludes both the leading 4 bytes and
//! the padding.  `checksum` covers every byte between `total_len` and
//! itself, in stream order.
//!
//! # Checksums
//! The CRC32 is mandatory.  [`Slot::decode`] verifies it after parsing and
//! refuses the record on any mismatch; a slot that fails its checksum is
//! corruption, not a recoverable condition.

use byteorder::{ByteOrder, LittleEndian};
use crc32fast::Hasher;
use thiserror::Error;

/// Every encoded slot starts and ends on a multiple of this many bytes.
pub const SLOT_ALIGN: usize = 16;

#[derive(Error, Debug)]
pub enum SlotError {
    #[error("Slot record ends prematurely")]
    UnexpectedEnd,
    #[error("Slot checksum mismatch: expected {expected:#010x}, got {actual:#010x}")]
    ChecksumMismatch { expected: u32, actual: u32 },
}

/// One key/value pair inside a slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pair {
    pub key:   Vec<u8>,
    pub value: Vec<u8>,
}

/// In-memory form of a persisted slot.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Slot {
    pairs: Vec<Pair>,
}

impl Slot {
    /// A slot holding a single pair.
    pub fn new(key: &[u8], value: &[u8]) -> Self {
        Self {
            pairs: vec![Pair { key: key.to_vec(), value: value.to_vec() }],
        }
    }

    #[inline] pub fn is_empty(&self) -> bool { self.pairs.is_empty() }
    #[inline] pub fn len(&self)      -> usize { self.pairs.len() }
    #[inline] pub fn pairs(&self)    -> &[Pair] { &self.pairs }

    /// Key of the first pair.  Every pair in a slot shares one fingerprint,
    /// so the first key is enough to re-derive the slot's index address.
    pub fn first_key(&self) -> Option<&[u8]> {
        self.pairs.first().map(|p| p.key.as_slice())
    }

    /// Overwrite the value if `key` is already present, else append.
    pub fn add(&mut self, key: &[u8], value: &[u8]) {
        for pair in &mut self.pairs {
            if pair.key == key {
                pair.value = value.to_vec();
                return;
            }
        }
        self.pairs.push(Pair { key: key.to_vec(), value: value.to_vec() });
    }

    pub fn get(&self, key: &[u8]) -> Option<&[u8]> {
        self.pairs
            .iter()
            .find(|p| p.key == key)
            .map(|p| p.value.as_slice())
    }

    /// Remove `key`, keeping the relative order of the remaining pairs.
    /// Returns whether the key was present.
    pub fn remove(&mut self, key: &[u8]) -> bool {
        match self.pairs.iter().position(|p| p.key == key) {
            Some(idx) => {
                self.pairs.remove(idx);
                true
            }
            None => false,
        }
    }

    // ── Encode ───────────────────────────────────────────────────────────

    /// `total_len` as stored on disk: everything after the leading length
    /// field through the checksum, padding excluded.
    fn total_len(&self) -> usize {
        let payload: usize = self
            .pairs
            .iter()
            .map(|p| p.key.len() + p.value.len())
            .sum();
        4 + 8 * self.pairs.len() + payload + 4
    }

    /// Byte length of [`Slot::encode`]'s output: the full on-disk footprint
    /// including the leading length field and the padding.
    pub fn encoded_len(&self) -> usize {
        (4 + self.total_len() + SLOT_ALIGN - 1) & !(SLOT_ALIGN - 1)
    }

    /// Emit the full padded record.  The output length is always a multiple
    /// of 16 and equals [`Slot::encoded_len`].
    pub fn encode(&self) -> Vec<u8> {
        let full = self.encoded_len();
        let mut out = Vec::with_capacity(full);
        let mut scratch = [0u8; 4];

        LittleEndian::write_u32(&mut scratch, self.total_len() as u32);
        out.extend_from_slice(&scratch);

        LittleEndian::write_u32(&mut scratch, self.pairs.len() as u32);
        out.extend_from_slice(&scratch);
        for pair in &self.pairs {
            LittleEndian::write_u32(&mut scratch, pair.key.len() as u32);
            out.extend_from_slice(&scratch);
            LittleEndian::write_u32(&mut scratch, pair.value.len() as u32);
            out.extend_from_slice(&scratch);
        }
        for pair in &self.pairs {
            out.extend_from_slice(&pair.key);
            out.extend_from_slice(&pair.value);
        }

        // CRC32 of pair_count through the last value byte.
        let mut h = Hasher::new();
        h.update(&out[4..]);
        LittleEndian::write_u32(&mut scratch, h.finalize());
        out.extend_from_slice(&scratch);

        out.resize(full, 0);
        out
    }

    // ── Decode ───────────────────────────────────────────────────────────

    /// Parse the record body that follows the 4-byte length field.  `body`
    /// must hold at least `total_len` bytes; trailing padding is ignored.
    ///
    /// Fails on a premature end of input or a checksum mismatch.  The
    /// caller MUST treat either as corruption of the data log.
    pub fn decode(body: &[u8]) -> Result<Self, SlotError> {
        let mut cur = Cursor { buf: body, pos: 0 };

        let pair_count = cur.read_u32()? as usize;
        // Each pair needs 8 length bytes; bound the count before allocating.
        if pair_count.saturating_mul(8) > body.len() {
            return Err(SlotError::UnexpectedEnd);
        }
        let mut lens = Vec::with_capacity(pair_count * 2);
        for _ in 0..pair_count * 2 {
            lens.push(cur.read_u32()? as usize);
        }

        let mut pairs = Vec::with_capacity(pair_count);
        for i in 0..pair_count {
            let key   = cur.read_bytes(lens[2 * i])?.to_vec();
            let value = cur.read_bytes(lens[2 * i + 1])?.to_vec();
            pairs.push(Pair { key, value });
        }

        let covered = cur.pos;
        let stored = cur.read_u32()?;

        let mut h = Hasher::new();
        h.update(&body[..covered]);
        let expected = h.finalize();
        if stored != expected {
            return Err(SlotError::ChecksumMismatch { expected, actual: stored });
        }

        Ok(Self { pairs })
    }
}

// ── Parse cursor ─────────────────────────────────────────────────────────

struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn read_u32(&mut self) -> Result<u32, SlotError> {
        let b = self.read_bytes(4)?;
        Ok(LittleEndian::read_u32(b))
    }

    fn read_bytes(&mut self, n: usize) -> Result<&'a [u8], SlotError> {
        if self.buf.len() - self.pos < n {
            return Err(SlotError::UnexpectedEnd);
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn roundtrip(slot: &Slot) -> Slot {
        let enc = slot.encode();
        assert_eq!(enc.len() % SLOT_ALIGN, 0);
        assert_eq!(enc.len(), slot.encoded_len());
        let total_len = LittleEndian::read_u32(&enc[..4]) as usize;
        assert!(4 + total_len <= enc.len());
        Slot::decode(&enc[4..]).expect("decode failed")
    }

    #[test]
    fn single_pair_roundtrip() {
        let slot = Slot::new(b"foo", b"bar");
        assert_eq!(roundtrip(&slot), slot);
    }

    #[test]
    fn multi_pair_order_preserved() {
        let mut slot = Slot::new(b"a", b"1");
        slot.add(b"b", b"2");
        slot.add(b"c", b"3");
        let back = roundtrip(&slot);
        let keys: Vec<&[u8]> = back.pairs().iter().map(|p| p.key.as_slice()).collect();
        assert_eq!(keys, vec![b"a" as &[u8], b"b", b"c"]);
    }

    #[test]
    fn add_overwrites_in_place() {
        let mut slot = Slot::new(b"a", b"1");
        slot.add(b"b", b"2");
        slot.add(b"a", b"9");
        assert_eq!(slot.len(), 2);
        assert_eq!(slot.get(b"a"), Some(b"9" as &[u8]));
        assert_eq!(slot.first_key(), Some(b"a" as &[u8]));
    }

    #[test]
    fn remove_keeps_order() {
        let mut slot = Slot::new(b"a", b"1");
        slot.add(b"b", b"2");
        slot.add(b"c", b"3");
        assert!(slot.remove(b"b"));
        assert!(!slot.remove(b"b"));
        let keys: Vec<&[u8]> = slot.pairs().iter().map(|p| p.key.as_slice()).collect();
        assert_eq!(keys, vec![b"a" as &[u8], b"c"]);
    }

    #[test]
    fn empty_values_are_ordinary() {
        let mut slot = Slot::new(b"k", b"");
        slot.add(b"", b"v");
        let back = roundtrip(&slot);
        assert_eq!(back.get(b"k"), Some(b"" as &[u8]));
        assert_eq!(back.get(b""), Some(b"v" as &[u8]));
    }

    #[test]
    fn checksum_mismatch_detected() {
        let slot = Slot::new(b"foo", b"bar");
        let mut enc = slot.encode();
        enc[16] ^= 0xFF; // flip the first key byte; lengths stay parseable
        let err = Slot::decode(&enc[4..]).unwrap_err();
        assert!(matches!(err, SlotError::ChecksumMismatch { .. }));
    }

    #[test]
    fn truncated_input_detected() {
        let slot = Slot::new(b"foo", b"bar");
        let enc = slot.encode();
        let err = Slot::decode(&enc[4..10]).unwrap_err();
        assert!(matches!(err, SlotError::UnexpectedEnd));
    }

    #[test]
    fn stored_total_len_excludes_padding() {
        let slot = Slot::new(b"k", b"v");
        let enc = slot.encode();
        let total_len = LittleEndian::read_u32(&enc[..4]) as usize;
        // pair_count + one (key_len, value_len) + 2 payload bytes + checksum
        assert_eq!(total_len, 4 + 8 + 2 + 4);
        assert_eq!(enc.len(), 32); // 4 + 18 rounded up to 16
    }

    proptest! {
        #[test]
        fn encode_decode_identity(
            entries in prop::collection::vec(
                (prop::collection::vec(any::<u8>(), 0..64),
                 prop::collection::vec(any::<u8>(), 0..256)),
                1..8,
            )
        ) {
            let mut slot = Slot::default();
            for (k, v) in &entries {
                slot.add(k, v);
            }
            prop_assume!(!slot.is_empty());
            let enc = slot.encode();
            prop_assert_eq!(enc.len() % SLOT_ALIGN, 0);
            let back = Slot::decode(&enc[4..]).unwrap();
            prop_assert_eq!(back, slot);
        }
    }
}
