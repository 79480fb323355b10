//! Three-way in-memory hash index over `(u32 key, u32 value)` entries.
//!
//! A [`TripleIndex`] places a key in one of three alternate buckets, each
//! derived from a different mix of the key:
//!
//! | Level | Bucket width | Bucket count      | Bucket index            |
//! |-------|--------------|-------------------|-------------------------|
//! | L1    | 8 entries    | `2^addr_bits`     | `key & mask`            |
//! | L2    | 16 entries   | `2^addr_bits / 4` | `rev(key) & mask` / 4   |
//! | L3    | 32 entries   | `2^addr_bits / 16`| `(rev(key)+key) & mask` / 16 |
//!
//! The widening cascade soaks up collisions: when a key's 8-wide L1 bucket
//! is full it can still land in its 16-wide L2 or 32-wide L3 bucket, which
//! pushes the usable load factor far past a single-placement table.  Only
//! when all three buckets are full does the table grow, one address bit at
//! a time.
//!
//! `value == 0` marks an entry empty; index values are data-log offsets
//! divided by 16, which can never be 0 for a live record.
//!
//! An [`IndexBundle`] is 256 independent `TripleIndex`es selected by the
//! high byte of a 64-bit fingerprint, with the fingerprint's low 32 bits
//! as the in-table key.  Each sub-index grows on its own; a hot sub-index
//! never forces the other 255 to reallocate.

use crate::hash::{low32, sub_index};

/// Initial and minimum `addr_bits` of a sub-index.
pub const MIN_ADDR_BITS: u32 = 4;

/// `addr_mask` is a u32, so a table can never address more than this.
pub const MAX_ADDR_BITS: u32 = 32;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct Entry {
    key:   u32,
    value: u32,
}

impl Entry {
    #[inline]
    fn is_valid(&self) -> bool {
        self.value != 0
    }
}

/// Coordinate of one entry inside a [`TripleIndex`].
///
/// Only valid until the owning sub-index is rebuilt (enlarged); the engine
/// re-runs its lookup after any enlargement instead of keeping one around.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryRef {
    level:  u8,
    bucket: u32,
    slot:   u8,
}

/// Tagged lookup result.  `Full` deliberately carries no coordinate: there
/// is nowhere to insert, and handing out an arbitrary entry invites misuse.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FindX {
    Found { at: EntryRef, value: u32 },
    CanInsert { at: EntryRef },
    Full,
}

// ── TripleIndex ──────────────────────────────────────────────────────────

pub struct TripleIndex {
    addr_bits: u32,
    addr_mask: u32,
    buc1:      Vec<[Entry; 8]>,
    buc2:      Vec<[Entry; 16]>,
    buc3:      Vec<[Entry; 32]>,
}

impl TripleIndex {
    /// Panics if `addr_bits` is outside `[MIN_ADDR_BITS, MAX_ADDR_BITS]`.
    pub fn new(addr_bits: u32) -> Self {
        assert!(
            (MIN_ADDR_BITS..=MAX_ADDR_BITS).contains(&addr_bits),
            "addr_bits {addr_bits} outside [{MIN_ADDR_BITS}, {MAX_ADDR_BITS}]"
        );
        let len = 1usize << addr_bits;
        Self {
            addr_bits,
            addr_mask: (len - 1) as u32,
            buc1: vec![[Entry::default(); 8]; len],
            buc2: vec![[Entry::default(); 16]; len / 4],
            buc3: vec![[Entry::default(); 32]; len / 16],
        }
    }

    #[inline]
    pub fn addr_bits(&self) -> u32 {
        self.addr_bits
    }

    /// The three candidate bucket ids for `key`, in probe order.
    #[inline]
    fn bucket_ids(&self, key: u32) -> [u32; 3] {
        let rev = key.reverse_bits();
        [
            key & self.addr_mask,
            (rev & self.addr_mask) / 4,
            (rev.wrapping_add(key) & self.addr_mask) / 16,
        ]
    }

    fn bucket(&self, level: u8, id: u32) -> &[Entry] {
        match level {
            0 => &self.buc1[id as usize][..],
            1 => &self.buc2[id as usize][..],
            _ => &self.buc3[id as usize][..],
        }
    }

    fn entry_mut(&mut self, at: EntryRef) -> &mut Entry {
        match at.level {
            0 => &mut self.buc1[at.bucket as usize][at.slot as usize],
            1 => &mut self.buc2[at.bucket as usize][at.slot as usize],
            _ => &mut self.buc3[at.bucket as usize][at.slot as usize],
        }
    }

    /// Locate `key` among its three buckets.  Buckets are probed L1, L2,
    /// L3 and scanned linearly from slot 0.
    pub fn find(&self, key: u32) -> Option<(EntryRef, u32)> {
        let ids = self.bucket_ids(key);
        for (level, &bucket) in ids.iter().enumerate() {
            for (slot, e) in self.bucket(level as u8, bucket).iter().enumerate() {
                if e.is_valid() && e.key == key {
                    let at = EntryRef { level: level as u8, bucket, slot: slot as u8 };
                    return Some((at, e.value));
                }
            }
        }
        None
    }

    /// Like [`TripleIndex::find`], but when the key is absent also reports
    /// the first free entry across the three buckets, or `Full`.
    pub fn find_x(&self, key: u32) -> FindX {
        if let Some((at, value)) = self.find(key) {
            return FindX::Found { at, value };
        }
        let ids = self.bucket_ids(key);
        for (level, &bucket) in ids.iter().enumerate() {
            for (slot, e) in self.bucket(level as u8, bucket).iter().enumerate() {
                if !e.is_valid() {
                    let at = EntryRef { level: level as u8, bucket, slot: slot as u8 };
                    return FindX::CanInsert { at };
                }
            }
        }
        FindX::Full
    }

    /// Write both fields of the entry at `at`.
    pub fn set_at(&mut self, at: EntryRef, key: u32, value: u32) {
        let e = self.entry_mut(at);
        e.key = key;
        e.value = value;
    }

    /// Mark the entry at `at` empty.
    pub fn invalidate_at(&mut self, at: EntryRef) {
        self.entry_mut(at).value = 0;
    }

    /// Visit every valid entry, all three levels included, in a fixed
    /// deterministic order (L1 buckets, then L2, then L3).
    pub fn scan(&self, mut f: impl FnMut(u32, u32)) {
        for bucket in &self.buc1 {
            for e in bucket.iter().filter(|e| e.is_valid()) {
                f(e.key, e.value);
            }
        }
        for bucket in &self.buc2 {
            for e in bucket.iter().filter(|e| e.is_valid()) {
                f(e.key, e.value);
            }
        }
        for bucket in &self.buc3 {
            for e in bucket.iter().filter(|e| e.is_valid()) {
                f(e.key, e.value);
            }
        }
    }

    /// Build a table one bit larger holding every entry of `old`.
    ///
    /// Panics on a duplicate key or a full target: a sub-index only ever
    /// holds distinct 32-bit keys, and doubling the space must fit them,
    /// so either condition means the table is corrupt.
    fn enlarged_from(old: &TripleIndex) -> Self {
        let mut grown = TripleIndex::new(old.addr_bits + 1);
        old.scan(|key, value| match grown.find_x(key) {
            FindX::Found { .. } => panic!("duplicate key {key:#010x} while rebuilding index"),
            FindX::Full => panic!("no free entry for key {key:#010x} while rebuilding index"),
            FindX::CanInsert { at } => grown.set_at(at, key, value),
        });
        grown
    }
}

// ── IndexBundle ──────────────────────────────────────────────────────────

/// 256 independent sub-indexes routed by the fingerprint's high byte.
pub struct IndexBundle {
    subs: Vec<TripleIndex>,
}

impl IndexBundle {
    /// Build empty sub-indexes from per-sub-index size hints.  Hints are
    /// allowed to be stale or nonsensical; they are clamped to the valid
    /// range and a wrong hint only costs enlargements during replay.
    pub fn new(addr_bits: &[u8; 256]) -> Self {
        let subs = addr_bits
            .iter()
            .map(|&b| TripleIndex::new((b as u32).clamp(MIN_ADDR_BITS, MAX_ADDR_BITS)))
            .collect();
        Self { subs }
    }

    /// Current `addr_bits` of every sub-index, for persisting as hints.
    pub fn addr_bits(&self) -> [u8; 256] {
        let mut out = [0u8; 256];
        for (i, sub) in self.subs.iter().enumerate() {
            out[i] = sub.addr_bits() as u8;
        }
        out
    }

    pub fn find(&self, fingerprint: u64) -> Option<(EntryRef, u32)> {
        self.subs[sub_index(fingerprint)].find(low32(fingerprint))
    }

    /// Value of the live entry for `fingerprint`, if any.
    pub fn get(&self, fingerprint: u64) -> Option<u32> {
        self.find(fingerprint).map(|(_, v)| v)
    }

    pub fn find_x(&self, fingerprint: u64) -> FindX {
        self.subs[sub_index(fingerprint)].find_x(low32(fingerprint))
    }

    pub fn set_at(&mut self, fingerprint: u64, at: EntryRef, value: u32) {
        self.subs[sub_index(fingerprint)].set_at(at, low32(fingerprint), value);
    }

    pub fn invalidate_at(&mut self, fingerprint: u64, at: EntryRef) {
        self.subs[sub_index(fingerprint)].invalidate_at(at);
    }

    /// Grow the sub-index holding `fingerprint` by one address bit.  Any
    /// previously obtained [`EntryRef`] into that sub-index is invalidated.
    pub fn enlarge_for_key(&mut self, fingerprint: u64) {
        let i = sub_index(fingerprint);
        self.subs[i] = TripleIndex::enlarged_from(&self.subs[i]);
    }

    /// Unconditional upsert, growing as needed.  Used by journal replay,
    /// not by the hot write path (which wants the old value first).
    pub fn set(&mut self, fingerprint: u64, value: u32) {
        loop {
            match self.find_x(fingerprint) {
                FindX::Found { at, .. } | FindX::CanInsert { at } => {
                    self.set_at(fingerprint, at, value);
                    return;
                }
                FindX::Full => self.enlarge_for_key(fingerprint),
            }
        }
    }

    /// Visit every valid entry of sub-index `i`.
    pub fn scan_sub(&self, i: usize, f: impl FnMut(u32, u32)) {
        self.subs[i].scan(f);
    }

    /// Coarse projection of how many entries the bundle could hold at a
    /// comfortable load, used to size journal rotation.
    // TODO: the 8+6 entry factor predates the 8/16/32 bucket split;
    // recalibrate against measured occupancy.
    pub fn estimated_count(&self) -> u64 {
        let mut count = 0f64;
        for sub in &self.subs {
            let n = (1u64 << sub.addr_bits()) * (8 + 6);
            count += n as f64 * 0.75;
        }
        count as u64
    }
}
