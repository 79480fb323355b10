//! MetaInfo — the store's persistent header.
//!
//! # On-disk layout (293 bytes, numeric fields little-endian)
//!
//! ```text
//! Offset  Size  Field
//!    0    256   addr_bits        per-sub-index table size hints
//!  256      8   next_gc_position lowest log offset not yet compacted (LE u64)
//!  264      8   active_byte_count encoded bytes reachable via the index (LE u64)
//!  272      8   seed             fingerprint seed, lifetime-constant (LE u64)
//!  280      8   block_size       data-log block size, lifetime-constant (LE u64)
//!  288      1   closed           1 = shut down cleanly
//!  289      4   checksum         CRC32 of all preceding bytes (LE u32)
//! ```
//!
//! The addr-bits vector is a hint: the journal replay is authoritative for
//! the index contents, and a stale hint only costs an extra enlargement.
//! `next_gc_position` and `active_byte_count` are exact only after a clean
//! shutdown; an unclean open must either refuse or recompute them.

use byteorder::{ByteOrder, LittleEndian};
use crc32fast::Hasher;
use std::fs;
use std::io::{self, Read, Write};
use std::path::Path;
use thiserror::Error;

/// Fixed byte size of the encoded header (including the trailing checksum).
pub const META_INFO_BYTES: usize = 256 + 4 * 8 + 1 + 4;

#[derive(Error, Debug)]
pub enum MetaError {
    #[error("MetaInfo checksum mismatch: expected {expected:#010x}, got {actual:#010x}")]
    ChecksumMismatch { expected: u32, actual: u32 },
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

#[derive(Debug, Clone)]
pub struct MetaInfo {
    /// Per-sub-index `addr_bits` hints; safe to be stale.
    pub addr_bits:         [u8; 256],
    /// Lowest data-log offset the compactor has not visited yet.
    pub next_gc_position:  u64,
    /// Sum of encoded lengths of slots reachable through the index.
    pub active_byte_count: u64,
    /// Fingerprint seed.  Constant for the lifetime of the store.
    pub seed:              u64,
    /// Data-log block size.  Constant for the lifetime of the store.
    pub block_size:        u64,
    /// True only between a clean `close` and the next `open`.
    pub closed:            bool,
}

impl MetaInfo {
    pub fn new(seed: u64, block_size: u64) -> Self {
        Self {
            addr_bits:         [crate::index::MIN_ADDR_BITS as u8; 256],
            next_gc_position:  0,
            active_byte_count: 0,
            seed,
            block_size,
            closed:            false,
        }
    }

    pub fn encode(&self) -> [u8; META_INFO_BYTES] {
        let mut buf = [0u8; META_INFO_BYTES];
        buf[..256].copy_from_slice(&self.addr_bits);
        LittleEndian::write_u64(&mut buf[256..264], self.next_gc_position);
        LittleEndian::write_u64(&mut buf[264..272], self.active_byte_count);
        LittleEndian::write_u64(&mut buf[272..280], self.seed);
        LittleEndian::write_u64(&mut buf[280..288], self.block_size);
        buf[288] = self.closed as u8;

        let mut h = Hasher::new();
        h.update(&buf[..META_INFO_BYTES - 4]);
        LittleEndian::write_u32(&mut buf[META_INFO_BYTES - 4..], h.finalize());
        buf
    }

    /// Validate the checksum and parse.  A mismatch is fatal — the header
    /// is the anchor for everything else and has no fallback.
    pub fn decode(buf: &[u8; META_INFO_BYTES]) -> Result<Self, MetaError> {
        let mut h = Hasher::new();
        h.update(&buf[..META_INFO_BYTES - 4]);
        let expected = h.finalize();
        let stored = LittleEndian::read_u32(&buf[META_INFO_BYTES - 4..]);
        if stored != expected {
            return Err(MetaError::ChecksumMismatch { expected, actual: stored });
        }

        let mut addr_bits = [0u8; 256];
        addr_bits.copy_from_slice(&buf[..256]);
        Ok(Self {
            addr_bits,
            next_gc_position:  LittleEndian::read_u64(&buf[256..264]),
            active_byte_count: LittleEndian::read_u64(&buf[264..272]),
            seed:              LittleEndian::read_u64(&buf[272..280]),
            block_size:        LittleEndian::read_u64(&buf[280..288]),
            closed:            buf[288] != 0,
        })
    }

    pub fn load(path: &Path) -> Result<Self, MetaError> {
        let mut f = fs::File::open(path)?;
        let mut buf = [0u8; META_INFO_BYTES];
        f.read_exact(&mut buf)?;
        Self::decode(&buf)
    }

    pub fn save(&self, path: &Path) -> Result<(), MetaError> {
        let mut f = fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        f.write_all(&self.encode())?;
        f.sync_all()?;
        Ok(())
    }
}
