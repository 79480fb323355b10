//! Journal — the replay log that rebuilds the in-memory index on open.
//!
//! Every index update is mirrored here as a fixed 10-byte record, so that
//! `open` can reconstruct the bundle by replaying records instead of
//! rescanning the whole data log.
//!
//! # Record layout (10 bytes)
//!
//! The codec fills a 13-byte big-endian scratch — `key40 (u64)`,
//! `value (u32)`, `xor (u8)` — and persists bytes 3..13; the three leading
//! bytes of the u64 are always zero and never reach disk:
//!
//! ```text
//! Offset  Size  Field
//!    0       5  key40   = sub_index << 32 | fingerprint_low32  (BE)
//!    5       4  value   index entry value (BE u32)
//!    9       1  xor     XOR of the preceding 9 bytes
//! ```
//!
//! The 40 stored bits are exactly what the index needs: the routing byte
//! and the in-table key.  On replay the full-width fingerprint is
//! reconstructed as `(key40 >> 32) << 56 | key40 as u32`.
//!
//! # Rotation and retention
//!
//! Files are named by ascending numeric id; the largest is the tail.
//! Rolling to file `n` dumps sub-index `n % 256` at the head of the new
//! file, then deletes every file with `id ≤ n − 257`.  Because 257
//! consecutive ids cover every residue mod 256, the retained window always
//! holds a complete dump of every sub-index, which bounds replay cost no
//! matter how old the store is.
//!
//! A checksum mismatch or torn record during replay is fatal; the journal
//! has no self-healing story and must not pretend otherwise.

use byteorder::{BigEndian, ByteOrder};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::index::IndexBundle;

/// Number of retained journal files: one more than the sub-index count,
/// so the retained window spans every residue mod 256.
pub const EFFECTIVE_FILE_COUNT: u64 = 257;

/// On-disk size of one record.
pub const ENTRY_LENGTH_IN_LOG: usize = 10;

#[derive(Error, Debug)]
pub enum JournalError {
    #[error("Journal file name {name:?} is not a numeric id")]
    BadFileName { name: String },
    #[error("Journal directory {dir:?} contains no files")]
    Empty { dir: PathBuf },
    #[error("Journal record checksum mismatch in file {file_id} at offset {offset}")]
    ChecksumMismatch { file_id: u64, offset: u64 },
    #[error("Journal file {file_id} is truncated mid-record")]
    Truncated { file_id: u64 },
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

pub struct Journal {
    dir:      PathBuf,
    /// Retained file ids, ascending.  The last one is the tail.
    file_ids: Vec<u64>,
    tail:     File,
    tail_len: u64,
}

impl Journal {
    /// Seed a fresh journal directory with the empty file `0` and open it.
    pub fn create(dir: &Path) -> Result<Self, JournalError> {
        fs::create_dir_all(dir)?;
        OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(dir.join("0"))?;
        Self::open(dir)
    }

    /// Open an existing journal directory.  Every file name must be a
    /// plain numeric id; anything else is a hard error.
    pub fn open(dir: &Path) -> Result<Self, JournalError> {
        let mut file_ids = Vec::new();
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            let id: u64 = name
                .parse()
                .map_err(|_| JournalError::BadFileName { name: name.clone() })?;
            file_ids.push(id);
        }
        if file_ids.is_empty() {
            return Err(JournalError::Empty { dir: dir.to_owned() });
        }
        file_ids.sort_unstable();

        let tail_id = *file_ids.last().expect("file_ids is non-empty");
        let tail = OpenOptions::new()
            .append(true)
            .open(dir.join(tail_id.to_string()))?;
        let tail_len = tail.metadata()?.len();

        Ok(Self { dir: dir.to_owned(), file_ids, tail, tail_len })
    }

    #[inline]
    fn tail_id(&self) -> u64 {
        *self.file_ids.last().expect("file_ids is non-empty")
    }

    /// Bytes in the tail file.
    #[inline]
    pub fn tail_size(&self) -> u64 {
        self.tail_len
    }

    /// Append one `(fingerprint, value)` record to the tail.
    pub fn append(&mut self, fingerprint: u64, value: u32) -> Result<(), JournalError> {
        let key40 = ((fingerprint >> 56) << 32) | (fingerprint & 0xFFFF_FFFF);
        let mut scratch = [0u8; 3 + ENTRY_LENGTH_IN_LOG];
        BigEndian::write_u64(&mut scratch[0..8], key40);
        BigEndian::write_u32(&mut scratch[8..12], value);
        let mut xor = 0u8;
        for b in &scratch[3..12] {
            xor ^= b;
        }
        scratch[12] = xor;

        self.tail.write_all(&scratch[3..])?;
        self.tail_len += ENTRY_LENGTH_IN_LOG as u64;
        Ok(())
    }

    /// Replay every record of every retained file in ascending id order.
    /// Fails fast on a bad checksum or a torn record.
    pub fn scan(&self, mut f: impl FnMut(u64, u32)) -> Result<(), JournalError> {
        for &id in &self.file_ids {
            let data = fs::read(self.dir.join(id.to_string()))?;
            if data.len() % ENTRY_LENGTH_IN_LOG != 0 {
                return Err(JournalError::Truncated { file_id: id });
            }
            for (i, rec) in data.chunks_exact(ENTRY_LENGTH_IN_LOG).enumerate() {
                let mut xor = 0u8;
                for b in &rec[..9] {
                    xor ^= b;
                }
                if xor != rec[9] {
                    return Err(JournalError::ChecksumMismatch {
                        file_id: id,
                        offset:  (i * ENTRY_LENGTH_IN_LOG) as u64,
                    });
                }
                let mut scratch = [0u8; 13];
                scratch[3..].copy_from_slice(rec);
                let key40 = BigEndian::read_u64(&scratch[0..8]);
                let value = BigEndian::read_u32(&scratch[8..12]);
                let fingerprint = ((key40 >> 32) << 56) | (key40 & 0xFFFF_FFFF);
                f(fingerprint, value);
            }
        }
        Ok(())
    }

    /// Flush the tail file to stable storage.
    pub fn sync(&self) -> Result<(), JournalError> {
        self.tail.sync_all()?;
        Ok(())
    }

    /// Roll to the next file: sync and seal the tail, open `tail_id + 1`,
    /// dump sub-index `new_id % 256` at its head, and delete every file
    /// with `id ≤ new_id − 257`.
    pub fn rotate(&mut self, bundle: &IndexBundle) -> Result<(), JournalError> {
        self.tail.sync_all()?;
        let new_id = self.tail_id() + 1;
        self.tail = OpenOptions::new()
            .append(true)
            .create_new(true)
            .open(self.dir.join(new_id.to_string()))?;
        self.tail_len = 0;
        self.file_ids.push(new_id);

        let sub = (new_id % 256) as usize;
        let mut entries = Vec::new();
        bundle.scan_sub(sub, |key, value| entries.push((key, value)));
        for &(key, value) in &entries {
            let fingerprint = ((sub as u64) << 56) | key as u64;
            self.append(fingerprint, value)?;
        }

        if new_id >= EFFECTIVE_FILE_COUNT {
            let cutoff = new_id - EFFECTIVE_FILE_COUNT;
            while let Some(&oldest) = self.file_ids.first() {
                if oldest > cutoff {
                    break;
                }
                fs::remove_file(self.dir.join(oldest.to_string()))?;
                self.file_ids.remove(0);
            }
        }

        log::debug!(
            "journal rotated to file {new_id}: dumped sub-index {sub} ({} entries), {} files retained",
            entries.len(),
            self.file_ids.len(),
        );
        Ok(())
    }
}
