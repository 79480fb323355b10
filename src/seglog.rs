//! Segmented append-only data log with head pruning.
//!
//! The log is a directory of numbered files, each nominally `block_size`
//! bytes, named `<id>-<blockSize>`.  A logical byte offset maps to
//! `(id = off / block_size, pos = off % block_size)` with no range table.
//! The highest id is the writable tail; lower ids are read-only and are
//! destroyed only by [`SegLog::prune_head`].
//!
//! # Crossing appends
//!
//! An append always goes to the current tail first, even when it runs past
//! `block_size` — the crossing bytes stay physically at the end of the old
//! file, where reads that *start* before the boundary can still reach
//! them.  The log then syncs the old tail, opens the next id, and pre-pads
//! it with `overflow` zero bytes so that the next append lands at the same
//! logical offset the crossing append ended on.  Logical addresses stay
//! strictly linear; the padding region is never the start of a record.
//!
//! Because of this scheme a single append must fit in one block; larger
//! appends are rejected.
//!
//! # Reads
//!
//! Reads are positioned (`pread`-style) and never touch a seek cursor, so
//! any number of readers can share the log while the tail is being
//! appended to.  A read is confined to the file its start offset maps to;
//! callers read one record at a time and records never exceed a block.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SegLogError {
    #[error("Segment name {name:?} does not match the pattern '<id>-<blockSize>'")]
    BadFileName { name: String },
    #[error("Segment {name:?} declares block size {found}, this log uses {expected}")]
    BlockSizeMismatch { name: String, found: u64, expected: u64 },
    #[error("No segment file covers offset {offset} (file id {file_id} is gone)")]
    MissingSegment { offset: u64, file_id: u64 },
    #[error("Append of {len} bytes exceeds the block size {block_size}")]
    OversizedAppend { len: u64, block_size: u64 },
    #[error("Data directory {dir:?} contains no segment files")]
    Empty { dir: PathBuf },
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

pub struct SegLog {
    files:      HashMap<u64, File>,
    block_size: u64,
    dir:        PathBuf,
    largest_id: u64,
    tail_len:   u64,
}

impl SegLog {
    /// Seed a fresh log directory with the empty segment `0-<blockSize>`
    /// and open it.
    pub fn create(block_size: u64, dir: &Path) -> Result<Self, SegLogError> {
        fs::create_dir_all(dir)?;
        let first = segment_path(dir, 0, block_size);
        OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(first)?;
        Self::open(block_size, dir)
    }

    /// Open an existing log directory.  Every file must be named
    /// `<id>-<blockSize>` with the configured block size; anything else is
    /// a hard error.  The largest id becomes the writable tail.
    pub fn open(block_size: u64, dir: &Path) -> Result<Self, SegLogError> {
        let mut ids = Vec::new();
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            let (id_part, size_part) = name
                .split_once('-')
                .ok_or_else(|| SegLogError::BadFileName { name: name.clone() })?;
            let id: u64 = id_part
                .parse()
                .map_err(|_| SegLogError::BadFileName { name: name.clone() })?;
            let found: u64 = size_part
                .parse()
                .map_err(|_| SegLogError::BadFileName { name: name.clone() })?;
            if found != block_size {
                return Err(SegLogError::BlockSizeMismatch { name, found, expected: block_size });
            }
            ids.push(id);
        }
        if ids.is_empty() {
            return Err(SegLogError::Empty { dir: dir.to_owned() });
        }

        let largest_id = *ids.iter().max().expect("ids is non-empty");
        let mut files = HashMap::with_capacity(ids.len());
        for id in ids {
            let path = segment_path(dir, id, block_size);
            let file = if id == largest_id {
                OpenOptions::new().read(true).write(true).open(path)?
            } else {
                File::open(path)?
            };
            files.insert(id, file);
        }
        let tail_len = files[&largest_id].metadata()?.len();

        Ok(Self { files, block_size, dir: dir.to_owned(), largest_id, tail_len })
    }

    #[inline]
    pub fn block_size(&self) -> u64 {
        self.block_size
    }

    /// Logical end of the log: `largest_id · block_size + tail length`.
    #[inline]
    pub fn size(&self) -> u64 {
        self.largest_id * self.block_size + self.tail_len
    }

    /// Fill `buf` from logical offset `off`.  The read stays within the
    /// single file that `off` maps to; it fails if that file was pruned.
    pub fn read_at(&self, buf: &mut [u8], off: u64) -> Result<(), SegLogError> {
        let file_id = off / self.block_size;
        let pos = off % self.block_size;
        let file = self
            .files
            .get(&file_id)
            .ok_or(SegLogError::MissingSegment { offset: off, file_id })?;
        read_exact_at(file, buf, pos)?;
        Ok(())
    }

    /// Append `parts` back to back and return the logical offset of the
    /// append's end — equivalently, where the next append will start.
    ///
    /// On a block crossing the old tail is synced before the new segment
    /// is created, so a crash between the two leaves a prefix-consistent
    /// log.
    pub fn append(&mut self, parts: &[&[u8]]) -> Result<u64, SegLogError> {
        let total: u64 = parts.iter().map(|p| p.len() as u64).sum();
        if total > self.block_size {
            return Err(SegLogError::OversizedAppend { len: total, block_size: self.block_size });
        }

        let tail = self
            .files
            .get_mut(&self.largest_id)
            .expect("tail segment is open");
        let start = tail.seek(SeekFrom::End(0))?;
        for part in parts {
            tail.write_all(part)?;
        }

        if start + total >= self.block_size {
            // Crossing (or exact fill): roll over to the next segment.
            tail.sync_all()?;
            let overflow = start + total - self.block_size;
            self.largest_id += 1;
            let path = segment_path(&self.dir, self.largest_id, self.block_size);
            let mut next = OpenOptions::new()
                .read(true)
                .write(true)
                .create_new(true)
                .open(path)?;
            if overflow > 0 {
                next.write_all(&vec![0u8; overflow as usize])?;
            }
            self.files.insert(self.largest_id, next);
            self.tail_len = overflow;
        } else {
            self.tail_len = start + total;
        }

        Ok(self.largest_id * self.block_size + self.tail_len)
    }

    /// Close and delete every segment whose id lies strictly before
    /// `off / block_size`.  Offsets below the cut become unreadable.
    pub fn prune_head(&mut self, off: u64) -> Result<(), SegLogError> {
        let keep_from = off / self.block_size;
        let doomed: Vec<u64> = self
            .files
            .keys()
            .copied()
            .filter(|&id| id < keep_from)
            .collect();
        for id in doomed {
            self.files.remove(&id); // drop closes the handle
            fs::remove_file(segment_path(&self.dir, id, self.block_size))?;
        }
        Ok(())
    }

    /// Flush the tail segment to stable storage.  Sealed segments were
    /// synced when the tail rolled past them.
    pub fn sync(&self) -> Result<(), SegLogError> {
        self.files[&self.largest_id].sync_all()?;
        Ok(())
    }
}

fn segment_path(dir: &Path, id: u64, block_size: u64) -> PathBuf {
    dir.join(format!("{id}-{block_size}"))
}

/// Positioned read that leaves the file's seek cursor untouched.
fn read_exact_at(file: &File, buf: &mut [u8], pos: u64) -> io::Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::FileExt;
        file.read_exact_at(buf, pos)
    }
    #[cfg(windows)]
    {
        use std::os::windows::fs::FileExt;
        let mut filled = 0usize;
        let mut offset = pos;
        while filled < buf.len() {
            let n = file.seek_read(&mut buf[filled..], offset)?;
            if n == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "failed to fill whole buffer",
                ));
            }
            filled += n;
            offset += n as u64;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn append_then_read() {
        let dir = tempdir().unwrap();
        let mut log = SegLog::create(64, dir.path()).unwrap();

        let end = log.append(&[b"hello, ", b"world"]).unwrap();
        assert_eq!(end, 12);
        assert_eq!(log.size(), 12);

        let mut buf = [0u8; 12];
        log.read_at(&mut buf, 0).unwrap();
        assert_eq!(&buf, b"hello, world");
    }

    #[test]
    fn exact_fill_rolls_to_fresh_segment() {
        let dir = tempdir().unwrap();
        let mut log = SegLog::create(32, dir.path()).unwrap();

        let end = log.append(&[&[7u8; 32]]).unwrap();
        assert_eq!(end, 32); // next append starts at offset 0 of segment 1
        assert_eq!(log.size(), 32);
        assert!(dir.path().join("1-32").exists());
        assert_eq!(fs::metadata(dir.path().join("1-32")).unwrap().len(), 0);

        let end = log.append(&[b"abcd"]).unwrap();
        assert_eq!(end, 36);
        let mut buf = [0u8; 4];
        log.read_at(&mut buf, 32).unwrap();
        assert_eq!(&buf, b"abcd");
    }

    #[test]
    fn overflow_prepads_next_segment() {
        let dir = tempdir().unwrap();
        let mut log = SegLog::create(32, dir.path()).unwrap();

        log.append(&[&[1u8; 16]]).unwrap();
        let end = log.append(&[&[2u8; 32]]).unwrap();
        // 16 bytes overflowed: next append starts at offset 16 of segment 1.
        assert_eq!(end, 32 + 16);

        // The crossing record is reachable from its start in segment 0.
        let mut buf = [0u8; 32];
        log.read_at(&mut buf, 16).unwrap();
        assert_eq!(buf, [2u8; 32]);

        // Segment 1 carries 16 bytes of zero padding.
        let pad = fs::read(dir.path().join("1-32")).unwrap();
        assert_eq!(pad, vec![0u8; 16]);
    }

    #[test]
    fn oversized_append_rejected() {
        let dir = tempdir().unwrap();
        let mut log = SegLog::create(32, dir.path()).unwrap();
        let err = log.append(&[&[0u8; 33]]).unwrap_err();
        assert!(matches!(err, SegLogError::OversizedAppend { .. }));
    }

    #[test]
    fn prune_head_deletes_whole_segments() {
        let dir = tempdir().unwrap();
        let mut log = SegLog::create(16, dir.path()).unwrap();
        for _ in 0..6 {
            log.append(&[&[9u8; 8]]).unwrap();
        }
        assert_eq!(log.size(), 48);

        log.prune_head(40).unwrap();
        assert!(!dir.path().join("0-16").exists());
        assert!(!dir.path().join("1-16").exists());
        assert!(dir.path().join("2-16").exists());

        assert!(matches!(
            log.read_at(&mut [0u8; 4], 0),
            Err(SegLogError::MissingSegment { .. })
        ));
        let mut buf = [0u8; 8];
        log.read_at(&mut buf, 40).unwrap();
        assert_eq!(buf, [9u8; 8]);
    }

    #[test]
    fn reopen_preserves_contents() {
        let dir = tempdir().unwrap();
        {
            let mut log = SegLog::create(32, dir.path()).unwrap();
            log.append(&[b"persistent"]).unwrap();
            log.sync().unwrap();
        }
        let log = SegLog::open(32, dir.path()).unwrap();
        assert_eq!(log.size(), 10);
        let mut buf = [0u8; 10];
        log.read_at(&mut buf, 0).unwrap();
        assert_eq!(&buf, b"persistent");
    }

    #[test]
    fn block_size_mismatch_is_fatal() {
        let dir = tempdir().unwrap();
        SegLog::create(32, dir.path()).unwrap();
        assert!(matches!(
            SegLog::open(64, dir.path()),
            Err(SegLogError::BlockSizeMismatch { .. })
        ));
    }

    #[test]
    fn malformed_name_is_fatal() {
        let dir = tempdir().unwrap();
        SegLog::create(32, dir.path()).unwrap();
        fs::write(dir.path().join("stray.tmp"), b"x").unwrap();
        assert!(matches!(
            SegLog::open(32, dir.path()),
            Err(SegLogError::BadFileName { .. })
        ));
    }
}
