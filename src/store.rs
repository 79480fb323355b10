//! The engine — public Get/Set/Delete over the index, data log, and
//! journal.
//!
//! ```no_run
//! use burrow::store::{Options, Store};
//!
//! let store = Store::create(
//!     "db/data".as_ref(),
//!     "db/journal".as_ref(),
//!     "db/meta".as_ref(),
//!     Options::default(),
//! )?;
//! store.set(b"greeting", b"hello")?;
//! assert_eq!(store.get(b"greeting")?.as_deref(), Some(b"hello" as &[u8]));
//! store.close()?;
//! # Ok::<(), burrow::store::StoreError>(())
//! ```
//!
//! # Write path
//!
//! A write fingerprints the key, looks it up in the bundle, merges the new
//! pair into the slot currently holding that fingerprint (reading it from
//! the data log if one exists), appends the merged slot, re-points the
//! index entry at the new position, and mirrors the entry into the
//! journal.  Old slot versions stay in the log as garbage until the
//! compactor passes them.
//!
//! # Addressing
//!
//! Index values are data-log byte offsets divided by 16; value 0 is the
//! empty sentinel.  The first 16 bytes of the data log are reserved at
//! creation so no slot can ever sit at offset 0.  Every slot append must
//! end 16-aligned — slot encoding pads to 16, so a violation means the log
//! is corrupt and the engine panics rather than write through it.
//!
//! # Locking
//!
//! One readers-writer lock guards the whole engine: `get` takes the read
//! side, updates take the write side, and the compactor takes the write
//! side once per relocation rather than for its whole scan, so reads
//! interleave with compaction.  The discipline is single-writer /
//! multi-reader; the lock enforces safety, the embedder enforces who
//! writes.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use byteorder::{ByteOrder, LittleEndian};
use thiserror::Error;

use crate::batch::Batch;
use crate::hash::fingerprint;
use crate::index::{FindX, IndexBundle};
use crate::journal::{Journal, JournalError, ENTRY_LENGTH_IN_LOG};
use crate::meta::{MetaError, MetaInfo};
use crate::seglog::{SegLog, SegLogError};
use crate::slot::{Slot, SlotError, SLOT_ALIGN};

/// Default data-log block size: 64 MiB per segment file.
pub const DEFAULT_BLOCK_SIZE: u64 = 64 * 1024 * 1024;

/// Journal-record cadence at which the rotation heuristic is evaluated.
const ROTATION_CHECK_INTERVAL: u64 = 1024;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Store was not closed properly; use open_recover to rebuild its counters")]
    NotClosedProperly,
    #[error("A store already exists at {path:?}")]
    AlreadyExists { path: PathBuf },
    #[error("Data log has outgrown the 32-bit slot address space")]
    AddressSpaceExhausted,
    #[error("Slot at offset {pos} holds no pairs")]
    EmptySlot { pos: u64 },
    #[error("Meta info: {0}")]
    Meta(#[from] MetaError),
    #[error("Data log: {0}")]
    SegLog(#[from] SegLogError),
    #[error("Journal: {0}")]
    Journal(#[from] JournalError),
    #[error("Slot codec: {0}")]
    Slot(#[from] SlotError),
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Creation-time configuration.
#[derive(Debug, Clone)]
pub struct Options {
    /// Size of one data-log segment file.  Constant for the lifetime of
    /// the store; also the upper bound on a single encoded slot.
    pub block_size: u64,
}

impl Default for Options {
    fn default() -> Self {
        Self { block_size: DEFAULT_BLOCK_SIZE }
    }
}

// ── Engine state ─────────────────────────────────────────────────────────

struct Inner {
    seglog:      SegLog,
    journal:     Journal,
    bundle:      IndexBundle,
    meta:        MetaInfo,
    meta_path:   PathBuf,
    /// Journal records written since open, for the rotation cadence.
    log_records: u64,
}

pub struct Store {
    inner: RwLock<Inner>,
}

impl Store {
    // ── Constructors ─────────────────────────────────────────────────────

    /// Initialize a fresh store and open it.
    ///
    /// Seeds the data log (with its reserved 16-byte head), the journal,
    /// and a meta header carrying a random fingerprint seed.  Fails if a
    /// meta file already exists at `meta_path`.
    pub fn create(
        data_dir:    &Path,
        journal_dir: &Path,
        meta_path:   &Path,
        opts:        Options,
    ) -> Result<Self, StoreError> {
        if meta_path.exists() {
            return Err(StoreError::AlreadyExists { path: meta_path.to_owned() });
        }
        if let Some(parent) = meta_path.parent() {
            fs::create_dir_all(parent)?;
        }

        {
            let mut seglog = SegLog::create(opts.block_size, data_dir)?;
            // Reserve offset 0: index value 0 means "empty entry".
            seglog.append(&[&[0u8; SLOT_ALIGN]])?;
            seglog.sync()?;
        }
        Journal::create(journal_dir)?;

        let mut meta = MetaInfo::new(rand::random::<u64>(), opts.block_size);
        meta.next_gc_position = SLOT_ALIGN as u64;
        meta.closed = true;
        meta.save(meta_path)?;

        log::info!("created store (data {data_dir:?}, journal {journal_dir:?})");
        Self::open(data_dir, journal_dir, meta_path)
    }

    /// Open a cleanly closed store.  An unclean shutdown is refused with
    /// [`StoreError::NotClosedProperly`]; see [`Store::open_recover`].
    pub fn open(
        data_dir:    &Path,
        journal_dir: &Path,
        meta_path:   &Path,
    ) -> Result<Self, StoreError> {
        Self::open_impl(data_dir, journal_dir, meta_path, false)
    }

    /// Open a store even after an unclean shutdown, rebuilding the GC
    /// cursor and the active-byte counter by rescanning the data log from
    /// the last known cursor.
    pub fn open_recover(
        data_dir:    &Path,
        journal_dir: &Path,
        meta_path:   &Path,
    ) -> Result<Self, StoreError> {
        Self::open_impl(data_dir, journal_dir, meta_path, true)
    }

    fn open_impl(
        data_dir:    &Path,
        journal_dir: &Path,
        meta_path:   &Path,
        recover:     bool,
    ) -> Result<Self, StoreError> {
        let meta = MetaInfo::load(meta_path)?;
        let unclean = !meta.closed;
        if unclean && !recover {
            return Err(StoreError::NotClosedProperly);
        }

        let seglog = SegLog::open(meta.block_size, data_dir)?;
        let journal = Journal::open(journal_dir)?;

        let mut bundle = IndexBundle::new(&meta.addr_bits);
        let mut replayed = 0u64;
        journal.scan(|f, v| {
            bundle.set(f, v);
            replayed += 1;
        })?;

        let mut inner = Inner {
            seglog,
            journal,
            bundle,
            meta,
            meta_path: meta_path.to_owned(),
            log_records: 0,
        };

        if unclean {
            log::warn!("store was not closed properly; recovering meta counters");
            inner.recover_meta_info()?;
        }
        inner.meta.closed = false;
        inner.save_meta()?;

        log::info!(
            "opened store: {replayed} journal records replayed, {} active bytes",
            inner.meta.active_byte_count,
        );
        Ok(Self { inner: RwLock::new(inner) })
    }

    // ── Reads ────────────────────────────────────────────────────────────

    /// Look up `key`, returning an owned copy of its current value.
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        let inner = self.inner.read().expect("lock is poisoned");
        let f = fingerprint(inner.meta.seed, key);
        let Some(v32) = inner.bundle.get(f) else {
            return Ok(None);
        };
        let (slot, _) = inner.read_slot(v32 as u64 * SLOT_ALIGN as u64)?;
        Ok(slot.get(key).map(|v| v.to_vec()))
    }

    /// Sum of encoded lengths of slots currently reachable via the index.
    pub fn active_byte_count(&self) -> u64 {
        self.inner.read().expect("lock is poisoned").meta.active_byte_count
    }

    // ── Writes ───────────────────────────────────────────────────────────

    /// Map `key` to `value`.  An empty value is an ordinary value, distinct
    /// from a deletion.
    pub fn set(&self, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
        self.apply(key, Some(value))
    }

    /// Remove `key`.  Deleting an absent key is a no-op.
    pub fn delete(&self, key: &[u8]) -> Result<(), StoreError> {
        self.apply(key, None)
    }

    pub(crate) fn apply(&self, key: &[u8], value: Option<&[u8]>) -> Result<(), StoreError> {
        let mut inner = self.inner.write().expect("lock is poisoned");
        inner.update(key, value)
    }

    /// Flush the journal tail and the data-log tail to stable storage.
    pub fn sync(&self) -> Result<(), StoreError> {
        let inner = self.inner.read().expect("lock is poisoned");
        inner.journal.sync()?;
        inner.seglog.sync()?;
        Ok(())
    }

    /// Sync, mark the meta header closed, and persist it.  A store that is
    /// dropped without `close` will only reopen through
    /// [`Store::open_recover`].
    pub fn close(self) -> Result<(), StoreError> {
        let mut inner = self.inner.into_inner().expect("lock is poisoned");
        inner.journal.sync()?;
        inner.seglog.sync()?;
        inner.meta.closed = true;
        inner.save_meta()?;
        Ok(())
    }

    /// Start a write-coalescing batch over this store.
    pub fn batch(&self) -> Batch<'_> {
        Batch::new(self)
    }

    // ── Compaction ───────────────────────────────────────────────────────

    /// Relocate still-live slots from the head of the data log to its
    /// tail, then prune the vacated segment files.
    ///
    /// Scans at most `length_limit` bytes or `count_limit` slots from the
    /// GC cursor, whichever ends first.  The write lock is taken once per
    /// slot, not for the whole scan, so readers interleave freely.  A slot
    /// is relocated only when the index entry for its fingerprint still
    /// addresses it; anything else is garbage and is simply passed over.
    pub fn garbage_collect(&self, length_limit: u64, count_limit: u64) -> Result<(), StoreError> {
        let (start, end, seed) = {
            let inner = self.inner.read().expect("lock is poisoned");
            let start = inner.meta.next_gc_position;
            let end = inner.seglog.size().min(start.saturating_add(length_limit));
            (start, end, inner.meta.seed)
        };

        let mut pos = start;
        let mut visited = 0u64;
        while pos < end && visited < count_limit {
            let (slot, disk_len) = {
                let inner = self.inner.read().expect("lock is poisoned");
                inner.read_slot(pos)?
            };

            let mut inner = self.inner.write().expect("lock is poisoned");
            let key = slot.first_key().ok_or(StoreError::EmptySlot { pos })?;
            let f = fingerprint(seed, key);
            if let Some((at, v32)) = inner.bundle.find(f) {
                if v32 as u64 * SLOT_ALIGN as u64 == pos {
                    let new_v = inner.append_slot(&slot)?;
                    inner.bundle.set_at(f, at, new_v);
                    inner.write_log(f, new_v)?;
                }
            }
            inner.meta.next_gc_position = pos + disk_len;
            drop(inner);

            pos += disk_len;
            visited += 1;
        }

        let mut inner = self.inner.write().expect("lock is poisoned");
        let cut = inner.meta.next_gc_position;
        inner.seglog.prune_head(cut)?;
        inner.save_meta()?;
        log::debug!("gc visited {visited} slots, cursor now {cut}");
        Ok(())
    }
}

// ── Inner operations (always under the engine lock) ──────────────────────

impl Inner {
    /// Read and decode the slot starting at byte offset `pos`.  Returns
    /// the slot and its full on-disk footprint.
    fn read_slot(&self, pos: u64) -> Result<(Slot, u64), StoreError> {
        let mut prefix = [0u8; 4];
        self.seglog.read_at(&mut prefix, pos)?;
        let total_len = LittleEndian::read_u32(&prefix) as usize;
        // A slot never exceeds one block; a larger claim is a corrupt
        // prefix and must not drive the allocation below.
        if total_len as u64 + 4 > self.seglog.block_size() {
            return Err(StoreError::Slot(SlotError::UnexpectedEnd));
        }
        let mut body = vec![0u8; total_len];
        self.seglog.read_at(&mut body, pos + 4)?;
        let slot = Slot::decode(&body)?;
        let len = slot.encoded_len() as u64;
        Ok((slot, len))
    }

    /// Append an encoded slot to the data log and return its index value
    /// (start offset divided by 16).
    fn append_slot(&mut self, slot: &Slot) -> Result<u32, StoreError> {
        let enc = slot.encode();
        let end = self.seglog.append(&[&enc])?;
        let pos = end - enc.len() as u64;
        assert_eq!(pos % SLOT_ALIGN as u64, 0, "slot landed at unaligned offset {pos}");
        let v = pos / SLOT_ALIGN as u64;
        if v > u32::MAX as u64 {
            return Err(StoreError::AddressSpaceExhausted);
        }
        Ok(v as u32)
    }

    /// Mirror an index update into the journal, rotating when the tail has
    /// outgrown roughly four sub-index dumps.
    fn write_log(&mut self, f: u64, v: u32) -> Result<(), StoreError> {
        self.journal.append(f, v)?;
        self.log_records += 1;
        if self.log_records % ROTATION_CHECK_INTERVAL == 0 {
            let est_sub_bytes =
                self.bundle.estimated_count() * ENTRY_LENGTH_IN_LOG as u64 / 256;
            if self.journal.tail_size() > 4 * est_sub_bytes {
                self.journal.rotate(&self.bundle)?;
                self.save_meta()?; // records the current addr-bits hints
            }
        }
        Ok(())
    }

    fn save_meta(&mut self) -> Result<(), StoreError> {
        self.meta.addr_bits = self.bundle.addr_bits();
        self.meta.save(&self.meta_path)?;
        Ok(())
    }

    fn update(&mut self, key: &[u8], value: Option<&[u8]>) -> Result<(), StoreError> {
        let f = fingerprint(self.meta.seed, key);
        match self.bundle.find_x(f) {
            FindX::Found { at, value: v32 } => {
                let pos = v32 as u64 * SLOT_ALIGN as u64;
                let (mut slot, disk_len) = self.read_slot(pos)?;
                self.meta.active_byte_count -= disk_len;
                match value {
                    Some(val) => slot.add(key, val),
                    None => {
                        slot.remove(key);
                    }
                }
                if slot.is_empty() {
                    self.bundle.invalidate_at(f, at);
                    self.write_log(f, 0)?;
                } else {
                    let new_v = self.append_slot(&slot)?;
                    self.meta.active_byte_count += slot.encoded_len() as u64;
                    self.bundle.set_at(f, at, new_v);
                    self.write_log(f, new_v)?;
                }
                Ok(())
            }
            not_found => {
                // Deleting a key that was never written is a no-op.
                let Some(val) = value else {
                    return Ok(());
                };

                let mut outcome = not_found;
                if matches!(outcome, FindX::Full) {
                    self.bundle.enlarge_for_key(f);
                    outcome = self.bundle.find_x(f);
                }
                let FindX::CanInsert { at } = outcome else {
                    unreachable!("index not insertable after enlargement");
                };

                let slot = Slot::new(key, val);
                let new_v = self.append_slot(&slot)?;
                self.meta.active_byte_count += slot.encoded_len() as u64;
                self.bundle.set_at(f, at, new_v);
                self.write_log(f, new_v)?;
                Ok(())
            }
        }
    }

    /// Rebuild `next_gc_position` and `active_byte_count` after an unclean
    /// shutdown by rescanning `[next_gc_position, size)`.
    ///
    /// A slot counts only when the index entry for its fingerprint still
    /// addresses it; the cursor resets to the first such slot, or to the
    /// end of the log when nothing ahead of it is live.
    fn recover_meta_info(&mut self) -> Result<(), StoreError> {
        let start = self.meta.next_gc_position;
        let end = self.seglog.size();
        let mut first_live: Option<u64> = None;
        let mut active = 0u64;

        let mut pos = start;
        while pos < end {
            let (slot, disk_len) = self.read_slot(pos)?;
            let key = slot.first_key().ok_or(StoreError::EmptySlot { pos })?;
            let f = fingerprint(self.meta.seed, key);
            if self.bundle.get(f) == Some((pos / SLOT_ALIGN as u64) as u32) {
                first_live.get_or_insert(pos);
                active += disk_len;
            }
            pos += disk_len;
        }

        self.meta.next_gc_position = first_live.unwrap_or(end);
        self.meta.active_byte_count = active;
        log::info!(
            "recovered meta: cursor {}, {} active bytes",
            self.meta.next_gc_position,
            active,
        );
        Ok(())
    }
}
