//! # burrow — embedded append-only key-value store
//!
//! Maps arbitrary byte keys to arbitrary byte values with a fixed-shape
//! in-memory index over variable-sized persisted records.
//!
//! Store guarantees:
//! - Every persisted record is self-describing and checksummed: slots and
//!   the meta header carry a mandatory CRC32, journal records an XOR byte;
//!   corrupt records abort reads, never degrade silently
//! - Keys are located through a 64-bit seeded fingerprint: the high byte
//!   picks one of 256 independent sub-indexes, the low 32 bits are the
//!   in-table key; sub-indexes grow on their own, one address bit at a time
//! - The data log is append-only and segmented; old segments are reclaimed
//!   from the head by the compactor, never rewritten in place
//! - The journal makes the in-memory index rebuildable on open without
//!   rescanning the data log, and its retention window always contains a
//!   full dump of every sub-index
//! - A clean `close` is recorded in the meta header; an unclean shutdown
//!   is refused on `open` and repaired only by the explicit `open_recover`
//! - Writers are exclusive, readers are concurrent, and durability is
//!   explicit: data reaches stable storage on `sync`, `close`, or batch
//!   close

pub mod batch;
pub mod hash;
pub mod index;
pub mod journal;
pub mod meta;
pub mod seglog;
pub mod slot;
pub mod store;

// Flat re-exports for the most common types.
pub use batch::Batch;
pub use index::{EntryRef, FindX, IndexBundle, TripleIndex, MIN_ADDR_BITS};
pub use journal::{Journal, JournalError, EFFECTIVE_FILE_COUNT, ENTRY_LENGTH_IN_LOG};
pub use meta::{MetaError, MetaInfo, META_INFO_BYTES};
pub use seglog::{SegLog, SegLogError};
pub use slot::{Slot, SlotError, SLOT_ALIGN};
pub use store::{Options, Store, StoreError, DEFAULT_BLOCK_SIZE};
