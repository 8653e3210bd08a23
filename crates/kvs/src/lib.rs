//! # KVS: a log-structured key-value store for NOR-like flash
//!
//! Small key-value records persisted on a medium that only supports sector
//! erase, aligned writes, and a fixed erased-byte pattern. Records are
//! appended to sector logs; an in-RAM index maps 32-bit key hashes to flash
//! addresses, and garbage collection compacts sectors to reclaim superseded
//! records. Each record may be stored in up to R redundant copies placed in
//! distinct sectors, so losing a sector loses no data.
//!
//! ## Shape of the store
//!
//! ```text
//! ┌───────────────┐   get/put/delete   ┌──────────────────┐
//! │ KeyValueStore │ ─────────────────> │ KeyIndex (RAM)   │
//! │               │                    │ hash -> id, addrs│
//! │               │                    └──────────────────┘
//! │               │   entry codec      ┌──────────────────┐
//! │               │ ─────────────────> │ FlashPartition   │
//! └───────────────┘                    └──────────────────┘
//! ```
//!
//! Keys themselves are never held in RAM; lookups compare the key bytes
//! read back from flash. All tables are sized at construction and never
//! grow. The store is single-threaded; callers serialize access.
//!
//! ## Crash safety
//!
//! Every record is written with one aligned buffer write and carries a
//! checksum, so a torn write is detected and reclaimed on the next
//! [`KeyValueStore::init`]. Records supersede each other through a
//! monotonically increasing transaction id; the highest verifiable id wins
//! at scan time.

mod index;
mod sectors;
mod store;

pub use store::KeyValueStore;

use entry::EntryError;
use flash::FlashError;
use thiserror::Error;

/// Errors returned by store operations.
///
/// Medium-level kinds ([`FlashError`]) are forwarded verbatim when a single
/// underlying failure caused the operation to fail; `DataLoss` means every
/// redundant copy of a requested record failed verification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum KvsError {
    #[error("key not found")]
    NotFound,
    #[error("all copies of the requested record failed verification")]
    DataLoss,
    #[error("no sector has enough free space")]
    ResourceExhausted,
    #[error("store has no usable sectors for this operation")]
    FailedPrecondition,
    #[error("invalid key, value or buffer")]
    InvalidArgument,
    #[error(transparent)]
    Flash(#[from] FlashError),
}

impl From<EntryError> for KvsError {
    fn from(error: EntryError) -> Self {
        match error {
            EntryError::DataLoss(_) => KvsError::DataLoss,
            EntryError::Flash(e) => KvsError::Flash(e),
        }
    }
}

/// When a `put` that cannot find space may trigger compaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GcOnWrite {
    /// Never compact on the write path; the put fails instead.
    Disabled,
    /// Compact at most one sector, then retry once.
    OneSector,
    /// Compact sector after sector until space is found or nothing is left
    /// to reclaim.
    AsNeeded,
}

/// How `init` reacts to corruption found during the scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorRecovery {
    /// Report `DataLoss` and touch nothing; the host decides when to run
    /// [`KeyValueStore::full_maintenance`].
    Manual,
    /// Collect corrupt sectors, restore redundancy and secure a free sector
    /// during `init`, reporting `Ok` when repair succeeds.
    Lazy,
}

/// Construction-time configuration. Capacities are hard limits; nothing
/// grows after construction.
#[derive(Debug, Clone, Copy)]
pub struct Options {
    pub gc_on_write: GcOnWrite,
    pub recovery: ErrorRecovery,
    /// Re-verify the checksum of every record read by `get`.
    pub verify_on_read: bool,
    /// Read every just-written record back and verify it.
    pub verify_on_write: bool,
    /// Key-descriptor table capacity.
    pub max_entries: usize,
    /// Sector-descriptor table capacity.
    pub max_usable_sectors: usize,
    /// Number of copies each record is written in (R >= 1).
    pub redundancy: usize,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            gc_on_write: GcOnWrite::OneSector,
            recovery: ErrorRecovery::Lazy,
            verify_on_read: true,
            verify_on_write: true,
            max_entries: 256,
            max_usable_sectors: 256,
            redundancy: 1,
        }
    }
}

/// A snapshot of the store's space accounting and repair counters.
///
/// The byte figures are derived from the current sector table; the two
/// `*_recovered` counters are cumulative since construction and survive
/// re-initialization.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StorageStats {
    /// Bytes backing live records (all redundant copies included).
    pub in_use_bytes: usize,
    /// Bytes that the next garbage collection can free.
    pub reclaimable_bytes: usize,
    /// Free tail bytes available for new records, excluding the one sector
    /// kept empty as the compaction destination.
    pub writable_bytes: usize,
    /// Corrupt sectors successfully collected and erased.
    pub corrupt_sectors_recovered: usize,
    /// Redundant copies rewritten to bring records back to R copies.
    pub missing_redundant_entries_recovered: usize,
}
