//! # Entry: the on-flash record codec
//!
//! Every value stored by the engine lives on flash as a self-describing
//! *entry*: a fixed 16-byte header followed by the key, the value, and
//! enough erased-pattern padding to round the record up to its write
//! alignment.
//!
//! ## Record layout
//!
//! ```text
//! ┌────────────────────────────────────────────────────┐
//! │ offset  size  field                                │
//! │ 0       4     magic            (u32 LE)            │
//! │ 4       4     checksum         (u32 LE, 0 while    │
//! │                                 computing)         │
//! │ 8       1     alignment_units  ((bytes / 16) - 1)  │
//! │ 9       1     key_length       (1..=127)           │
//! │ 10      2     value_length     (u16 LE)            │
//! │ 12      4     transaction_id   (u32 LE)            │
//! │ 16      K     key bytes                            │
//! │ 16+K    V     value bytes                          │
//! │ ...     P     padding to a multiple of alignment   │
//! └────────────────────────────────────────────────────┘
//! ```
//!
//! The magic selects an [`EntryFormat`]; several formats (each with its own
//! optional [`ChecksumAlgorithm`]) may coexist in one store. The checksum is
//! computed over the whole padded record with the checksum field zeroed. A
//! `value_length` of zero marks a tombstone.
//!
//! All integers are little-endian.

mod checksum;
mod codec;
mod format;

pub use checksum::{ChecksumAlgorithm, Crc32Checksum, SumChecksum};
pub use codec::{next_entry_step, Entry, EntryHeader, ScanStep};
pub use format::{EntryFormat, EntryFormats, HEADER_SIZE, MAX_KEY_LENGTH, MIN_ALIGNMENT_BYTES};

use flash::FlashError;
use thiserror::Error;

/// Errors surfaced by the codec.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum EntryError {
    /// The record failed structural validation or its checksum.
    #[error("entry failed verification: {0}")]
    DataLoss(&'static str),
    /// Forwarded from the medium unchanged.
    #[error(transparent)]
    Flash(#[from] FlashError),
}
