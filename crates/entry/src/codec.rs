//! Serialize, parse and verify single records, and walk sectors looking for
//! them.
//!
//! A record is always written as one aligned buffer with a single partition
//! write, so a torn write leaves at most one bad record, which the checksum
//! catches on the next scan. Parsing reads the fixed header first, validates
//! the structural fields, and only then touches the variable tail.

use byteorder::{ByteOrder, LittleEndian};
use flash::{Address, FlashError, FlashPartition};
use log::{debug, warn};

use crate::format::{
    EntryFormat, EntryFormats, HEADER_SIZE, MAX_KEY_LENGTH, MIN_ALIGNMENT_BYTES,
};
use crate::EntryError;

/// The fixed 16-byte record header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryHeader {
    pub magic: u32,
    pub checksum: u32,
    pub alignment_units: u8,
    pub key_length: u8,
    pub value_length: u16,
    pub transaction_id: u32,
}

impl EntryHeader {
    /// Decodes a header from its on-flash bytes.
    pub fn parse(bytes: &[u8; HEADER_SIZE]) -> Self {
        Self {
            magic: LittleEndian::read_u32(&bytes[0..4]),
            checksum: LittleEndian::read_u32(&bytes[4..8]),
            alignment_units: bytes[8],
            key_length: bytes[9],
            value_length: LittleEndian::read_u16(&bytes[10..12]),
            transaction_id: LittleEndian::read_u32(&bytes[12..16]),
        }
    }

    /// Encodes the header. `zero_checksum` substitutes zero for the checksum
    /// field, as required while computing or verifying it.
    pub fn encode(&self, zero_checksum: bool) -> [u8; HEADER_SIZE] {
        let mut bytes = [0u8; HEADER_SIZE];
        LittleEndian::write_u32(&mut bytes[0..4], self.magic);
        LittleEndian::write_u32(
            &mut bytes[4..8],
            if zero_checksum { 0 } else { self.checksum },
        );
        bytes[8] = self.alignment_units;
        bytes[9] = self.key_length;
        LittleEndian::write_u16(&mut bytes[10..12], self.value_length);
        LittleEndian::write_u32(&mut bytes[12..16], self.transaction_id);
        bytes
    }

    /// The write alignment this record was encoded with.
    pub fn alignment_bytes(&self) -> usize {
        (usize::from(self.alignment_units) + 1) * MIN_ALIGNMENT_BYTES
    }

    /// Header + key + value, without padding.
    pub fn content_size(&self) -> usize {
        HEADER_SIZE + usize::from(self.key_length) + usize::from(self.value_length)
    }

    /// Total record size including padding.
    pub fn padded_size(&self) -> usize {
        round_up(self.content_size(), self.alignment_bytes())
    }
}

/// A parsed record at a known partition address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Entry {
    pub header: EntryHeader,
    pub address: Address,
}

impl Entry {
    /// Reads and structurally validates the record at `address`.
    ///
    /// Checks, in order: the magic is one of the configured formats, the key
    /// length is in `1..=127`, the record's alignment is no finer than the
    /// partition's, and the padded record fits inside its sector. Violations
    /// fail with [`EntryError::DataLoss`]; the checksum is *not* examined
    /// here (see [`Entry::verify`]).
    pub fn read(
        partition: &FlashPartition,
        formats: &EntryFormats,
        address: Address,
    ) -> Result<Entry, EntryError> {
        let mut bytes = [0u8; HEADER_SIZE];
        partition.read(address, &mut bytes)?;
        let header = EntryHeader::parse(&bytes);

        if !formats.recognizes(header.magic) {
            debug!("record at {address}: magic {:08x} not configured", header.magic);
            return Err(EntryError::DataLoss("unrecognized magic"));
        }
        if header.key_length == 0 || usize::from(header.key_length) > MAX_KEY_LENGTH {
            debug!("record at {address}: key length {}", header.key_length);
            return Err(EntryError::DataLoss("key length out of range"));
        }
        if header.alignment_bytes() < partition.alignment_bytes() {
            debug!(
                "record at {address}: alignment {} finer than partition {}",
                header.alignment_bytes(),
                partition.alignment_bytes()
            );
            return Err(EntryError::DataLoss("alignment finer than partition"));
        }
        let sector_size = partition.sector_size_bytes();
        let offset_in_sector = address as usize % sector_size;
        if offset_in_sector + header.padded_size() > sector_size {
            debug!(
                "record at {address}: {} bytes overrun the sector",
                header.padded_size()
            );
            return Err(EntryError::DataLoss("record overruns its sector"));
        }

        Ok(Entry { header, address })
    }

    /// Recomputes the record's checksum from flash and compares it against
    /// the stored value. Formats without a checksum verify trivially.
    pub fn verify(
        &self,
        partition: &FlashPartition,
        formats: &EntryFormats,
    ) -> Result<(), EntryError> {
        let format = formats
            .find(self.header.magic)
            .ok_or(EntryError::DataLoss("unrecognized magic"))?;
        let algorithm = match format.checksum {
            Some(algorithm) => algorithm,
            None => return Ok(()),
        };

        let mut tail = vec![0u8; self.size() - HEADER_SIZE];
        partition.read(self.address + HEADER_SIZE as Address, &mut tail)?;

        algorithm.reset();
        algorithm.update(&self.header.encode(true));
        algorithm.update(&tail);
        let computed = algorithm.value();
        if computed != self.header.checksum {
            warn!(
                "record at {}: checksum {computed:08x} does not match stored {:08x}",
                self.address, self.header.checksum
            );
            return Err(EntryError::DataLoss("checksum mismatch"));
        }
        Ok(())
    }

    /// Reads the key bytes back from flash.
    pub fn read_key(&self, partition: &FlashPartition) -> Result<Vec<u8>, EntryError> {
        let mut key = vec![0u8; usize::from(self.header.key_length)];
        partition.read(self.address + HEADER_SIZE as Address, &mut key)?;
        Ok(key)
    }

    /// Copies the value into `out`, truncating if `out` is short. Returns
    /// the number of bytes copied; the full value size is
    /// `header.value_length`.
    pub fn read_value(&self, partition: &FlashPartition, out: &mut [u8]) -> Result<usize, EntryError> {
        let value_offset = HEADER_SIZE + usize::from(self.header.key_length);
        let to_copy = out.len().min(usize::from(self.header.value_length));
        partition.read(
            self.address + value_offset as Address,
            &mut out[..to_copy],
        )?;
        Ok(to_copy)
    }

    /// Reads the whole padded record, for relocation or comparison.
    pub fn read_raw(&self, partition: &FlashPartition) -> Result<Vec<u8>, EntryError> {
        let mut raw = vec![0u8; self.size()];
        partition.read(self.address, &mut raw)?;
        Ok(raw)
    }

    /// True for tombstones.
    pub fn deleted(&self) -> bool {
        self.header.value_length == 0
    }

    pub fn transaction_id(&self) -> u32 {
        self.header.transaction_id
    }

    /// Total on-flash size including padding.
    pub fn size(&self) -> usize {
        self.header.padded_size()
    }

    /// First address past this record.
    pub fn next_address(&self) -> Address {
        self.address + self.size() as Address
    }

    /// Builds the complete on-flash image of a new record: header, key,
    /// value, and erased-byte padding, with the checksum computed and
    /// patched in when the format carries one.
    pub fn serialize(
        format: &EntryFormat,
        alignment_bytes: usize,
        key: &[u8],
        value: &[u8],
        transaction_id: u32,
        erased_byte: u8,
    ) -> Vec<u8> {
        debug_assert!(alignment_bytes % MIN_ALIGNMENT_BYTES == 0);
        debug_assert!(!key.is_empty() && key.len() <= MAX_KEY_LENGTH);

        let header = EntryHeader {
            magic: format.magic,
            checksum: 0,
            alignment_units: (alignment_bytes / MIN_ALIGNMENT_BYTES - 1) as u8,
            key_length: key.len() as u8,
            value_length: value.len() as u16,
            transaction_id,
        };

        let padded = header.padded_size();
        let mut image = Vec::with_capacity(padded);
        image.extend_from_slice(&header.encode(true));
        image.extend_from_slice(key);
        image.extend_from_slice(value);
        image.resize(padded, erased_byte);

        if let Some(algorithm) = format.checksum {
            algorithm.reset();
            algorithm.update(&image);
            LittleEndian::write_u32(&mut image[4..8], algorithm.value());
        }
        image
    }
}

/// One step of a sector walk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanStep {
    /// A configured magic starts at this address.
    Candidate(Address),
    /// Non-erased bytes that are not a recognized record.
    Garbage(Address),
    /// Everything from this address to the end of the region is erased.
    Tail(Address),
    /// The region is exhausted.
    End,
}

/// Examines the region starting at `address` (exclusive end `end`) and
/// classifies what is there. The caller advances by the partition alignment
/// after `Garbage`, or to the record's end after consuming a `Candidate`;
/// `end - address` must stay a multiple of the partition alignment so the
/// erased check remains legal.
pub fn next_entry_step(
    partition: &FlashPartition,
    formats: &EntryFormats,
    address: Address,
    end: Address,
) -> Result<ScanStep, FlashError> {
    if address >= end {
        return Ok(ScanStep::End);
    }
    let remaining = (end - address) as usize;

    // A record needs at least a full header; anything shorter is garbage or
    // tail no matter what the bytes say.
    if remaining >= HEADER_SIZE {
        let mut word = [0u8; 4];
        partition.read(address, &mut word)?;
        if formats.recognizes(LittleEndian::read_u32(&word)) {
            return Ok(ScanStep::Candidate(address));
        }
    }

    if partition.is_region_erased(address, remaining)? {
        Ok(ScanStep::Tail(address))
    } else {
        Ok(ScanStep::Garbage(address))
    }
}

fn round_up(value: usize, multiple: usize) -> usize {
    value.div_ceil(multiple) * multiple
}
