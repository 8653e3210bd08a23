//! # Flash
//!
//! The medium abstraction for the key-value store: an erasable, addressable
//! storage device with a fixed write alignment and a fixed erased-byte
//! pattern, plus a bounded [`FlashPartition`] view layered on top of it.
//!
//! A [`FlashMemory`] is divided into fixed-size sectors. Writes must be
//! aligned to the device's alignment; erases operate on whole sectors and
//! leave every byte equal to [`FlashMemory::erased_memory_content`]
//! (typically `0xFF` on NOR flash).
//!
//! All trait methods take `&self`; implementations that need mutable state
//! (such as the RAM-backed [`fake::FakeFlash`]) use interior mutability.
//! The store is single-threaded, so no synchronization is provided here.

use thiserror::Error;

pub mod fake;

pub use fake::{FakeFlash, FlashFault};

/// Byte address within a flash device or partition.
pub type Address = u32;

/// Errors produced by the medium and the partition layer.
///
/// `Unavailable`, `Internal` and `Unauthenticated` originate in the device
/// driver and are forwarded through the partition verbatim.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum FlashError {
    #[error("address or length exceeds bounds")]
    OutOfRange,
    #[error("write or erase on a read-only partition")]
    PermissionDenied,
    #[error("misaligned address or length")]
    InvalidArgument,
    #[error("medium unavailable")]
    Unavailable,
    #[error("internal medium failure")]
    Internal,
    #[error("medium authentication failure")]
    Unauthenticated,
}

/// An erasable, addressable storage device.
///
/// Implementations are provided by the host; the store only relies on the
/// contract below. `alignment_bytes` must be a power of two >= 1, and
/// `sector_size_bytes` must be a multiple of it.
pub trait FlashMemory {
    /// Size of the erase unit in bytes.
    fn sector_size_bytes(&self) -> usize;

    /// Number of sectors in the device.
    fn sector_count(&self) -> usize;

    /// Minimum read/write granularity in bytes.
    fn alignment_bytes(&self) -> usize;

    /// The byte value every cell holds after an erase.
    fn erased_memory_content(&self) -> u8;

    /// Reads `out.len()` bytes starting at `address`. Returns the number of
    /// bytes read.
    fn read(&self, address: Address, out: &mut [u8]) -> Result<usize, FlashError>;

    /// Writes `data` starting at `address`; both must respect the device
    /// alignment. Returns the number of bytes written.
    fn write(&self, address: Address, data: &[u8]) -> Result<usize, FlashError>;

    /// Erases `num_sectors` sectors beginning at the sector-aligned
    /// `address`.
    fn erase(&self, address: Address, num_sectors: usize) -> Result<(), FlashError>;

    /// Total device capacity in bytes.
    fn size_bytes(&self) -> usize {
        self.sector_size_bytes() * self.sector_count()
    }
}

/// Access permission of a [`FlashPartition`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartitionPermission {
    ReadOnly,
    ReadWrite,
}

/// A bounded view of a [`FlashMemory`].
///
/// The partition starts at a sector index, spans a sector count, and carries
/// its own alignment (a multiple of the device alignment) and permission.
/// Addresses passed to partition methods are relative to the partition
/// start; bounds are checked before forwarding to the device.
pub struct FlashPartition<'a> {
    flash: &'a dyn FlashMemory,
    start_sector: usize,
    sector_count: usize,
    alignment_bytes: usize,
    permission: PartitionPermission,
}

impl<'a> FlashPartition<'a> {
    /// Creates a writable partition covering the whole device, using the
    /// device's own alignment.
    pub fn new(flash: &'a dyn FlashMemory) -> Self {
        Self {
            start_sector: 0,
            sector_count: flash.sector_count(),
            alignment_bytes: flash.alignment_bytes(),
            permission: PartitionPermission::ReadWrite,
            flash,
        }
    }

    /// Creates a partition over `[start_sector, start_sector + sector_count)`
    /// with an explicit alignment and permission.
    ///
    /// The alignment must be a nonzero multiple of the device alignment, and
    /// the sector range must lie within the device.
    pub fn with_layout(
        flash: &'a dyn FlashMemory,
        start_sector: usize,
        sector_count: usize,
        alignment_bytes: usize,
        permission: PartitionPermission,
    ) -> Result<Self, FlashError> {
        if alignment_bytes == 0 || alignment_bytes % flash.alignment_bytes() != 0 {
            return Err(FlashError::InvalidArgument);
        }
        if start_sector + sector_count > flash.sector_count() {
            return Err(FlashError::OutOfRange);
        }
        Ok(Self {
            flash,
            start_sector,
            sector_count,
            alignment_bytes,
            permission,
        })
    }

    pub fn sector_size_bytes(&self) -> usize {
        self.flash.sector_size_bytes()
    }

    pub fn sector_count(&self) -> usize {
        self.sector_count
    }

    pub fn alignment_bytes(&self) -> usize {
        self.alignment_bytes
    }

    pub fn size_bytes(&self) -> usize {
        self.sector_size_bytes() * self.sector_count
    }

    /// The byte value erased regions read back as.
    pub fn erased_byte(&self) -> u8 {
        self.flash.erased_memory_content()
    }

    pub fn writable(&self) -> bool {
        self.permission == PartitionPermission::ReadWrite
    }

    /// Bounds-checked read; forwards device errors verbatim.
    pub fn read(&self, address: Address, out: &mut [u8]) -> Result<usize, FlashError> {
        self.check_bounds(address, out.len())?;
        self.flash.read(self.to_flash_address(address), out)
    }

    /// Aligned, bounds-checked write. Both `address` and `data.len()` must
    /// be multiples of the partition alignment.
    pub fn write(&self, address: Address, data: &[u8]) -> Result<usize, FlashError> {
        if self.permission == PartitionPermission::ReadOnly {
            return Err(FlashError::PermissionDenied);
        }
        if address as usize % self.alignment_bytes != 0 || data.len() % self.alignment_bytes != 0
        {
            return Err(FlashError::InvalidArgument);
        }
        self.check_bounds(address, data.len())?;
        self.flash.write(self.to_flash_address(address), data)
    }

    /// Erases `num_sectors` sectors starting at the sector-aligned
    /// `address`.
    pub fn erase(&self, address: Address, num_sectors: usize) -> Result<(), FlashError> {
        if self.permission == PartitionPermission::ReadOnly {
            return Err(FlashError::PermissionDenied);
        }
        if address as usize % self.sector_size_bytes() != 0 {
            return Err(FlashError::InvalidArgument);
        }
        self.check_bounds(address, num_sectors * self.sector_size_bytes())?;
        self.flash.erase(self.to_flash_address(address), num_sectors)
    }

    /// Erases the entire partition.
    pub fn erase_all(&self) -> Result<(), FlashError> {
        self.erase(0, self.sector_count)
    }

    /// Returns true iff every byte in `[address, address + length)` equals
    /// the erased byte. `length` must be a multiple of the partition
    /// alignment.
    pub fn is_region_erased(&self, address: Address, length: usize) -> Result<bool, FlashError> {
        if length % self.alignment_bytes != 0 {
            return Err(FlashError::InvalidArgument);
        }
        let erased = self.erased_byte();
        let mut buffer = [0u8; 64];
        let mut offset = 0;
        while offset < length {
            let chunk = buffer.len().min(length - offset);
            self.read(address + offset as Address, &mut buffer[..chunk])?;
            if buffer[..chunk].iter().any(|&b| b != erased) {
                return Ok(false);
            }
            offset += chunk;
        }
        Ok(true)
    }

    fn check_bounds(&self, address: Address, length: usize) -> Result<(), FlashError> {
        if address as usize + length > self.size_bytes() {
            log::error!(
                "out-of-bounds partition access (address: {}, length: {})",
                address,
                length
            );
            return Err(FlashError::OutOfRange);
        }
        Ok(())
    }

    fn to_flash_address(&self, address: Address) -> Address {
        (self.start_sector * self.sector_size_bytes()) as Address + address
    }
}
