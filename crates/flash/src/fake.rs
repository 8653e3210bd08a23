//! RAM-backed [`FlashMemory`] with injectable read and write faults.
//!
//! Used by the store's tests to simulate power-loss artifacts, bad sectors
//! and transient driver failures without real hardware. Fault injection
//! comes in two flavors, matching how flash failures present in practice:
//!
//! - *unconditional*: the next `count` matching operations fail, optionally
//!   after letting `delay` operations through first;
//! - *in-range*: any operation touching an address range fails, for as long
//!   as the fault is installed.
//!
//! The buffer is reachable byte-by-byte through [`FakeFlash::set_byte`] and
//! friends so tests can corrupt entries without respecting alignment.

use std::cell::{Cell, RefCell};
use std::ops::Range;

use crate::{Address, FlashError, FlashMemory};

/// A single injected fault.
#[derive(Debug)]
pub struct FlashFault {
    kind: FlashError,
    range: Option<Range<Address>>,
    remaining: Cell<usize>,
    delay: Cell<usize>,
}

impl FlashFault {
    /// Fails the next `count` operations.
    pub fn unconditional(kind: FlashError, count: usize) -> Self {
        Self::with_delay(kind, count, 0)
    }

    /// Lets `delay` operations through, then fails the next `count`.
    pub fn with_delay(kind: FlashError, count: usize, delay: usize) -> Self {
        Self {
            kind,
            range: None,
            remaining: Cell::new(count),
            delay: Cell::new(delay),
        }
    }

    /// Fails every operation beginning inside `[start, start + length)`.
    pub fn in_range(kind: FlashError, start: Address, length: usize) -> Self {
        Self {
            kind,
            range: Some(start..start + length as Address),
            remaining: Cell::new(usize::MAX),
            delay: Cell::new(0),
        }
    }

    /// Checks whether this fault fires for an operation at `address`.
    fn check(&self, address: Address) -> Option<FlashError> {
        if let Some(range) = &self.range {
            if !range.contains(&address) {
                return None;
            }
        }
        if self.delay.get() > 0 {
            self.delay.set(self.delay.get() - 1);
            return None;
        }
        if self.remaining.get() == 0 {
            return None;
        }
        if self.remaining.get() != usize::MAX {
            self.remaining.set(self.remaining.get() - 1);
        }
        Some(self.kind)
    }
}

/// In-memory flash device for tests.
pub struct FakeFlash {
    sector_size: usize,
    sectors: usize,
    alignment: usize,
    buffer: RefCell<Vec<u8>>,
    read_faults: RefCell<Vec<FlashFault>>,
    write_faults: RefCell<Vec<FlashFault>>,
}

const ERASED: u8 = 0xff;

impl FakeFlash {
    /// Creates a device of `sectors` sectors of `sector_size` bytes each,
    /// with the given write alignment. The buffer starts erased.
    pub fn new(sector_size: usize, sectors: usize, alignment: usize) -> Self {
        assert!(alignment.is_power_of_two());
        assert_eq!(sector_size % alignment, 0);
        Self {
            sector_size,
            sectors,
            alignment,
            buffer: RefCell::new(vec![ERASED; sector_size * sectors]),
            read_faults: RefCell::new(Vec::new()),
            write_faults: RefCell::new(Vec::new()),
        }
    }

    /// Installs a fault on the read path.
    pub fn inject_read_error(&self, fault: FlashFault) {
        self.read_faults.borrow_mut().push(fault);
    }

    /// Installs a fault on the write path.
    pub fn inject_write_error(&self, fault: FlashFault) {
        self.write_faults.borrow_mut().push(fault);
    }

    /// Copies `data` into the buffer at `address`, ignoring alignment.
    /// Intended for seeding pre-built entry images.
    pub fn load(&self, address: Address, data: &[u8]) {
        let address = address as usize;
        self.buffer.borrow_mut()[address..address + data.len()].copy_from_slice(data);
    }

    /// Overwrites one byte, ignoring alignment.
    pub fn set_byte(&self, address: Address, value: u8) {
        self.buffer.borrow_mut()[address as usize] = value;
    }

    /// Adds one to a byte, wrapping. Flips the byte to a different value no
    /// matter what it currently holds.
    pub fn corrupt_byte(&self, address: Address) {
        let mut buffer = self.buffer.borrow_mut();
        buffer[address as usize] = buffer[address as usize].wrapping_add(1);
    }

    /// Reads one byte back, ignoring faults.
    pub fn byte_at(&self, address: Address) -> u8 {
        self.buffer.borrow()[address as usize]
    }

    /// Snapshot of a buffer region, ignoring faults.
    pub fn region(&self, address: Address, length: usize) -> Vec<u8> {
        let address = address as usize;
        self.buffer.borrow()[address..address + length].to_vec()
    }

    fn check_faults(
        &self,
        faults: &RefCell<Vec<FlashFault>>,
        address: Address,
    ) -> Result<(), FlashError> {
        for fault in faults.borrow().iter() {
            if let Some(kind) = fault.check(address) {
                return Err(kind);
            }
        }
        Ok(())
    }
}

impl FlashMemory for FakeFlash {
    fn sector_size_bytes(&self) -> usize {
        self.sector_size
    }

    fn sector_count(&self) -> usize {
        self.sectors
    }

    fn alignment_bytes(&self) -> usize {
        self.alignment
    }

    fn erased_memory_content(&self) -> u8 {
        ERASED
    }

    fn read(&self, address: Address, out: &mut [u8]) -> Result<usize, FlashError> {
        let start = address as usize;
        if start + out.len() > self.size_bytes() {
            return Err(FlashError::OutOfRange);
        }
        self.check_faults(&self.read_faults, address)?;
        out.copy_from_slice(&self.buffer.borrow()[start..start + out.len()]);
        Ok(out.len())
    }

    fn write(&self, address: Address, data: &[u8]) -> Result<usize, FlashError> {
        let start = address as usize;
        if start % self.alignment != 0 || data.len() % self.alignment != 0 {
            return Err(FlashError::InvalidArgument);
        }
        if start + data.len() > self.size_bytes() {
            return Err(FlashError::OutOfRange);
        }
        self.check_faults(&self.write_faults, address)?;
        self.buffer.borrow_mut()[start..start + data.len()].copy_from_slice(data);
        Ok(data.len())
    }

    fn erase(&self, address: Address, num_sectors: usize) -> Result<(), FlashError> {
        let start = address as usize;
        if start % self.sector_size != 0 {
            return Err(FlashError::InvalidArgument);
        }
        let length = num_sectors * self.sector_size;
        if start + length > self.size_bytes() {
            return Err(FlashError::OutOfRange);
        }
        self.buffer.borrow_mut()[start..start + length].fill(ERASED);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_erased() {
        let flash = FakeFlash::new(256, 2, 16);
        let mut out = [0u8; 32];
        flash.read(0, &mut out).unwrap();
        assert!(out.iter().all(|&b| b == 0xff));
    }

    #[test]
    fn write_read_roundtrip() {
        let flash = FakeFlash::new(256, 2, 16);
        let data = [0x42u8; 32];
        assert_eq!(flash.write(16, &data), Ok(32));

        let mut out = [0u8; 32];
        flash.read(16, &mut out).unwrap();
        assert_eq!(out, data);
    }

    #[test]
    fn erase_clears_only_selected_sectors() {
        let flash = FakeFlash::new(256, 2, 16);
        flash.write(0, &[0u8; 16]).unwrap();
        flash.write(256, &[0u8; 16]).unwrap();

        flash.erase(0, 1).unwrap();
        assert_eq!(flash.byte_at(0), 0xff);
        assert_eq!(flash.byte_at(256), 0x00);
    }

    // -------------------- Fault injection --------------------

    #[test]
    fn unconditional_read_fault_consumes_count() {
        let flash = FakeFlash::new(256, 2, 16);
        flash.inject_read_error(FlashFault::unconditional(FlashError::Internal, 2));

        let mut out = [0u8; 16];
        assert_eq!(flash.read(0, &mut out), Err(FlashError::Internal));
        assert_eq!(flash.read(0, &mut out), Err(FlashError::Internal));
        assert_eq!(flash.read(0, &mut out), Ok(16));
    }

    #[test]
    fn delayed_write_fault_skips_operations() {
        let flash = FakeFlash::new(256, 2, 16);
        flash.inject_write_error(FlashFault::with_delay(FlashError::Unavailable, 1, 2));

        let data = [0u8; 16];
        assert_eq!(flash.write(0, &data), Ok(16));
        assert_eq!(flash.write(16, &data), Ok(16));
        assert_eq!(flash.write(32, &data), Err(FlashError::Unavailable));
        assert_eq!(flash.write(48, &data), Ok(16));
    }

    #[test]
    fn ranged_read_fault_is_persistent() {
        let flash = FakeFlash::new(256, 2, 16);
        flash.inject_read_error(FlashFault::in_range(FlashError::Unauthenticated, 0, 32));

        let mut out = [0u8; 16];
        assert_eq!(flash.read(0, &mut out), Err(FlashError::Unauthenticated));
        assert_eq!(flash.read(16, &mut out), Err(FlashError::Unauthenticated));
        assert_eq!(flash.read(16, &mut out), Err(FlashError::Unauthenticated));
        assert_eq!(flash.read(32, &mut out), Ok(16));
    }

    #[test]
    fn corrupt_byte_changes_value() {
        let flash = FakeFlash::new(256, 2, 16);
        assert_eq!(flash.byte_at(7), 0xff);
        flash.corrupt_byte(7);
        assert_eq!(flash.byte_at(7), 0x00);
    }
}
