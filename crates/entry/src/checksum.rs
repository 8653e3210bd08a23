//! Incremental checksum state behind an object-safe trait.
//!
//! An [`EntryFormat`](crate::EntryFormat) holds `Option<&dyn
//! ChecksumAlgorithm>`, so the trait takes `&self` everywhere and
//! implementations keep their running state in interior-mutable cells. The
//! store is single-threaded; nothing here synchronizes.

use std::cell::{Cell, RefCell};

use crc32fast::Hasher as Crc32;

/// Algorithm-agnostic incremental checksum with a fixed 4-byte result.
pub trait ChecksumAlgorithm {
    /// Clears the running state.
    fn reset(&self);

    /// Feeds `data` into the running state.
    fn update(&self, data: &[u8]);

    /// A finished view of the current state. Does not consume the state;
    /// further `update` calls continue from where they left off.
    fn value(&self) -> u32;

    /// Convenience comparison against a stored checksum.
    fn verify(&self, expected: u32) -> bool {
        self.value() == expected
    }
}

/// CRC32 (IEEE) checksum, the production default.
pub struct Crc32Checksum {
    state: RefCell<Crc32>,
}

impl Crc32Checksum {
    pub fn new() -> Self {
        Self {
            state: RefCell::new(Crc32::new()),
        }
    }
}

impl Default for Crc32Checksum {
    fn default() -> Self {
        Self::new()
    }
}

impl ChecksumAlgorithm for Crc32Checksum {
    fn reset(&self) {
        *self.state.borrow_mut() = Crc32::new();
    }

    fn update(&self, data: &[u8]) {
        self.state.borrow_mut().update(data);
    }

    fn value(&self) -> u32 {
        self.state.borrow().clone().finalize()
    }
}

/// Wrapping sum of bytes. Cheap enough for the smallest targets and for
/// hand-computing expected values in tests.
pub struct SumChecksum {
    state: Cell<u32>,
}

impl SumChecksum {
    pub fn new() -> Self {
        Self {
            state: Cell::new(0),
        }
    }
}

impl Default for SumChecksum {
    fn default() -> Self {
        Self::new()
    }
}

impl ChecksumAlgorithm for SumChecksum {
    fn reset(&self) {
        self.state.set(0);
    }

    fn update(&self, data: &[u8]) {
        let mut state = self.state.get();
        for &b in data {
            state = state.wrapping_add(u32::from(b));
        }
        self.state.set(state);
    }

    fn value(&self) -> u32 {
        self.state.get()
    }
}
