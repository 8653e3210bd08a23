//! Per-sector space accounting and write-destination selection.
//!
//! Each sector tracks the bytes backing live records (`valid`), the erased
//! free tail at its end (`writable`), and whether corruption was seen in it.
//! Reclaimable space is what remains: bytes consumed by superseded,
//! abandoned or corrupt records that the next collection of the sector will
//! free.
//!
//! One invariant shapes destination selection: outside of a running
//! collection, at least one sector must stay completely empty so compaction
//! always has somewhere to move records. Ordinary writes therefore refuse to
//! consume the last empty sector; collection itself is allowed to.

use flash::Address;

/// Bookkeeping for one sector.
#[derive(Debug, Clone)]
pub(crate) struct SectorDescriptor {
    valid_bytes: usize,
    writable_bytes: usize,
    corrupt: bool,
}

impl SectorDescriptor {
    fn new(sector_size: usize) -> Self {
        Self {
            valid_bytes: 0,
            writable_bytes: sector_size,
            corrupt: false,
        }
    }

    pub fn valid_bytes(&self) -> usize {
        self.valid_bytes
    }

    pub fn writable_bytes(&self) -> usize {
        self.writable_bytes
    }

    pub fn corrupt(&self) -> bool {
        self.corrupt
    }

    pub fn reclaimable_bytes(&self, sector_size: usize) -> usize {
        sector_size - self.valid_bytes - self.writable_bytes
    }

    pub fn is_empty(&self, sector_size: usize) -> bool {
        self.writable_bytes == sector_size
    }

    /// Corruption poisons the remaining tail; nothing more is written here
    /// until the sector is collected and erased.
    pub fn mark_corrupt(&mut self) {
        self.corrupt = true;
        self.writable_bytes = 0;
    }

    pub fn add_valid(&mut self, bytes: usize) {
        self.valid_bytes += bytes;
    }

    pub fn remove_valid(&mut self, bytes: usize) {
        self.valid_bytes = self.valid_bytes.saturating_sub(bytes);
    }

    /// Claims `bytes` from the free tail. The bytes only count as valid once
    /// the caller commits them via [`SectorDescriptor::add_valid`]; until
    /// then they are reclaimable, which is exactly right for abandoned
    /// writes.
    pub fn consume_tail(&mut self, bytes: usize) {
        debug_assert!(bytes <= self.writable_bytes);
        self.writable_bytes -= bytes;
    }

    /// Scan result: the erased tail of the sector.
    pub fn set_writable(&mut self, bytes: usize) {
        self.writable_bytes = bytes;
    }

    /// Back to factory-fresh after an erase.
    pub fn reset(&mut self, sector_size: usize) {
        *self = Self::new(sector_size);
    }
}

/// Fixed-capacity table of sector descriptors plus address arithmetic.
#[derive(Debug)]
pub(crate) struct SectorMap {
    sectors: Vec<SectorDescriptor>,
    sector_size: usize,
    capacity: usize,
}

impl SectorMap {
    pub fn new(capacity: usize) -> Self {
        Self {
            sectors: Vec::with_capacity(capacity),
            sector_size: 0,
            capacity,
        }
    }

    /// (Re)builds the table for a partition layout. Fails when the partition
    /// has more sectors than the table can hold.
    pub fn configure(&mut self, sector_count: usize, sector_size: usize) -> Result<(), ()> {
        if sector_count > self.capacity {
            return Err(());
        }
        self.sector_size = sector_size;
        self.sectors.clear();
        self.sectors
            .resize_with(sector_count, || SectorDescriptor::new(sector_size));
        Ok(())
    }

    pub fn sector_size(&self) -> usize {
        self.sector_size
    }

    pub fn len(&self) -> usize {
        self.sectors.len()
    }

    pub fn get(&self, index: usize) -> &SectorDescriptor {
        &self.sectors[index]
    }

    pub fn get_mut(&mut self, index: usize) -> &mut SectorDescriptor {
        &mut self.sectors[index]
    }

    pub fn base_address(&self, index: usize) -> Address {
        (index * self.sector_size) as Address
    }

    pub fn sector_of(&self, address: Address) -> usize {
        address as usize / self.sector_size
    }

    /// Next unwritten address in a sector's tail.
    pub fn append_address(&self, index: usize) -> Address {
        self.base_address(index) + (self.sector_size - self.get(index).writable_bytes()) as Address
    }

    pub fn empty_count(&self) -> usize {
        self.sectors
            .iter()
            .filter(|s| s.is_empty(self.sector_size))
            .count()
    }

    /// Picks the destination for a record of `size` bytes: the usable sector
    /// with the most free tail, ties broken toward the lower index. Sectors
    /// in `exclude` (already chosen for other copies of the same record, or
    /// being collected) never qualify, and unless `allow_reserved` is set
    /// the choice leaves at least one empty sector untouched, counting the
    /// excluded ones as spoken for.
    pub fn find_space(
        &self,
        size: usize,
        exclude: &[usize],
        allow_reserved: bool,
    ) -> Option<usize> {
        let excluded_empties = exclude
            .iter()
            .filter(|&&i| self.get(i).is_empty(self.sector_size))
            .count();
        let spare_empties = self.empty_count().saturating_sub(excluded_empties);

        let mut best: Option<usize> = None;
        for (i, sector) in self.sectors.iter().enumerate() {
            if sector.corrupt() || sector.writable_bytes() < size || exclude.contains(&i) {
                continue;
            }
            if !allow_reserved && sector.is_empty(self.sector_size) && spare_empties <= 1 {
                continue;
            }
            match best {
                Some(b) if self.get(b).writable_bytes() >= sector.writable_bytes() => {}
                _ => best = Some(i),
            }
        }
        best
    }

    /// The sector the next collection should target: most reclaimable
    /// bytes, ties toward the lower index. `None` when nothing is
    /// reclaimable.
    pub fn most_reclaimable(&self) -> Option<usize> {
        let mut best: Option<usize> = None;
        for (i, sector) in self.sectors.iter().enumerate() {
            let reclaimable = sector.reclaimable_bytes(self.sector_size);
            if reclaimable == 0 {
                continue;
            }
            match best {
                Some(b) if self.get(b).reclaimable_bytes(self.sector_size) >= reclaimable => {}
                _ => best = Some(i),
            }
        }
        best
    }

    pub fn in_use_bytes(&self) -> usize {
        self.sectors.iter().map(|s| s.valid_bytes()).sum()
    }

    pub fn reclaimable_bytes(&self) -> usize {
        self.sectors
            .iter()
            .map(|s| s.reclaimable_bytes(self.sector_size))
            .sum()
    }

    /// Free tail across the partition minus the reserved sector's worth,
    /// when a fully empty sector exists to reserve.
    pub fn writable_bytes(&self) -> usize {
        let total: usize = self.sectors.iter().map(|s| s.writable_bytes()).sum();
        if self.empty_count() > 0 {
            total - self.sector_size
        } else {
            total
        }
    }
}
