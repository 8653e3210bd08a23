//! The store engine: scan and index construction, reads and writes with
//! N-way redundancy, garbage collection, and repair.
//!
//! ## How space moves
//!
//! A record's bytes pass through three states inside a sector: free tail,
//! consumed, and valid. The write path claims tail bytes before writing and
//! only counts them as valid once every redundant copy is on flash, so a
//! failed put leaves its bytes consumed-but-stale and they are reclaimed by
//! the next collection of that sector instead of being overwritten.
//!
//! ## Recovery
//!
//! `init` rebuilds the whole index from a sector-by-sector scan. Under
//! [`ErrorRecovery::Lazy`] it then collects corrupt sectors, secures one
//! empty sector for compaction, and rewrites missing redundant copies;
//! under [`ErrorRecovery::Manual`] it reports `DataLoss` and leaves the
//! flash untouched until the host runs
//! [`KeyValueStore::full_maintenance`].

use entry::{
    next_entry_step, Entry, EntryFormat, EntryFormats, ScanStep, HEADER_SIZE, MAX_KEY_LENGTH,
    MIN_ALIGNMENT_BYTES,
};
use flash::{Address, FlashPartition};
use log::{debug, error, warn};

use crate::index::{key_hash, KeyDescriptor, KeyIndex, KeyState};
use crate::sectors::SectorMap;
use crate::{ErrorRecovery, GcOnWrite, KvsError, Options, StorageStats};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum InitState {
    NotInitialized,
    /// Usable for reads and writes, but corruption was seen and structural
    /// guarantees (like the reserved empty sector) may not hold.
    NeedsCleaning,
    Ready,
}

/// A log-structured key-value store over one [`FlashPartition`].
///
/// All capacities are fixed by [`Options`] at construction. The store is
/// single-threaded; callers serialize access.
pub struct KeyValueStore<'a> {
    partition: &'a FlashPartition<'a>,
    formats: EntryFormats<'a>,
    options: Options,
    index: KeyIndex,
    sectors: SectorMap,
    state: InitState,
    error_detected: bool,
    last_transaction_id: u32,
    corrupt_sectors_recovered: usize,
    missing_redundant_entries_recovered: usize,
}

impl<'a> KeyValueStore<'a> {
    /// Builds an uninitialized store; call [`KeyValueStore::init`] before
    /// anything else. `formats` must be non-empty and `options.redundancy`
    /// at least 1.
    pub fn new(
        partition: &'a FlashPartition<'a>,
        formats: &'a [EntryFormat<'a>],
        options: Options,
    ) -> Self {
        assert!(options.redundancy >= 1, "redundancy must be at least 1");
        Self {
            partition,
            formats: EntryFormats::new(formats),
            index: KeyIndex::new(options.max_entries),
            sectors: SectorMap::new(options.max_usable_sectors),
            options,
            state: InitState::NotInitialized,
            error_detected: false,
            last_transaction_id: 0,
            corrupt_sectors_recovered: 0,
            missing_redundant_entries_recovered: 0,
        }
    }

    /// Scans every sector, rebuilds the index and sector accounting, and
    /// runs recovery according to [`Options::recovery`].
    ///
    /// May be called again at any time to resynchronize with the flash
    /// contents; the repair counters are cumulative across calls.
    pub fn init(&mut self) -> Result<(), KvsError> {
        if self
            .sectors
            .configure(
                self.partition.sector_count(),
                self.partition.sector_size_bytes(),
            )
            .is_err()
        {
            error!(
                "partition has {} sectors but the store only handles {}",
                self.partition.sector_count(),
                self.options.max_usable_sectors
            );
            return Err(KvsError::FailedPrecondition);
        }

        self.state = InitState::NotInitialized;
        self.error_detected = false;
        self.index.clear();
        self.last_transaction_id = 0;

        self.scan_all_sectors();

        if self.options.recovery == ErrorRecovery::Lazy {
            self.repair();
        }

        self.state = if !self.error_detected && self.sectors.empty_count() > 0 {
            InitState::Ready
        } else {
            InitState::NeedsCleaning
        };

        if self.error_detected {
            warn!("initialized with unrepaired corruption");
            return Err(KvsError::DataLoss);
        }
        Ok(())
    }

    /// Copies the value for `key` into `out`, truncating if `out` is short.
    /// Returns the full value size. Redundant copies are tried in order;
    /// only when every copy fails does the call fail with `DataLoss`.
    pub fn get(&mut self, key: &str, out: &mut [u8]) -> Result<usize, KvsError> {
        self.check_operation(key)?;
        let position = self.find_descriptor(key.as_bytes()).ok_or(KvsError::NotFound)?;
        if self.index.get(position).state == KeyState::Deleted {
            return Err(KvsError::NotFound);
        }

        let addresses = self.index.get(position).addresses().to_vec();
        for address in addresses {
            let record = match Entry::read(self.partition, &self.formats, address) {
                Ok(record) => record,
                Err(e) => {
                    self.note_lost_copy(address, e.into());
                    continue;
                }
            };
            if self.options.verify_on_read {
                if let Err(e) = record.verify(self.partition, &self.formats) {
                    self.note_corrupt_copy(address, e.into());
                    continue;
                }
            }
            match record.read_value(self.partition, out) {
                Ok(_) => return Ok(usize::from(record.header.value_length)),
                Err(e) => self.note_lost_copy(address, e.into()),
            }
        }
        Err(KvsError::DataLoss)
    }

    /// Size of the stored value without reading it out.
    pub fn value_size(&self, key: &str) -> Result<usize, KvsError> {
        self.check_operation(key)?;
        let position = self.find_descriptor(key.as_bytes()).ok_or(KvsError::NotFound)?;
        if self.index.get(position).state == KeyState::Deleted {
            return Err(KvsError::NotFound);
        }
        for &address in self.index.get(position).addresses() {
            if let Ok(record) = Entry::read(self.partition, &self.formats, address) {
                return Ok(usize::from(record.header.value_length));
            }
        }
        Err(KvsError::DataLoss)
    }

    /// Writes `key` -> `value` as a new record with the next transaction
    /// id, in R copies placed in distinct sectors. Updates reuse the format
    /// the key was last written with; new keys use the first configured
    /// format. An empty value is a tombstone, making this equivalent to
    /// [`KeyValueStore::delete`].
    pub fn put(&mut self, key: &str, value: &[u8]) -> Result<(), KvsError> {
        self.check_mutation(key)?;
        if value.len() > usize::from(u16::MAX) || !self.record_fits(key.len(), value.len()) {
            return Err(KvsError::InvalidArgument);
        }

        match self.find_descriptor(key.as_bytes()) {
            Some(position) => {
                let magic = self.current_magic(position)?;
                let format = self
                    .formats
                    .find(magic)
                    .ok_or(KvsError::DataLoss)?;
                self.write_record(Some(position), key.as_bytes(), value, format)
            }
            None => {
                if self.index.is_full() {
                    return Err(KvsError::ResourceExhausted);
                }
                self.write_record(None, key.as_bytes(), value, self.formats.primary())
            }
        }
    }

    /// Writes a tombstone for `key`. The key reads as absent afterwards;
    /// the tombstone itself is dropped by the next full maintenance.
    pub fn delete(&mut self, key: &str) -> Result<(), KvsError> {
        self.check_mutation(key)?;
        let position = self.find_descriptor(key.as_bytes()).ok_or(KvsError::NotFound)?;
        if self.index.get(position).state == KeyState::Deleted {
            return Err(KvsError::NotFound);
        }
        let magic = self.current_magic(position)?;
        let format = self.formats.find(magic).ok_or(KvsError::DataLoss)?;
        self.write_record(Some(position), key.as_bytes(), &[], format)
    }

    /// Re-verifies every indexed copy, compacts every sector holding
    /// reclaimable, corrupt or tombstoned data, drops tombstones, and
    /// rewrites missing redundant copies. Clears the error flag on success.
    /// Idempotent at steady state.
    pub fn full_maintenance(&mut self) -> Result<(), KvsError> {
        if self.state == InitState::NotInitialized {
            return Err(KvsError::FailedPrecondition);
        }
        self.verify_copies();
        while let Some(sector) = self.next_maintenance_target() {
            self.garbage_collect_sector(sector, true)?;
        }
        self.restore_redundancy()?;
        self.error_detected = false;
        self.state = InitState::Ready;
        debug!("maintenance complete");
        Ok(())
    }

    // -------------------- Accessors --------------------

    /// Number of keys currently holding a value.
    pub fn size(&self) -> usize {
        self.index.live_count()
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    /// True once `init` completed with all structural guarantees intact.
    pub fn initialized(&self) -> bool {
        self.state == InitState::Ready
    }

    /// True if any scan, read-verify or write failure has been seen since
    /// the last successful repair. Cleared only by a full maintenance (or a
    /// fully clean re-init).
    pub fn error_detected(&self) -> bool {
        self.error_detected
    }

    /// Number of copies each record is written in.
    pub fn redundancy(&self) -> usize {
        self.options.redundancy
    }

    /// Key-descriptor capacity.
    pub fn max_size(&self) -> usize {
        self.index.capacity()
    }

    /// The highest transaction id handed out so far.
    pub fn transaction_count(&self) -> u32 {
        self.last_transaction_id
    }

    pub fn storage_stats(&self) -> StorageStats {
        StorageStats {
            in_use_bytes: self.sectors.in_use_bytes(),
            reclaimable_bytes: self.sectors.reclaimable_bytes(),
            writable_bytes: self.sectors.writable_bytes(),
            corrupt_sectors_recovered: self.corrupt_sectors_recovered,
            missing_redundant_entries_recovered: self.missing_redundant_entries_recovered,
        }
    }

    // -------------------- Scan --------------------

    fn scan_all_sectors(&mut self) {
        let step = self.partition.alignment_bytes() as Address;
        let sector_size = self.partition.sector_size_bytes();

        for sector in 0..self.sectors.len() {
            let base = self.sectors.base_address(sector);
            let end = base + sector_size as Address;
            let mut address = base;
            let mut corrupt = false;
            let mut tail = 0usize;

            while address < end {
                match next_entry_step(self.partition, &self.formats, address, end) {
                    Ok(ScanStep::Candidate(at)) => match self.load_record(at) {
                        Ok(record) => {
                            let next = record.next_address();
                            if !self.record_scanned_entry(sector, &record) {
                                corrupt = true;
                            }
                            address = next;
                            continue;
                        }
                        Err(e) => {
                            debug!("sector {sector}: bad record at {at}: {e}");
                            corrupt = true;
                        }
                    },
                    Ok(ScanStep::Garbage(at)) => {
                        debug!("sector {sector}: unrecognized bytes at {at}");
                        corrupt = true;
                    }
                    Ok(ScanStep::Tail(at)) => {
                        tail = (end - at) as usize;
                        break;
                    }
                    Ok(ScanStep::End) => break,
                    Err(e) => {
                        debug!("sector {sector}: read failed at {address}: {e}");
                        corrupt = true;
                    }
                }
                address += step;
            }

            let descriptor = self.sectors.get_mut(sector);
            if corrupt {
                descriptor.mark_corrupt();
                self.error_detected = true;
                warn!("sector {sector} holds corruption");
            } else {
                descriptor.set_writable(tail);
            }
        }
    }

    /// Reads and fully verifies the record at `address`. Scan always
    /// verifies checksums regardless of `verify_on_read`.
    fn load_record(&self, address: Address) -> Result<Entry, KvsError> {
        let record = Entry::read(self.partition, &self.formats, address)?;
        record.verify(self.partition, &self.formats)?;
        Ok(record)
    }

    /// Folds one verified record into the index. Returns false when the
    /// record indicates corruption (a duplicate beyond the redundancy
    /// level, or conflicting records sharing a transaction id).
    fn record_scanned_entry(&mut self, sector: usize, record: &Entry) -> bool {
        self.last_transaction_id = self.last_transaction_id.max(record.transaction_id());

        let key = match record.read_key(self.partition) {
            Ok(key) => key,
            Err(_) => return false,
        };
        let hash = key_hash(&key);
        let state = if record.deleted() {
            KeyState::Deleted
        } else {
            KeyState::Valid
        };

        // Scan-time identity is the hash; key bytes disambiguate later, at
        // get/put time.
        let Some(position) = self.index.candidates(hash).next() else {
            let mut descriptor = KeyDescriptor::new(hash, record.transaction_id(), state);
            descriptor.add_address(record.address);
            if self.index.insert(descriptor).is_err() {
                error!("key table full during scan; dropping records");
                return false;
            }
            self.sectors.get_mut(sector).add_valid(record.size());
            return true;
        };

        let known_id = self.index.get(position).transaction_id;
        if record.transaction_id() > known_id {
            // This record supersedes every copy we knew about.
            let old: Vec<Address> = self.index.get(position).addresses().to_vec();
            for address in old {
                self.mark_stale_address(address);
            }
            self.index
                .get_mut(position)
                .update(record.transaction_id(), state, vec![record.address]);
            self.sectors.get_mut(sector).add_valid(record.size());
            return true;
        }
        if record.transaction_id() < known_id {
            // Superseded already; its bytes stay reclaimable.
            return true;
        }

        // Same transaction id: a redundant copy if the payload is
        // bit-identical and the redundancy level has room, corruption
        // otherwise.
        if self.index.get(position).addresses().len() >= self.options.redundancy {
            debug!("duplicate record beyond redundancy at {}", record.address);
            return false;
        }
        let first = self.index.get(position).addresses()[0];
        match self.records_identical(first, record) {
            Ok(true) => {
                self.index.get_mut(position).add_address(record.address);
                self.sectors.get_mut(sector).add_valid(record.size());
                true
            }
            Ok(false) => {
                debug!(
                    "records at {} and {} share id {} but differ",
                    first,
                    record.address,
                    record.transaction_id()
                );
                false
            }
            Err(_) => false,
        }
    }

    fn records_identical(&self, known: Address, candidate: &Entry) -> Result<bool, KvsError> {
        let known = Entry::read(self.partition, &self.formats, known)?;
        if known.size() != candidate.size() {
            return Ok(false);
        }
        let a = known.read_raw(self.partition)?;
        let b = candidate.read_raw(self.partition)?;
        Ok(a == b)
    }

    /// A record stopped being the live version; its bytes become
    /// reclaimable in their sector.
    fn mark_stale_address(&mut self, address: Address) {
        match Entry::read(self.partition, &self.formats, address) {
            Ok(record) => {
                let sector = self.sectors.sector_of(address);
                self.sectors.get_mut(sector).remove_valid(record.size());
            }
            Err(e) => debug!("stale record at {address} unreadable: {e}"),
        }
    }

    // -------------------- Lookup --------------------

    /// Finds the descriptor for `key`, confirming hash candidates by
    /// reading the key bytes back from flash. A candidate none of whose
    /// copies can be read at all is assumed to match: the caller's read of
    /// the value will surface the loss.
    fn find_descriptor(&self, key: &[u8]) -> Option<usize> {
        let hash = key_hash(key);
        let candidates: Vec<usize> = self.index.candidates(hash).collect();
        for position in candidates {
            let mut confirmed_other = false;
            for &address in self.index.get(position).addresses() {
                let stored = Entry::read(self.partition, &self.formats, address)
                    .and_then(|record| record.read_key(self.partition));
                match stored {
                    Ok(stored) => {
                        if stored == key {
                            return Some(position);
                        }
                        confirmed_other = true;
                        break;
                    }
                    Err(_) => continue,
                }
            }
            if !confirmed_other && !self.index.get(position).addresses().is_empty() {
                return Some(position);
            }
        }
        None
    }

    fn current_magic(&self, position: usize) -> Result<u32, KvsError> {
        for &address in self.index.get(position).addresses() {
            if let Ok(record) = Entry::read(self.partition, &self.formats, address) {
                return Ok(record.header.magic);
            }
        }
        Err(KvsError::DataLoss)
    }

    // -------------------- Write path --------------------

    fn write_record(
        &mut self,
        existing: Option<usize>,
        key: &[u8],
        value: &[u8],
        format: &EntryFormat,
    ) -> Result<(), KvsError> {
        let id = self.last_transaction_id.wrapping_add(1);
        self.last_transaction_id = id;

        let image = Entry::serialize(
            format,
            self.record_alignment(),
            key,
            value,
            id,
            self.partition.erased_byte(),
        );

        let destinations = self.select_destinations(image.len())?;
        let mut addresses: Vec<Address> = Vec::with_capacity(destinations.len());
        for &sector in &destinations {
            let address = self.sectors.append_address(sector);
            self.sectors.get_mut(sector).consume_tail(image.len());
            if let Err(e) = self.write_and_verify(address, &image) {
                // This copy's sector takes no more writes until collected;
                // copies already written stay behind as stale bytes.
                self.sectors.get_mut(sector).mark_corrupt();
                self.error_detected = true;
                error!(
                    "record write failed at {address}: {e}; abandoning {} written copies",
                    addresses.len()
                );
                return Err(e);
            }
            addresses.push(address);
        }

        // All copies are on flash: commit.
        for &address in &addresses {
            let sector = self.sectors.sector_of(address);
            self.sectors.get_mut(sector).add_valid(image.len());
        }
        let state = if value.is_empty() {
            KeyState::Deleted
        } else {
            KeyState::Valid
        };
        match existing {
            Some(position) => {
                let old: Vec<Address> = self.index.get(position).addresses().to_vec();
                for address in old {
                    self.mark_stale_address(address);
                }
                self.index.get_mut(position).update(id, state, addresses);
            }
            None => {
                let mut descriptor = KeyDescriptor::new(key_hash(key), id, state);
                for address in addresses {
                    descriptor.add_address(address);
                }
                self.index
                    .insert(descriptor)
                    .map_err(|_| KvsError::ResourceExhausted)?;
            }
        }
        Ok(())
    }

    /// Picks R distinct destination sectors up front, compacting per the
    /// GC-on-write policy when space is short.
    fn select_destinations(&mut self, size: usize) -> Result<Vec<usize>, KvsError> {
        let redundancy = self.options.redundancy;
        let mut gc_passes_left = match self.options.gc_on_write {
            GcOnWrite::Disabled => 0usize,
            GcOnWrite::OneSector => 1,
            GcOnWrite::AsNeeded => usize::MAX,
        };

        loop {
            let mut chosen: Vec<usize> = Vec::with_capacity(redundancy);
            while chosen.len() < redundancy {
                match self.sectors.find_space(size, &chosen, false) {
                    Some(sector) => chosen.push(sector),
                    None => break,
                }
            }
            if chosen.len() == redundancy {
                return Ok(chosen);
            }

            if gc_passes_left == 0 {
                break;
            }
            gc_passes_left -= 1;
            match self.sectors.most_reclaimable() {
                Some(sector) => self.garbage_collect_sector(sector, false)?,
                None => break,
            }
        }

        // Structural failures (corrupt, uncollected sectors) and plain
        // fullness are reported differently.
        let any_corrupt = (0..self.sectors.len()).any(|s| self.sectors.get(s).corrupt());
        if any_corrupt {
            Err(KvsError::FailedPrecondition)
        } else {
            Err(KvsError::ResourceExhausted)
        }
    }

    fn write_and_verify(&mut self, address: Address, image: &[u8]) -> Result<(), KvsError> {
        self.partition.write(address, image)?;
        if self.options.verify_on_write {
            let record = Entry::read(self.partition, &self.formats, address)?;
            record.verify(self.partition, &self.formats)?;
        }
        Ok(())
    }

    /// Appends pre-serialized record bytes somewhere outside `exclude`,
    /// committing them as valid immediately. Used for relocation and
    /// redundancy repair.
    fn append_record_image(
        &mut self,
        image: &[u8],
        exclude: &[usize],
        allow_reserved: bool,
    ) -> Result<Address, KvsError> {
        let sector = match self.sectors.find_space(image.len(), exclude, allow_reserved) {
            Some(sector) => sector,
            None => {
                let any_corrupt = (0..self.sectors.len()).any(|s| self.sectors.get(s).corrupt());
                return Err(if any_corrupt {
                    KvsError::FailedPrecondition
                } else {
                    KvsError::ResourceExhausted
                });
            }
        };
        let address = self.sectors.append_address(sector);
        self.sectors.get_mut(sector).consume_tail(image.len());
        match self.write_and_verify(address, image) {
            Ok(()) => {
                self.sectors.get_mut(sector).add_valid(image.len());
                Ok(address)
            }
            Err(e) => {
                self.sectors.get_mut(sector).mark_corrupt();
                self.error_detected = true;
                Err(e)
            }
        }
    }

    // -------------------- Garbage collection and repair --------------------

    /// Relocates every live copy out of `sector`, erases it, and resets its
    /// accounting. With `drop_deleted`, tombstone copies are not relocated;
    /// descriptors left with no copies disappear. Only full maintenance may
    /// set `drop_deleted`: it compacts every dirty sector in the same pass,
    /// so no superseded version of a dropped key can survive to resurface
    /// at the next scan.
    fn garbage_collect_sector(
        &mut self,
        sector: usize,
        drop_deleted: bool,
    ) -> Result<(), KvsError> {
        debug!("collecting sector {sector}");
        let base = self.sectors.base_address(sector);
        let end = base + self.sectors.sector_size() as Address;

        let mut emptied: Vec<usize> = Vec::new();
        for position in 0..self.index.len() {
            let in_sector: Vec<Address> = self
                .index
                .get(position)
                .addresses()
                .iter()
                .copied()
                .filter(|&a| a >= base && a < end)
                .collect();
            if in_sector.is_empty() {
                continue;
            }
            let deleted = self.index.get(position).state == KeyState::Deleted;
            for address in in_sector {
                if drop_deleted && deleted {
                    self.index.get_mut(position).remove_address(address);
                } else {
                    self.relocate_copy(position, address, sector)?;
                }
            }
            if self.index.get(position).addresses().is_empty() {
                emptied.push(position);
            }
        }
        // Remove from the back so earlier positions stay valid across
        // swap-removes.
        emptied.sort_unstable_by(|a, b| b.cmp(a));
        for position in emptied {
            self.index.remove(position);
        }

        self.partition.erase(base, 1)?;
        let was_corrupt = self.sectors.get(sector).corrupt();
        let sector_size = self.sectors.sector_size();
        self.sectors.get_mut(sector).reset(sector_size);
        if was_corrupt {
            self.corrupt_sectors_recovered += 1;
            debug!("recovered corrupt sector {sector}");
        }
        Ok(())
    }

    /// Moves one copy of a record out of the sector being collected. If the
    /// copy itself is unreadable it is sourced from a surviving copy (which
    /// counts as recovering a missing redundant entry); a record with no
    /// readable copy anywhere is dropped.
    fn relocate_copy(
        &mut self,
        position: usize,
        address: Address,
        from_sector: usize,
    ) -> Result<(), KvsError> {
        let sourced = match self.read_image(address) {
            Ok(image) => Some((image, false)),
            Err(_) => {
                let others: Vec<Address> = self
                    .index
                    .get(position)
                    .addresses()
                    .iter()
                    .copied()
                    .filter(|&a| a != address)
                    .collect();
                others
                    .into_iter()
                    .find_map(|a| self.read_image(a).ok())
                    .map(|image| (image, true))
            }
        };
        let Some((image, from_other)) = sourced else {
            warn!("record at {address} lost: no readable copy remains");
            self.index.get_mut(position).remove_address(address);
            return Ok(());
        };

        let mut exclude = vec![from_sector];
        for &a in self.index.get(position).addresses() {
            if a != address {
                exclude.push(self.sectors.sector_of(a));
            }
        }
        let new_address = self.append_record_image(&image, &exclude, true)?;
        self.sectors.get_mut(from_sector).remove_valid(image.len());
        self.index
            .get_mut(position)
            .replace_address(address, new_address);
        if from_other {
            self.missing_redundant_entries_recovered += 1;
        }
        Ok(())
    }

    /// Reads and verifies one copy, returning its raw padded bytes.
    fn read_image(&self, address: Address) -> Result<Vec<u8>, KvsError> {
        let record = Entry::read(self.partition, &self.formats, address)?;
        record.verify(self.partition, &self.formats)?;
        Ok(record.read_raw(self.partition)?)
    }

    /// Init-time repair under lazy recovery: collect corrupt sectors,
    /// secure the reserved empty sector, restore redundancy. Clears the
    /// error flag only when everything succeeded.
    fn repair(&mut self) {
        loop {
            let corrupt: Vec<usize> = (0..self.sectors.len())
                .filter(|&s| self.sectors.get(s).corrupt())
                .collect();
            if corrupt.is_empty() {
                break;
            }
            let mut progressed = false;
            for sector in corrupt {
                match self.garbage_collect_sector(sector, false) {
                    Ok(()) => progressed = true,
                    Err(e) => debug!("cannot collect sector {sector} yet: {e}"),
                }
            }
            if !progressed {
                warn!("unable to recover corrupt sectors");
                return;
            }
        }

        if self.sectors.empty_count() == 0 {
            let Some(sector) = self.sectors.most_reclaimable() else {
                warn!("no reclaimable space to secure a free sector");
                return;
            };
            if let Err(e) = self.garbage_collect_sector(sector, false) {
                warn!("failed to secure a free sector: {e}");
                return;
            }
        }

        if let Err(e) = self.restore_redundancy() {
            warn!("failed to restore redundancy: {e}");
            return;
        }

        self.error_detected = false;
    }

    /// Rewrites missing copies until every record has R of them.
    fn restore_redundancy(&mut self) -> Result<(), KvsError> {
        for position in 0..self.index.len() {
            while self.index.get(position).addresses().len() < self.options.redundancy {
                let image = {
                    let addresses = self.index.get(position).addresses().to_vec();
                    addresses
                        .into_iter()
                        .find_map(|a| self.read_image(a).ok())
                };
                let Some(image) = image else {
                    warn!("cannot restore redundancy: no readable copy");
                    break;
                };
                let exclude: Vec<usize> = self
                    .index
                    .get(position)
                    .addresses()
                    .iter()
                    .map(|&a| self.sectors.sector_of(a))
                    .collect();
                let address = self.append_record_image(&image, &exclude, false)?;
                self.index.get_mut(position).add_address(address);
                self.missing_redundant_entries_recovered += 1;
            }
        }
        Ok(())
    }

    /// Maintenance-time audit of the index against the flash: unreadable
    /// copies are dropped from their descriptors (restored later from a
    /// survivor), and records with no readable copy left are dropped
    /// entirely. Sectors that lost copies are queued for collection via
    /// their accounting.
    fn verify_copies(&mut self) {
        let mut position = 0;
        while position < self.index.len() {
            let addresses = self.index.get(position).addresses().to_vec();
            let mut dead: Vec<Address> = Vec::new();
            let mut copy_size = None;
            for &address in &addresses {
                match self.read_image(address) {
                    Ok(image) => copy_size = Some(image.len()),
                    Err(_) => dead.push(address),
                }
            }

            if dead.len() == addresses.len() {
                warn!("record lost: no copy verifies; dropping its key");
                // No copy parses, so the believed sizes are unknown; poison
                // the sectors instead so collection corrects the books.
                for address in dead {
                    let sector = self.sectors.sector_of(address);
                    self.sectors.get_mut(sector).set_writable(0);
                }
                self.index.remove(position);
                self.error_detected = true;
                continue;
            }

            if let Some(size) = copy_size {
                for address in dead {
                    warn!("copy at {address} no longer verifies; dropping it");
                    let sector = self.sectors.sector_of(address);
                    self.sectors.get_mut(sector).remove_valid(size);
                    self.index.get_mut(position).remove_address(address);
                }
            }
            position += 1;
        }
    }

    fn next_maintenance_target(&self) -> Option<usize> {
        let sector_size = self.sectors.sector_size();
        (0..self.sectors.len()).find(|&s| {
            let descriptor = self.sectors.get(s);
            descriptor.corrupt()
                || descriptor.reclaimable_bytes(sector_size) > 0
                || self.sector_holds_tombstone(s)
        })
    }

    fn sector_holds_tombstone(&self, sector: usize) -> bool {
        let base = self.sectors.base_address(sector);
        let end = base + self.sectors.sector_size() as Address;
        self.index.iter().any(|d| {
            d.state == KeyState::Deleted && d.addresses().iter().any(|&a| a >= base && a < end)
        })
    }

    // -------------------- Failure marking --------------------

    /// A copy could not be read at all (erased, torn, or a read error).
    /// Its sector stops taking writes so the bytes are reclaimed, not
    /// reused, but this is not counted as sector corruption.
    fn note_lost_copy(&mut self, address: Address, e: KvsError) {
        warn!("copy at {address} unreadable: {e}");
        let sector = self.sectors.sector_of(address);
        self.sectors.get_mut(sector).set_writable(0);
        self.error_detected = true;
    }

    /// A copy read back but failed its checksum: the sector holds
    /// corruption and is flagged for recovery accounting.
    fn note_corrupt_copy(&mut self, address: Address, e: KvsError) {
        warn!("copy at {address} failed verification: {e}");
        let sector = self.sectors.sector_of(address);
        self.sectors.get_mut(sector).mark_corrupt();
        self.error_detected = true;
    }

    // -------------------- Validation helpers --------------------

    fn check_operation(&self, key: &str) -> Result<(), KvsError> {
        if key.is_empty() || key.len() > MAX_KEY_LENGTH {
            return Err(KvsError::InvalidArgument);
        }
        if self.state == InitState::NotInitialized {
            return Err(KvsError::FailedPrecondition);
        }
        Ok(())
    }

    fn check_mutation(&self, key: &str) -> Result<(), KvsError> {
        self.check_operation(key)?;
        if !self.partition.writable() {
            return Err(KvsError::Flash(flash::FlashError::PermissionDenied));
        }
        Ok(())
    }

    /// Record alignment: the partition alignment rounded up to the codec's
    /// 16-byte granule.
    fn record_alignment(&self) -> usize {
        let alignment = self.partition.alignment_bytes().max(MIN_ALIGNMENT_BYTES);
        alignment.div_ceil(MIN_ALIGNMENT_BYTES) * MIN_ALIGNMENT_BYTES
    }

    fn record_fits(&self, key_length: usize, value_length: usize) -> bool {
        let alignment = self.record_alignment();
        let content = HEADER_SIZE + key_length + value_length;
        let padded = content.div_ceil(alignment) * alignment;
        padded <= self.partition.sector_size_bytes()
    }
}
