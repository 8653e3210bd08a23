//! The in-RAM key index.
//!
//! One [`KeyDescriptor`] per key known to the store, holding the key's
//! 32-bit hash, the latest transaction id, the addresses of its redundant
//! copies, and whether the latest record is a tombstone. Key bytes are never
//! stored here; candidates found by hash are confirmed by reading the key
//! back from flash, so two keys colliding on the hash can coexist as
//! separate descriptors.
//!
//! The table is sized at construction and never grows. Lookups are linear;
//! the table is small and lives on devices where predictable memory beats
//! asymptotics.

use flash::Address;

/// State of the most recent record for a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum KeyState {
    /// The key holds a value.
    Valid,
    /// The latest record is a tombstone; the key reads as absent until the
    /// tombstone is compacted away.
    Deleted,
}

/// Per-key bookkeeping. Addresses are weak references into the partition,
/// re-established by `init` and maintained by garbage collection.
#[derive(Debug, Clone)]
pub(crate) struct KeyDescriptor {
    pub key_hash: u32,
    pub transaction_id: u32,
    pub state: KeyState,
    addresses: Vec<Address>,
}

impl KeyDescriptor {
    pub fn new(key_hash: u32, transaction_id: u32, state: KeyState) -> Self {
        Self {
            key_hash,
            transaction_id,
            state,
            addresses: Vec::new(),
        }
    }

    pub fn addresses(&self) -> &[Address] {
        &self.addresses
    }

    pub fn add_address(&mut self, address: Address) {
        self.addresses.push(address);
    }

    pub fn remove_address(&mut self, address: Address) {
        self.addresses.retain(|&a| a != address);
    }

    /// Swaps one copy's address for its relocated position.
    pub fn replace_address(&mut self, from: Address, to: Address) {
        for slot in &mut self.addresses {
            if *slot == from {
                *slot = to;
                return;
            }
        }
    }

    /// Points the descriptor at a freshly committed record.
    pub fn update(&mut self, transaction_id: u32, state: KeyState, addresses: Vec<Address>) {
        self.transaction_id = transaction_id;
        self.state = state;
        self.addresses = addresses;
    }
}

/// Fixed-capacity descriptor table.
#[derive(Debug)]
pub(crate) struct KeyIndex {
    descriptors: Vec<KeyDescriptor>,
    capacity: usize,
}

impl KeyIndex {
    pub fn new(capacity: usize) -> Self {
        Self {
            descriptors: Vec::with_capacity(capacity),
            capacity,
        }
    }

    pub fn clear(&mut self) {
        self.descriptors.clear();
    }

    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn is_full(&self) -> bool {
        self.descriptors.len() >= self.capacity
    }

    /// Number of keys that currently hold a value.
    pub fn live_count(&self) -> usize {
        self.descriptors
            .iter()
            .filter(|d| d.state == KeyState::Valid)
            .count()
    }

    /// Adds a descriptor; fails when the table is full.
    pub fn insert(&mut self, descriptor: KeyDescriptor) -> Result<usize, ()> {
        if self.is_full() {
            return Err(());
        }
        self.descriptors.push(descriptor);
        Ok(self.descriptors.len() - 1)
    }

    pub fn remove(&mut self, position: usize) {
        self.descriptors.swap_remove(position);
    }

    pub fn get(&self, position: usize) -> &KeyDescriptor {
        &self.descriptors[position]
    }

    pub fn get_mut(&mut self, position: usize) -> &mut KeyDescriptor {
        &mut self.descriptors[position]
    }

    /// Positions of all descriptors whose hash matches. Usually zero or one;
    /// more only under hash collisions.
    pub fn candidates(&self, key_hash: u32) -> impl Iterator<Item = usize> + '_ {
        self.descriptors
            .iter()
            .enumerate()
            .filter(move |(_, d)| d.key_hash == key_hash)
            .map(|(i, _)| i)
    }

    pub fn iter(&self) -> impl Iterator<Item = &KeyDescriptor> {
        self.descriptors.iter()
    }
}

/// The compact identifier kept in RAM instead of the key bytes.
pub(crate) fn key_hash(key: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(key);
    hasher.finalize()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor(hash: u32, id: u32) -> KeyDescriptor {
        KeyDescriptor::new(hash, id, KeyState::Valid)
    }

    // -------------------- Capacity --------------------

    #[test]
    fn insert_up_to_capacity() {
        let mut index = KeyIndex::new(2);
        assert!(index.insert(descriptor(1, 1)).is_ok());
        assert!(index.insert(descriptor(2, 2)).is_ok());
        assert!(index.is_full());
        assert!(index.insert(descriptor(3, 3)).is_err());
        assert_eq!(index.len(), 2);
    }

    #[test]
    fn clear_empties_but_keeps_capacity() {
        let mut index = KeyIndex::new(4);
        index.insert(descriptor(1, 1)).unwrap();
        index.clear();
        assert_eq!(index.len(), 0);
        assert_eq!(index.capacity(), 4);
    }

    // -------------------- Lookup --------------------

    #[test]
    fn candidates_filters_by_hash() {
        let mut index = KeyIndex::new(8);
        index.insert(descriptor(10, 1)).unwrap();
        index.insert(descriptor(20, 2)).unwrap();
        index.insert(descriptor(10, 3)).unwrap(); // hash collision

        let positions: Vec<usize> = index.candidates(10).collect();
        assert_eq!(positions.len(), 2);
        for p in positions {
            assert_eq!(index.get(p).key_hash, 10);
        }
        assert_eq!(index.candidates(30).count(), 0);
    }

    #[test]
    fn live_count_skips_tombstones() {
        let mut index = KeyIndex::new(8);
        index.insert(descriptor(1, 1)).unwrap();
        index
            .insert(KeyDescriptor::new(2, 2, KeyState::Deleted))
            .unwrap();
        assert_eq!(index.len(), 2);
        assert_eq!(index.live_count(), 1);
    }

    // -------------------- Address maintenance --------------------

    #[test]
    fn replace_address_swaps_one_copy() {
        let mut d = descriptor(1, 1);
        d.add_address(100);
        d.add_address(600);
        d.replace_address(100, 1100);
        assert_eq!(d.addresses(), &[1100, 600]);
    }

    #[test]
    fn remove_address_drops_copy() {
        let mut d = descriptor(1, 1);
        d.add_address(100);
        d.add_address(600);
        d.remove_address(600);
        assert_eq!(d.addresses(), &[100]);
    }

    #[test]
    fn update_replaces_everything() {
        let mut d = descriptor(1, 1);
        d.add_address(100);
        d.update(5, KeyState::Deleted, vec![200, 700]);
        assert_eq!(d.transaction_id, 5);
        assert_eq!(d.state, KeyState::Deleted);
        assert_eq!(d.addresses(), &[200, 700]);
    }

    // -------------------- Hashing --------------------

    #[test]
    fn hash_is_deterministic_and_spreads() {
        assert_eq!(key_hash(b"key1"), key_hash(b"key1"));
        assert_ne!(key_hash(b"key1"), key_hash(b"key2"));
        assert_ne!(key_hash(b"a"), key_hash(b"b"));
    }
}
