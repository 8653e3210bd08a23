//! End-to-end store behavior on a fake flash device: round trips, updates,
//! deletes, compaction, redundancy, and survival across re-initialization.

use anyhow::Result;
use entry::{Crc32Checksum, EntryFormat};
use flash::{FakeFlash, FlashError, FlashPartition, PartitionPermission};
use kvs::{ErrorRecovery, GcOnWrite, KeyValueStore, KvsError, Options};

const MAGIC: u32 = 0x4b565331; // "KVS1"

fn options() -> Options {
    Options {
        gc_on_write: GcOnWrite::OneSector,
        recovery: ErrorRecovery::Lazy,
        verify_on_read: true,
        verify_on_write: true,
        max_entries: 256,
        max_usable_sectors: 256,
        redundancy: 1,
    }
}

fn value_for(i: usize) -> Vec<u8> {
    let mut v = format!("value-{i}-").into_bytes();
    v.extend(std::iter::repeat(i as u8).take(i % 40));
    v
}

// -------------------- Round trips --------------------

#[test]
fn roundtrip_many_keys() -> Result<()> {
    let flash = FakeFlash::new(1024, 8, 16);
    let partition = FlashPartition::new(&flash);
    let crc = Crc32Checksum::new();
    let formats = [EntryFormat {
        magic: MAGIC,
        checksum: Some(&crc),
    }];
    let mut kvs = KeyValueStore::new(&partition, &formats, options());
    kvs.init()?;

    for i in 0..60 {
        kvs.put(&format!("key{i:03}"), &value_for(i))?;
    }
    assert_eq!(kvs.size(), 60);

    let mut out = [0u8; 128];
    for i in 0..60 {
        let key = format!("key{i:03}");
        let n = kvs.get(&key, &mut out)?;
        assert_eq!(&out[..n], value_for(i).as_slice(), "mismatch for {key}");
        assert_eq!(kvs.value_size(&key)?, n);
    }
    Ok(())
}

#[test]
fn binary_keys_and_values_roundtrip() -> Result<()> {
    let flash = FakeFlash::new(1024, 8, 16);
    let partition = FlashPartition::new(&flash);
    let crc = Crc32Checksum::new();
    let formats = [EntryFormat {
        magic: MAGIC,
        checksum: Some(&crc),
    }];
    let mut kvs = KeyValueStore::new(&partition, &formats, options());
    kvs.init()?;

    let value = [0xde, 0xad, 0xbe, 0xef, 0x00, 0xff];
    kvs.put("\u{00e5}key", &value)?;

    let mut out = [0u8; 16];
    let n = kvs.get("\u{00e5}key", &mut out)?;
    assert_eq!(&out[..n], &value);
    Ok(())
}

#[test]
fn single_byte_and_max_length_keys() -> Result<()> {
    let flash = FakeFlash::new(1024, 8, 16);
    let partition = FlashPartition::new(&flash);
    let crc = Crc32Checksum::new();
    let formats = [EntryFormat {
        magic: MAGIC,
        checksum: Some(&crc),
    }];
    let mut kvs = KeyValueStore::new(&partition, &formats, options());
    kvs.init()?;

    let longest = "k".repeat(127);
    kvs.put("a", b"1")?;
    kvs.put(&longest, b"2")?;

    let mut out = [0u8; 8];
    assert_eq!(kvs.get("a", &mut out)?, 1);
    assert_eq!(kvs.get(&longest, &mut out)?, 1);
    assert_eq!(out[0], b'2');
    Ok(())
}

// -------------------- Updates and deletes --------------------

#[test]
fn latest_update_always_wins() -> Result<()> {
    let flash = FakeFlash::new(1024, 8, 16);
    let partition = FlashPartition::new(&flash);
    let crc = Crc32Checksum::new();
    let formats = [EntryFormat {
        magic: MAGIC,
        checksum: Some(&crc),
    }];
    let mut kvs = KeyValueStore::new(&partition, &formats, options());
    kvs.init()?;

    for round in 0..50u32 {
        kvs.put("counter", &round.to_le_bytes())?;
    }
    let mut out = [0u8; 4];
    kvs.get("counter", &mut out)?;
    assert_eq!(u32::from_le_bytes(out), 49);
    assert_eq!(kvs.size(), 1);
    Ok(())
}

#[test]
fn delete_then_rewrite_resurrects_key() -> Result<()> {
    let flash = FakeFlash::new(1024, 8, 16);
    let partition = FlashPartition::new(&flash);
    let crc = Crc32Checksum::new();
    let formats = [EntryFormat {
        magic: MAGIC,
        checksum: Some(&crc),
    }];
    let mut kvs = KeyValueStore::new(&partition, &formats, options());
    kvs.init()?;

    kvs.put("k", b"old")?;
    kvs.delete("k")?;
    let mut out = [0u8; 8];
    assert_eq!(kvs.get("k", &mut out), Err(KvsError::NotFound));

    kvs.put("k", b"new")?;
    let n = kvs.get("k", &mut out)?;
    assert_eq!(&out[..n], b"new");
    Ok(())
}

#[test]
fn delete_of_missing_key_is_not_found() -> Result<()> {
    let flash = FakeFlash::new(1024, 8, 16);
    let partition = FlashPartition::new(&flash);
    let crc = Crc32Checksum::new();
    let formats = [EntryFormat {
        magic: MAGIC,
        checksum: Some(&crc),
    }];
    let mut kvs = KeyValueStore::new(&partition, &formats, options());
    kvs.init()?;

    assert_eq!(kvs.delete("ghost"), Err(KvsError::NotFound));
    kvs.put("real", b"x")?;
    kvs.delete("real")?;
    assert_eq!(kvs.delete("real"), Err(KvsError::NotFound));
    Ok(())
}

// -------------------- Reinitialization --------------------

#[test]
fn committed_writes_survive_reinit() -> Result<()> {
    let flash = FakeFlash::new(1024, 8, 16);
    let partition = FlashPartition::new(&flash);
    let crc = Crc32Checksum::new();
    let formats = [EntryFormat {
        magic: MAGIC,
        checksum: Some(&crc),
    }];

    {
        let mut kvs = KeyValueStore::new(&partition, &formats, options());
        kvs.init()?;
        for i in 0..30 {
            kvs.put(&format!("key{i:02}"), &value_for(i))?;
        }
        kvs.put("key05", b"overwritten")?;
        kvs.delete("key07")?;
    }

    let mut kvs = KeyValueStore::new(&partition, &formats, options());
    kvs.init()?;
    assert_eq!(kvs.size(), 29);

    let mut out = [0u8; 128];
    let n = kvs.get("key05", &mut out)?;
    assert_eq!(&out[..n], b"overwritten");
    assert_eq!(kvs.get("key07", &mut out), Err(KvsError::NotFound));
    for i in 0..30 {
        if i == 5 || i == 7 {
            continue;
        }
        let n = kvs.get(&format!("key{i:02}"), &mut out)?;
        assert_eq!(&out[..n], value_for(i).as_slice());
    }
    Ok(())
}

#[test]
fn tombstone_survives_reinit_and_maintenance_drops_it() -> Result<()> {
    let flash = FakeFlash::new(1024, 8, 16);
    let partition = FlashPartition::new(&flash);
    let crc = Crc32Checksum::new();
    let formats = [EntryFormat {
        magic: MAGIC,
        checksum: Some(&crc),
    }];

    {
        let mut kvs = KeyValueStore::new(&partition, &formats, options());
        kvs.init()?;
        kvs.put("gone", b"data")?;
        kvs.delete("gone")?;
    }

    let mut kvs = KeyValueStore::new(&partition, &formats, options());
    kvs.init()?;
    let mut out = [0u8; 8];
    assert_eq!(kvs.get("gone", &mut out), Err(KvsError::NotFound));

    kvs.full_maintenance()?;
    assert_eq!(kvs.get("gone", &mut out), Err(KvsError::NotFound));

    // After the tombstone is dropped, a reinit must not resurrect the old
    // value either: maintenance compacted the superseded record away.
    let mut again = KeyValueStore::new(&partition, &formats, options());
    again.init()?;
    assert_eq!(again.get("gone", &mut out), Err(KvsError::NotFound));
    Ok(())
}

// -------------------- Compaction --------------------

#[test]
fn churn_with_gc_keeps_all_live_keys() -> Result<()> {
    let flash = FakeFlash::new(1024, 8, 16);
    let partition = FlashPartition::new(&flash);
    let crc = Crc32Checksum::new();
    let formats = [EntryFormat {
        magic: MAGIC,
        checksum: Some(&crc),
    }];
    let mut kvs = KeyValueStore::new(&partition, &formats, options());
    kvs.init()?;

    // Far more write volume than the partition holds; compaction must keep
    // up and never lose the ten live keys.
    let payload = [0x5a; 120];
    for round in 0..40 {
        for k in 0..10 {
            let mut value = payload.to_vec();
            value[0] = round as u8;
            value[1] = k as u8;
            kvs.put(&format!("slot{k}"), &value)?;
        }
    }

    assert_eq!(kvs.size(), 10);
    let mut out = [0u8; 128];
    for k in 0..10 {
        let n = kvs.get(&format!("slot{k}"), &mut out)?;
        assert_eq!(n, 120);
        assert_eq!(out[0], 39);
        assert_eq!(out[1], k as u8);
    }
    Ok(())
}

#[test]
fn maintenance_compacts_and_counters_settle() -> Result<()> {
    let flash = FakeFlash::new(1024, 8, 16);
    let partition = FlashPartition::new(&flash);
    let crc = Crc32Checksum::new();
    let formats = [EntryFormat {
        magic: MAGIC,
        checksum: Some(&crc),
    }];
    let mut kvs = KeyValueStore::new(&partition, &formats, options());
    kvs.init()?;

    for i in 0..20 {
        kvs.put("churn", &value_for(i))?;
    }
    assert!(kvs.storage_stats().reclaimable_bytes > 0);

    kvs.full_maintenance()?;
    let settled = kvs.storage_stats();
    assert_eq!(settled.reclaimable_bytes, 0);

    kvs.full_maintenance()?;
    assert_eq!(kvs.storage_stats(), settled);

    let mut out = [0u8; 128];
    let n = kvs.get("churn", &mut out)?;
    assert_eq!(&out[..n], value_for(19).as_slice());
    Ok(())
}

// -------------------- Redundancy --------------------

#[test]
fn redundant_store_survives_any_single_sector_loss() -> Result<()> {
    let flash = FakeFlash::new(1024, 8, 16);
    let partition = FlashPartition::new(&flash);
    let crc = Crc32Checksum::new();
    let formats = [EntryFormat {
        magic: MAGIC,
        checksum: Some(&crc),
    }];
    let mut redundant = Options {
        redundancy: 2,
        ..options()
    };
    redundant.gc_on_write = GcOnWrite::OneSector;
    let mut kvs = KeyValueStore::new(&partition, &formats, redundant);
    kvs.init()?;
    assert_eq!(kvs.redundancy(), 2);

    for i in 0..12 {
        kvs.put(&format!("key{i:02}"), &value_for(i))?;
    }

    for lost_sector in 0..8u32 {
        partition.erase(lost_sector * 1024, 1)?;
        let mut out = [0u8; 128];
        for i in 0..12 {
            let key = format!("key{i:02}");
            let n = kvs
                .get(&key, &mut out)
                .unwrap_or_else(|e| panic!("{key} lost with sector {lost_sector}: {e}"));
            assert_eq!(&out[..n], value_for(i).as_slice());
        }
        // Put every copy back before losing the next sector.
        kvs.full_maintenance()?;
    }
    Ok(())
}

#[test]
fn read_only_partition_serves_reads_and_refuses_writes() -> Result<()> {
    let flash = FakeFlash::new(1024, 8, 16);
    let crc = Crc32Checksum::new();
    let formats = [EntryFormat {
        magic: MAGIC,
        checksum: Some(&crc),
    }];

    {
        let partition = FlashPartition::new(&flash);
        let mut kvs = KeyValueStore::new(&partition, &formats, options());
        kvs.init()?;
        kvs.put("frozen", b"contents")?;
    }

    let read_only =
        FlashPartition::with_layout(&flash, 0, 8, 16, PartitionPermission::ReadOnly).unwrap();
    let mut kvs = KeyValueStore::new(&read_only, &formats, options());
    kvs.init()?;

    let mut out = [0u8; 16];
    let n = kvs.get("frozen", &mut out)?;
    assert_eq!(&out[..n], b"contents");

    assert_eq!(
        kvs.put("frozen", b"changed"),
        Err(KvsError::Flash(FlashError::PermissionDenied))
    );
    assert_eq!(
        kvs.delete("frozen"),
        Err(KvsError::Flash(FlashError::PermissionDenied))
    );
    Ok(())
}

#[test]
fn accessors_report_configuration() -> Result<()> {
    let flash = FakeFlash::new(1024, 8, 16);
    let partition = FlashPartition::new(&flash);
    let crc = Crc32Checksum::new();
    let formats = [EntryFormat {
        magic: MAGIC,
        checksum: Some(&crc),
    }];
    let mut small = options();
    small.max_entries = 10;
    let mut kvs = KeyValueStore::new(&partition, &formats, small);
    kvs.init()?;

    assert_eq!(kvs.max_size(), 10);
    assert_eq!(kvs.redundancy(), 1);
    assert_eq!(kvs.transaction_count(), 0);
    assert!(kvs.is_empty());
    assert!(!kvs.error_detected());

    kvs.put("k", b"v")?;
    assert_eq!(kvs.transaction_count(), 1);
    assert_eq!(kvs.size(), 1);
    Ok(())
}
