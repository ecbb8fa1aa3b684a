#![allow(missing_docs)]

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;

use tempfile::{tempdir, TempDir};
use vtreedb::storage::{
    key_hash, CounterMetrics, DataSource, EngineConfig, Hash, HashRecord, LeafRecord, Registry,
    RegistryOptions, StoreKind, TableConfig,
};
use vtreedb::types::Result;
use vtreedb::Validator;

const FIRST: i64 = 63;
const LAST: i64 = 126;

type Fixture = (TempDir, Arc<CounterMetrics>, Registry, DataSource);

fn open(engine: EngineConfig, enable: bool) -> Result<Fixture> {
    let dir = tempdir()?;
    let metrics = Arc::new(CounterMetrics::default());
    let registry = Registry::open(
        dir.path(),
        RegistryOptions::default()
            .config(engine)
            .metrics(metrics.clone()),
    )?;
    let ds = registry.create_data_source(
        "t",
        TableConfig::default()
            .max_keys(512)
            .hashes_ram_to_disk_threshold(16),
        enable,
    )?;
    Ok((dir, metrics, registry, ds))
}

fn round(ds: &DataSource, n: u32) -> Result<()> {
    let tag = n.to_le_bytes().to_vec();
    ds.save_records(
        FIRST,
        LAST,
        (0..FIRST).map(|p| {
            let mut hash = vec![0u8; 48];
            hash[..4].copy_from_slice(&n.to_le_bytes());
            hash[8..16].copy_from_slice(&p.to_le_bytes());
            HashRecord::new(p, Hash::new(hash))
        }),
        (FIRST..=LAST)
            .filter(|p| n == 0 || (*p + i64::from(n)) % 3 == 0)
            .map(|p| LeafRecord::new(p, format!("leaf-{p}").into_bytes(), tag.clone())),
        Vec::new(),
    )
}

fn expected_round(path: i64, last_round: u32) -> u32 {
    (1..=last_round)
        .rev()
        .find(|r| (path + i64::from(*r)) % 3 == 0)
        .unwrap_or(0)
}

fn assert_latest(ds: &DataSource, last_round: u32) -> Result<()> {
    for p in 0..FIRST {
        let hash = ds.load_hash(p)?.expect("internal hash");
        assert_eq!(&hash.as_bytes()[..4], &last_round.to_le_bytes());
    }
    for p in FIRST..=LAST {
        let key = format!("leaf-{p}").into_bytes();
        let leaf = ds
            .load_leaf_record_by_key(&key, key_hash(&key))?
            .expect("leaf by key");
        assert_eq!(leaf.path, p);
        assert_eq!(leaf.value.as_ref(), &expected_round(p, last_round).to_le_bytes());
    }
    Ok(())
}

#[test]
fn compaction_merges_flush_files_and_keeps_latest_values() -> Result<()> {
    let engine = EngineConfig::default().compact_after_flush(false);
    let (_dir, metrics, _registry, ds) = open(engine, true)?;
    for r in 0..6 {
        round(&ds, r)?;
    }
    for store in StoreKind::ALL {
        assert_eq!(ds.store_files(store).0, 6, "{store} before compaction");
    }
    let (_, leaf_bytes_before) = ds.store_files(StoreKind::PathToKeyValue);

    assert_eq!(ds.compact_now(), 3);
    ds.wait_for_compaction();

    for store in StoreKind::ALL {
        assert_eq!(ds.store_files(store).0, 1, "{store} after compaction");
    }
    assert!(ds.store_files(StoreKind::PathToKeyValue).1 < leaf_bytes_before);
    assert_eq!(metrics.compactions.load(Ordering::Relaxed), 3);
    assert_eq!(metrics.files_merged.load(Ordering::Relaxed), 18);
    assert_eq!(metrics.compaction_failures.load(Ordering::Relaxed), 0);
    assert_latest(&ds, 5)?;
    assert!(Validator::new(&ds).validate());

    ds.close()?;
    Ok(())
}

#[test]
fn disabled_compaction_discards_requests() -> Result<()> {
    let (_dir, metrics, _registry, ds) = open(EngineConfig::default(), false)?;
    for r in 0..3 {
        round(&ds, r)?;
    }
    assert!(!ds.is_compaction_enabled());
    assert!(!ds.compact_async(StoreKind::Hashes));
    assert_eq!(ds.compact_now(), 0);
    assert_eq!(ds.store_files(StoreKind::Hashes).0, 3);

    ds.enable_background_compaction();
    assert!(ds.compact_async(StoreKind::Hashes));
    ds.wait_for_compaction();
    assert_eq!(ds.store_files(StoreKind::Hashes).0, 1);
    assert_eq!(ds.store_files(StoreKind::KeyToPath).0, 3);
    assert_eq!(metrics.compactions.load(Ordering::Relaxed), 1);
    assert_latest(&ds, 2)?;
    Ok(())
}

#[test]
fn cancelled_compaction_leaves_data_valid() -> Result<()> {
    let engine = EngineConfig::default()
        .compact_after_flush(false)
        .compaction_check_interval(1);
    let (_dir, metrics, _registry, ds) = open(engine, true)?;
    let mut last = 0;
    round(&ds, last)?;
    // A merge that finishes before the stop lands is not a cancellation, so
    // keep feeding files until one is interrupted.
    for _ in 0..50 {
        for _ in 0..8 {
            last += 1;
            round(&ds, last)?;
        }
        ds.enable_background_compaction();
        ds.compact_now();
        ds.stop_and_disable_background_compaction();
        if metrics.compaction_cancellations.load(Ordering::Relaxed) > 0 {
            break;
        }
    }
    assert!(metrics.compaction_cancellations.load(Ordering::Relaxed) > 0);
    assert!(!ds.is_compaction_enabled());
    for store in StoreKind::ALL {
        assert!(!ds.is_compacting(store));
    }
    assert_latest(&ds, last)?;
    assert!(Validator::new(&ds).validate());

    last += 1;
    round(&ds, last)?;
    assert_latest(&ds, last)?;
    ds.enable_background_compaction();
    ds.compact_now();
    ds.wait_for_compaction();
    assert_latest(&ds, last)?;
    assert!(Validator::new(&ds).validate());
    Ok(())
}

#[test]
fn compaction_runs_alongside_writers_and_readers() -> Result<()> {
    let engine = EngineConfig::default()
        .min_files_to_compact(2)
        .compaction_check_interval(8);
    let (_dir, _metrics, _registry, ds) = open(engine, true)?;
    round(&ds, 0)?;

    let writer = {
        let ds = ds.clone();
        thread::spawn(move || -> Result<()> {
            for r in 1..=40 {
                round(&ds, r)?;
            }
            Ok(())
        })
    };
    let reader = {
        let ds = ds.clone();
        thread::spawn(move || -> Result<u64> {
            let mut reads = 0u64;
            for _ in 0..200 {
                for p in FIRST..=LAST {
                    let key = format!("leaf-{p}").into_bytes();
                    let leaf = ds.load_leaf_record_by_key(&key, key_hash(&key))?;
                    assert!(leaf.is_some(), "leaf {p} vanished during compaction");
                    reads += 1;
                }
            }
            Ok(reads)
        })
    };
    writer.join().expect("writer thread")?;
    assert!(reader.join().expect("reader thread")? > 0);
    ds.wait_for_compaction();
    ds.compact_now();
    ds.wait_for_compaction();

    assert_latest(&ds, 40)?;
    assert!(Validator::new(&ds).validate());
    for store in StoreKind::ALL {
        assert!(ds.store_files(store).0 < 41, "{store} never compacted");
    }
    Ok(())
}
