#![allow(missing_docs)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;

use tempfile::tempdir;
use vtreedb::storage::{
    key_hash, DataSource, EngineConfig, Hash, HashRecord, LeafRecord, LinkMode, Registry,
    RegistryOptions, TableConfig,
};
use vtreedb::types::{Result, StoreError};
use vtreedb::Validator;

const LEAVES: i64 = 20;

fn config() -> TableConfig {
    TableConfig::default().max_keys(256).hashes_ram_to_disk_threshold(8)
}

fn generation_batch(ds: &DataSource, generation: u8) -> Result<()> {
    let first = LEAVES - 1;
    let last = 2 * LEAVES - 2;
    ds.save_records(
        first,
        last,
        (0..first).map(|p| HashRecord::new(p, Hash::new(vec![generation; 48]))),
        (first..=last).map(|p| {
            LeafRecord::new(p, format!("key-{p}").into_bytes(), vec![generation; 4])
        }),
        Vec::new(),
    )
}

fn assert_generation(ds: &DataSource, generation: u8) -> Result<()> {
    let first = LEAVES - 1;
    for p in 0..first {
        assert_eq!(ds.load_hash(p)?, Some(Hash::new(vec![generation; 48])));
    }
    for p in first..=2 * LEAVES - 2 {
        let key = format!("key-{p}").into_bytes();
        let record = ds.load_leaf_record_by_key(&key, key_hash(&key))?;
        assert_eq!(record.map(|r| r.value.to_vec()), Some(vec![generation; 4]));
    }
    Ok(())
}

#[test]
fn snapshot_under_concurrent_writes_is_consistent() -> Result<()> {
    let dir = tempdir()?;
    let registry = Registry::open(dir.path().join("root"), RegistryOptions::default())?;
    let ds = registry.create_data_source("t", config(), true)?;
    generation_batch(&ds, 1)?;

    let stop = Arc::new(AtomicBool::new(false));
    let writer = {
        let ds = ds.clone();
        let stop = stop.clone();
        thread::spawn(move || -> Result<u8> {
            let mut generation = 1u8;
            while !stop.load(Ordering::Acquire) && generation < 200 {
                generation += 1;
                generation_batch(&ds, generation)?;
            }
            Ok(generation)
        })
    };
    let snapshot_root = dir.path().join("snapshot");
    registry.snapshot(&snapshot_root, &ds)?;
    stop.store(true, Ordering::Release);
    let last_generation = writer.join().expect("writer thread")?;
    assert_generation(&ds, last_generation)?;

    let restored_registry = Registry::open(&snapshot_root, RegistryOptions::default())?;
    let restored = restored_registry.get_data_source("t", false)?;
    let captured = restored.flush_version();
    assert!(captured >= 1 && captured <= u64::from(last_generation));
    assert_generation(&restored, captured as u8)?;
    assert!(Validator::new(&restored).validate());
    Ok(())
}

#[test]
fn concurrent_snapshots_to_one_target_admit_one() -> Result<()> {
    let dir = tempdir()?;
    let registry = Registry::open(dir.path().join("root"), RegistryOptions::default())?;
    let ds = registry.create_data_source("t", config(), false)?;
    generation_batch(&ds, 7)?;

    let target = dir.path().join("snapshot");
    let barrier = Arc::new(Barrier::new(2));
    let attempts: Vec<_> = (0..2)
        .map(|_| {
            let registry = registry.clone();
            let ds = ds.clone();
            let target = target.clone();
            let barrier = barrier.clone();
            thread::spawn(move || {
                barrier.wait();
                registry.snapshot(&target, &ds)
            })
        })
        .collect();
    let results: Vec<Result<()>> = attempts
        .into_iter()
        .map(|handle| handle.join().expect("snapshot thread"))
        .collect();
    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
    assert!(results
        .iter()
        .any(|r| matches!(r, Err(StoreError::IllegalState(_)))));

    assert!(matches!(
        registry.snapshot(&target, &ds),
        Err(StoreError::IllegalState(_))
    ));
    Ok(())
}

#[test]
fn restore_into_relocated_directory() -> Result<()> {
    let dir = tempdir()?;
    let registry = Registry::open(dir.path().join("root"), RegistryOptions::default())?;
    let ds = registry.create_data_source("t", config(), false)?;
    generation_batch(&ds, 3)?;
    let snapshot_root = dir.path().join("snapshot");
    registry.snapshot(&snapshot_root, &ds)?;
    generation_batch(&ds, 4)?;

    let relocated = dir.path().join("relocated");
    let options = RegistryOptions::default().config(EngineConfig::default().link_mode(LinkMode::Copy));
    {
        let restored = Registry::restore(&snapshot_root, Some(relocated.as_path()), options.clone())?;
        let table = restored.get_data_source("t", false)?;
        assert_generation(&table, 3)?;
        generation_batch(&table, 5)?;
        table.close()?;
    }
    let again = Registry::restore(&snapshot_root, Some(relocated.as_path()), options)?;
    assert_generation(&again.get_data_source("t", false)?, 5)?;

    let untouched = Registry::open(&snapshot_root, RegistryOptions::default())?;
    assert_generation(&untouched.get_data_source("t", false)?, 3)?;
    assert_generation(&ds, 4)?;
    Ok(())
}

#[test]
fn snapshot_all_collects_every_table() -> Result<()> {
    let dir = tempdir()?;
    let registry = Registry::open(dir.path().join("root"), RegistryOptions::default())?;
    let a = registry.create_data_source("a", config(), false)?;
    let b = registry.create_data_source("b", config(), false)?;
    generation_batch(&a, 1)?;
    generation_batch(&b, 2)?;
    let target = dir.path().join("all");
    registry.snapshot_all(&target, &[a.clone(), b.clone()])?;
    assert!(matches!(
        registry.snapshot(&target, &a),
        Err(StoreError::IllegalState(_))
    ));

    let restored = Registry::restore(&target, None, RegistryOptions::default())?;
    assert_eq!(restored.table_names(), vec!["a".to_string(), "b".to_string()]);
    assert_generation(&restored.get_data_source("a", false)?, 1)?;
    assert_generation(&restored.get_data_source("b", false)?, 2)?;
    let c = restored.create_data_source("c", config(), false)?;
    assert!(c.table_id().0 > b.table_id().0);
    Ok(())
}

#[test]
fn restore_requires_a_snapshot() -> Result<()> {
    let dir = tempdir()?;
    assert!(matches!(
        Registry::restore(dir.path().join("nothing"), None, RegistryOptions::default()),
        Err(StoreError::NotFound(_))
    ));
    Ok(())
}
