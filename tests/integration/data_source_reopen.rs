#![allow(missing_docs)]

use std::fs;
use std::path::Path;
use std::sync::Arc;

use tempfile::tempdir;
use vtreedb::storage::{
    key_hash, EngineConfig, Hash, HashRecord, Instrumentation, LeafRecord, Registry,
    RegistryOptions, StoreKind, TableConfig,
};
use vtreedb::types::{Result, StoreError};
use vtreedb::Validator;

fn hash(path: i64) -> Hash {
    Hash::new(vec![(path % 256) as u8; 48])
}

fn leaf(path: i64, generation: u8) -> LeafRecord {
    LeafRecord::new(
        path,
        format!("key-{path}").into_bytes(),
        vec![generation; 1 + (path % 7) as usize],
    )
}

fn config() -> TableConfig {
    TableConfig::default()
        .max_keys(1024)
        .hashes_ram_to_disk_threshold(16)
}

fn options(instrumentation: &Arc<Instrumentation>, engine: EngineConfig) -> RegistryOptions {
    RegistryOptions::default()
        .config(engine)
        .instrumentation(instrumentation.clone())
}

fn remove_index_images(dir: &Path) -> Result<usize> {
    let mut removed = 0;
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if entry.file_type()?.is_dir() {
            removed += remove_index_images(&path)?;
        } else if matches!(
            path.extension().and_then(|ext| ext.to_str()),
            Some("ll") | Some("hl")
        ) {
            fs::remove_file(&path)?;
            removed += 1;
        }
    }
    Ok(removed)
}

fn write_two_batches(registry: &Registry) -> Result<()> {
    let ds = registry.create_data_source("t", config(), false)?;
    ds.save_records(
        31,
        62,
        (0..31).map(|p| HashRecord::new(p, hash(p))),
        (31..=62).map(|p| leaf(p, 1)),
        Vec::new(),
    )?;
    ds.save_records(
        31,
        62,
        (40..50).map(|p| HashRecord::new(p, hash(p + 1))),
        (50..=62).map(|p| leaf(p, 2)),
        Vec::new(),
    )?;
    ds.close()
}

fn assert_contents(registry: &Registry) -> Result<()> {
    let ds = registry.get_data_source("t", false)?;
    assert_eq!(ds.flush_version(), 2);
    assert_eq!((ds.first_leaf_path(), ds.last_leaf_path()), (31, 62));
    for p in 0..31 {
        assert_eq!(ds.load_hash(p)?, Some(hash(p)), "internal hash {p}");
    }
    for p in 40..50 {
        assert_eq!(ds.load_hash(p)?, Some(hash(p + 1)), "leaf hash {p}");
    }
    for p in 31..=62 {
        let generation = if p >= 50 { 2 } else { 1 };
        let expected = leaf(p, generation);
        assert_eq!(ds.load_leaf_record(p)?, Some(expected.clone()));
        assert_eq!(
            ds.load_leaf_record_by_key(&expected.key, key_hash(&expected.key))?,
            Some(expected)
        );
    }
    assert!(Validator::new(&ds).validate());
    ds.close()
}

#[test]
fn reopen_after_close_uses_saved_indexes() -> Result<()> {
    let dir = tempdir()?;
    let instrumentation = Instrumentation::new();
    let registry = Registry::open(dir.path(), options(&instrumentation, EngineConfig::default()))?;
    write_two_batches(&registry)?;
    let table_dir = registry.storage_dir("t")?;
    assert!(table_dir.join("leaf_index.ll").exists());
    assert!(table_dir.join("hashes_ram.hl").exists());
    assert_contents(&registry)?;
    Ok(())
}

#[test]
fn reopen_after_lost_indexes_rebuilds_from_files() -> Result<()> {
    let dir = tempdir()?;
    let instrumentation = Instrumentation::new();
    let registry = Registry::open(dir.path(), options(&instrumentation, EngineConfig::default()))?;
    write_two_batches(&registry)?;
    let removed = remove_index_images(&registry.storage_dir("t")?)?;
    assert_eq!(removed, 4);
    assert_contents(&registry)?;
    Ok(())
}

#[test]
fn deleted_leaf_stays_deleted_after_rebuild() -> Result<()> {
    let dir = tempdir()?;
    let instrumentation = Instrumentation::new();
    let registry = Registry::open(dir.path(), options(&instrumentation, EngineConfig::default()))?;
    let ds = registry.create_data_source("t", config(), false)?;
    ds.save_records(
        1,
        3,
        vec![HashRecord::new(0, hash(0))],
        (1..=3).map(|p| leaf(p, 1)),
        Vec::new(),
    )?;
    ds.save_records(1, 3, Vec::new(), Vec::new(), vec![leaf(2, 1)])?;
    ds.close()?;
    assert_eq!(remove_index_images(&registry.storage_dir("t")?)?, 4);

    let ds = registry.get_data_source("t", false)?;
    let gone = leaf(2, 1);
    assert_eq!(ds.load_leaf_record(2)?, None);
    assert_eq!(ds.load_leaf_record_by_key(&gone.key, key_hash(&gone.key))?, None);
    assert_eq!(ds.load_leaf_record(1)?, Some(leaf(1, 1)));
    assert_eq!(ds.load_leaf_record(3)?, Some(leaf(3, 1)));
    ds.close()
}

#[test]
fn enforced_rebuild_ignores_saved_indexes() -> Result<()> {
    let dir = tempdir()?;
    let instrumentation = Instrumentation::new();
    {
        let registry =
            Registry::open(dir.path(), options(&instrumentation, EngineConfig::default()))?;
        write_two_batches(&registry)?;
    }
    let engine = EngineConfig::default().index_rebuild_enforced(true);
    let registry = Registry::open(dir.path(), options(&instrumentation, engine))?;
    assert_contents(&registry)?;
    Ok(())
}

#[test]
fn counters_return_to_baseline_after_close() -> Result<()> {
    let dir = tempdir()?;
    let instrumentation = Instrumentation::new();
    let registry = Registry::open(dir.path(), options(&instrumentation, EngineConfig::default()))?;
    let ds = registry.create_data_source("t", config(), true)?;
    ds.save_records(
        8,
        15,
        (0..8).map(|p| HashRecord::new(p, hash(p))),
        (8..16).map(|p| leaf(p, 1)),
        Vec::new(),
    )?;
    assert_eq!(instrumentation.open_data_sources(), 1);
    assert!(instrumentation.index_bytes() > 0);
    ds.close()?;
    assert_eq!(instrumentation.open_data_sources(), 0);
    assert_eq!(instrumentation.index_bytes(), 0);
    assert!(matches!(ds.load_hash(0), Err(StoreError::IllegalState(_))));
    Ok(())
}

#[test]
fn config_mismatch_is_rejected_on_create() -> Result<()> {
    let dir = tempdir()?;
    let registry = Registry::open(dir.path(), RegistryOptions::default())?;
    registry.create_data_source("t", config(), false)?.close()?;
    let other = config().max_keys(4096);
    assert!(matches!(
        registry.create_data_source("t", other, false),
        Err(StoreError::IllegalState(_))
    ));
    let ds = registry.create_data_source("t", config(), false)?;
    assert_eq!(ds.store_files(StoreKind::PathToKeyValue), (0, 0));
    Ok(())
}

#[test]
fn engine_config_loads_from_toml() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("engine.toml");
    fs::write(
        &path,
        "compaction_threads = 2\nleaf_cache_capacity = 0\nlink_mode = \"copy\"\n",
    )?;
    let engine = EngineConfig::load(&path)?;
    assert_eq!(engine.compaction_threads, 2);
    assert_eq!(engine.leaf_cache_capacity, 0);
    let registry = Registry::open(dir.path().join("root"), RegistryOptions::default().config(engine))?;
    write_two_batches(&registry)?;
    assert_contents(&registry)?;
    Ok(())
}
