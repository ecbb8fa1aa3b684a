#![allow(missing_docs)]

use std::time::{Duration, Instant};

use tempfile::tempdir;
use vtreedb::storage::{
    key_hash, DataSource, Hash, HashRecord, Instrumentation, LeafRecord, Registry,
    RegistryOptions, TableConfig,
};
use vtreedb::types::{Result, StoreError};

fn config() -> TableConfig {
    TableConfig::default().max_keys(128)
}

fn fill(ds: &DataSource, tag: u8) -> Result<()> {
    ds.save_records(
        4,
        8,
        (0..4).map(|p| HashRecord::new(p, Hash::new(vec![tag; 48]))),
        (4..=8).map(|p| LeafRecord::new(p, vec![b'k', p as u8], vec![tag])),
        Vec::new(),
    )
}

fn value_of(ds: &DataSource, path: i64) -> Result<Option<u8>> {
    let key = [b'k', path as u8];
    Ok(ds
        .load_leaf_record_by_key(&key, key_hash(&key))?
        .map(|leaf| leaf.value[0]))
}

fn wait_until(mut done: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if done() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    done()
}

#[test]
fn transient_copy_is_removed_on_close() -> Result<()> {
    let dir = tempdir()?;
    let instrumentation = Instrumentation::new();
    let registry = Registry::open(
        dir.path(),
        RegistryOptions::default().instrumentation(instrumentation.clone()),
    )?;
    let baseline = instrumentation.open_data_sources();
    let source = registry.create_data_source("t", config(), false)?;
    fill(&source, 1)?;

    let copy = registry.copy_data_source(&source, false, true)?;
    assert!(copy.is_transient());
    assert_ne!(copy.table_id(), source.table_id());
    assert_eq!(instrumentation.open_data_sources(), baseline + 2);
    let copy_dir = copy.storage_dir().to_path_buf();
    assert!(copy_dir.exists());

    fill(&copy, 2)?;
    assert_eq!(value_of(&copy, 5)?, Some(2));
    assert_eq!(value_of(&source, 5)?, Some(1));

    copy.close()?;
    assert!(wait_until(|| instrumentation.open_data_sources() == baseline + 1));
    assert!(!copy_dir.exists());
    assert_eq!(registry.table_names(), vec!["t".to_string()]);
    assert_eq!(registry.storage_dir("t")?, source.storage_dir());

    source.close()?;
    assert!(wait_until(|| instrumentation.open_data_sources() == baseline));
    assert_eq!(instrumentation.index_bytes(), 0);
    Ok(())
}

#[test]
fn active_copy_supersedes_the_source() -> Result<()> {
    let dir = tempdir()?;
    let registry = Registry::open(dir.path(), RegistryOptions::default())?;
    let source = registry.create_data_source("t", config(), false)?;
    fill(&source, 1)?;
    let old_dir = source.storage_dir().to_path_buf();

    let copy = registry.copy_data_source(&source, true, false)?;
    assert!(!copy.is_transient());
    assert_eq!(registry.storage_dir("t")?, copy.storage_dir());
    fill(&copy, 3)?;

    source.close()?;
    assert!(!old_dir.exists());
    assert!(matches!(
        registry.get_data_source("t", false),
        Err(StoreError::IllegalState(_))
    ));
    copy.close()?;

    let reopened = registry.get_data_source("t", false)?;
    assert_eq!(reopened.table_id(), copy.table_id());
    assert_eq!(value_of(&reopened, 6)?, Some(3));
    reopened.close()?;

    let registry = Registry::open(dir.path(), RegistryOptions::default())?;
    let persisted = registry.get_data_source("t", false)?;
    assert_eq!(persisted.table_id(), copy.table_id());
    assert_eq!(persisted.load_hash(0)?, Some(Hash::new(vec![3; 48])));
    Ok(())
}

#[test]
fn copy_of_closed_source_fails() -> Result<()> {
    let dir = tempdir()?;
    let registry = Registry::open(dir.path(), RegistryOptions::default())?;
    let source = registry.create_data_source("t", config(), false)?;
    source.close()?;
    assert!(matches!(
        registry.copy_data_source(&source, false, false),
        Err(StoreError::IllegalState(_))
    ));
    Ok(())
}

#[test]
fn close_and_delete_forgets_the_table() -> Result<()> {
    let dir = tempdir()?;
    let registry = Registry::open(dir.path(), RegistryOptions::default())?;
    let ds = registry.create_data_source("t", config(), false)?;
    fill(&ds, 1)?;
    let table_dir = ds.storage_dir().to_path_buf();
    ds.close_and_delete()?;
    assert!(!table_dir.exists());
    assert!(matches!(
        registry.get_data_source("t", false),
        Err(StoreError::NotFound(_))
    ));
    let fresh = registry.create_data_source("t", config(), false)?;
    assert_eq!(fresh.leaf_range(), vtreedb::KeyRange::EMPTY);
    Ok(())
}
