#![allow(missing_docs)]

use std::sync::Once;

use tempfile::{tempdir, TempDir};
use tracing_subscriber::EnvFilter;
use vtreedb::storage::{
    key_hash, DataSource, Hash, HashRecord, LeafRecord, Registry, RegistryOptions, TableConfig,
};
use vtreedb::types::{Result, StoreError};

fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("vtreedb=info"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .with_ansi(false)
            .try_init();
    });
}

fn hash(path: i64) -> Hash {
    let mut bytes = vec![0xA5u8; 48];
    bytes[..8].copy_from_slice(&path.to_le_bytes());
    Hash::new(bytes)
}

fn leaf(path: i64) -> LeafRecord {
    LeafRecord::new(
        path,
        format!("key-{path}").into_bytes(),
        format!("value-{path}").into_bytes(),
    )
}

fn setup(config: TableConfig) -> Result<(TempDir, Registry, DataSource)> {
    init_tracing();
    let dir = tempdir()?;
    let registry = Registry::open(dir.path().join("root"), RegistryOptions::default())?;
    let ds = registry.create_data_source("t", config, false)?;
    Ok((dir, registry, ds))
}

#[test]
fn hashes_and_leaves_round_trip() -> Result<()> {
    let (_dir, _registry, ds) = setup(TableConfig::default().hashes_ram_to_disk_threshold(100))?;
    ds.save_records(
        150,
        299,
        (0..150).map(|p| HashRecord::new(p, hash(p))),
        (150..300).map(leaf),
        Vec::new(),
    )?;
    for p in 0..150 {
        assert_eq!(ds.load_hash(p)?, Some(hash(p)), "hash {p}");
    }
    for p in 150..300 {
        let expected = leaf(p);
        let by_path = ds.load_leaf_record(p)?;
        let by_key = ds.load_leaf_record_by_key(&expected.key, key_hash(&expected.key))?;
        assert_eq!(by_path.as_ref(), Some(&expected));
        assert_eq!(by_key, by_path);
    }
    assert_eq!(ds.load_hash(300)?, None);
    assert_eq!(ds.load_leaf_record(300)?, None);
    assert_eq!(ds.load_leaf_record_by_key(b"absent", key_hash(b"absent"))?, None);
    Ok(())
}

#[test]
fn negative_paths_are_rejected() -> Result<()> {
    let (_dir, _registry, ds) = setup(TableConfig::default())?;
    ds.save_records(1, 2, Vec::new(), vec![leaf(1), leaf(2)], Vec::new())?;
    assert!(matches!(ds.load_hash(-1), Err(StoreError::InvalidArgument(_))));
    assert!(matches!(
        ds.load_leaf_record(-1),
        Err(StoreError::InvalidArgument(_))
    ));
    Ok(())
}

#[test]
fn deleted_leaf_is_absent_by_key_and_path() -> Result<()> {
    let (_dir, _registry, ds) = setup(TableConfig::default())?;
    ds.save_records(5, 9, Vec::new(), (5..=9).map(leaf), Vec::new())?;
    let gone = leaf(7);
    assert!(ds.load_leaf_record_by_key(&gone.key, key_hash(&gone.key))?.is_some());
    ds.save_records(5, 9, Vec::new(), Vec::new(), vec![gone.clone()])?;
    assert_eq!(ds.load_leaf_record(7)?, None);
    assert_eq!(ds.load_leaf_record_by_key(&gone.key, key_hash(&gone.key))?, None);
    assert_eq!(ds.find_key(&gone.key, key_hash(&gone.key))?, None);
    assert_eq!(ds.load_leaf_record(8)?, Some(leaf(8)));
    Ok(())
}

#[test]
fn moving_a_leaf_in_one_batch_leaves_old_path_empty() -> Result<()> {
    let (_dir, _registry, ds) = setup(TableConfig::default())?;
    ds.save_records(3, 6, Vec::new(), (3..=6).map(leaf), Vec::new())?;
    let original = leaf(4);
    let moved = LeafRecord::new(8, original.key.clone(), original.value.clone());
    ds.save_records(
        3,
        8,
        Vec::new(),
        vec![moved.clone()],
        vec![original.clone()],
    )?;
    assert_eq!(
        ds.load_leaf_record_by_key(&original.key, key_hash(&original.key))?,
        Some(moved.clone())
    );
    assert_eq!(ds.load_leaf_record(4)?, None);
    assert_eq!(ds.load_leaf_record(8)?, Some(moved));
    Ok(())
}

#[test]
fn update_wins_over_delete_of_same_key_in_one_batch() -> Result<()> {
    let (_dir, _registry, ds) = setup(TableConfig::default())?;
    ds.save_records(1, 2, Vec::new(), vec![leaf(1), leaf(2)], Vec::new())?;
    let updated = LeafRecord::new(2, leaf(2).key, b"fresh".to_vec());
    ds.save_records(1, 2, Vec::new(), vec![updated.clone()], vec![leaf(2)])?;
    assert_eq!(ds.load_leaf_record(2)?, Some(updated.clone()));
    assert_eq!(
        ds.load_leaf_record_by_key(&updated.key, key_hash(&updated.key))?,
        Some(updated)
    );
    Ok(())
}

#[test]
fn stale_delete_does_not_remove_reused_path() -> Result<()> {
    let (_dir, _registry, ds) = setup(TableConfig::default())?;
    ds.save_records(1, 2, Vec::new(), vec![leaf(1), leaf(2)], Vec::new())?;
    // Path 2 now holds another key; deleting the old key at 2 must keep it.
    let replacement = LeafRecord::new(2, b"other".to_vec(), b"x".to_vec());
    ds.save_records(1, 2, Vec::new(), vec![replacement.clone()], Vec::new())?;
    ds.save_records(1, 2, Vec::new(), Vec::new(), vec![leaf(2)])?;
    assert_eq!(ds.load_leaf_record(2)?, Some(replacement));
    Ok(())
}

#[test]
fn shrinking_the_range_hides_excluded_paths() -> Result<()> {
    let (_dir, _registry, ds) = setup(TableConfig::default().hashes_ram_to_disk_threshold(3))?;
    ds.save_records(
        4,
        8,
        (0..=8).map(|p| HashRecord::new(p, hash(p))),
        (4..=8).map(leaf),
        Vec::new(),
    )?;
    ds.save_records(2, 4, Vec::new(), Vec::new(), Vec::new())?;
    assert_eq!(ds.leaf_range().leaf_count(), 3);
    for p in 5..=8 {
        assert_eq!(ds.load_hash(p)?, None);
        assert_eq!(ds.load_leaf_record(p)?, None);
    }
    assert_eq!(ds.load_hash(4)?, Some(hash(4)));
    assert_eq!(ds.load_leaf_record(4)?, Some(leaf(4)));
    assert_eq!(ds.load_hash(1)?, Some(hash(1)));
    let excluded = leaf(6);
    assert_eq!(ds.find_key(&excluded.key, key_hash(&excluded.key))?, None);

    ds.save_records(-1, -1, Vec::new(), Vec::new(), Vec::new())?;
    assert_eq!(ds.load_hash(0)?, None);
    assert_eq!(ds.load_leaf_record(4)?, None);
    Ok(())
}

#[test]
fn second_writer_on_another_thread_is_rejected_or_serialised() -> Result<()> {
    let (_dir, _registry, ds) = setup(TableConfig::default())?;
    let handles: Vec<_> = (0..4)
        .map(|t| {
            let ds = ds.clone();
            std::thread::spawn(move || {
                let mut ok = 0;
                for round in 0..25i64 {
                    let path = 1 + (t * 25 + round) % 50;
                    match ds.save_records(1, 50, Vec::new(), vec![leaf(path)], Vec::new()) {
                        Ok(()) => ok += 1,
                        Err(StoreError::IllegalState(_)) => {}
                        Err(err) => return Err(err),
                    }
                }
                Ok(ok)
            })
        })
        .collect();
    let mut applied = 0u64;
    for handle in handles {
        applied += handle.join().expect("writer thread")?;
    }
    assert_eq!(ds.flush_version(), applied);
    Ok(())
}

#[test]
fn end_to_end_ten_thousand_leaves_survive_snapshot() -> Result<()> {
    let (dir, registry, ds) = setup(TableConfig::default().max_keys(20_000))?;
    ds.save_records(
        10_000,
        19_999,
        (0..10_000).map(|p| HashRecord::new(p, hash(p))),
        (10_000..20_000).map(leaf),
        Vec::new(),
    )?;
    for p in 0..10_000 {
        assert_eq!(ds.load_hash(p)?, Some(hash(p)));
    }

    let snapshot_root = dir.path().join("snapshot");
    registry.snapshot(&snapshot_root, &ds)?;
    let restored_registry = Registry::open(&snapshot_root, RegistryOptions::default())?;
    let restored = restored_registry.get_data_source("t", false)?;
    assert_eq!(restored.leaf_range(), ds.leaf_range());
    for p in 0..10_000 {
        assert_eq!(restored.load_hash(p)?, ds.load_hash(p)?);
    }
    for p in 10_000..20_000 {
        let original = ds.load_leaf_record(p)?;
        assert_eq!(restored.load_leaf_record(p)?, original);
        let key = leaf(p).key;
        assert_eq!(
            restored.load_leaf_record_by_key(&key, key_hash(&key))?,
            original
        );
    }
    Ok(())
}
