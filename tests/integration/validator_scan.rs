#![allow(missing_docs)]

use std::collections::HashMap;
use std::fs;

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use tempfile::tempdir;
use vtreedb::admin::ValidationSeverity;
use vtreedb::storage::{
    key_hash, DataSource, EngineConfig, Hash, HashRecord, LeafRecord, Registry, RegistryOptions,
    TableConfig,
};
use vtreedb::types::Result;
use vtreedb::Validator;

/// Keys laid out left to right over the leaf range `[n - 1, 2n - 2]`.
struct Model {
    keys: Vec<Vec<u8>>,
    values: HashMap<Vec<u8>, Vec<u8>>,
    hashes: Vec<Hash>,
    next_key: u64,
}

impl Model {
    fn new() -> Self {
        Self {
            keys: Vec::new(),
            values: HashMap::new(),
            hashes: Vec::new(),
            next_key: 0,
        }
    }

    fn range(len: usize) -> (i64, i64) {
        if len == 0 {
            (-1, -1)
        } else {
            (len as i64 - 1, 2 * len as i64 - 2)
        }
    }

    fn record(&self, index: usize, first: i64) -> LeafRecord {
        let key = &self.keys[index];
        LeafRecord::new(first + index as i64, key.clone(), self.values[key].clone())
    }

    /// Applies one random batch to both the model and `ds`.
    fn step(&mut self, rng: &mut ChaCha8Rng, ds: &DataSource) -> Result<()> {
        let (old_first, _) = Self::range(self.keys.len());
        let old_paths: HashMap<Vec<u8>, i64> = self
            .keys
            .iter()
            .enumerate()
            .map(|(index, key)| (key.clone(), old_first + index as i64))
            .collect();
        let new_len = rng.gen_range(0..=40usize);

        let mut deleted = Vec::new();
        while self.keys.len() > new_len {
            let index = rng.gen_range(0..self.keys.len());
            let key = self.keys.remove(index);
            let value = self.values.remove(&key).unwrap_or_default();
            deleted.push(LeafRecord::new(old_paths[&key], key, value));
        }
        while self.keys.len() < new_len {
            let key = format!("key-{}", self.next_key).into_bytes();
            self.next_key += 1;
            self.values.insert(key.clone(), vec![0]);
            let at = rng.gen_range(0..=self.keys.len());
            self.keys.insert(at, key);
        }

        let (first, last) = Self::range(new_len);
        let mut leaves = Vec::new();
        for index in 0..new_len {
            let path = first + index as i64;
            let moved = old_paths.get(&self.keys[index]) != Some(&path);
            let touched = rng.gen_bool(0.2);
            if touched {
                if let Some(value) = self.values.get_mut(&self.keys[index]) {
                    value[0] = value[0].wrapping_add(1);
                }
            }
            if moved || touched {
                leaves.push(self.record(index, first));
            }
        }

        self.hashes = (0..first.max(0))
            .map(|p| {
                let mut bytes = vec![0u8; 48];
                rng.fill(&mut bytes[..]);
                bytes[..8].copy_from_slice(&p.to_le_bytes());
                Hash::new(bytes)
            })
            .collect();
        let internal: Vec<HashRecord> = self
            .hashes
            .iter()
            .enumerate()
            .map(|(p, hash)| HashRecord::new(p as i64, hash.clone()))
            .collect();
        ds.save_records(first, last, internal, leaves, deleted)
    }

    fn check(&self, ds: &DataSource, removed: &[Vec<u8>]) -> Result<()> {
        let (first, _) = Self::range(self.keys.len());
        for (index, key) in self.keys.iter().enumerate() {
            let expected = self.record(index, first);
            assert_eq!(ds.load_leaf_record(expected.path)?, Some(expected.clone()));
            assert_eq!(ds.load_leaf_record_by_key(key, key_hash(key))?, Some(expected));
        }
        for key in removed {
            if !self.values.contains_key(key) {
                assert_eq!(ds.load_leaf_record_by_key(key, key_hash(key))?, None);
            }
        }
        for (p, hash) in self.hashes.iter().enumerate() {
            assert_eq!(ds.load_hash(p as i64)?.as_ref(), Some(hash));
        }
        Ok(())
    }
}

fn open(dir: &std::path::Path, engine: EngineConfig) -> Result<Registry> {
    Registry::open(dir, RegistryOptions::default().config(engine))
}

fn config() -> TableConfig {
    TableConfig::default()
        .max_keys(128)
        .hashes_ram_to_disk_threshold(10)
}

#[test]
fn random_batches_keep_the_table_consistent() -> Result<()> {
    for seed in [7u64, 42, 2024] {
        let dir = tempdir()?;
        let engine = EngineConfig::default().compaction_check_interval(4);
        let registry = open(dir.path(), engine)?;
        let ds = registry.create_data_source("random", config(), true)?;
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let mut model = Model::new();
        let mut seen_keys: Vec<Vec<u8>> = Vec::new();
        for step in 0..60 {
            model.step(&mut rng, &ds)?;
            seen_keys.extend(model.keys.iter().cloned());
            if step % 10 == 9 {
                ds.wait_for_compaction();
                model.check(&ds, &seen_keys)?;
                let report = Validator::new(&ds).validate_report();
                assert!(report.success, "seed {seed} step {step}: {:?}", report.findings);
            }
        }
        ds.close()?;

        let ds = registry.get_data_source("random", false)?;
        model.check(&ds, &seen_keys)?;
        assert!(Validator::new(&ds).validate());
    }
    Ok(())
}

#[test]
fn missing_leaf_files_are_reported_not_raised() -> Result<()> {
    let dir = tempdir()?;
    let registry = open(dir.path(), EngineConfig::default())?;
    let ds = registry.create_data_source("t", config(), false)?;
    ds.save_records(
        3,
        6,
        (0..3).map(|p| HashRecord::new(p, Hash::new(vec![p as u8; 48]))),
        (3..=6).map(|p| LeafRecord::new(p, vec![p as u8], vec![1])),
        Vec::new(),
    )?;
    assert!(Validator::new(&ds).validate());
    let leaves_dir = ds.storage_dir().join("leaves");
    ds.close()?;

    for entry in fs::read_dir(&leaves_dir)? {
        fs::remove_file(entry?.path())?;
    }
    let ds = registry.get_data_source("t", false)?;
    let report = Validator::new(&ds).validate_report();
    assert!(!report.success);
    assert!(report.counts.errors >= 4);
    assert!(report
        .findings
        .iter()
        .all(|finding| finding.severity == ValidationSeverity::Error));
    Ok(())
}
