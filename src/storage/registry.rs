#![forbid(unsafe_code)]

use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};
use std::time::Instant;

use parking_lot::{const_mutex, Mutex, MutexGuard};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::primitives::io::{mirror_tree, write_atomic};
use crate::storage::compaction::compaction_pool;
use crate::storage::data_source::{CloseListener, DataSource, OpenParams};
use crate::storage::metrics::Instrumentation;
use crate::storage::options::{RegistryOptions, TableConfig};
use crate::types::{Result, StoreError, TableId};

const METADATA_FILE: &str = "metadata.json";
const SHARED_DIR: &str = "shared";
const TABLES_DIR: &str = "tables";
const METADATA_VERSION: u32 = 1;

/// Registries open in this process, keyed by canonical root.
static OPEN_ROOTS: Mutex<BTreeMap<PathBuf, Weak<Shared>>> = const_mutex(BTreeMap::new());

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
struct TableEntry {
    id: TableId,
    name: String,
    config: TableConfig,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct RegistryMetadata {
    version: u32,
    next_table_id: u32,
    tables: Vec<TableEntry>,
}

impl Default for RegistryMetadata {
    fn default() -> Self {
        Self {
            version: METADATA_VERSION,
            next_table_id: 1,
            tables: Vec::new(),
        }
    }
}

impl RegistryMetadata {
    fn load(root: &Path) -> Result<Option<Self>> {
        let path = root.join(METADATA_FILE);
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        let meta: RegistryMetadata = serde_json::from_slice(&bytes).map_err(|err| {
            StoreError::Corruption(format!("registry metadata {}: {err}", path.display()))
        })?;
        if meta.version != METADATA_VERSION {
            return Err(StoreError::Corruption(format!(
                "unsupported registry metadata version {}",
                meta.version
            )));
        }
        Ok(Some(meta))
    }

    fn save(&self, root: &Path) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(self)?;
        write_atomic(&root.join(METADATA_FILE), &bytes)
    }

    fn entry(&self, name: &str) -> Option<&TableEntry> {
        self.tables.iter().find(|entry| entry.name == name)
    }

    fn allocate_id(&mut self) -> TableId {
        let id = TableId(self.next_table_id);
        self.next_table_id += 1;
        id
    }
}

fn table_dir_name(name: &str, id: TableId) -> String {
    format!("{name}-{id}")
}

fn validate_name(name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
        && name != "."
        && name != "..";
    if valid {
        Ok(())
    } else {
        Err(StoreError::InvalidArgument(format!(
            "table name {name:?} must be non-empty ASCII letters, digits, '_', '-' or '.'"
        )))
    }
}

struct RegistryState {
    meta: RegistryMetadata,
    open: HashSet<TableId>,
}

struct Shared {
    root: PathBuf,
    options: RegistryOptions,
    pool: Arc<rayon::ThreadPool>,
    state: Mutex<RegistryState>,
}

/// Owns the tables under one storage root.
///
/// The registry persists table names, ids and configs in `metadata.json`,
/// hands out [`DataSource`]s, and takes and restores snapshots. A table can be
/// open at most once at a time, and a process holds at most one registry per
/// root: opening a root that is already open returns the live registry.
#[derive(Clone)]
pub struct Registry {
    shared: Arc<Shared>,
}

impl Registry {
    /// Opens or initialises the storage root at `root`.
    ///
    /// When this process already has the root open, the existing registry is
    /// returned and `options` are ignored. Otherwise table directories that no
    /// longer belong to a registered table, such as transient copies left
    /// behind by a crash, are removed.
    pub fn open(root: impl AsRef<Path>, options: RegistryOptions) -> Result<Self> {
        options.config.validate()?;
        let root = root.as_ref();
        fs::create_dir_all(root.join(SHARED_DIR))?;
        fs::create_dir_all(root.join(TABLES_DIR))?;
        let root = fs::canonicalize(root)?;

        let mut roots = OPEN_ROOTS.lock();
        if let Some(shared) = roots.get(&root).and_then(Weak::upgrade) {
            drop(roots);
            debug!(root = %root.display(), "registry.reused");
            return Ok(Self { shared });
        }
        let meta = match RegistryMetadata::load(&root)? {
            Some(meta) => meta,
            None => {
                let meta = RegistryMetadata::default();
                meta.save(&root)?;
                meta
            }
        };
        remove_orphans(&root, &meta)?;
        let pool = compaction_pool(options.config.compaction_threads)?;
        info!(
            root = %root.display(),
            tables = meta.tables.len(),
            next_table_id = meta.next_table_id,
            "registry.opened"
        );
        let shared = Arc::new(Shared {
            root: root.clone(),
            options,
            pool,
            state: Mutex::new(RegistryState {
                meta,
                open: HashSet::new(),
            }),
        });
        roots.insert(root, Arc::downgrade(&shared));
        Ok(Self { shared })
    }

    /// Restores a registry from `snapshot_dir`.
    ///
    /// With a `target_dir` that holds no registry yet, the snapshot layout is
    /// linked (or copied) there first. Without one, the snapshot directory is
    /// opened in place.
    pub fn restore(
        snapshot_dir: impl AsRef<Path>,
        target_dir: Option<&Path>,
        options: RegistryOptions,
    ) -> Result<Self> {
        let snapshot_dir = snapshot_dir.as_ref();
        if !snapshot_dir.join(METADATA_FILE).exists() {
            return Err(StoreError::NotFound(format!(
                "no snapshot at {}",
                snapshot_dir.display()
            )));
        }
        let Some(target) = target_dir else {
            return Self::open(snapshot_dir, options);
        };
        if !target.join(METADATA_FILE).exists() {
            let started = Instant::now();
            mirror_tree(snapshot_dir, target, options.config.link_mode)?;
            info!(
                source = %snapshot_dir.display(),
                target = %target.display(),
                millis = started.elapsed().as_millis() as u64,
                "registry.restored"
            );
        }
        Self::open(target, options)
    }

    /// Storage root of this registry.
    pub fn root(&self) -> &Path {
        &self.shared.root
    }

    /// Counters shared by every data source of this registry.
    pub fn instrumentation(&self) -> &Arc<Instrumentation> {
        &self.shared.options.instrumentation
    }

    /// Names of the registered tables, sorted.
    pub fn table_names(&self) -> Vec<String> {
        let state = self.shared.state.lock();
        let mut names: Vec<String> = state.meta.tables.iter().map(|e| e.name.clone()).collect();
        names.sort();
        names
    }

    /// Config of a registered table.
    pub fn table_config(&self, name: &str) -> Result<TableConfig> {
        let state = self.shared.state.lock();
        state
            .meta
            .entry(name)
            .map(|entry| entry.config.clone())
            .ok_or_else(|| unknown_table(name))
    }

    /// Directory of the current incarnation of a registered table.
    pub fn storage_dir(&self, name: &str) -> Result<PathBuf> {
        let state = self.shared.state.lock();
        let entry = state.meta.entry(name).ok_or_else(|| unknown_table(name))?;
        Ok(self.shared.table_dir(&entry.name, entry.id))
    }

    /// Creates a table, or reopens an existing closed one with the same config.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::IllegalState`] when the table is open or was
    /// created with a different config.
    pub fn create_data_source(
        &self,
        name: &str,
        config: TableConfig,
        enable_compaction: bool,
    ) -> Result<DataSource> {
        validate_name(name)?;
        config.validate()?;
        let mut state = self.shared.state.lock();
        if let Some(entry) = state.meta.entry(name).cloned() {
            if state.open.contains(&entry.id) {
                return Err(already_open(name));
            }
            if entry.config != config {
                return Err(StoreError::IllegalState(format!(
                    "table {name} exists with a different config"
                )));
            }
            return self.open_entry(&mut state, &entry, false, enable_compaction);
        }

        let mut meta = state.meta.clone();
        let entry = TableEntry {
            id: meta.allocate_id(),
            name: name.to_string(),
            config,
        };
        meta.tables.push(entry.clone());
        meta.save(&self.shared.root)?;
        state.meta = meta;
        info!(table = name, id = entry.id.0, "registry.table_created");
        self.open_entry(&mut state, &entry, true, enable_compaction)
    }

    /// Opens an existing closed table.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] for an unknown table,
    /// [`StoreError::IllegalState`] when it is already open and
    /// [`StoreError::Corruption`] when its metadata is missing or damaged.
    pub fn get_data_source(&self, name: &str, enable_compaction: bool) -> Result<DataSource> {
        let mut state = self.shared.state.lock();
        let entry = state
            .meta
            .entry(name)
            .cloned()
            .ok_or_else(|| unknown_table(name))?;
        if state.open.contains(&entry.id) {
            return Err(already_open(name));
        }
        self.open_entry(&mut state, &entry, false, enable_compaction)
    }

    /// Copies `source` into a new table directory and opens the copy.
    ///
    /// With `make_active` the copy becomes the table's current incarnation and
    /// the source's directory is removed once the source closes. Otherwise the
    /// copy is transient and deleted when it closes.
    pub fn copy_data_source(
        &self,
        source: &DataSource,
        make_active: bool,
        enable_compaction: bool,
    ) -> Result<DataSource> {
        let name = source.table_name().to_string();
        let id = {
            let mut state = self.shared.state.lock();
            let mut meta = state.meta.clone();
            let id = meta.allocate_id();
            meta.save(&self.shared.root)?;
            state.meta = meta;
            id
        };
        let dir = self.shared.table_dir(&name, id);
        let started = Instant::now();
        source.snapshot_into(&dir, self.shared.options.config.link_mode)?;

        let mut state = self.shared.state.lock();
        let entry = TableEntry {
            id,
            name: name.clone(),
            config: source.table_config().clone(),
        };
        if make_active {
            let mut meta = state.meta.clone();
            match meta.tables.iter_mut().find(|e| e.name == name) {
                Some(existing) => *existing = entry.clone(),
                None => meta.tables.push(entry.clone()),
            }
            if let Err(err) = meta.save(&self.shared.root) {
                drop(state);
                remove_dir_logged(&dir);
                return Err(err);
            }
            state.meta = meta;
        }
        let opened = self.open_params(&entry, false, !make_active, enable_compaction);
        let copy = match DataSource::open(opened) {
            Ok(copy) => copy,
            Err(err) => {
                drop(state);
                if !make_active {
                    remove_dir_logged(&dir);
                }
                return Err(err);
            }
        };
        state.open.insert(id);
        info!(
            table = %name,
            source_id = source.table_id().0,
            id = id.0,
            make_active,
            millis = started.elapsed().as_millis() as u64,
            "registry.copy.completed"
        );
        Ok(copy)
    }

    /// Writes a snapshot of one open data source under `target_dir`.
    pub fn snapshot(&self, target_dir: impl AsRef<Path>, source: &DataSource) -> Result<()> {
        self.snapshot_all(target_dir, std::slice::from_ref(source))
    }

    /// Writes a snapshot of several open data sources under `target_dir`.
    ///
    /// `target_dir` becomes a storage root that [`Registry::restore`] or
    /// [`Registry::open`] can load. Tables are added to an existing target
    /// root.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::IllegalState`] when the target already holds a
    /// table of the same name or a snapshot of a source is already running.
    pub fn snapshot_all(&self, target_dir: impl AsRef<Path>, sources: &[DataSource]) -> Result<()> {
        let target = target_dir.as_ref();
        let started = Instant::now();
        let mut meta = RegistryMetadata::load(target)?.unwrap_or_default();
        let mut names = HashSet::new();
        for source in sources {
            let name = source.table_name();
            if meta.entry(name).is_some() || !names.insert(name) {
                return Err(StoreError::IllegalState(format!(
                    "snapshot target {} already holds table {name}",
                    target.display()
                )));
            }
        }
        fs::create_dir_all(target.join(SHARED_DIR))?;
        fs::create_dir_all(target.join(TABLES_DIR))?;
        mirror_tree(
            &self.shared.root.join(SHARED_DIR),
            &target.join(SHARED_DIR),
            self.shared.options.config.link_mode,
        )?;
        for source in sources {
            let id = source.table_id();
            let dir = target
                .join(TABLES_DIR)
                .join(table_dir_name(source.table_name(), id));
            source.snapshot_into(&dir, self.shared.options.config.link_mode)?;
            meta.tables.push(TableEntry {
                id,
                name: source.table_name().to_string(),
                config: source.table_config().clone(),
            });
            meta.next_table_id = meta.next_table_id.max(id.0 + 1);
            meta.save(target)?;
            debug!(table = %source.table_name(), id = id.0, "registry.snapshot.table");
        }
        meta.save(target)?;
        info!(
            target = %target.display(),
            tables = sources.len(),
            millis = started.elapsed().as_millis() as u64,
            "registry.snapshot.completed"
        );
        Ok(())
    }

    /// Removes a closed table's registry entry and files.
    pub fn delete_table(&self, name: &str) -> Result<()> {
        let mut state = self.shared.state.lock();
        let entry = state
            .meta
            .entry(name)
            .cloned()
            .ok_or_else(|| unknown_table(name))?;
        if state.open.contains(&entry.id) {
            return Err(already_open(name));
        }
        let mut meta = state.meta.clone();
        meta.tables.retain(|e| e.name != name);
        meta.save(&self.shared.root)?;
        state.meta = meta;
        drop(state);
        let dir = self.shared.table_dir(name, entry.id);
        if dir.exists() {
            fs::remove_dir_all(&dir)?;
        }
        info!(table = name, id = entry.id.0, "registry.table_deleted");
        Ok(())
    }

    fn open_params(
        &self,
        entry: &TableEntry,
        create: bool,
        transient: bool,
        enable_compaction: bool,
    ) -> OpenParams {
        let shared: Weak<Shared> = Arc::downgrade(&self.shared);
        let listener: Weak<dyn CloseListener> = shared;
        OpenParams {
            name: entry.name.clone(),
            id: entry.id,
            dir: self.shared.table_dir(&entry.name, entry.id),
            config: entry.config.clone(),
            engine: self.shared.options.config.clone(),
            create,
            transient,
            enable_compaction,
            pool: self.shared.pool.clone(),
            metrics: self.shared.options.metrics.clone(),
            instrumentation: self.shared.options.instrumentation.clone(),
            listener: Some(listener),
        }
    }

    fn open_entry(
        &self,
        state: &mut MutexGuard<'_, RegistryState>,
        entry: &TableEntry,
        create: bool,
        enable_compaction: bool,
    ) -> Result<DataSource> {
        let ds = DataSource::open(self.open_params(entry, create, false, enable_compaction))?;
        state.open.insert(entry.id);
        Ok(ds)
    }
}

impl Shared {
    fn table_dir(&self, name: &str, id: TableId) -> PathBuf {
        self.root.join(TABLES_DIR).join(table_dir_name(name, id))
    }
}

impl Drop for Shared {
    fn drop(&mut self) {
        let mut roots = OPEN_ROOTS.lock();
        if roots
            .get(&self.root)
            .is_some_and(|entry| entry.strong_count() == 0)
        {
            roots.remove(&self.root);
        }
    }
}

impl CloseListener for Shared {
    fn data_source_closed(&self, id: TableId, name: &str, deleted: bool) {
        let mut state = self.state.lock();
        state.open.remove(&id);
        let active = state.meta.entry(name).map(|entry| entry.id) == Some(id);
        if deleted && active {
            let mut meta = state.meta.clone();
            meta.tables.retain(|entry| entry.id != id);
            match meta.save(&self.root) {
                Ok(()) => state.meta = meta,
                Err(err) => warn!(table = name, error = %err, "registry.metadata_save_failed"),
            }
        } else if !deleted && !active {
            drop(state);
            let dir = self.table_dir(name, id);
            if dir.exists() {
                remove_dir_logged(&dir);
                debug!(table = name, id = id.0, "registry.superseded_removed");
            }
        }
    }
}

fn remove_orphans(root: &Path, meta: &RegistryMetadata) -> Result<()> {
    let live: HashSet<String> = meta
        .tables
        .iter()
        .map(|entry| table_dir_name(&entry.name, entry.id))
        .collect();
    for dirent in fs::read_dir(root.join(TABLES_DIR))? {
        let dirent = dirent?;
        let name = dirent.file_name().to_string_lossy().into_owned();
        if dirent.file_type()?.is_dir() && !live.contains(&name) {
            fs::remove_dir_all(dirent.path())?;
            info!(dir = %name, "registry.orphan_removed");
        }
    }
    Ok(())
}

fn remove_dir_logged(dir: &Path) {
    if let Err(err) = fs::remove_dir_all(dir) {
        warn!(dir = %dir.display(), error = %err, "registry.remove_dir_failed");
    }
}

fn unknown_table(name: &str) -> StoreError {
    StoreError::NotFound(format!("table {name}"))
}

fn already_open(name: &str) -> StoreError {
    StoreError::IllegalState(format!("table {name} is already open"))
}
