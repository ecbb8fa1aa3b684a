use serde::Serialize;

use crate::storage::compaction::StoreKind;
use crate::storage::data_source::DataSourceState;
use crate::storage::DataSource;

/// Snapshot of one data source's size and state.
#[derive(Debug, Clone, Serialize)]
pub struct StatsReport {
    pub table: TableStatsSection,
    pub stores: Vec<StoreStatsSection>,
    pub index: IndexStatsSection,
}

#[derive(Debug, Clone, Serialize)]
pub struct TableStatsSection {
    pub name: String,
    pub id: u32,
    pub storage_dir: String,
    pub state: DataSourceState,
    pub transient: bool,
    pub first_leaf_path: i64,
    pub last_leaf_path: i64,
    pub flush_version: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct StoreStatsSection {
    pub store: &'static str,
    pub files: usize,
    pub bytes: u64,
    pub compacting: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct IndexStatsSection {
    pub memory_bytes: usize,
    pub compaction_enabled: bool,
}

pub fn stats(data_source: &DataSource) -> StatsReport {
    let range = data_source.leaf_range();
    let table = TableStatsSection {
        name: data_source.table_name().to_string(),
        id: data_source.table_id().0,
        storage_dir: data_source.storage_dir().display().to_string(),
        state: data_source.state(),
        transient: data_source.is_transient(),
        first_leaf_path: range.first,
        last_leaf_path: range.last,
        flush_version: data_source.flush_version(),
    };

    let stores = StoreKind::ALL
        .iter()
        .map(|&store| {
            let (files, bytes) = data_source.store_files(store);
            StoreStatsSection {
                store: store.as_str(),
                files,
                bytes,
                compacting: data_source.is_compacting(store),
            }
        })
        .collect();

    let index = IndexStatsSection {
        memory_bytes: data_source.index_bytes(),
        compaction_enabled: data_source.is_compaction_enabled(),
    };

    StatsReport {
        table,
        stores,
        index,
    }
}
