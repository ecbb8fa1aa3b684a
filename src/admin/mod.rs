#![forbid(unsafe_code)]

//! Consistency checks and statistics for data sources.

mod stats;
mod validate;

/// Statistics collection and reporting.
///
/// Gathers the leaf range, per-store file counts and sizes, and index memory of
/// one data source.
pub use stats::{stats, IndexStatsSection, StatsReport, StoreStatsSection, TableStatsSection};

/// Data source integrity validation.
pub use validate::{
    ValidationCounts, ValidationFinding, ValidationReport, ValidationSeverity, Validator,
};
