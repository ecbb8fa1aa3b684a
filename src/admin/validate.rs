use serde::Serialize;
use tracing::{info, warn};

use crate::storage::record::key_hash;
use crate::storage::DataSource;

const MAX_FINDINGS: usize = 32;

/// Indicates the severity level of a validation finding.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationSeverity {
    /// Informational message about the validation process.
    Info,
    /// Missing or inconsistent data.
    Error,
}

/// A single issue discovered during validation.
#[derive(Clone, Debug, Serialize)]
pub struct ValidationFinding {
    /// The severity level of this finding.
    pub severity: ValidationSeverity,
    /// Human-readable description of the issue.
    pub message: String,
}

impl ValidationFinding {
    fn error(message: impl Into<String>) -> Self {
        Self {
            severity: ValidationSeverity::Error,
            message: message.into(),
        }
    }

    fn info(message: impl Into<String>) -> Self {
        Self {
            severity: ValidationSeverity::Info,
            message: message.into(),
        }
    }
}

/// What the validator looked at.
#[derive(Clone, Debug, Default, Serialize)]
pub struct ValidationCounts {
    /// Leaf paths checked.
    pub leaves_checked: u64,
    /// Internal paths whose hash was checked.
    pub hashes_checked: u64,
    /// key→path entries checked.
    pub key_entries_checked: u64,
    /// Errors found, including ones beyond the reported findings.
    pub errors: u64,
}

/// Complete report of a validation run.
#[derive(Clone, Debug, Serialize)]
pub struct ValidationReport {
    /// Table that was validated.
    pub table: String,
    /// Whether no errors were found.
    pub success: bool,
    /// The first issues discovered, capped.
    pub findings: Vec<ValidationFinding>,
    /// Statistics about the data examined.
    pub counts: ValidationCounts,
}

/// Checks that a data source's hashes, leaves and key index agree.
///
/// Every leaf path in range must hold a record whose key maps back to it,
/// every internal path must hold a hash, and every key→path entry must point
/// at a leaf holding that key. Run it while no writer is active.
pub struct Validator<'a> {
    data_source: &'a DataSource,
}

impl<'a> Validator<'a> {
    /// Creates a validator for `data_source`.
    pub fn new(data_source: &'a DataSource) -> Self {
        Self { data_source }
    }

    /// Returns `true` when the data source is consistent.
    pub fn validate(&self) -> bool {
        self.validate_report().success
    }

    /// Runs every check and reports what was found.
    pub fn validate_report(&self) -> ValidationReport {
        let ds = self.data_source;
        let mut report = ValidationReport {
            table: ds.table_name().to_string(),
            success: false,
            findings: Vec::new(),
            counts: ValidationCounts::default(),
        };
        let range = ds.leaf_range();
        if range.is_empty() {
            report
                .findings
                .push(ValidationFinding::info("data source holds no leaves"));
        } else {
            check_leaves(ds, range.first, range.last, &mut report);
            check_hashes(ds, range.first, &mut report);
        }
        check_key_entries(ds, &mut report);

        report.success = report.counts.errors == 0;
        if report.success {
            info!(
                table = %report.table,
                leaves = report.counts.leaves_checked,
                hashes = report.counts.hashes_checked,
                key_entries = report.counts.key_entries_checked,
                "validator.passed"
            );
        } else {
            warn!(
                table = %report.table,
                errors = report.counts.errors,
                "validator.failed"
            );
        }
        report
    }
}

fn check_leaves(ds: &DataSource, first: i64, last: i64, report: &mut ValidationReport) {
    for path in first..=last {
        report.counts.leaves_checked += 1;
        let leaf = match ds.load_leaf_record(path) {
            Ok(Some(leaf)) => leaf,
            Ok(None) => {
                push_error(report, format!("leaf {path} is missing"));
                continue;
            }
            Err(err) => {
                push_error(report, format!("failed to load leaf {path}: {err}"));
                continue;
            }
        };
        if leaf.path != path {
            push_error(report, format!("leaf {path} reports path {}", leaf.path));
        }
        match ds.find_key(&leaf.key, key_hash(&leaf.key)) {
            Ok(Some(found)) if found == path => {}
            Ok(Some(found)) => push_error(
                report,
                format!("key of leaf {path} maps to path {found}"),
            ),
            Ok(None) => push_error(report, format!("key of leaf {path} is not indexed")),
            Err(err) => push_error(report, format!("failed to look up key of leaf {path}: {err}")),
        }
    }
}

fn check_hashes(ds: &DataSource, first: i64, report: &mut ValidationReport) {
    for path in 0..first {
        report.counts.hashes_checked += 1;
        match ds.load_hash(path) {
            Ok(Some(_)) => {}
            Ok(None) => push_error(report, format!("hash of internal path {path} is missing")),
            Err(err) => push_error(report, format!("failed to load hash {path}: {err}")),
        }
    }
}

fn check_key_entries(ds: &DataSource, report: &mut ValidationReport) {
    let range = ds.leaf_range();
    let mut problems = Vec::new();
    let mut checked = 0u64;
    let scanned = ds.for_each_key_entry(|key, path| {
        checked += 1;
        if !range.contains(path) {
            problems.push(format!("key entry points at {path} outside the leaf range"));
            return Ok(());
        }
        match ds.load_leaf_record(path) {
            Ok(Some(leaf)) if leaf.key.as_ref() == key => {}
            Ok(Some(_)) => problems.push(format!("key entry for path {path} names another key")),
            Ok(None) => problems.push(format!("key entry points at missing leaf {path}")),
            Err(err) => problems.push(format!("failed to load leaf {path}: {err}")),
        }
        Ok(())
    });
    report.counts.key_entries_checked += checked;
    for problem in problems {
        push_error(report, problem);
    }
    if let Err(err) = scanned {
        push_error(report, format!("failed to scan key index: {err}"));
    }
}

fn push_error(report: &mut ValidationReport, message: impl Into<String>) {
    report.counts.errors += 1;
    if report.findings.len() < MAX_FINDINGS {
        report.findings.push(ValidationFinding::error(message));
    }
}
