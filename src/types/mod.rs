#![forbid(unsafe_code)]
//! Shared error type, identifiers and checksum helpers.

use thiserror::Error;

/// Length and checksum framing of data file items.
pub mod checksum;

/// Sentinel path meaning "no path".
pub const INVALID_PATH: i64 = -1;

/// Numeric identifier assigned to a table by the registry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
#[serde(transparent)]
pub struct TableId(pub u32);

impl std::fmt::Display for TableId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Errors produced by the storage engine.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Underlying I/O failure.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// On-disk data failed validation.
    #[error("corruption: {0}")]
    Corruption(String),
    /// Caller supplied an argument outside the accepted domain.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    /// Operation is not permitted in the current state.
    #[error("illegal state: {0}")]
    IllegalState(String),
    /// Named entity does not exist.
    #[error("not found: {0}")]
    NotFound(String),
    /// Metadata or configuration could not be encoded or decoded.
    #[error("serialization error: {0}")]
    Serialization(String),
    /// Work was cancelled before it completed.
    #[error("operation interrupted")]
    Interrupted,
}

impl StoreError {
    pub(crate) fn invalid_path(path: i64) -> Self {
        StoreError::InvalidArgument(format!("path {path} is not a valid path"))
    }

    pub(crate) fn closed(name: &str) -> Self {
        StoreError::IllegalState(format!("data source {name} is closed"))
    }

    /// Returns true when the error represents a cooperative cancellation.
    pub fn is_interrupted(&self) -> bool {
        matches!(self, StoreError::Interrupted)
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Serialization(err.to_string())
    }
}

impl From<toml::de::Error> for StoreError {
    fn from(err: toml::de::Error) -> Self {
        StoreError::Serialization(err.to_string())
    }
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, StoreError>;
