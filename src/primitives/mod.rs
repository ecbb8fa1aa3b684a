//! Low-level primitives for building the storage engine.
//!
//! Includes byte codecs, positioned file I/O and concurrency controls.

/// Byte-level utilities and encoding/decoding.
pub mod bytes;

/// Cancellation tokens and the per-table lock.
pub mod concurrency;

/// Positioned reads, atomic metadata writes and link-or-copy helpers.
pub mod io;
