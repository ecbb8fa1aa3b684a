#![forbid(unsafe_code)]

use std::fmt;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::primitives::bytes::{buf::Cursor, le};
use crate::storage::serializer::ByteFormat;
use crate::types::{Result, StoreError, INVALID_PATH};

/// Digest algorithm whose output length fixes the size of every stored hash.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DigestType {
    /// SHA-384, 48-byte digests.
    #[default]
    Sha384,
    /// SHA-256, 32-byte digests.
    Sha256,
}

impl DigestType {
    /// Digest length in bytes.
    pub const fn len(self) -> usize {
        match self {
            DigestType::Sha384 => 48,
            DigestType::Sha256 => 32,
        }
    }
}

/// A node hash. The engine stores hashes, it never computes them.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Hash(Bytes);

impl Hash {
    /// Wraps digest bytes produced by the caller.
    pub fn new(bytes: impl Into<Bytes>) -> Self {
        Self(bytes.into())
    }

    /// Raw digest bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Digest length in bytes.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// True for a zero-length digest.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Hash(")?;
        for byte in self.0.iter().take(6) {
            write!(f, "{byte:02x}")?;
        }
        if self.0.len() > 6 {
            write!(f, "..")?;
        }
        write!(f, ")")
    }
}

/// Inclusive range of leaf paths. `first = last = -1` means the tree has no leaves.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyRange {
    /// First leaf path.
    pub first: i64,
    /// Last leaf path.
    pub last: i64,
}

impl KeyRange {
    /// The empty range.
    pub const EMPTY: KeyRange = KeyRange {
        first: INVALID_PATH,
        last: INVALID_PATH,
    };

    /// Builds a leaf range, rejecting inverted or partially unset bounds.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::InvalidArgument`] unless the range is `-1/-1` or
    /// `0 <= first <= last`.
    pub fn new(first: i64, last: i64) -> Result<Self> {
        if first == INVALID_PATH && last == INVALID_PATH {
            return Ok(Self::EMPTY);
        }
        if first < 0 || last < first {
            return Err(StoreError::InvalidArgument(format!(
                "invalid leaf range [{first}, {last}]"
            )));
        }
        Ok(Self { first, last })
    }

    /// True when no leaves exist.
    pub fn is_empty(&self) -> bool {
        self.first < 0
    }

    /// True when `path` holds a leaf.
    pub fn contains(&self, path: i64) -> bool {
        !self.is_empty() && path >= self.first && path <= self.last
    }

    /// Number of leaf paths in the range.
    pub fn leaf_count(&self) -> u64 {
        if self.is_empty() {
            0
        } else {
            (self.last - self.first + 1) as u64
        }
    }
}

impl Default for KeyRange {
    fn default() -> Self {
        Self::EMPTY
    }
}

/// A hash stored at a tree path.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HashRecord {
    /// Tree path.
    pub path: i64,
    /// Hash at that path.
    pub hash: Hash,
}

impl HashRecord {
    /// Creates a hash record.
    pub fn new(path: i64, hash: Hash) -> Self {
        Self { path, hash }
    }

    pub(crate) fn encode(&self, out: &mut Vec<u8>) {
        le::put_i64(out, self.path);
        out.extend_from_slice(self.hash.as_bytes());
    }

    pub(crate) fn decode(src: &[u8], digest: DigestType) -> Result<Self> {
        let mut cur = Cursor::new(src);
        let path = cur.i64()?;
        let hash = Hash::new(Bytes::copy_from_slice(cur.take(digest.len())?));
        cur.finish()?;
        Ok(Self { path, hash })
    }
}

/// A key/value leaf stored at a tree path.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LeafRecord {
    /// Tree path.
    pub path: i64,
    /// Key bytes in the table's key format.
    pub key: Bytes,
    /// Value bytes in the table's value format.
    pub value: Bytes,
}

impl LeafRecord {
    /// Creates a leaf record.
    pub fn new(path: i64, key: impl Into<Bytes>, value: impl Into<Bytes>) -> Self {
        Self {
            path,
            key: key.into(),
            value: value.into(),
        }
    }

    /// Hash code of this record's key, as used by the key→path index.
    pub fn key_hash(&self) -> u64 {
        key_hash(&self.key)
    }

    pub(crate) fn encode(
        &self,
        key_format: ByteFormat,
        value_format: ByteFormat,
        out: &mut Vec<u8>,
    ) -> Result<()> {
        le::put_i64(out, self.path);
        key_format.write(&self.key, out)?;
        value_format.write(&self.value, out)
    }

    pub(crate) fn decode(
        src: &[u8],
        key_format: ByteFormat,
        value_format: ByteFormat,
    ) -> Result<Self> {
        let mut cur = Cursor::new(src);
        let path = cur.i64()?;
        let key = Bytes::copy_from_slice(key_format.read(&mut cur)?);
        let value = Bytes::copy_from_slice(value_format.read(&mut cur)?);
        cur.finish()?;
        Ok(Self { path, key, value })
    }
}

/// Default key hash code: xxh64 of the key bytes.
pub fn key_hash(key: &[u8]) -> u64 {
    xxhash_rust::xxh64::xxh64(key, 0)
}
