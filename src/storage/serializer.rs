#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};

use crate::primitives::bytes::{buf::Cursor, var};
use crate::types::{Result, StoreError};

/// On-disk encoding of a key or a value.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ByteFormat {
    /// Every item has exactly `size` bytes and no length prefix.
    Fixed {
        /// Item size in bytes.
        size: u32,
    },
    /// Varint length prefix followed by the bytes.
    #[default]
    Variable,
}

impl ByteFormat {
    /// Fixed-size format of `size` bytes.
    pub const fn fixed(size: u32) -> Self {
        ByteFormat::Fixed { size }
    }

    /// Bytes `write` will emit for `bytes`.
    pub fn encoded_len(self, bytes: &[u8]) -> usize {
        match self {
            ByteFormat::Fixed { size } => size as usize,
            ByteFormat::Variable => var::encoded_len(bytes.len() as u64) + bytes.len(),
        }
    }

    /// Checks that `bytes` can be written in this format.
    pub fn validate(self, bytes: &[u8]) -> Result<()> {
        match self {
            ByteFormat::Fixed { size } if bytes.len() != size as usize => {
                Err(StoreError::InvalidArgument(format!(
                    "expected {size} bytes, got {}",
                    bytes.len()
                )))
            }
            _ => Ok(()),
        }
    }

    /// Appends the encoding of `bytes` to `out`.
    pub fn write(self, bytes: &[u8], out: &mut Vec<u8>) -> Result<()> {
        self.validate(bytes)?;
        if let ByteFormat::Variable = self {
            var::encode_u64(bytes.len() as u64, out);
        }
        out.extend_from_slice(bytes);
        Ok(())
    }

    /// Reads one encoded item from `cur`.
    pub fn read<'a>(self, cur: &mut Cursor<'a>) -> Result<&'a [u8]> {
        let len = match self {
            ByteFormat::Fixed { size } => size as usize,
            ByteFormat::Variable => usize::try_from(cur.varint()?)
                .map_err(|_| StoreError::Corruption("item length exceeds usize".into()))?,
        };
        cur.take(len)
    }
}
