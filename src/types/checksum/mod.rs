#![forbid(unsafe_code)]

use crate::types::{Result, StoreError};

/// Bytes of the frame in front of every data file item.
pub const ITEM_FRAME_LEN: usize = 8;

/// Length and CRC-32 written in front of a data file item.
///
/// The CRC covers the little-endian length followed by the payload, so a
/// frame whose length was damaged fails verification even when the shorter
/// or longer payload happens to be readable.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ItemFrame {
    len: u32,
    crc: u32,
}

impl ItemFrame {
    /// Frames `payload`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::InvalidArgument`] for payloads of 4 GiB or more.
    pub fn for_payload(payload: &[u8]) -> Result<Self> {
        let len = u32::try_from(payload.len())
            .map_err(|_| StoreError::InvalidArgument("data item larger than 4 GiB".into()))?;
        Ok(Self {
            len,
            crc: crc_of(len, payload),
        })
    }

    /// Payload length announced by the frame.
    pub fn payload_len(&self) -> u64 {
        u64::from(self.len)
    }

    /// On-disk form: length, then CRC.
    pub fn encode(&self) -> [u8; ITEM_FRAME_LEN] {
        let mut out = [0u8; ITEM_FRAME_LEN];
        out[..4].copy_from_slice(&self.len.to_le_bytes());
        out[4..].copy_from_slice(&self.crc.to_le_bytes());
        out
    }

    /// Parses a frame read from disk.
    pub fn decode(raw: [u8; ITEM_FRAME_LEN]) -> Self {
        let [l0, l1, l2, l3, c0, c1, c2, c3] = raw;
        Self {
            len: u32::from_le_bytes([l0, l1, l2, l3]),
            crc: u32::from_le_bytes([c0, c1, c2, c3]),
        }
    }

    /// True when `payload` is exactly what this frame was written for.
    pub fn matches(&self, payload: &[u8]) -> bool {
        payload.len() as u64 == self.payload_len() && crc_of(self.len, payload) == self.crc
    }
}

fn crc_of(len: u32, payload: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&len.to_le_bytes());
    hasher.update(payload);
    hasher.finalize()
}
