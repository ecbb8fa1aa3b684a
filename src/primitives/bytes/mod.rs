#![forbid(unsafe_code)]
//! Fixed-width, varint and cursor utilities shared by the on-disk formats.

pub mod le {
    //! Little-endian fixed-width helpers for file headers and items.

    /// Appends a u32 in little-endian order.
    pub fn put_u32(dst: &mut Vec<u8>, v: u32) {
        dst.extend_from_slice(&v.to_le_bytes());
    }

    /// Appends a u64 in little-endian order.
    pub fn put_u64(dst: &mut Vec<u8>, v: u64) {
        dst.extend_from_slice(&v.to_le_bytes());
    }

    /// Appends an i64 in little-endian order.
    pub fn put_i64(dst: &mut Vec<u8>, v: i64) {
        dst.extend_from_slice(&v.to_le_bytes());
    }

    /// Reads a u32 from the first four bytes of `src`.
    pub fn u32_at(src: &[u8]) -> Option<u32> {
        Some(u32::from_le_bytes(src.get(..4)?.try_into().ok()?))
    }

    /// Reads a u64 from the first eight bytes of `src`.
    pub fn u64_at(src: &[u8]) -> Option<u64> {
        Some(u64::from_le_bytes(src.get(..8)?.try_into().ok()?))
    }
}

pub mod var {
    //! Unsigned varints.

    use crate::types::{Result, StoreError};

    /// Encodes a u64 as an unsigned varint.
    pub fn encode_u64(mut v: u64, out: &mut Vec<u8>) {
        loop {
            let byte = (v & 0x7f) as u8;
            v >>= 7;
            if v == 0 {
                out.push(byte);
                break;
            }
            out.push(byte | 0x80);
        }
    }

    /// Number of bytes `encode_u64` emits for `v`.
    pub fn encoded_len(v: u64) -> usize {
        let bits = 64 - v.leading_zeros() as usize;
        bits.max(1).div_ceil(7)
    }

    /// Decodes a u64 varint from a slice, updating the offset.
    pub fn decode_u64(src: &[u8], off: &mut usize) -> Result<u64> {
        let mut result = 0u64;
        let mut shift = 0u32;
        for i in 0..10 {
            let byte = *src
                .get(*off)
                .ok_or_else(|| StoreError::Corruption(format!("varint truncated at byte {i}")))?;
            *off += 1;
            let payload = (byte & 0x7f) as u64;
            if i == 9 && payload > 1 {
                return Err(StoreError::Corruption("varint overflows 64 bits".into()));
            }
            result |= payload << shift;
            if byte & 0x80 == 0 {
                return Ok(result);
            }
            shift += 7;
        }
        Err(StoreError::Corruption("varint longer than 10 bytes".into()))
    }
}

pub mod buf {
    //! A slice-backed cursor for parsing records.

    use crate::types::{Result, StoreError};

    use super::var;

    /// A cursor for reading bytes from a slice with offset tracking.
    pub struct Cursor<'a> {
        buf: &'a [u8],
        off: usize,
    }

    impl<'a> Cursor<'a> {
        /// Creates a new cursor starting at offset 0.
        pub fn new(buf: &'a [u8]) -> Self {
            Self { buf, off: 0 }
        }

        /// Bytes left to read.
        pub fn remaining(&self) -> usize {
            self.buf.len() - self.off
        }

        /// Takes the next `n` bytes, failing if the buffer is short.
        pub fn take(&mut self, n: usize) -> Result<&'a [u8]> {
            let end = self
                .off
                .checked_add(n)
                .filter(|end| *end <= self.buf.len())
                .ok_or_else(|| {
                    StoreError::Corruption(format!(
                        "record truncated: need {n} bytes, have {}",
                        self.remaining()
                    ))
                })?;
            let out = &self.buf[self.off..end];
            self.off = end;
            Ok(out)
        }

        /// Reads a little-endian u32.
        pub fn u32(&mut self) -> Result<u32> {
            let raw = self.take(4)?;
            Ok(u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]))
        }

        /// Reads a little-endian u64.
        pub fn u64(&mut self) -> Result<u64> {
            let raw = self.take(8)?;
            let mut bytes = [0u8; 8];
            bytes.copy_from_slice(raw);
            Ok(u64::from_le_bytes(bytes))
        }

        /// Reads a little-endian i64.
        pub fn i64(&mut self) -> Result<i64> {
            Ok(self.u64()? as i64)
        }

        /// Reads an unsigned varint.
        pub fn varint(&mut self) -> Result<u64> {
            var::decode_u64(self.buf, &mut self.off)
        }

        /// Fails unless every byte has been consumed.
        pub fn finish(self) -> Result<()> {
            if self.off == self.buf.len() {
                Ok(())
            } else {
                Err(StoreError::Corruption(format!(
                    "{} trailing bytes after record",
                    self.remaining()
                )))
            }
        }
    }
}
