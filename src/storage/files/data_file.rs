#![forbid(unsafe_code)]

use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use tracing::warn;

use crate::primitives::bytes::le;
use crate::primitives::io::{ReadAt, StdFileIo};
use crate::types::checksum::{ItemFrame, ITEM_FRAME_LEN};
use crate::types::{Result, StoreError};

const MAGIC: &[u8; 4] = b"VTDF";
const FOOTER_MAGIC: &[u8; 8] = b"VTDFDONE";
const VERSION: u16 = 1;
/// Bytes before the first item.
pub const HEADER_LEN: u64 = 24;
/// Bytes after the last item.
pub const FOOTER_LEN: u64 = 16;
const ITEM_HEADER_LEN: u64 = ITEM_FRAME_LEN as u64;
const OFFSET_BITS: u32 = 40;
const OFFSET_MASK: u64 = (1 << OFFSET_BITS) - 1;
const EXTENSION: &str = "vtd";

/// Packs a file index and byte offset into a data location. Zero means "none".
pub fn data_location(file_index: u32, offset: u64) -> u64 {
    ((file_index as u64 + 1) << OFFSET_BITS) | (offset & OFFSET_MASK)
}

/// File index encoded in a data location.
pub fn location_file(location: u64) -> Option<u32> {
    let high = location >> OFFSET_BITS;
    if high == 0 {
        None
    } else {
        u32::try_from(high - 1).ok()
    }
}

/// Byte offset encoded in a data location.
pub fn location_offset(location: u64) -> u64 {
    location & OFFSET_MASK
}

/// File name of data file `index` of `store`.
pub fn file_name(store: &str, index: u32) -> String {
    format!("{store}_{index:06}.{EXTENSION}")
}

/// Parses a file name produced by [`file_name`].
pub fn parse_file_name(store: &str, name: &str) -> Option<u32> {
    let rest = name.strip_prefix(store)?.strip_prefix('_')?;
    let digits = rest.strip_suffix(EXTENSION)?.strip_suffix('.')?;
    digits.parse().ok()
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

/// Appends items to a new data file.
pub struct DataFileWriter {
    path: PathBuf,
    index: u32,
    out: BufWriter<File>,
    offset: u64,
    items: u64,
}

impl DataFileWriter {
    /// Creates data file `index` of `store` in `dir` at compaction level `level`.
    ///
    /// `generation` is the index of the newest flush whose items the file may
    /// hold: a flush file's own index, or the largest generation among the
    /// files a compaction merges.
    pub fn create(dir: &Path, store: &str, index: u32, level: u8, generation: u32) -> Result<Self> {
        let path = dir.join(file_name(store, index));
        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)?;
        let mut out = BufWriter::with_capacity(1 << 20, file);
        let mut header = Vec::with_capacity(HEADER_LEN as usize);
        header.extend_from_slice(MAGIC);
        header.extend_from_slice(&VERSION.to_le_bytes());
        header.push(level);
        header.push(0);
        le::put_u32(&mut header, index);
        le::put_u64(&mut header, now_millis());
        le::put_u32(&mut header, generation);
        header.resize(HEADER_LEN as usize, 0);
        out.write_all(&header)?;
        Ok(Self {
            path,
            index,
            out,
            offset: HEADER_LEN,
            items: 0,
        })
    }

    /// Appends one item and returns its data location.
    pub fn store(&mut self, payload: &[u8]) -> Result<u64> {
        let frame = ItemFrame::for_payload(payload)?;
        let location = data_location(self.index, self.offset);
        if location_offset(location) != self.offset {
            return Err(StoreError::IllegalState(format!(
                "data file {} exceeds the addressable size",
                self.path.display()
            )));
        }
        self.out.write_all(&frame.encode())?;
        self.out.write_all(payload)?;
        self.offset += ITEM_HEADER_LEN + payload.len() as u64;
        self.items += 1;
        Ok(location)
    }

    /// Items written so far.
    pub fn items(&self) -> u64 {
        self.items
    }

    /// File index.
    pub fn index(&self) -> u32 {
        self.index
    }

    /// Seals the file with its footer, fsyncs it and reopens it for reads.
    pub fn finish(mut self) -> Result<DataFileReader> {
        let mut footer = Vec::with_capacity(FOOTER_LEN as usize);
        le::put_u64(&mut footer, self.items);
        footer.extend_from_slice(FOOTER_MAGIC);
        self.out.write_all(&footer)?;
        let file = self
            .out
            .into_inner()
            .map_err(|err| StoreError::Io(err.into_error()))?;
        file.sync_all()?;
        drop(file);
        DataFileReader::open(&self.path)
    }

    /// Discards the partially written file.
    pub fn abort(self) {
        let path = self.path;
        drop(self.out);
        if let Err(err) = fs::remove_file(&path) {
            warn!(error = %err, path = %path.display(), "data_file.abort.remove_failed");
        }
    }
}

/// Read access to a sealed data file.
pub struct DataFileReader {
    path: PathBuf,
    index: u32,
    level: u8,
    generation: u32,
    items: u64,
    size: u64,
    io: StdFileIo,
}

impl DataFileReader {
    /// Opens a sealed data file, validating its header and footer.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Corruption`] when the file is truncated or was never sealed.
    pub fn open(path: &Path) -> Result<Self> {
        let io = StdFileIo::open_read(path)?;
        let size = io.len()?;
        if size < HEADER_LEN + FOOTER_LEN {
            return Err(StoreError::Corruption(format!(
                "data file {} is truncated",
                path.display()
            )));
        }
        let mut header = [0u8; HEADER_LEN as usize];
        io.read_at(0, &mut header)?;
        if &header[..4] != MAGIC || header[4..6] != VERSION.to_le_bytes() {
            return Err(StoreError::Corruption(format!(
                "bad data file header in {}",
                path.display()
            )));
        }
        let mut footer = [0u8; FOOTER_LEN as usize];
        io.read_at(size - FOOTER_LEN, &mut footer)?;
        if &footer[8..] != FOOTER_MAGIC {
            return Err(StoreError::Corruption(format!(
                "data file {} was never sealed",
                path.display()
            )));
        }
        Ok(Self {
            path: path.to_path_buf(),
            index: le::u32_at(&header[8..]).unwrap_or_default(),
            level: header[6],
            generation: le::u32_at(&header[20..]).unwrap_or_default(),
            items: le::u64_at(&footer).unwrap_or_default(),
            size,
            io,
        })
    }

    /// File index.
    pub fn index(&self) -> u32 {
        self.index
    }

    /// Compaction level; freshly flushed files are level zero.
    pub fn level(&self) -> u8 {
        self.level
    }

    /// Newest flush whose items this file may hold.
    pub fn generation(&self) -> u32 {
        self.generation
    }

    /// Number of items in the file.
    pub fn items(&self) -> u64 {
        self.items
    }

    /// File size in bytes.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Path on disk.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_item_at(&self, offset: u64) -> Result<(Vec<u8>, u64)> {
        let items_end = self.size - FOOTER_LEN;
        if offset < HEADER_LEN || offset + ITEM_HEADER_LEN > items_end {
            return Err(StoreError::Corruption(format!(
                "offset {offset} outside items of {}",
                self.path.display()
            )));
        }
        let mut head = [0u8; ITEM_FRAME_LEN];
        self.io.read_at(offset, &mut head)?;
        let frame = ItemFrame::decode(head);
        let len = frame.payload_len();
        let end = offset + ITEM_HEADER_LEN + len;
        if end > items_end {
            return Err(StoreError::Corruption(format!(
                "item at {offset} overruns {}",
                self.path.display()
            )));
        }
        let mut payload = vec![0u8; len as usize];
        self.io.read_at(offset + ITEM_HEADER_LEN, &mut payload)?;
        if !frame.matches(&payload) {
            return Err(StoreError::Corruption(format!(
                "checksum mismatch at {offset} in {}",
                self.path.display()
            )));
        }
        Ok((payload, end))
    }

    /// Reads the item stored at byte `offset`.
    pub fn read(&self, offset: u64) -> Result<Vec<u8>> {
        self.read_item_at(offset).map(|(payload, _)| payload)
    }

    /// Calls `f` with the location and payload of every item, in file order.
    pub fn for_each_item(&self, mut f: impl FnMut(u64, &[u8]) -> Result<()>) -> Result<()> {
        let mut offset = HEADER_LEN;
        for _ in 0..self.items {
            let (payload, next) = self.read_item_at(offset)?;
            f(data_location(self.index, offset), &payload)?;
            offset = next;
        }
        Ok(())
    }
}
