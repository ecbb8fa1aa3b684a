#![forbid(unsafe_code)]

use std::{
    fs::{self, File, OpenOptions},
    io::{self, Write},
    path::Path,
};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::types::{Result, StoreError};

/// Read-only handle supporting positioned reads from many threads at once.
pub trait ReadAt: Send + Sync + 'static {
    /// Fills `dst` with the bytes starting at `off`.
    fn read_at(&self, off: u64, dst: &mut [u8]) -> Result<()>;
    /// Returns the current length of the file in bytes.
    fn len(&self) -> Result<u64>;
    /// Returns true if the file is empty.
    fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }
}

/// [`ReadAt`] over a plain `std::fs::File`.
pub struct StdFileIo {
    file: File,
}

impl StdFileIo {
    /// Opens an existing file for positioned reads.
    pub fn open_read(path: impl AsRef<Path>) -> Result<Self> {
        let file = OpenOptions::new().read(true).open(path)?;
        Ok(Self { file })
    }
}

impl ReadAt for StdFileIo {
    fn read_at(&self, off: u64, dst: &mut [u8]) -> Result<()> {
        read_exact_at(&self.file, off, dst).map_err(StoreError::from)
    }

    fn len(&self) -> Result<u64> {
        Ok(self.file.metadata()?.len())
    }
}

#[cfg(unix)]
fn read_exact_at(file: &File, mut off: u64, mut dst: &mut [u8]) -> io::Result<()> {
    use std::os::unix::fs::FileExt;
    while !dst.is_empty() {
        let read = file.read_at(dst, off)?;
        if read == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "positioned read past end of file",
            ));
        }
        dst = &mut dst[read..];
        off += read as u64;
    }
    Ok(())
}

#[cfg(windows)]
fn read_exact_at(file: &File, mut off: u64, mut dst: &mut [u8]) -> io::Result<()> {
    use std::os::windows::fs::FileExt;
    while !dst.is_empty() {
        let read = file.seek_read(dst, off)?;
        if read == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "positioned read past end of file",
            ));
        }
        dst = &mut dst[read..];
        off += read as u64;
    }
    Ok(())
}

/// Writes `bytes` to `path` through a temporary sibling and an atomic rename.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let tmp = path.with_extension("tmp");
    {
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&tmp)?;
        file.write_all(bytes)?;
        file.sync_all()?;
    }
    fs::rename(&tmp, path)?;
    if let Some(parent) = path.parent() {
        sync_dir(parent)?;
    }
    Ok(())
}

/// Flushes directory entries so renames and creations survive a crash.
pub fn sync_dir(dir: &Path) -> Result<()> {
    #[cfg(unix)]
    {
        File::open(dir)?.sync_all()?;
    }
    #[cfg(not(unix))]
    {
        let _ = dir;
    }
    Ok(())
}

/// How snapshot and copy operations materialise files at a new location.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkMode {
    /// Hard links only; fails where the filesystem cannot link.
    HardLink,
    /// Always copy bytes.
    Copy,
    /// Hard link, falling back to a copy when linking fails.
    #[default]
    Auto,
}

/// Materialises `src` at `dst` according to `mode`.
pub fn link_or_copy(src: &Path, dst: &Path, mode: LinkMode) -> Result<()> {
    match mode {
        LinkMode::HardLink => fs::hard_link(src, dst)?,
        LinkMode::Copy => {
            fs::copy(src, dst)?;
        }
        LinkMode::Auto => {
            if let Err(err) = fs::hard_link(src, dst) {
                debug!(
                    error = %err,
                    src = %src.display(),
                    "io.hard_link.fallback_copy"
                );
                fs::copy(src, dst)?;
            }
        }
    }
    Ok(())
}

/// Recursively mirrors `src` into `dst`, linking or copying every file.
pub fn mirror_tree(src: &Path, dst: &Path, mode: LinkMode) -> Result<()> {
    fs::create_dir_all(dst)?;
    for entry in fs::read_dir(src)? {
        let entry = entry?;
        let target = dst.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            mirror_tree(&entry.path(), &target, mode)?;
        } else {
            link_or_copy(&entry.path(), &target, mode)?;
        }
    }
    Ok(())
}
