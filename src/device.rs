//! # Device Abstraction
//!
//! The storage layer talks to its backing store through the [`Device`] trait:
//! a byte-addressable object supporting positioned reads and writes, durable
//! flush, and truncation. Two implementations ship in-tree:
//!
//! - [`FileDevice`]: a regular file, used by persistent environments. All
//!   I/O is positioned through an internal mutex so the device can be shared
//!   behind `&self`.
//! - [`MemoryDevice`]: a growable in-memory buffer, used by `IN_MEMORY`
//!   environments and by unit tests that do not want to touch the
//!   filesystem.
//!
//! Writes past the current end of the device extend it; reads past the end
//! fail with `Io`. Nothing above this module performs raw file I/O.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use eyre::{Result, WrapErr};
use parking_lot::{Mutex, RwLock};

use crate::error::ErrorKind;

pub trait Device: Send + Sync {
    /// Reads exactly `buf.len()` bytes starting at `offset`.
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()>;

    /// Writes all of `data` starting at `offset`, extending the device if
    /// the write reaches past the current end.
    fn write_at(&self, offset: u64, data: &[u8]) -> Result<()>;

    /// Durably flushes all previous writes.
    fn flush(&self) -> Result<()>;

    /// Sets the device length to `len` bytes.
    fn truncate(&self, len: u64) -> Result<()>;

    /// Current device length in bytes.
    fn len(&self) -> Result<u64>;
}

pub struct FileDevice {
    file: Mutex<File>,
}

impl std::fmt::Debug for FileDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileDevice").finish_non_exhaustive()
    }
}

impl FileDevice {
    /// Creates the file, truncating anything already at `path`.
    pub fn create(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .truncate(true)
            .read(true)
            .write(true)
            .open(path)
            .map_err(|e| eyre::Report::new(e).wrap_err(ErrorKind::Io))
            .wrap_err_with(|| format!("failed to create device file at {:?}", path))?;

        Ok(Self {
            file: Mutex::new(file),
        })
    }

    /// Opens an existing file; fails with `FileNotFound` when it is absent.
    pub fn open(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|e| {
                let kind = if e.kind() == std::io::ErrorKind::NotFound {
                    ErrorKind::FileNotFound
                } else {
                    ErrorKind::Io
                };
                eyre::Report::new(e).wrap_err(kind)
            })
            .wrap_err_with(|| format!("failed to open device file at {:?}", path))?;

        Ok(Self {
            file: Mutex::new(file),
        })
    }
}

impl Device for FileDevice {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(offset))
            .and_then(|_| file.read_exact(buf))
            .map_err(|e| eyre::Report::new(e).wrap_err(ErrorKind::Io))
            .wrap_err_with(|| format!("failed to read {} bytes at offset {}", buf.len(), offset))
    }

    fn write_at(&self, offset: u64, data: &[u8]) -> Result<()> {
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(offset))
            .and_then(|_| file.write_all(data))
            .map_err(|e| eyre::Report::new(e).wrap_err(ErrorKind::Io))
            .wrap_err_with(|| format!("failed to write {} bytes at offset {}", data.len(), offset))
    }

    fn flush(&self) -> Result<()> {
        self.file
            .lock()
            .sync_all()
            .map_err(|e| eyre::Report::new(e).wrap_err(ErrorKind::Io))
            .wrap_err("failed to sync device file")
    }

    fn truncate(&self, len: u64) -> Result<()> {
        self.file
            .lock()
            .set_len(len)
            .map_err(|e| eyre::Report::new(e).wrap_err(ErrorKind::Io))
            .wrap_err_with(|| format!("failed to truncate device to {} bytes", len))
    }

    fn len(&self) -> Result<u64> {
        let file = self.file.lock();
        let meta = file
            .metadata()
            .map_err(|e| eyre::Report::new(e).wrap_err(ErrorKind::Io))
            .wrap_err("failed to stat device file")?;
        Ok(meta.len())
    }
}

#[derive(Default)]
pub struct MemoryDevice {
    bytes: RwLock<Vec<u8>>,
}

impl MemoryDevice {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Device for MemoryDevice {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let bytes = self.bytes.read();
        let start = offset as usize;
        let end = start + buf.len();
        if end > bytes.len() {
            return Err(eyre::Report::new(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                format!("read of {}..{} past device end {}", start, end, bytes.len()),
            ))
            .wrap_err(ErrorKind::Io));
        }
        buf.copy_from_slice(&bytes[start..end]);
        Ok(())
    }

    fn write_at(&self, offset: u64, data: &[u8]) -> Result<()> {
        let mut bytes = self.bytes.write();
        let start = offset as usize;
        let end = start + data.len();
        if end > bytes.len() {
            bytes.resize(end, 0);
        }
        bytes[start..end].copy_from_slice(data);
        Ok(())
    }

    fn flush(&self) -> Result<()> {
        Ok(())
    }

    fn truncate(&self, len: u64) -> Result<()> {
        self.bytes.write().resize(len as usize, 0);
        Ok(())
    }

    fn len(&self) -> Result<u64> {
        Ok(self.bytes.read().len() as u64)
    }
}
