// Backing store abstraction
// The volume engine only ever talks to the raw image through this trait

use crate::error::NtvfsError;
use log::debug;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// Byte addressable, fixed size storage holding a filesystem image.
pub trait BackingStore: Send {
    /// Fill `buf` with the bytes starting at `offset`.
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<(), NtvfsError>;

    /// Overwrite the bytes starting at `offset`. Never grows the store.
    fn write_at(&mut self, offset: u64, buf: &[u8]) -> Result<(), NtvfsError>;

    /// Total size in bytes.
    fn size(&self) -> u64;

    /// Flush pending writes
    fn flush(&mut self) -> Result<(), NtvfsError> {
        Ok(())
    }
}

fn check_span(offset: u64, len: usize, size: u64) -> Result<(), NtvfsError> {
    match offset.checked_add(len as u64) {
        Some(end) if end <= size => Ok(()),
        _ => Err(NtvfsError::Eof(format!(
            "access of {} bytes at {:#x} exceeds backing size {:#x}",
            len, offset, size
        ))),
    }
}

/// Image file on the host filesystem
pub struct FileBacking {
    file: File,
    path: PathBuf,
    size: u64,
    writable: bool,
}

impl FileBacking {
    /// Open an image read-only.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, NtvfsError> {
        Self::open_with(path, false)
    }

    /// Open an image, optionally allowing in-place overwrites.
    pub fn open_with<P: AsRef<Path>>(path: P, writable: bool) -> Result<Self, NtvfsError> {
        let path = path.as_ref();
        let file = OpenOptions::new().read(true).write(writable).open(path)?;
        let size = file.metadata()?.len();
        debug!("Opened backing file {} ({} bytes, writable={})", path.display(), size, writable);
        Ok(Self {
            file,
            path: path.to_path_buf(),
            size,
            writable,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl BackingStore for FileBacking {
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<(), NtvfsError> {
        check_span(offset, buf.len(), self.size)?;
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.read_exact(buf)?;
        Ok(())
    }

    fn write_at(&mut self, offset: u64, buf: &[u8]) -> Result<(), NtvfsError> {
        if !self.writable {
            return Err(NtvfsError::WriteProtected(format!(
                "{} was opened read-only",
                self.path.display()
            )));
        }
        check_span(offset, buf.len(), self.size)?;
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(buf)?;
        Ok(())
    }

    fn size(&self) -> u64 {
        self.size
    }

    fn flush(&mut self) -> Result<(), NtvfsError> {
        if self.writable {
            self.file.sync_data()?;
        }
        Ok(())
    }
}

/// Image held entirely in memory, mostly useful for tests and small images.
#[derive(Debug, Clone, Default)]
pub struct MemoryBacking {
    data: Vec<u8>,
}

impl MemoryBacking {
    pub fn new(data: Vec<u8>) -> Self {
        Self { data }
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    pub fn into_inner(self) -> Vec<u8> {
        self.data
    }
}

impl BackingStore for MemoryBacking {
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<(), NtvfsError> {
        check_span(offset, buf.len(), self.data.len() as u64)?;
        let start = offset as usize;
        buf.copy_from_slice(&self.data[start..start + buf.len()]);
        Ok(())
    }

    fn write_at(&mut self, offset: u64, buf: &[u8]) -> Result<(), NtvfsError> {
        check_span(offset, buf.len(), self.data.len() as u64)?;
        let start = offset as usize;
        self.data[start..start + buf.len()].copy_from_slice(buf);
        Ok(())
    }

    fn size(&self) -> u64 {
        self.data.len() as u64
    }
}
