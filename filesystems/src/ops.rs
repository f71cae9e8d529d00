// Filesystem operations trait
// A path based interface over a mounted volume, shaped for FUSE/WinFsp style
// front ends and the command line tool.

use ntvfs_core::NtvfsError;
use serde::Serialize;
use std::path::Path;

/// File attributes returned by stat operations
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileAttributes {
    pub inode: u64,
    pub size: u64,
    pub allocated_size: u64,
    pub is_directory: bool,
    pub is_file: bool,
    pub is_symlink: bool,
    pub created: Option<i64>,  // Unix timestamp
    pub modified: Option<i64>, // Unix timestamp
    pub changed: Option<i64>,  // Unix timestamp
    pub accessed: Option<i64>, // Unix timestamp
    pub permissions: u32,      // Unix-style permissions
    /// Native attribute flags of the filesystem
    pub native_attributes: u32,
}

/// Directory entry returned by readdir operations
#[derive(Debug, Clone, Serialize)]
pub struct DirectoryEntry {
    pub name: String,
    pub attributes: FileAttributes,
}

/// Core filesystem operations trait
/// All operations are synchronous to match WinFsp/FUSE requirements
pub trait FilesystemOps: Send + Sync {
    /// Get filesystem information
    fn statfs(&self) -> Result<FilesystemInfo, NtvfsError>;

    /// Get file/directory attributes
    fn stat(&mut self, path: &Path) -> Result<FileAttributes, NtvfsError>;

    /// List directory contents, without "." and ".."
    fn readdir(&mut self, path: &Path) -> Result<Vec<DirectoryEntry>, NtvfsError>;

    /// Read file contents; short or empty at the end of the file
    fn read(&mut self, path: &Path, offset: u64, size: u32) -> Result<Vec<u8>, NtvfsError>;

    /// Overwrite file contents (optional - not all filesystems support write)
    fn write(&mut self, _path: &Path, _offset: u64, _data: &[u8]) -> Result<u32, NtvfsError> {
        Err(NtvfsError::WriteProtected("Filesystem is read-only".to_string()))
    }

    /// Flush any pending writes
    fn sync(&mut self) -> Result<(), NtvfsError> {
        Ok(()) // No-op for read-only filesystems
    }

    /// Check if filesystem supports writes
    fn is_readonly(&self) -> bool {
        true // Default to read-only
    }

    /// Get filesystem type name (e.g. "ntfs")
    fn filesystem_type(&self) -> &str;
}

/// Filesystem information
#[derive(Debug, Clone, Serialize)]
pub struct FilesystemInfo {
    pub total_space: u64,
    pub free_space: u64,
    pub available_space: u64,
    pub total_inodes: u64,
    pub block_size: u32,
    pub max_filename_length: u32,
    pub filesystem_type: String,
    pub volume_label: Option<String>,
    pub volume_serial: Option<String>,
    pub is_readonly: bool,
}
