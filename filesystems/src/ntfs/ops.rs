// NTFS FilesystemOps implementation for mounting
use super::dir::{DirCursor, MAX_NAME_UNITS};
use super::info::ObjectInfo;
use super::structures::ATTR_TYPE_DATA;
use super::volume::{NtfsObject, NtfsVolume};
use crate::ops::{DirectoryEntry, FileAttributes, FilesystemInfo, FilesystemOps};
use log::debug;
use ntvfs_core::{BackingStore, MountOptions, NtvfsError};
use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};

impl From<&ObjectInfo> for FileAttributes {
    fn from(info: &ObjectInfo) -> Self {
        FileAttributes {
            inode: info.inode,
            size: info.size,
            allocated_size: info.allocated_size,
            is_directory: info.is_directory(),
            is_file: info.is_file(),
            is_symlink: info.is_symlink(),
            created: info.creation_time.map(|t| t.timestamp()),
            modified: info.modification_time.map(|t| t.timestamp()),
            changed: info.change_time.map(|t| t.timestamp()),
            accessed: info.access_time.map(|t| t.timestamp()),
            permissions: info.mode & 0o7777,
            native_attributes: info.file_attributes,
        }
    }
}

/// NTFS filesystem operations wrapper
pub struct NtfsOps {
    volume: Mutex<NtfsVolume>,
}

impl NtfsOps {
    pub fn new(volume: NtfsVolume) -> Self {
        NtfsOps {
            volume: Mutex::new(volume),
        }
    }

    pub fn mount(backing: Box<dyn BackingStore>, options: MountOptions) -> Result<Self, NtvfsError> {
        Ok(Self::new(NtfsVolume::mount(backing, options)?))
    }

    pub fn into_inner(self) -> NtfsVolume {
        self.volume.into_inner().unwrap_or_else(PoisonError::into_inner)
    }

    fn volume(&self) -> MutexGuard<'_, NtfsVolume> {
        self.volume.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn path_str(path: &Path) -> Result<&str, NtvfsError> {
        path.to_str()
            .ok_or_else(|| NtvfsError::InvalidInput(format!("Invalid path: {}", path.display())))
    }
}

impl FilesystemOps for NtfsOps {
    fn filesystem_type(&self) -> &str {
        "ntfs"
    }

    fn statfs(&self) -> Result<FilesystemInfo, NtvfsError> {
        let mut volume = self.volume();
        let info = volume.volume_info();
        let geometry = &info.geometry;
        let allocated = volume.allocated_clusters()?;
        let free_space = geometry.cluster_count.saturating_sub(allocated) * geometry.cluster_size as u64;
        let mft_size = volume.query_core(0)?.find_unnamed(ATTR_TYPE_DATA).map_or(0, |a| a.value_size);

        Ok(FilesystemInfo {
            total_space: geometry.volume_size,
            free_space,
            available_space: if info.read_only { 0 } else { free_space },
            total_inodes: mft_size / geometry.mft_record_size as u64,
            block_size: geometry.cluster_size,
            max_filename_length: MAX_NAME_UNITS as u32,
            filesystem_type: format!("NTFS {}.{}", info.major_version, info.minor_version),
            volume_label: info.label.clone(),
            volume_serial: Some(format!("{:016X}", info.serial_number)),
            is_readonly: info.read_only,
        })
    }

    fn stat(&mut self, path: &Path) -> Result<FileAttributes, NtvfsError> {
        let path_str = Self::path_str(path)?;
        let mut volume = self.volume();
        let info = match volume.resolve_path(path_str)? {
            NtfsObject::Dir(dir) => volume.query_dir_info(&dir)?,
            NtfsObject::File(file) => volume.query_info(&file)?,
        };
        Ok(FileAttributes::from(&info))
    }

    fn readdir(&mut self, path: &Path) -> Result<Vec<DirectoryEntry>, NtvfsError> {
        let path_str = Self::path_str(path)?;
        let mut volume = self.volume();
        let dir = match volume.resolve_path(path_str)? {
            NtfsObject::Dir(dir) => dir,
            NtfsObject::File(_) => {
                return Err(NtvfsError::NotADirectory(path_str.to_string()));
            }
        };

        let mut cursor = DirCursor::new(dir);
        // "." and ".." are left to the caller
        cursor.skip_dot();
        cursor.skip_dot();
        let mut entries = Vec::new();
        while let Some(entry) = volume.dir_enumerate(&mut cursor)? {
            entries.push(DirectoryEntry {
                attributes: FileAttributes::from(&entry.info),
                name: entry.name,
            });
        }
        debug!("readdir {}: {} entries", path_str, entries.len());
        Ok(entries)
    }

    fn read(&mut self, path: &Path, offset: u64, size: u32) -> Result<Vec<u8>, NtvfsError> {
        let path_str = Self::path_str(path)?;
        let mut volume = self.volume();
        let file = match volume.resolve_path(path_str)? {
            NtfsObject::File(file) => file,
            NtfsObject::Dir(_) => return Err(NtvfsError::NotAFile(path_str.to_string())),
        };

        let mut data = vec![0u8; size as usize];
        match volume.file_read(&file, offset, &mut data) {
            Ok(len) => {
                data.truncate(len);
                Ok(data)
            }
            Err(NtvfsError::Eof(_)) => Ok(Vec::new()),
            Err(e) => Err(e),
        }
    }

    fn write(&mut self, path: &Path, offset: u64, data: &[u8]) -> Result<u32, NtvfsError> {
        let path_str = Self::path_str(path)?;
        let mut volume = self.volume();
        let file = match volume.resolve_path(path_str)? {
            NtfsObject::File(file) => file,
            NtfsObject::Dir(_) => return Err(NtvfsError::NotAFile(path_str.to_string())),
        };
        let written = volume.file_write(&file, offset, data)?;
        Ok(written as u32)
    }

    fn sync(&mut self) -> Result<(), NtvfsError> {
        self.volume().flush()
    }

    fn is_readonly(&self) -> bool {
        self.volume().is_read_only()
    }
}
