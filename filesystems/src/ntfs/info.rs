// Object information and NTFS attribute to Unix mode conversion

use super::index::IndexEntry;
use super::record::{Attribute, Core, FileNameAttr};
use super::structures::*;
use chrono::{DateTime, Utc};
use ntvfs_core::NtvfsError;
use serde::Serialize;

pub const S_IFMT: u32 = 0o170000;
pub const S_IFDIR: u32 = 0o040000;
pub const S_IFREG: u32 = 0o100000;
pub const S_IFLNK: u32 = 0o120000;

const READ_ALL: u32 = 0o444;
const WRITE_ALL: u32 = 0o222;
const EXEC_ALL: u32 = 0o111;

const EXECUTABLE_EXTENSIONS: [&str; 5] = ["exe", "bat", "com", "cmd", "btm"];

/// Metadata reported for files, directories and directory entries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ObjectInfo {
    /// MFT record index
    pub inode: u64,
    pub size: u64,
    pub allocated_size: u64,
    pub creation_time: Option<DateTime<Utc>>,
    pub modification_time: Option<DateTime<Utc>>,
    pub change_time: Option<DateTime<Utc>>,
    pub access_time: Option<DateTime<Utc>>,
    /// Raw NTFS file attribute flags
    pub file_attributes: u32,
    pub mode: u32,
}

impl ObjectInfo {
    pub fn is_directory(&self) -> bool {
        self.mode & S_IFMT == S_IFDIR
    }

    pub fn is_file(&self) -> bool {
        self.mode & S_IFMT == S_IFREG
    }

    pub fn is_symlink(&self) -> bool {
        self.mode & S_IFMT == S_IFLNK
    }

    /// Information for `core`, presenting `attr` (DATA or INDEX_ROOT) as its content.
    pub fn from_core(core: &Core, attr: &Attribute) -> Result<Self, NtvfsError> {
        let std_info = core.standard_info();
        let file_name = core.file_name()?;

        let mut info = ObjectInfo {
            inode: core.mft_index,
            size: attr.value_size,
            allocated_size: attr.allocated_size(),
            creation_time: None,
            modification_time: None,
            change_time: None,
            access_time: None,
            file_attributes: 0,
            mode: 0,
        };

        let mut attribs = match &std_info {
            Some(si) => {
                info.creation_time = filetime_to_datetime(si.creation_time);
                info.modification_time = filetime_to_datetime(si.modification_time);
                info.change_time = filetime_to_datetime(si.mft_modification_time);
                info.access_time = filetime_to_datetime(si.access_time);
                si.file_attributes
            }
            None => match attr.attr_type {
                ATTR_TYPE_INDEX_ROOT | ATTR_TYPE_INDEX_ALLOCATION => FILE_ATTR_DOS_DIRECTORY,
                _ => FILE_ATTR_NORMAL,
            },
        };
        if let Some(name) = &file_name {
            if std_info.is_some() {
                attribs |= name.file_attributes;
            } else {
                attribs = name.file_attributes;
            }
        }

        info.file_attributes = attribs;
        info.mode = file_attributes_to_mode(attribs, file_name.as_ref());
        Ok(info)
    }

    /// Information from the FILENAME key of a directory index entry.
    pub fn from_index_entry(entry: &IndexEntry<'_>) -> Result<Self, NtvfsError> {
        let name = entry.file_name()?;
        Ok(ObjectInfo {
            inode: entry.file_ref().index(),
            size: name.data_size,
            allocated_size: name.allocated_size,
            creation_time: filetime_to_datetime(name.creation_time),
            modification_time: filetime_to_datetime(name.modification_time),
            change_time: filetime_to_datetime(name.mft_modification_time),
            access_time: filetime_to_datetime(name.access_time),
            file_attributes: name.file_attributes,
            mode: file_attributes_to_mode(name.file_attributes, Some(&name)),
        })
    }
}

fn has_executable_extension(name: &[u16]) -> bool {
    if name.len() < 4 || name[name.len() - 4] != b'.' as u16 {
        return false;
    }
    let ext = &name[name.len() - 3..];
    if ext.iter().any(|&u| u >= 0x7f) {
        return false;
    }
    let ext: String = ext
        .iter()
        .map(|&u| (u as u8).to_ascii_lowercase() as char)
        .collect();
    EXECUTABLE_EXTENSIONS.contains(&ext.as_str())
}

/// Convert NTFS file attributes to a Unix mode word.
pub fn file_attributes_to_mode(attribs: u32, file_name: Option<&FileNameAttr>) -> u32 {
    let is_dir = attribs & (FILE_ATTR_DOS_DIRECTORY | FILE_ATTR_DIRECTORY) != 0;

    let mut mode = READ_ALL;
    if is_dir {
        mode |= S_IFDIR | EXEC_ALL;
    } else {
        mode |= S_IFREG;
        if file_name.map_or(false, |n| has_executable_extension(&n.name)) {
            mode |= EXEC_ALL;
        }
    }

    if attribs & FILE_ATTR_REPARSE_POINT != 0
        && file_name.map_or(false, |n| n.reparse_tag == REPARSE_TAG_SYMLINK)
    {
        mode = (mode & !S_IFMT) | S_IFLNK;
    }

    if attribs & FILE_ATTR_READONLY == 0 {
        mode |= WRITE_ALL;
    }
    mode
}

/// `ls -l` style rendering of a mode word.
pub fn mode_string(mode: u32) -> String {
    let kind = match mode & S_IFMT {
        S_IFDIR => 'd',
        S_IFLNK => 'l',
        _ => '-',
    };
    let mut s = String::with_capacity(10);
    s.push(kind);
    for shift in [6, 3, 0] {
        let bits = (mode >> shift) & 7;
        s.push(if bits & 4 != 0 { 'r' } else { '-' });
        s.push(if bits & 2 != 0 { 'w' } else { '-' });
        s.push(if bits & 1 != 0 { 'x' } else { '-' });
    }
    s
}
