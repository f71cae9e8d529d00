// NTFS on-disk layout
// Field offsets, type codes and flag values for every structure the engine decodes.
// All multi-byte fields are little endian.

use byteorder::{ByteOrder, LittleEndian};
use chrono::{DateTime, Utc};
use ntvfs_core::NtvfsError;

// Well-known MFT record numbers
pub const MFT_RECORD_MFT: u64 = 0;
pub const MFT_RECORD_MFTMIRR: u64 = 1;
pub const MFT_RECORD_LOGFILE: u64 = 2;
pub const MFT_RECORD_VOLUME: u64 = 3;
pub const MFT_RECORD_ATTRDEF: u64 = 4;
pub const MFT_RECORD_ROOT: u64 = 5;
pub const MFT_RECORD_BITMAP: u64 = 6;
pub const MFT_RECORD_BOOT: u64 = 7;
pub const MFT_RECORD_BADCLUS: u64 = 8;
pub const MFT_RECORD_SECURE: u64 = 9;
pub const MFT_RECORD_UPCASE: u64 = 10;
pub const MFT_RECORD_EXTEND: u64 = 11;
/// `$MFT` must cover at least the reserved system records.
pub const MFT_RESERVED_RECORDS: u64 = 16;

// Attribute type codes
pub const ATTR_TYPE_STANDARD_INFORMATION: u32 = 0x10;
pub const ATTR_TYPE_ATTRIBUTE_LIST: u32 = 0x20;
pub const ATTR_TYPE_FILE_NAME: u32 = 0x30;
pub const ATTR_TYPE_OBJECT_ID: u32 = 0x40;
pub const ATTR_TYPE_SECURITY_DESCRIPTOR: u32 = 0x50;
pub const ATTR_TYPE_VOLUME_NAME: u32 = 0x60;
pub const ATTR_TYPE_VOLUME_INFORMATION: u32 = 0x70;
pub const ATTR_TYPE_DATA: u32 = 0x80;
pub const ATTR_TYPE_INDEX_ROOT: u32 = 0x90;
pub const ATTR_TYPE_INDEX_ALLOCATION: u32 = 0xA0;
pub const ATTR_TYPE_BITMAP: u32 = 0xB0;
pub const ATTR_TYPE_REPARSE_POINT: u32 = 0xC0;
pub const ATTR_TYPE_EA_INFORMATION: u32 = 0xD0;
pub const ATTR_TYPE_EA: u32 = 0xE0;
pub const ATTR_TYPE_END: u32 = 0xFFFF_FFFF;

// Multi-sector record header, shared by FILE and INDX records
pub const REC_MAGIC: usize = 0x00;
pub const REC_USA_OFFSET: usize = 0x04;
pub const REC_USA_COUNT: usize = 0x06;
pub const FILE_MAGIC: &[u8; 4] = b"FILE";
pub const INDX_MAGIC: &[u8; 4] = b"INDX";

// FILE record header
pub const MFT_REC_SEQUENCE: usize = 0x10;
pub const MFT_REC_LINK_COUNT: usize = 0x12;
pub const MFT_REC_ATTRS_OFFSET: usize = 0x14;
pub const MFT_REC_FLAGS: usize = 0x16;
pub const MFT_REC_BYTES_USED: usize = 0x18;
pub const MFT_REC_BYTES_ALLOCATED: usize = 0x1C;
pub const MFT_REC_BASE_RECORD: usize = 0x20;
pub const MFT_REC_HEADER_SIZE: usize = 0x30;

pub const MFT_RECORD_IN_USE: u16 = 0x0001;
pub const MFT_RECORD_IS_DIRECTORY: u16 = 0x0002;

// Attribute record header
pub const ATTR_TYPE: usize = 0x00;
pub const ATTR_LENGTH: usize = 0x04;
pub const ATTR_NON_RESIDENT: usize = 0x08;
pub const ATTR_NAME_LENGTH: usize = 0x09;
pub const ATTR_NAME_OFFSET: usize = 0x0A;
pub const ATTR_FLAGS: usize = 0x0C;
pub const ATTR_INSTANCE: usize = 0x0E;

// 0x10: resident part
pub const ATTR_RES_VALUE_LENGTH: usize = 0x10;
pub const ATTR_RES_VALUE_OFFSET: usize = 0x14;
pub const ATTR_RES_HEADER_SIZE: usize = 0x18;

// 0x10: non-resident part
pub const ATTR_NONRES_FIRST_VCN: usize = 0x10;
pub const ATTR_NONRES_LAST_VCN: usize = 0x18;
pub const ATTR_NONRES_MAPPING_PAIRS: usize = 0x20;
pub const ATTR_NONRES_COMPRESSION_UNIT: usize = 0x22;
pub const ATTR_NONRES_ALLOCATED: usize = 0x28;
pub const ATTR_NONRES_DATA_SIZE: usize = 0x30;
pub const ATTR_NONRES_INITIALIZED: usize = 0x38;
pub const ATTR_NONRES_COMPRESSED_SIZE: usize = 0x40;
pub const ATTR_NONRES_HEADER_SIZE: usize = 0x40;
pub const ATTR_NONRES_COMPRESSED_HEADER_SIZE: usize = 0x48;

pub const ATTR_FLAG_COMPRESSION_MASK: u16 = 0x00FF;
pub const ATTR_FLAG_ENCRYPTED: u16 = 0x4000;
pub const ATTR_FLAG_SPARSE: u16 = 0x8000;

// STANDARD_INFORMATION value
pub const STDINFO_CREATION_TIME: usize = 0x00;
pub const STDINFO_MODIFICATION_TIME: usize = 0x08;
pub const STDINFO_MFT_MODIFICATION_TIME: usize = 0x10;
pub const STDINFO_ACCESS_TIME: usize = 0x18;
pub const STDINFO_FILE_ATTRIBUTES: usize = 0x20;
/// NTFS 1.2 layout; the 3.x extension fields are not used.
pub const STDINFO_MIN_SIZE: usize = 0x30;

// FILE_NAME value
pub const FN_PARENT_REF: usize = 0x00;
pub const FN_CREATION_TIME: usize = 0x08;
pub const FN_MODIFICATION_TIME: usize = 0x10;
pub const FN_MFT_MODIFICATION_TIME: usize = 0x18;
pub const FN_ACCESS_TIME: usize = 0x20;
pub const FN_ALLOCATED_SIZE: usize = 0x28;
pub const FN_DATA_SIZE: usize = 0x30;
pub const FN_FILE_ATTRIBUTES: usize = 0x38;
pub const FN_REPARSE_TAG: usize = 0x3C;
pub const FN_NAME_LENGTH: usize = 0x40;
pub const FN_NAMESPACE: usize = 0x41;
pub const FN_NAME: usize = 0x42;

// VOLUME_INFORMATION value
pub const VOLINFO_MAJOR_VERSION: usize = 0x08;
pub const VOLINFO_MINOR_VERSION: usize = 0x09;
pub const VOLINFO_FLAGS: usize = 0x0A;
pub const VOLINFO_SIZE: usize = 0x0C;

pub const VOLUME_FLAG_DIRTY: u16 = 0x0001;
pub const VOLUME_FLAG_RESIZE_LOG_FILE: u16 = 0x0002;
pub const VOLUME_FLAG_UPGRADE_ON_MOUNT: u16 = 0x0004;
pub const VOLUME_FLAG_MOUNTED_ON_NT4: u16 = 0x0008;
pub const VOLUME_FLAG_DELETE_USN_UNDERWAY: u16 = 0x0010;
pub const VOLUME_FLAG_REPAIR_OBJECT_ID: u16 = 0x0020;
pub const VOLUME_FLAG_CHKDSK_UNDERWAY: u16 = 0x4000;
pub const VOLUME_FLAG_MODIFIED_BY_CHKDSK: u16 = 0x8000;

// INDEX_ROOT value
pub const IDX_ROOT_TYPE: usize = 0x00;
pub const IDX_ROOT_COLLATION: usize = 0x04;
pub const IDX_ROOT_NODE_SIZE: usize = 0x08;
pub const IDX_ROOT_ADDRESSES_PER_NODE: usize = 0x0C;
pub const IDX_ROOT_HEADER: usize = 0x10;
pub const IDX_ROOT_SIZE: usize = 0x20;

// Index header, embedded in INDEX_ROOT and in every INDX node
pub const IDX_HDR_FIRST_ENTRY: usize = 0x00;
pub const IDX_HDR_USED: usize = 0x04;
pub const IDX_HDR_ALLOCATED: usize = 0x08;
pub const IDX_HDR_FLAGS: usize = 0x0C;
pub const IDX_HDR_SIZE: usize = 0x10;
pub const IDX_HDR_F_INTERNAL: u8 = 0x01;

// INDX node
pub const IDX_NODE_SELF_ADDRESS: usize = 0x10;
pub const IDX_NODE_HEADER: usize = 0x18;

// Index entry header
pub const IDX_ENTRY_FILE_REF: usize = 0x00;
pub const IDX_ENTRY_LENGTH: usize = 0x08;
pub const IDX_ENTRY_KEY_LENGTH: usize = 0x0A;
pub const IDX_ENTRY_FLAGS: usize = 0x0C;
pub const IDX_ENTRY_HEADER_SIZE: usize = 0x10;
pub const IDX_ENTRY_F_INTERNAL: u16 = 0x0001;
pub const IDX_ENTRY_F_END: u16 = 0x0002;

pub const COLLATION_FILENAME: u32 = 0x01;

/// Name of the directory index attributes.
pub const DIR_INDEX_NAME: &str = "$I30";

// File attribute flags (STANDARD_INFORMATION and FILE_NAME)
pub const FILE_ATTR_READONLY: u32 = 0x0000_0001;
pub const FILE_ATTR_HIDDEN: u32 = 0x0000_0002;
pub const FILE_ATTR_SYSTEM: u32 = 0x0000_0004;
pub const FILE_ATTR_DOS_DIRECTORY: u32 = 0x0000_0010;
pub const FILE_ATTR_ARCHIVE: u32 = 0x0000_0020;
pub const FILE_ATTR_DEVICE: u32 = 0x0000_0040;
pub const FILE_ATTR_NORMAL: u32 = 0x0000_0080;
pub const FILE_ATTR_TEMPORARY: u32 = 0x0000_0100;
pub const FILE_ATTR_SPARSE_FILE: u32 = 0x0000_0200;
pub const FILE_ATTR_REPARSE_POINT: u32 = 0x0000_0400;
pub const FILE_ATTR_COMPRESSED: u32 = 0x0000_0800;
pub const FILE_ATTR_OFFLINE: u32 = 0x0000_1000;
pub const FILE_ATTR_NOT_CONTENT_INDEXED: u32 = 0x0000_2000;
pub const FILE_ATTR_ENCRYPTED: u32 = 0x0000_4000;
/// Also known as DUP_FILE_NAME_INDEX_PRESENT.
pub const FILE_ATTR_DIRECTORY: u32 = 0x1000_0000;
pub const FILE_ATTR_DUP_VIEW_INDEX_PRESENT: u32 = 0x2000_0000;

pub const REPARSE_TAG_SYMLINK: u32 = 0xA000_000C;

/// 100ns intervals between 1601-01-01 and 1970-01-01
const FILETIME_UNIX_EPOCH_DIFF: i64 = 11_644_473_600;

#[inline]
pub fn read_u16(buf: &[u8], offset: usize) -> u16 {
    LittleEndian::read_u16(&buf[offset..offset + 2])
}

#[inline]
pub fn read_u32(buf: &[u8], offset: usize) -> u32 {
    LittleEndian::read_u32(&buf[offset..offset + 4])
}

#[inline]
pub fn read_u64(buf: &[u8], offset: usize) -> u64 {
    LittleEndian::read_u64(&buf[offset..offset + 8])
}

#[inline]
pub fn read_i64(buf: &[u8], offset: usize) -> i64 {
    LittleEndian::read_i64(&buf[offset..offset + 8])
}

/// MFT file reference: 48-bit record number plus 16-bit sequence number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MftRef(pub u64);

impl MftRef {
    pub fn new(index: u64, sequence: u16) -> Self {
        MftRef((index & 0x0000_FFFF_FFFF_FFFF) | ((sequence as u64) << 48))
    }

    pub fn read(buf: &[u8], offset: usize) -> Self {
        MftRef(read_u64(buf, offset))
    }

    pub fn index(&self) -> u64 {
        self.0 & 0x0000_FFFF_FFFF_FFFF
    }

    pub fn sequence(&self) -> u16 {
        (self.0 >> 48) as u16
    }

    pub fn is_null(&self) -> bool {
        self.0 == 0
    }
}

impl std::fmt::Display for MftRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:#x}/{:#x}", self.index(), self.sequence())
    }
}

/// Convert an NT FILETIME (100ns ticks since 1601) to UTC.
pub fn filetime_to_datetime(filetime: u64) -> Option<DateTime<Utc>> {
    if filetime == 0 {
        return None;
    }
    let secs = (filetime / 10_000_000) as i64 - FILETIME_UNIX_EPOCH_DIFF;
    let nanos = ((filetime % 10_000_000) * 100) as u32;
    DateTime::from_timestamp(secs, nanos)
}

/// Allocate a zeroed buffer, reporting allocation failure instead of aborting.
pub fn alloc_buffer(len: usize) -> Result<Vec<u8>, NtvfsError> {
    let mut buf = Vec::new();
    buf.try_reserve_exact(len)
        .map_err(|_| NtvfsError::NoMemory(format!("failed to allocate {} bytes", len)))?;
    buf.resize(len, 0);
    Ok(buf)
}

/// Collect `count` UTF-16 code units starting at `offset`.
pub fn read_utf16_units(buf: &[u8], offset: usize, count: usize) -> Vec<u16> {
    (0..count).map(|i| read_u16(buf, offset + i * 2)).collect()
}

/// Decode a UTF-16LE name, replacing unpaired surrogates.
pub fn decode_utf16_name(buf: &[u8], offset: usize, count: usize) -> String {
    String::from_utf16_lossy(&read_utf16_units(buf, offset, count))
}

/// Compare a UTF-16LE name on disk with an ASCII string, ignoring ASCII case.
pub fn utf16_name_eq_ascii(buf: &[u8], offset: usize, count: usize, ascii: &str) -> bool {
    count == ascii.len()
        && ascii.bytes().enumerate().all(|(i, b)| {
            let unit = read_u16(buf, offset + i * 2);
            unit < 0x80 && (unit as u8).eq_ignore_ascii_case(&b)
        })
}
