// NTFS MFT record parsing
// A Core is a validated base MFT record together with its attribute table.

use super::cache::CacheCost;
use super::data_runs::{decode_mapping_pairs, ExtentTable};
use super::fixup::{apply_fixups, FixupOutcome};
use super::geometry::VolumeGeometry;
use super::structures::*;
use log::{trace, warn};
use ntvfs_core::NtvfsError;

/// Bookkeeping charged per attribute on top of the raw record size.
const ATTR_COST: usize = 64;
const EXTENT_COST: usize = 16;

/// FILENAME namespace used for 8.3 short names
pub const FILENAME_NAMESPACE_DOS: u8 = 2;

#[derive(Debug, Clone)]
pub enum AttributeKind {
    Resident {
        value_offset: usize,
        /// Bytes of the value actually present in the record.
        resident_len: usize,
    },
    NonResident {
        first_vcn: i64,
        last_vcn: i64,
        allocated: u64,
        initialized: u64,
        compression_unit: u8,
        extents: ExtentTable,
    },
}

/// One attribute of a base MFT record.
#[derive(Debug, Clone)]
pub struct Attribute {
    pub attr_type: u32,
    pub name: Option<String>,
    pub flags: u16,
    /// Offset of the attribute header within the record
    pub offset: usize,
    pub length: usize,
    /// Logical size of the value (data size for non-resident attributes)
    pub value_size: u64,
    pub kind: AttributeKind,
}

impl Attribute {
    pub fn is_resident(&self) -> bool {
        matches!(self.kind, AttributeKind::Resident { .. })
    }

    pub fn is_compressed(&self) -> bool {
        match &self.kind {
            AttributeKind::NonResident {
                compression_unit, ..
            } => *compression_unit != 0 || self.flags & ATTR_FLAG_COMPRESSION_MASK != 0,
            AttributeKind::Resident { .. } => false,
        }
    }

    /// Allocated size: the larger of the header value and what the extents cover.
    pub fn allocated_size(&self) -> u64 {
        match &self.kind {
            AttributeKind::Resident { resident_len, .. } => ((*resident_len as u64) + 7) & !7,
            AttributeKind::NonResident {
                allocated, extents, ..
            } => (*allocated).max(extents.covered),
        }
    }

    pub fn initialized_size(&self) -> u64 {
        match &self.kind {
            AttributeKind::Resident { resident_len, .. } => *resident_len as u64,
            AttributeKind::NonResident { initialized, .. } => *initialized,
        }
    }

    pub fn extents(&self) -> Option<&ExtentTable> {
        match &self.kind {
            AttributeKind::NonResident { extents, .. } => Some(extents),
            AttributeKind::Resident { .. } => None,
        }
    }

    pub fn is_unnamed(&self) -> bool {
        self.name.is_none()
    }

    pub fn has_name(&self, name: &str) -> bool {
        self.name.as_deref() == Some(name)
    }
}

/// Parsed FILENAME attribute value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileNameAttr {
    pub parent: MftRef,
    pub creation_time: u64,
    pub modification_time: u64,
    pub mft_modification_time: u64,
    pub access_time: u64,
    pub allocated_size: u64,
    pub data_size: u64,
    pub file_attributes: u32,
    pub reparse_tag: u32,
    pub namespace: u8,
    pub name: Vec<u16>,
}

impl FileNameAttr {
    pub fn parse(value: &[u8]) -> Result<Self, NtvfsError> {
        if value.len() < FN_NAME {
            return Err(NtvfsError::BogusFormat(format!(
                "FILENAME value too short: {:#x} bytes",
                value.len()
            )));
        }
        let name_len = value[FN_NAME_LENGTH] as usize;
        if FN_NAME + name_len * 2 > value.len() {
            return Err(NtvfsError::BogusFormat(format!(
                "FILENAME name ({} units) extends beyond the value ({:#x} bytes)",
                name_len,
                value.len()
            )));
        }
        Ok(FileNameAttr {
            parent: MftRef::read(value, FN_PARENT_REF),
            creation_time: read_u64(value, FN_CREATION_TIME),
            modification_time: read_u64(value, FN_MODIFICATION_TIME),
            mft_modification_time: read_u64(value, FN_MFT_MODIFICATION_TIME),
            access_time: read_u64(value, FN_ACCESS_TIME),
            allocated_size: read_u64(value, FN_ALLOCATED_SIZE),
            data_size: read_u64(value, FN_DATA_SIZE),
            file_attributes: read_u32(value, FN_FILE_ATTRIBUTES),
            reparse_tag: read_u32(value, FN_REPARSE_TAG),
            namespace: value[FN_NAMESPACE],
            name: read_utf16_units(value, FN_NAME, name_len),
        })
    }

    pub fn name_string(&self) -> String {
        String::from_utf16_lossy(&self.name)
    }

    /// Case-insensitive ASCII comparison, used for the system file names.
    pub fn name_eq_ascii(&self, ascii: &str) -> bool {
        self.name.len() == ascii.len()
            && self
                .name
                .iter()
                .zip(ascii.bytes())
                .all(|(&unit, b)| unit < 0x80 && (unit as u8).eq_ignore_ascii_case(&b))
    }
}

/// STANDARD_INFORMATION fields the engine reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StandardInfo {
    pub creation_time: u64,
    pub modification_time: u64,
    pub mft_modification_time: u64,
    pub access_time: u64,
    pub file_attributes: u32,
}

/// A validated base MFT record.
#[derive(Debug)]
pub struct Core {
    pub mft_index: u64,
    pub sequence: u16,
    pub flags: u16,
    pub record: Vec<u8>,
    pub attributes: Vec<Attribute>,
    /// The record carries an ATTRIBUTE_LIST; some attributes may live elsewhere.
    pub has_attribute_list: bool,
    pub cost: usize,
}

impl Core {
    /// Validate a raw record read from the MFT and build its attribute table.
    ///
    /// Fixups are applied here; with `relaxed` set a broken update sequence
    /// array is logged instead of failing the load.
    pub fn load(
        mft_index: u64,
        mut record: Vec<u8>,
        geometry: &VolumeGeometry,
        relaxed: bool,
    ) -> Result<Self, NtvfsError> {
        if record.len() < MFT_REC_HEADER_SIZE || &record[REC_MAGIC..REC_MAGIC + 4] != FILE_MAGIC {
            return Err(NtvfsError::BogusFormat(format!(
                "MFT record {:#x}: no FILE signature",
                mft_index
            )));
        }
        if apply_fixups(&mut record, relaxed)? == FixupOutcome::Skipped {
            warn!("MFT record {:#x}: using record without fixups", mft_index);
        }
        Self::parse(mft_index, record, geometry)
    }

    /// Parse a record that already had its fixups applied.
    pub fn parse(
        mft_index: u64,
        record: Vec<u8>,
        geometry: &VolumeGeometry,
    ) -> Result<Self, NtvfsError> {
        let bad = |what: String| {
            NtvfsError::BogusFormat(format!("Bad MFT record {:#x}: {}", mft_index, what))
        };

        if record.len() < MFT_REC_HEADER_SIZE {
            return Err(bad(format!("record too short: {:#x} bytes", record.len())));
        }
        let base = read_u64(&record, MFT_REC_BASE_RECORD);
        if base != 0 {
            return Err(bad(format!("not a base record (base reference {:#x})", base)));
        }
        let bytes_used = read_u32(&record, MFT_REC_BYTES_USED) as usize;
        let limit = bytes_used.min(record.len());
        let attrs_offset = read_u16(&record, MFT_REC_ATTRS_OFFSET) as usize;
        if attrs_offset < MFT_REC_HEADER_SIZE - 8 || attrs_offset & 7 != 0 {
            return Err(bad(format!("bad attribute offset {:#x}", attrs_offset)));
        }

        let mut attributes = Vec::new();
        let mut has_attribute_list = false;
        let mut off = attrs_offset;
        while off + ATTR_RES_HEADER_SIZE <= limit {
            let attr_type = read_u32(&record, off + ATTR_TYPE);
            if attr_type == ATTR_TYPE_END {
                break;
            }
            let attr = Self::parse_attribute(&record, off, limit, geometry)
                .map_err(|e| match e {
                    NtvfsError::BogusFormat(msg) => {
                        bad(format!("attribute @{:#x} (type {:#x}): {}", off, attr_type, msg))
                    }
                    other => other,
                })?;
            if attr_type == ATTR_TYPE_ATTRIBUTE_LIST {
                has_attribute_list = true;
            }
            trace!(
                "MFT record {:#x}: attribute {:#x} {:?} @{:#x} len {:#x}",
                mft_index,
                attr_type,
                attr.name,
                off,
                attr.length
            );
            off += attr.length;
            attributes.push(attr);
        }

        let cost = record.len()
            + attributes
                .iter()
                .map(|a| ATTR_COST + a.extents().map_or(0, |t| t.len() * EXTENT_COST))
                .sum::<usize>();

        Ok(Core {
            mft_index,
            sequence: read_u16(&record, MFT_REC_SEQUENCE),
            flags: read_u16(&record, MFT_REC_FLAGS),
            record,
            attributes,
            has_attribute_list,
            cost,
        })
    }

    fn parse_attribute(
        record: &[u8],
        off: usize,
        limit: usize,
        geometry: &VolumeGeometry,
    ) -> Result<Attribute, NtvfsError> {
        let attr_type = read_u32(record, off + ATTR_TYPE);
        let length = read_u32(record, off + ATTR_LENGTH) as usize;
        let non_resident = record[off + ATTR_NON_RESIDENT] != 0;
        let flags = read_u16(record, off + ATTR_FLAGS);
        let min_header = if !non_resident {
            ATTR_RES_HEADER_SIZE
        } else if flags & ATTR_FLAG_COMPRESSION_MASK != 0 {
            ATTR_NONRES_COMPRESSED_HEADER_SIZE
        } else {
            ATTR_NONRES_HEADER_SIZE
        };

        if off & 7 != 0 || length & 7 != 0 {
            return Err(NtvfsError::BogusFormat(format!(
                "misaligned attribute (length {:#x})",
                length
            )));
        }
        if length < min_header {
            return Err(NtvfsError::BogusFormat(format!(
                "attribute length {:#x} is smaller than the header ({:#x})",
                length, min_header
            )));
        }
        if off + length > limit {
            return Err(NtvfsError::BogusFormat(format!(
                "attribute length {:#x} extends beyond the used record size {:#x}",
                length, limit
            )));
        }

        let name_len = record[off + ATTR_NAME_LENGTH] as usize;
        let name = if name_len > 0 {
            let name_off = read_u16(record, off + ATTR_NAME_OFFSET) as usize;
            if name_off < min_header || name_off >= length || name_off + name_len * 2 > length {
                return Err(NtvfsError::BogusFormat(format!(
                    "name @{:#x} ({} units) is outside the attribute",
                    name_off, name_len
                )));
            }
            Some(decode_utf16_name(record, off + name_off, name_len))
        } else {
            None
        };

        if !non_resident {
            let value_len = read_u32(record, off + ATTR_RES_VALUE_LENGTH) as usize;
            let value_offset = read_u16(record, off + ATTR_RES_VALUE_OFFSET) as usize;
            if value_offset < ATTR_RES_HEADER_SIZE || value_offset > length {
                return Err(NtvfsError::BogusFormat(format!(
                    "resident value offset {:#x} is outside the attribute",
                    value_offset
                )));
            }
            if flags & ATTR_FLAG_COMPRESSION_MASK != 0 {
                warn!("resident attribute {:#x} claims compression; ignored", attr_type);
            }
            return Ok(Attribute {
                attr_type,
                name,
                flags,
                offset: off,
                length,
                value_size: value_len as u64,
                kind: AttributeKind::Resident {
                    value_offset,
                    resident_len: (length - value_offset).min(value_len),
                },
            });
        }

        let first_vcn = read_i64(record, off + ATTR_NONRES_FIRST_VCN);
        let last_vcn = read_i64(record, off + ATTR_NONRES_LAST_VCN);
        let mapping_pairs = read_u16(record, off + ATTR_NONRES_MAPPING_PAIRS) as usize;
        let compression_unit = record[off + ATTR_NONRES_COMPRESSION_UNIT];
        let allocated = read_i64(record, off + ATTR_NONRES_ALLOCATED);
        let data_size = read_i64(record, off + ATTR_NONRES_DATA_SIZE);
        let initialized = read_i64(record, off + ATTR_NONRES_INITIALIZED);

        if allocated < 0 || data_size < 0 || initialized < 0 {
            return Err(NtvfsError::BogusFormat(format!(
                "negative size: allocated {:#x}, data {:#x}, initialized {:#x}",
                allocated, data_size, initialized
            )));
        }
        if (allocated as u64) & geometry.cluster_mask() != 0 {
            return Err(NtvfsError::BogusFormat(format!(
                "allocated size {:#x} is not a multiple of the cluster size",
                allocated
            )));
        }
        if first_vcn > last_vcn && !(last_vcn == -1 && allocated == 0) {
            return Err(NtvfsError::BogusFormat(format!(
                "first VCN {:#x} is above last VCN {:#x}",
                first_vcn, last_vcn
            )));
        }
        if first_vcn < 0 || last_vcn > geometry.max_virtual_cluster as i64 {
            return Err(NtvfsError::BogusFormat(format!(
                "VCN range {:#x}..{:#x} is out of bounds",
                first_vcn, last_vcn
            )));
        }
        if mapping_pairs != 0 && (mapping_pairs < min_header || mapping_pairs > length) {
            return Err(NtvfsError::BogusFormat(format!(
                "mapping pairs offset {:#x} is outside the attribute",
                mapping_pairs
            )));
        }
        if compression_unit > 16 {
            return Err(NtvfsError::BogusFormat(format!(
                "compression unit {} is too large",
                compression_unit
            )));
        }

        let program = if mapping_pairs == 0 {
            &record[0..0]
        } else {
            &record[off + mapping_pairs..off + length]
        };
        let extents = decode_mapping_pairs(
            program,
            first_vcn,
            0,
            geometry.cluster_shift,
            geometry.volume_size,
        )?;

        Ok(Attribute {
            attr_type,
            name,
            flags,
            offset: off,
            length,
            value_size: data_size as u64,
            kind: AttributeKind::NonResident {
                first_vcn,
                last_vcn,
                allocated: allocated as u64,
                initialized: initialized as u64,
                compression_unit,
                extents,
            },
        })
    }

    pub fn is_in_use(&self) -> bool {
        self.flags & MFT_RECORD_IN_USE != 0
    }

    pub fn is_directory(&self) -> bool {
        self.flags & MFT_RECORD_IS_DIRECTORY != 0
    }

    pub fn mft_ref(&self) -> MftRef {
        MftRef::new(self.mft_index, self.sequence)
    }

    pub fn find_unnamed(&self, attr_type: u32) -> Option<&Attribute> {
        self.attributes
            .iter()
            .find(|a| a.attr_type == attr_type && a.is_unnamed())
    }

    pub fn find_named(&self, attr_type: u32, name: &str) -> Option<&Attribute> {
        self.attributes
            .iter()
            .find(|a| a.attr_type == attr_type && a.has_name(name))
    }

    /// Error for an attribute this record does not carry.
    pub fn missing_attribute(&self, what: &str) -> NtvfsError {
        if self.has_attribute_list {
            NtvfsError::NotSupported(format!(
                "MFT record {:#x}: {} may live in an attribute list extension",
                self.mft_index, what
            ))
        } else {
            NtvfsError::BogusFormat(format!("MFT record {:#x}: no {}", self.mft_index, what))
        }
    }

    /// The bytes of a resident value present in the record.
    pub fn resident_value(&self, attr: &Attribute) -> Option<&[u8]> {
        match attr.kind {
            AttributeKind::Resident {
                value_offset,
                resident_len,
            } => {
                let start = attr.offset + value_offset;
                Some(&self.record[start..start + resident_len])
            }
            AttributeKind::NonResident { .. } => None,
        }
    }

    /// The primary FILENAME: the first resident one outside the DOS namespace,
    /// falling back to the first resident one.
    pub fn file_name(&self) -> Result<Option<FileNameAttr>, NtvfsError> {
        let mut fallback = None;
        for attr in self
            .attributes
            .iter()
            .filter(|a| a.attr_type == ATTR_TYPE_FILE_NAME)
        {
            let Some(value) = self.resident_value(attr) else {
                continue;
            };
            let parsed = FileNameAttr::parse(value)?;
            if parsed.namespace != FILENAME_NAMESPACE_DOS {
                return Ok(Some(parsed));
            }
            if fallback.is_none() {
                fallback = Some(parsed);
            }
        }
        Ok(fallback)
    }

    pub fn standard_info(&self) -> Option<StandardInfo> {
        let attr = self.find_unnamed(ATTR_TYPE_STANDARD_INFORMATION)?;
        let value = self.resident_value(attr)?;
        if value.len() < STDINFO_MIN_SIZE {
            return None;
        }
        Some(StandardInfo {
            creation_time: read_u64(value, STDINFO_CREATION_TIME),
            modification_time: read_u64(value, STDINFO_MODIFICATION_TIME),
            mft_modification_time: read_u64(value, STDINFO_MFT_MODIFICATION_TIME),
            access_time: read_u64(value, STDINFO_ACCESS_TIME),
            file_attributes: read_u32(value, STDINFO_FILE_ATTRIBUTES),
        })
    }
}

impl CacheCost for Core {
    fn cache_cost(&self) -> usize {
        self.cost
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use byteorder::{ByteOrder, LittleEndian};

    fn geometry() -> VolumeGeometry {
        VolumeGeometry {
            sector_size: 512,
            cluster_size: 4096,
            cluster_shift: 12,
            cluster_count: 2560,
            volume_size: 2560 * 4096,
            mft_lcn: 4,
            mft_mirror_lcn: 2,
            mft_record_size: 1024,
            index_node_size: 4096,
            serial_number: 0,
            max_virtual_cluster: (i64::MAX >> 12) as u64,
        }
    }

    fn empty_record() -> Vec<u8> {
        let mut rec = vec![0u8; 1024];
        rec[0..4].copy_from_slice(FILE_MAGIC);
        LittleEndian::write_u16(&mut rec[REC_USA_OFFSET..], 0x30);
        LittleEndian::write_u16(&mut rec[REC_USA_COUNT..], 3);
        LittleEndian::write_u16(&mut rec[MFT_REC_SEQUENCE..], 1);
        LittleEndian::write_u16(&mut rec[MFT_REC_ATTRS_OFFSET..], 0x38);
        LittleEndian::write_u16(&mut rec[MFT_REC_FLAGS..], MFT_RECORD_IN_USE);
        LittleEndian::write_u32(&mut rec[MFT_REC_BYTES_ALLOCATED..], 1024);
        rec
    }

    fn put_resident(rec: &mut [u8], off: usize, attr_type: u32, value: &[u8]) -> usize {
        let length = (0x18 + value.len() + 7) & !7;
        LittleEndian::write_u32(&mut rec[off..], attr_type);
        LittleEndian::write_u32(&mut rec[off + 4..], length as u32);
        LittleEndian::write_u32(&mut rec[off + 0x10..], value.len() as u32);
        LittleEndian::write_u16(&mut rec[off + 0x14..], 0x18);
        rec[off + 0x18..off + 0x18 + value.len()].copy_from_slice(value);
        off + length
    }

    fn finish(rec: &mut [u8], end: usize) {
        LittleEndian::write_u32(&mut rec[end..], ATTR_TYPE_END);
        LittleEndian::write_u32(&mut rec[MFT_REC_BYTES_USED..], (end + 8) as u32);
    }

    fn filename_value(name: &str, namespace: u8) -> Vec<u8> {
        let units: Vec<u16> = name.encode_utf16().collect();
        let mut v = vec![0u8; FN_NAME + units.len() * 2];
        LittleEndian::write_u64(&mut v[FN_PARENT_REF..], MftRef::new(5, 5).0);
        v[FN_NAME_LENGTH] = units.len() as u8;
        v[FN_NAMESPACE] = namespace;
        for (i, u) in units.iter().enumerate() {
            LittleEndian::write_u16(&mut v[FN_NAME + i * 2..], *u);
        }
        v
    }

    #[test]
    fn test_parse_resident_attributes() {
        let mut rec = empty_record();
        let mut off = put_resident(&mut rec, 0x38, ATTR_TYPE_FILE_NAME, &filename_value("A~1", 2));
        off = put_resident(&mut rec, off, ATTR_TYPE_FILE_NAME, &filename_value("alpha.txt", 1));
        off = put_resident(&mut rec, off, ATTR_TYPE_DATA, b"hello");
        finish(&mut rec, off);

        let core = Core::parse(42, rec, &geometry()).unwrap();
        assert_eq!(core.attributes.len(), 3);
        assert!(core.is_in_use());
        assert!(!core.is_directory());
        let data = core.find_unnamed(ATTR_TYPE_DATA).unwrap();
        assert_eq!(data.value_size, 5);
        assert_eq!(core.resident_value(data).unwrap(), b"hello");
        let name = core.file_name().unwrap().unwrap();
        assert_eq!(name.name_string(), "alpha.txt");
        assert_eq!(name.parent.index(), 5);
    }

    #[test]
    fn test_non_resident_attribute() {
        let mut rec = empty_record();
        let off = 0x38;
        let length = 0x48;
        LittleEndian::write_u32(&mut rec[off..], ATTR_TYPE_DATA);
        LittleEndian::write_u32(&mut rec[off + 4..], length);
        rec[off + ATTR_NON_RESIDENT] = 1;
        LittleEndian::write_i64(&mut rec[off + ATTR_NONRES_FIRST_VCN..], 0);
        LittleEndian::write_i64(&mut rec[off + ATTR_NONRES_LAST_VCN..], 1);
        LittleEndian::write_u16(&mut rec[off + ATTR_NONRES_MAPPING_PAIRS..], 0x40);
        LittleEndian::write_u64(&mut rec[off + ATTR_NONRES_ALLOCATED..], 8192);
        LittleEndian::write_u64(&mut rec[off + ATTR_NONRES_DATA_SIZE..], 6000);
        LittleEndian::write_u64(&mut rec[off + ATTR_NONRES_INITIALIZED..], 5000);
        rec[off + 0x40..off + 0x43].copy_from_slice(&[0x11, 0x02, 0x20]);
        finish(&mut rec, off + length as usize);

        let core = Core::parse(30, rec, &geometry()).unwrap();
        let data = core.find_unnamed(ATTR_TYPE_DATA).unwrap();
        assert!(!data.is_resident());
        assert!(!data.is_compressed());
        assert_eq!(data.value_size, 6000);
        assert_eq!(data.initialized_size(), 5000);
        assert_eq!(data.allocated_size(), 8192);
        let extents = data.extents().unwrap();
        assert_eq!(extents.len(), 1);
        assert_eq!(extents.extents[0].disk_offset, 0x20 * 4096);
        assert_eq!(extents.covered, 8192);
    }

    #[test]
    fn test_rejects_extension_record() {
        let mut rec = empty_record();
        LittleEndian::write_u64(&mut rec[MFT_REC_BASE_RECORD..], MftRef::new(20, 1).0);
        finish(&mut rec, 0x38);
        assert!(matches!(
            Core::parse(21, rec, &geometry()),
            Err(NtvfsError::BogusFormat(_))
        ));
    }

    #[test]
    fn test_rejects_overlong_attribute() {
        let mut rec = empty_record();
        let off = put_resident(&mut rec, 0x38, ATTR_TYPE_DATA, b"abc");
        finish(&mut rec, off);
        LittleEndian::write_u32(&mut rec[0x38 + 4..], 0x400);
        let err = Core::parse(40, rec, &geometry()).unwrap_err();
        match err {
            NtvfsError::BogusFormat(msg) => assert!(msg.contains("Bad MFT record 0x28")),
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[test]
    fn test_rejects_bad_value_offset() {
        let mut rec = empty_record();
        let off = put_resident(&mut rec, 0x38, ATTR_TYPE_DATA, b"abc");
        finish(&mut rec, off);
        LittleEndian::write_u16(&mut rec[0x38 + ATTR_RES_VALUE_OFFSET..], 0x10);
        assert!(Core::parse(40, rec, &geometry()).is_err());
    }

    #[test]
    fn test_load_requires_signature() {
        let mut rec = empty_record();
        rec[0..4].copy_from_slice(b"BAAD");
        assert!(matches!(
            Core::load(3, rec, &geometry(), false),
            Err(NtvfsError::BogusFormat(_))
        ));
    }

    #[test]
    fn test_missing_attribute_with_list() {
        let mut rec = empty_record();
        let off = put_resident(&mut rec, 0x38, ATTR_TYPE_ATTRIBUTE_LIST, &[0u8; 32]);
        finish(&mut rec, off);
        let core = Core::parse(50, rec, &geometry()).unwrap();
        assert!(core.has_attribute_list);
        assert!(matches!(
            core.missing_attribute("unnamed DATA"),
            NtvfsError::NotSupported(_)
        ));
    }

    #[test]
    fn test_filename_too_short() {
        assert!(FileNameAttr::parse(&[0u8; 0x20]).is_err());
        let mut v = filename_value("x", 1);
        v[FN_NAME_LENGTH] = 10;
        assert!(FileNameAttr::parse(&v).is_err());
    }
}
