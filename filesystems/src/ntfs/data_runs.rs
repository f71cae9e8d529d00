// NTFS mapping pair decoder
// Turns the run-length program of a non-resident attribute into a table of
// byte extents on the volume.

use log::trace;
use ntvfs_core::NtvfsError;

/// Disk offset marking a sparse extent
pub const UNMAPPED: u64 = u64::MAX;

/// One contiguous piece of attribute data
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Extent {
    pub disk_offset: u64, // Byte offset on the volume, UNMAPPED for holes
    pub length: u64,      // Length in bytes
}

impl Extent {
    pub fn is_sparse(&self) -> bool {
        self.disk_offset == UNMAPPED
    }
}

/// Extents in VCN order, built once and never modified.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExtentTable {
    pub extents: Vec<Extent>,
    /// Sum of all extent lengths.
    pub covered: u64,
}

impl ExtentTable {
    pub fn is_empty(&self) -> bool {
        self.extents.is_empty()
    }

    pub fn len(&self) -> usize {
        self.extents.len()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Extent> {
        self.extents.iter()
    }

    /// Translate a byte offset within the attribute to a disk offset.
    /// Returns the disk offset (UNMAPPED for holes) and the bytes left in that extent.
    pub fn offset_to_disk(&self, offset: u64) -> Option<(u64, u64)> {
        let mut remaining = offset;
        for extent in &self.extents {
            if remaining < extent.length {
                let disk = if extent.is_sparse() {
                    UNMAPPED
                } else {
                    extent.disk_offset + remaining
                };
                return Some((disk, extent.length - remaining));
            }
            remaining -= extent.length;
        }
        None
    }
}

/// Decode a mapping pair program.
///
/// `attr_first_vcn` is the starting VCN recorded in the attribute header and
/// `expected_vcn` the first VCN not covered by previous tables in the chain;
/// a gap between the two becomes a leading sparse extent unless the program
/// is empty.
pub fn decode_mapping_pairs(
    program: &[u8],
    attr_first_vcn: i64,
    expected_vcn: i64,
    cluster_shift: u8,
    volume_size: u64,
) -> Result<ExtentTable, NtvfsError> {
    if attr_first_vcn < expected_vcn {
        return Err(NtvfsError::BogusFormat(format!(
            "attribute starts at a lower VCN than expected: {:#x}, {:#x}",
            attr_first_vcn, expected_vcn
        )));
    }

    // First pass only validates the structure and counts the pairs
    let mut pos = 0;
    let mut pairs = 0usize;
    while pos < program.len() {
        let header = program[pos];
        if header == 0 {
            break; // End marker
        }
        let length_size = (header & 0x0F) as usize;
        let offset_size = (header >> 4) as usize;
        if length_size == 0 || length_size > 8 {
            return Err(NtvfsError::BogusFormat(format!(
                "mapping pair #{:#x}: run length field size out of bounds: {}",
                pairs, length_size
            )));
        }
        if offset_size > 8 {
            return Err(NtvfsError::BogusFormat(format!(
                "mapping pair #{:#x}: LCN field size out of bounds: {}",
                pairs, offset_size
            )));
        }
        pos += 1 + length_size + offset_size;
        if pos > program.len() {
            return Err(NtvfsError::BogusFormat(format!(
                "mapping pair #{:#x} extends beyond the attribute",
                pairs
            )));
        }
        pairs += 1;
    }

    let mut max_clusters = (i64::MAX >> cluster_shift)
        .checked_sub(attr_first_vcn)
        .and_then(|v| u64::try_from(v).ok())
        .ok_or_else(|| {
            NtvfsError::BogusFormat(format!(
                "attribute first VCN {:#x} is beyond the maximum",
                attr_first_vcn
            ))
        })?;

    let leading_gap = pairs > 0 && attr_first_vcn != expected_vcn;
    let mut table = ExtentTable {
        extents: Vec::with_capacity(pairs + leading_gap as usize),
        covered: 0,
    };

    // A hole between this table and the previous one in the chain
    if leading_gap {
        let gap = ((attr_first_vcn - expected_vcn) as u64)
            .checked_mul(1u64 << cluster_shift)
            .ok_or_else(|| NtvfsError::BogusFormat("VCN gap overflows".to_string()))?;
        table.extents.push(Extent {
            disk_offset: UNMAPPED,
            length: gap,
        });
        table.covered = gap;
    }

    let mut lcn = 0i64;
    pos = 0;
    for index in 0..pairs {
        let header = program[pos];
        pos += 1;
        let length_size = (header & 0x0F) as usize;
        let offset_size = (header >> 4) as usize;

        let length_bytes = &program[pos..pos + length_size];
        if length_bytes[length_size - 1] & 0x80 != 0 {
            return Err(NtvfsError::BogusFormat(format!(
                "extent #{:#x}: negative run length",
                index
            )));
        }
        let clusters = read_le_bytes(length_bytes);
        pos += length_size;
        if clusters > max_clusters {
            return Err(NtvfsError::BogusFormat(format!(
                "extent #{:#x}: too many clusters {:#x}, max {:#x}",
                index, clusters, max_clusters
            )));
        }
        max_clusters -= clusters;
        let length = clusters << cluster_shift;

        let disk_offset = if offset_size == 0 {
            // No LCN field: sparse run
            UNMAPPED
        } else {
            let delta = read_le_bytes_signed(&program[pos..pos + offset_size]);
            pos += offset_size;
            lcn = lcn.checked_add(delta).ok_or_else(|| {
                NtvfsError::BogusFormat(format!("extent #{:#x}: LCN overflows", index))
            })?;
            if lcn < 0 {
                UNMAPPED
            } else {
                let offset = (lcn as u64) << cluster_shift;
                if offset >> cluster_shift != lcn as u64 {
                    return Err(NtvfsError::BogusFormat(format!(
                        "extent #{:#x}: LCN {:#x} overflows when shifted by {}",
                        index, lcn, cluster_shift
                    )));
                }
                match offset.checked_add(length) {
                    Some(end) if end <= volume_size => offset,
                    _ => {
                        return Err(NtvfsError::BogusFormat(format!(
                            "extent #{:#x} outside volume: {:#x} LB {:#x}, volume size {:#x}",
                            index, offset, length, volume_size
                        )))
                    }
                }
            }
        };

        trace!("   extent[{:#04x}]: {:#018x} LB {:#010x}", table.extents.len(), disk_offset, length);
        table.extents.push(Extent { disk_offset, length });
        table.covered += length;
    }

    Ok(table)
}

/// Read little-endian bytes as unsigned integer
fn read_le_bytes(bytes: &[u8]) -> u64 {
    let mut value = 0u64;
    for (i, &byte) in bytes.iter().enumerate() {
        value |= (byte as u64) << (i * 8);
    }
    value
}

/// Read little-endian bytes as signed integer
fn read_le_bytes_signed(bytes: &[u8]) -> i64 {
    if bytes.is_empty() {
        return 0;
    }

    let mut value = 0i64;
    for (i, &byte) in bytes.iter().enumerate() {
        value |= (byte as i64) << (i * 8);
    }

    // Sign extend if negative
    let bits = bytes.len() * 8;
    if bits < 64 && (value & (1 << (bits - 1))) != 0 {
        value |= !((1i64 << bits) - 1);
    }

    value
}
