// Attribute value I/O
// Reads and same-size overwrites of attribute values, resident or mapped
// through an extent table.

use super::data_runs::{ExtentTable, UNMAPPED};
use super::record::{Attribute, AttributeKind, Core};
use log::trace;
use ntvfs_core::{BackingStore, NtvfsError};

/// One piece of a request after mapping it through an extent table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Span {
    disk_offset: u64, // UNMAPPED for holes
    len: usize,
}

/// Split `[offset, offset + len)` of the attribute into disk spans.
fn map_range(table: &ExtentTable, offset: u64, len: usize) -> Result<Vec<Span>, NtvfsError> {
    let mut spans = Vec::new();
    let mut pos = offset;
    let mut left = len;
    while left > 0 {
        let (disk, avail) = table.offset_to_disk(pos).ok_or_else(|| {
            NtvfsError::BogusFormat(format!(
                "extent table ends at {:#x}, before offset {:#x}",
                table.covered, pos
            ))
        })?;
        let take = (avail.min(left as u64)) as usize;
        spans.push(Span {
            disk_offset: disk,
            len: take,
        });
        pos += take as u64;
        left -= take;
    }
    Ok(spans)
}

fn request_end(offset: u64, len: usize) -> Result<u64, NtvfsError> {
    offset.checked_add(len as u64).ok_or_else(|| {
        NtvfsError::Eof(format!("request at {:#x} LB {:#x} overflows", offset, len))
    })
}

/// Read `buf.len()` bytes of the attribute value starting at `offset`.
///
/// Bytes past the initialized size read as zeros; anything past the value
/// (resident) or the allocation (non-resident) is `Eof`.
pub fn read_attribute(
    backing: &mut dyn BackingStore,
    core: &Core,
    attr: &Attribute,
    offset: u64,
    buf: &mut [u8],
) -> Result<(), NtvfsError> {
    if buf.is_empty() {
        return Ok(());
    }
    let end = request_end(offset, buf.len())?;

    match &attr.kind {
        AttributeKind::Resident { .. } => {
            if offset >= attr.value_size || end > attr.value_size {
                return Err(NtvfsError::Eof(format!(
                    "read at {:#x} LB {:#x} beyond resident value of {:#x} bytes",
                    offset,
                    buf.len(),
                    attr.value_size
                )));
            }
            let value = core.resident_value(attr).unwrap_or(&[]);
            let start = offset as usize;
            let present = value.len().saturating_sub(start).min(buf.len());
            buf[..present].copy_from_slice(&value[start..start + present]);
            buf[present..].fill(0);
            Ok(())
        }
        AttributeKind::NonResident {
            allocated,
            initialized,
            extents,
            ..
        } => {
            if attr.is_compressed() {
                return Err(NtvfsError::NotSupported(format!(
                    "reading compressed attribute {:#x} of MFT record {:#x}",
                    attr.attr_type, core.mft_index
                )));
            }
            if offset >= *allocated || end > *allocated {
                return Err(NtvfsError::Eof(format!(
                    "read at {:#x} LB {:#x} beyond allocated size {:#x}",
                    offset,
                    buf.len(),
                    allocated
                )));
            }

            let on_disk = if offset < *initialized {
                (end.min(*initialized) - offset) as usize
            } else {
                0
            };
            let mut pos = 0;
            for span in map_range(extents, offset, on_disk)? {
                let chunk = &mut buf[pos..pos + span.len];
                if span.disk_offset == UNMAPPED {
                    chunk.fill(0);
                } else {
                    backing.read_at(span.disk_offset, chunk)?;
                }
                pos += span.len;
            }
            buf[on_disk..].fill(0);
            trace!(
                "read {:#x} LB {:#x} of attribute {:#x} in MFT record {:#x} ({:#x} from disk)",
                offset,
                buf.len(),
                attr.attr_type,
                core.mft_index,
                on_disk
            );
            Ok(())
        }
    }
}

/// Overwrite already-allocated, initialized bytes of a non-resident value.
///
/// Nothing is written unless the whole request can be satisfied.
pub fn write_attribute(
    backing: &mut dyn BackingStore,
    core: &Core,
    attr: &Attribute,
    offset: u64,
    buf: &[u8],
) -> Result<(), NtvfsError> {
    let (allocated, initialized, extents) = match &attr.kind {
        AttributeKind::Resident { .. } => {
            return Err(NtvfsError::NotSupported(format!(
                "writing resident attribute {:#x} of MFT record {:#x}",
                attr.attr_type, core.mft_index
            )))
        }
        AttributeKind::NonResident {
            allocated,
            initialized,
            extents,
            ..
        } => (*allocated, *initialized, extents),
    };
    if attr.is_compressed() {
        return Err(NtvfsError::NotSupported(format!(
            "writing compressed attribute {:#x} of MFT record {:#x}",
            attr.attr_type, core.mft_index
        )));
    }
    if buf.is_empty() {
        return Ok(());
    }
    let end = request_end(offset, buf.len())?;
    if offset >= allocated || end > allocated {
        return Err(NtvfsError::Eof(format!(
            "write at {:#x} LB {:#x} beyond allocated size {:#x}",
            offset,
            buf.len(),
            allocated
        )));
    }
    if end > initialized {
        return Err(NtvfsError::Eof(format!(
            "write at {:#x} LB {:#x} beyond initialized size {:#x}",
            offset,
            buf.len(),
            initialized
        )));
    }

    let spans = map_range(extents, offset, buf.len())?;
    let mut pos = 0;
    for span in &spans {
        if span.disk_offset == UNMAPPED && buf[pos..pos + span.len].iter().any(|&b| b != 0) {
            return Err(NtvfsError::WriteProtected(format!(
                "cannot allocate clusters for non-zero write into sparse range at {:#x}",
                offset + pos as u64
            )));
        }
        pos += span.len;
    }

    pos = 0;
    for span in spans {
        if span.disk_offset != UNMAPPED {
            backing.write_at(span.disk_offset, &buf[pos..pos + span.len])?;
        }
        pos += span.len;
    }
    trace!(
        "wrote {:#x} LB {:#x} of attribute {:#x} in MFT record {:#x}",
        offset,
        buf.len(),
        attr.attr_type,
        core.mft_index
    );
    Ok(())
}
