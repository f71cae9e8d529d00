// Update sequence (multi-sector transfer) fixups
// Every 512-byte block of an MFT or INDX record ends with a check value that
// must be swapped for the saved original before the record can be parsed.

use super::structures::{read_u16, REC_USA_COUNT, REC_USA_OFFSET};
use log::{trace, warn};
use ntvfs_core::NtvfsError;

pub const FIXUP_STRIDE: usize = 512;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FixupOutcome {
    /// Every block verified and was restored.
    Applied,
    /// Relaxed mode gave up; the record is used as read.
    Skipped,
}

fn usa_is_sane(len: usize, usa_offset: usize, usa_count: usize) -> bool {
    len % FIXUP_STRIDE == 0
        && usa_offset & 1 == 0
        && usa_count == 1 + len / FIXUP_STRIDE
        && usa_offset + usa_count * 2 < FIXUP_STRIDE - 2
}

/// Verify and undo the update sequence protection of `record` in place.
///
/// In relaxed mode a malformed sequence array or a check mismatch is logged
/// and the record is left untouched; otherwise both fail with `BogusFormat`.
pub fn apply_fixups(record: &mut [u8], relaxed: bool) -> Result<FixupOutcome, NtvfsError> {
    if record.len() < FIXUP_STRIDE {
        return Err(NtvfsError::BogusFormat(format!(
            "record of {} bytes is too small for update sequence processing",
            record.len()
        )));
    }
    let usa_offset = read_u16(record, REC_USA_OFFSET) as usize;
    let usa_count = read_u16(record, REC_USA_COUNT) as usize;

    if !usa_is_sane(record.len(), usa_offset, usa_count) {
        if relaxed {
            warn!(
                "Ignoring bogus multisector update sequence: len={:#x} usa_offset={:#x} usa_count={:#x}",
                record.len(),
                usa_offset,
                usa_count
            );
            return Ok(FixupOutcome::Skipped);
        }
        return Err(NtvfsError::BogusFormat(format!(
            "Bogus multisector update sequence: len={:#x} usa_offset={:#x} usa_count={:#x}",
            record.len(),
            usa_offset,
            usa_count
        )));
    }

    let check = read_u16(record, usa_offset);
    let blocks = usa_count - 1;
    for block in 0..blocks {
        let tail = (block + 1) * FIXUP_STRIDE - 2;
        let found = read_u16(record, tail);
        if found != check {
            let saved = read_u16(record, usa_offset + 2 + block * 2);
            if relaxed {
                warn!(
                    "Multisector transfer warning: block #{} ends with {:#x} instead of {:#x} (fixup: {:#x})",
                    block, found, check, saved
                );
                return Ok(FixupOutcome::Skipped);
            }
            return Err(NtvfsError::BogusFormat(format!(
                "Multisector transfer error: block #{} ends with {:#x} instead of {:#x} (fixup: {:#x})",
                block, found, check, saved
            )));
        }
    }

    for block in 0..blocks {
        let tail = (block + 1) * FIXUP_STRIDE - 2;
        let src = usa_offset + 2 + block * 2;
        record.copy_within(src..src + 2, tail);
    }
    trace!("Applied {} fixups with check value {:#06x}", blocks, check);
    Ok(FixupOutcome::Applied)
}

/// Protect a record for writing: save each block tail in the sequence array and
/// replace it with `check`. The header fields must already describe the array.
pub fn protect_record(record: &mut [u8], check: u16) -> Result<(), NtvfsError> {
    let usa_offset = read_u16(record, REC_USA_OFFSET) as usize;
    let usa_count = read_u16(record, REC_USA_COUNT) as usize;
    if !usa_is_sane(record.len(), usa_offset, usa_count) {
        return Err(NtvfsError::InvalidInput(format!(
            "cannot protect record: len={:#x} usa_offset={:#x} usa_count={:#x}",
            record.len(),
            usa_offset,
            usa_count
        )));
    }

    record[usa_offset..usa_offset + 2].copy_from_slice(&check.to_le_bytes());
    for block in 0..usa_count - 1 {
        let tail = (block + 1) * FIXUP_STRIDE - 2;
        let dst = usa_offset + 2 + block * 2;
        record.copy_within(tail..tail + 2, dst);
        record[tail..tail + 2].copy_from_slice(&check.to_le_bytes());
    }
    Ok(())
}
