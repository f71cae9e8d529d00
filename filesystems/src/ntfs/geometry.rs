// NTFS boot sector parser
// Validates the BPB and distills it into the immutable volume geometry

use super::structures::{read_u16, read_u64};
use log::{debug, info};
use ntvfs_core::NtvfsError;
use serde::Serialize;

pub const BOOT_SECTOR_SIZE: usize = 512;
pub const NTFS_OEM_ID: &[u8; 8] = b"NTFS    ";

// 0x03: OEM id
const BPB_OEM_ID: usize = 0x03;
// 0x0B: classic BPB
const BPB_BYTES_PER_SECTOR: usize = 0x0B;
const BPB_SECTORS_PER_CLUSTER: usize = 0x0D;
const BPB_RESERVED_SECTORS: usize = 0x0E;
const BPB_FAT_COUNT: usize = 0x10;
const BPB_ROOT_ENTRIES: usize = 0x11;
const BPB_TOTAL_SECTORS16: usize = 0x13;
const BPB_SECTORS_PER_FAT: usize = 0x16;
// 0x28: NTFS extension
const BPB_TOTAL_SECTORS: usize = 0x28;
const BPB_MFT_LCN: usize = 0x30;
const BPB_MFT_MIRROR_LCN: usize = 0x38;
const BPB_CLUSTERS_PER_MFT_RECORD: usize = 0x40;
const BPB_CLUSTERS_PER_INDEX_NODE: usize = 0x44;
const BPB_SERIAL_NUMBER: usize = 0x48;

/// Immutable volume geometry, created once at mount.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VolumeGeometry {
    pub sector_size: u32,
    pub cluster_size: u32,
    pub cluster_shift: u8,
    pub cluster_count: u64,
    pub volume_size: u64,
    pub mft_lcn: u64,
    pub mft_mirror_lcn: u64,
    pub mft_record_size: u32,
    pub index_node_size: u32,
    pub serial_number: u64,
    /// Largest VCN an attribute can address without overflowing a byte offset.
    pub max_virtual_cluster: u64,
}

impl VolumeGeometry {
    /// Parse and validate the boot sector against the size of the backing store.
    pub fn parse(boot: &[u8], backing_size: u64) -> Result<Self, NtvfsError> {
        if boot.len() < BOOT_SECTOR_SIZE {
            return Err(NtvfsError::UnknownFormat(format!(
                "boot sector too short: {} bytes",
                boot.len()
            )));
        }

        if &boot[BPB_OEM_ID..BPB_OEM_ID + 8] != NTFS_OEM_ID {
            return Err(NtvfsError::UnknownFormat(format!(
                "Not NTFS - OEM field mismatch: {:02x?}",
                &boot[BPB_OEM_ID..BPB_OEM_ID + 8]
            )));
        }

        // Fields the FAT layout uses must be zero
        let mbz = [
            ("reserved sectors", read_u16(boot, BPB_RESERVED_SECTORS) as u32),
            ("FAT count", boot[BPB_FAT_COUNT] as u32),
            ("root entries", read_u16(boot, BPB_ROOT_ENTRIES) as u32),
            ("16-bit total sectors", read_u16(boot, BPB_TOTAL_SECTORS16) as u32),
            ("sectors per FAT", read_u16(boot, BPB_SECTORS_PER_FAT) as u32),
        ];
        for (field, value) in mbz {
            if value != 0 {
                return Err(NtvfsError::UnknownFormat(format!(
                    "Not NTFS - MBZ: BPB {}={}",
                    field, value
                )));
            }
        }

        let sector_size = read_u16(boot, BPB_BYTES_PER_SECTOR) as u32;
        if !matches!(sector_size, 512 | 1024 | 2048 | 4096) {
            return Err(NtvfsError::UnknownFormat(format!(
                "Not NTFS - sector size out of range: {}",
                sector_size
            )));
        }

        let sectors_per_cluster = boot[BPB_SECTORS_PER_CLUSTER] as u32;
        if sectors_per_cluster == 0 || !sectors_per_cluster.is_power_of_two() {
            return Err(NtvfsError::UnknownFormat(format!(
                "Not NTFS - sectors per cluster out of range: {}",
                sectors_per_cluster
            )));
        }

        let cluster_size = sectors_per_cluster * sector_size;
        if cluster_size > 64 * 1024 {
            return Err(NtvfsError::NotSupported(format!(
                "cluster size exceeds 64KB: {:#x}",
                cluster_size
            )));
        }
        let cluster_shift = cluster_size.trailing_zeros() as u8;
        let max_virtual_cluster = (i64::MAX as u64) >> cluster_shift;

        let total_sectors = read_u64(boot, BPB_TOTAL_SECTORS);
        if total_sectors > backing_size / sector_size as u64 {
            return Err(NtvfsError::NotSupported(format!(
                "NTFS sector count exceeds volume size: {:#x} vs {:#x}",
                total_sectors,
                backing_size / sector_size as u64
            )));
        }
        if total_sectors < 256 {
            return Err(NtvfsError::NotSupported(format!(
                "NTFS sector count too small: {:#x}",
                total_sectors
            )));
        }
        let volume_size = total_sectors * sector_size as u64;
        let cluster_count = total_sectors / sectors_per_cluster as u64;

        let mft_lcn = read_u64(boot, BPB_MFT_LCN);
        if mft_lcn < 1 || mft_lcn >= cluster_count {
            return Err(NtvfsError::NotSupported(format!(
                "NTFS MFT location is out of bounds: {:#x} ({:#x} clusters)",
                mft_lcn, cluster_count
            )));
        }
        let mft_mirror_lcn = read_u64(boot, BPB_MFT_MIRROR_LCN);
        if mft_mirror_lcn < 1 || mft_mirror_lcn >= cluster_count {
            return Err(NtvfsError::NotSupported(format!(
                "NTFS mirror MFT location is out of bounds: {:#x} ({:#x} clusters)",
                mft_mirror_lcn, cluster_count
            )));
        }

        let mft_record_size = decode_size_field(
            boot[BPB_CLUSTERS_PER_MFT_RECORD] as i8,
            cluster_shift,
            -20,
            "clusters-per-mft-record",
        )?;
        if !(256..=32 * 1024).contains(&mft_record_size) {
            return Err(NtvfsError::NotSupported(format!(
                "Unsupported NTFS MFT record size: {:#x}",
                mft_record_size
            )));
        }

        let index_node_size = decode_size_field(
            boot[BPB_CLUSTERS_PER_INDEX_NODE] as i8,
            cluster_shift,
            -32,
            "clusters-per-index-node",
        )?;

        let serial_number = read_u64(boot, BPB_SERIAL_NUMBER);

        let geometry = Self {
            sector_size,
            cluster_size,
            cluster_shift,
            cluster_count,
            volume_size,
            mft_lcn,
            mft_mirror_lcn,
            mft_record_size,
            index_node_size,
            serial_number,
            max_virtual_cluster,
        };
        info!(
            "NTFS geometry: {} byte clusters, {} clusters, {} byte MFT records",
            cluster_size, cluster_count, mft_record_size
        );
        debug!("  MFT at cluster {:#x}, mirror at {:#x}", mft_lcn, mft_mirror_lcn);
        debug!("  Default index node size: {:#x}", index_node_size);
        debug!("  Serial number: {:#018x}", serial_number);
        Ok(geometry)
    }

    /// Byte offset of a logical cluster
    pub fn cluster_offset(&self, lcn: u64) -> u64 {
        lcn << self.cluster_shift
    }

    pub fn mft_offset(&self) -> u64 {
        self.cluster_offset(self.mft_lcn)
    }

    /// Mask of the byte-within-cluster bits
    pub fn cluster_mask(&self) -> u64 {
        self.cluster_size as u64 - 1
    }
}

/// Decode the signed "clusters per X" encoding: positive values count clusters,
/// negative values n give `1 << -n` bytes.
fn decode_size_field(value: i8, cluster_shift: u8, min_shift: i8, what: &str) -> Result<u32, NtvfsError> {
    if value >= 0 {
        let clusters = value as u32;
        if clusters == 0 || !clusters.is_power_of_two() {
            return Err(NtvfsError::NotSupported(format!(
                "NTFS {} value is zero or not a power of two: {:#x}",
                what, clusters
            )));
        }
        Ok(clusters << cluster_shift)
    } else if value < min_shift || value > -9 {
        Err(NtvfsError::NotSupported(format!(
            "NTFS {} is out of shift range: {}",
            what, value
        )))
    } else {
        Ok(1u32 << (-(value as i32)))
    }
}
