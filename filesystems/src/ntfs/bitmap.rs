// Cluster allocation bitmap ($Bitmap)
// Small bitmaps are cached whole; larger ones through a single window that
// is reloaded on a miss.

use super::attr_io::read_attribute;
use super::geometry::VolumeGeometry;
use super::record::{Attribute, Core};
use super::structures::{alloc_buffer, ATTR_TYPE_DATA};
use log::{debug, trace, warn};
use ntvfs_core::{BackingStore, NtvfsError};
use std::sync::Arc;

const MIN_WINDOW: usize = 4096;

#[derive(Debug)]
pub struct ClusterBitmap {
    core: Arc<Core>,
    data_size: u64,
    cluster_count: u64,
    cluster_shift: u8,
    cluster_size: u32,
    max_whole: usize,
    buffer: Vec<u8>,
    first_cluster: u64,
    cached_clusters: u64,
}

fn bit_is_set(buffer: &[u8], bit: u64) -> bool {
    buffer[(bit >> 3) as usize] & (1 << (bit & 7)) != 0
}

impl ClusterBitmap {
    /// `core` is the $Bitmap MFT record; its unnamed DATA holds the bitmap.
    pub fn new(
        core: Arc<Core>,
        geometry: &VolumeGeometry,
        max_whole: usize,
    ) -> Result<Self, NtvfsError> {
        let data_size = core
            .find_unnamed(ATTR_TYPE_DATA)
            .ok_or_else(|| core.missing_attribute("unnamed DATA in $Bitmap"))?
            .value_size;
        Ok(ClusterBitmap {
            core,
            data_size,
            cluster_count: geometry.cluster_count,
            cluster_shift: geometry.cluster_shift,
            cluster_size: geometry.cluster_size,
            max_whole,
            buffer: Vec::new(),
            first_cluster: 0,
            cached_clusters: 0,
        })
    }

    fn data_attr(&self) -> Result<&Attribute, NtvfsError> {
        self.core
            .find_unnamed(ATTR_TYPE_DATA)
            .ok_or_else(|| self.core.missing_attribute("unnamed DATA in $Bitmap"))
    }

    /// Clusters the bitmap data can describe; a short $Bitmap stops before
    /// the last clusters of the volume.
    fn described_clusters(&self) -> u64 {
        self.cluster_count.min(self.data_size.saturating_mul(8))
    }

    /// True when the whole bitmap is held in memory.
    pub fn is_whole(&self) -> bool {
        self.first_cluster == 0
            && self.cached_clusters != 0
            && self.cached_clusters == self.described_clusters()
    }

    /// Allocation state of one cluster.
    pub fn query_cluster(
        &mut self,
        backing: &mut dyn BackingStore,
        cluster: u64,
    ) -> Result<bool, NtvfsError> {
        let in_cache = cluster.wrapping_sub(self.first_cluster);
        if in_cache < self.cached_clusters {
            return Ok(bit_is_set(&self.buffer, in_cache));
        }
        self.query_cluster_slow(backing, cluster)
    }

    fn query_cluster_slow(
        &mut self,
        backing: &mut dyn BackingStore,
        cluster: u64,
    ) -> Result<bool, NtvfsError> {
        let byte = cluster >> 3;
        if byte >= self.data_size {
            return Err(NtvfsError::OutOfRange(format!(
                "cluster {:#x} is beyond the allocation bitmap ({:#x} bytes)",
                cluster, self.data_size
            )));
        }

        if self.buffer.is_empty() {
            let min_whole = ((self.cluster_count >> 3) + 7) & !7;
            if self.data_size <= self.max_whole as u64 && self.data_size >= min_whole {
                let mut buffer = alloc_buffer(((self.data_size + 7) & !7) as usize)?;
                buffer.fill(0xff);
                let whole = self.data_size as usize;
                let attr = self.data_attr()?;
                read_attribute(backing, &self.core, attr, 0, &mut buffer[..whole])?;
                debug!("Cached whole allocation bitmap: {:#x} bytes", whole);
                self.buffer = buffer;
                self.first_cluster = 0;
                self.cached_clusters = self.described_clusters();
                return Ok(bit_is_set(&self.buffer, cluster));
            }
            let window = (self.cluster_size as usize).max(MIN_WINDOW);
            self.buffer = alloc_buffer(window)?;
        }

        let window = self.buffer.len() as u64;
        let load_offset = byte & !(window - 1);
        let load_len = (self.data_size - load_offset).min(window) as usize;
        self.buffer.fill(0xff);
        let attr = self
            .core
            .find_unnamed(ATTR_TYPE_DATA)
            .ok_or_else(|| self.core.missing_attribute("unnamed DATA in $Bitmap"))?;
        if let Err(e) = read_attribute(
            backing,
            &self.core,
            attr,
            load_offset,
            &mut self.buffer[..load_len],
        ) {
            self.cached_clusters = 0;
            return Err(e);
        }
        trace!(
            "Loaded bitmap window at {:#x} LB {:#x}",
            load_offset,
            load_len
        );
        self.first_cluster = load_offset << 3;
        self.cached_clusters = (load_len as u64) << 3;
        Ok(bit_is_set(&self.buffer, cluster - self.first_cluster))
    }

    /// Whether any cluster touched by `[offset, offset + len)` is allocated.
    /// The cluster at `offset` is always checked, even for an empty range.
    pub fn query_range_state(
        &mut self,
        backing: &mut dyn BackingStore,
        offset: u64,
        len: u64,
    ) -> Result<bool, NtvfsError> {
        let mask = self.cluster_size as u64 - 1;
        let first = offset >> self.cluster_shift;
        let span = len
            .checked_add(offset & mask)
            .and_then(|v| v.checked_add(mask))
            .ok_or_else(|| NtvfsError::OutOfRange(format!("range at {:#x} overflows", offset)))?;
        let count = (span >> self.cluster_shift).max(1);
        for cluster in first..first + count {
            if self.query_cluster(backing, cluster)? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Number of clusters marked allocated, for free space reporting.
    pub fn count_allocated(&self, backing: &mut dyn BackingStore) -> Result<u64, NtvfsError> {
        let attr = self.data_attr()?;
        let bytes = ((self.cluster_count + 7) >> 3).min(self.data_size);
        let mut chunk = alloc_buffer(MIN_WINDOW * 16)?;
        let mut used = 0u64;
        let mut offset = 0u64;
        while offset < bytes {
            let len = (bytes - offset).min(chunk.len() as u64) as usize;
            read_attribute(backing, &self.core, attr, offset, &mut chunk[..len])?;
            for (i, byte) in chunk[..len].iter().enumerate() {
                let first = (offset + i as u64) << 3;
                let valid = self.cluster_count.saturating_sub(first).min(8);
                let mask = if valid == 8 { 0xff } else { (1u8 << valid) - 1 };
                used += (byte & mask).count_ones() as u64;
            }
            offset += len as u64;
        }
        Ok(used)
    }

    /// Verify that every non-sparse cluster of `attr` is marked allocated.
    pub fn check_allocated(
        &mut self,
        backing: &mut dyn BackingStore,
        attr: &Attribute,
        desc: &str,
    ) -> Result<(), NtvfsError> {
        let Some(extents) = attr.extents() else {
            return Ok(());
        };
        let mut file_offset = 0u64;
        for extent in extents.iter() {
            if extent.is_sparse() {
                file_offset += extent.length;
                continue;
            }
            let first = extent.disk_offset >> self.cluster_shift;
            let count = extent.length >> self.cluster_shift;
            for cluster in first..first + count {
                let allocated = self.query_cluster(backing, cluster).map_err(|e| {
                    warn!(
                        "Error querying allocation bitmap entry {:#x} (for {} offset {:#x}): {}",
                        cluster, desc, file_offset, e
                    );
                    e
                })?;
                if !allocated {
                    return Err(NtvfsError::BogusFormat(format!(
                        "Cluster {:#x} at offset {:#x} in {} is not marked allocated",
                        cluster, file_offset, desc
                    )));
                }
                file_offset += self.cluster_size as u64;
            }
        }
        Ok(())
    }
}
