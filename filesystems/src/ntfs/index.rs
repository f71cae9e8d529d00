// NTFS directory index ($I30) structures
// Validates INDEX_ROOT / INDEX_ALLOCATION nodes once and keeps the entry
// offsets so lookups and enumeration can trust them afterwards.

use super::attr_io::read_attribute;
use super::cache::{CacheCost, ObjectCache};
use super::fixup::apply_fixups;
use super::record::{Attribute, Core, FileNameAttr};
use super::structures::*;
use log::{debug, trace};
use ntvfs_core::{BackingStore, NtvfsError};
use std::sync::Arc;

/// Index type for directories: entries are keyed by FILENAME values
pub const INDEX_TYPE_FILENAME: u32 = ATTR_TYPE_FILE_NAME;

const SUBNODE_SIZE: usize = 8;
const MIN_INDEX_SIZE: usize = IDX_HDR_SIZE + IDX_ENTRY_HEADER_SIZE;

/// A view of one validated index entry.
#[derive(Debug, Clone, Copy)]
pub struct IndexEntry<'a> {
    bytes: &'a [u8],
}

impl<'a> IndexEntry<'a> {
    /// `offset` must come from a validated IndexNodeInfo for `buf`.
    pub fn at(buf: &'a [u8], offset: usize) -> Self {
        let len = read_u16(buf, offset + IDX_ENTRY_LENGTH) as usize;
        IndexEntry {
            bytes: &buf[offset..offset + len],
        }
    }

    pub fn file_ref(&self) -> MftRef {
        MftRef::read(self.bytes, IDX_ENTRY_FILE_REF)
    }

    pub fn flags(&self) -> u16 {
        read_u16(self.bytes, IDX_ENTRY_FLAGS)
    }

    pub fn is_end(&self) -> bool {
        self.flags() & IDX_ENTRY_F_END != 0
    }

    pub fn is_internal(&self) -> bool {
        self.flags() & IDX_ENTRY_F_INTERNAL != 0
    }

    pub fn key(&self) -> &'a [u8] {
        let key_len = read_u16(self.bytes, IDX_ENTRY_KEY_LENGTH) as usize;
        &self.bytes[IDX_ENTRY_HEADER_SIZE..IDX_ENTRY_HEADER_SIZE + key_len]
    }

    /// Node address of the child subtree; only meaningful for internal entries.
    pub fn subnode(&self) -> i64 {
        read_i64(self.bytes, self.bytes.len() - SUBNODE_SIZE)
    }

    pub fn file_name(&self) -> Result<FileNameAttr, NtvfsError> {
        FileNameAttr::parse(self.key())
    }

    /// Raw UTF-16 name of a FILENAME key. Not valid for END entries.
    pub fn name_units(&self) -> Vec<u16> {
        let key = self.key();
        read_utf16_units(key, FN_NAME, key[FN_NAME_LENGTH] as usize)
    }
}

/// Validated layout of one index node, root or allocation.
#[derive(Debug, Clone, Default)]
pub struct IndexNodeInfo {
    /// Offsets of the entries in the containing buffer, END entry last.
    pub entries: Vec<usize>,
    /// The node has children.
    pub internal: bool,
}

impl IndexNodeInfo {
    pub fn entry<'a>(&self, buf: &'a [u8], i: usize) -> IndexEntry<'a> {
        IndexEntry::at(buf, self.entries[i])
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Node address limits shared by every node of one index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeAddressing {
    pub index_type: u32,
    pub node_size: u32,
    pub address_shift: u8,
    pub addresses_per_node: u32,
    /// First node address past the allocation; 0 without INDEX_ALLOCATION.
    pub end_address: u64,
}

impl NodeAddressing {
    pub fn misalign_mask(&self) -> u64 {
        self.addresses_per_node as u64 - 1
    }

    pub fn check_address(&self, address: i64) -> Result<(), NtvfsError> {
        if address < 0
            || address as u64 >= self.end_address
            || address as u64 & self.misalign_mask() != 0
        {
            return Err(NtvfsError::BogusOffset(format!(
                "index node address {:#x} invalid (end {:#x}, addresses per node {:#x})",
                address, self.end_address, self.addresses_per_node
            )));
        }
        Ok(())
    }
}

/// Validate an index header at `header_offset` in `buf` with `available`
/// bytes from the header on, and collect its entries.
pub fn load_node_info(
    buf: &[u8],
    header_offset: usize,
    available: usize,
    addressing: &NodeAddressing,
    what: &str,
) -> Result<IndexNodeInfo, NtvfsError> {
    let bogus = |msg: String| NtvfsError::BogusFormat(format!("{}: {}", what, msg));

    if available < MIN_INDEX_SIZE || header_offset + available > buf.len() {
        return Err(bogus(format!(
            "not enough room for the index header and one entry header: {:#x} (min {:#x})",
            available, MIN_INDEX_SIZE
        )));
    }
    let hdr = &buf[header_offset..header_offset + available];

    let allocated = read_u32(hdr, IDX_HDR_ALLOCATED) as usize;
    if allocated > available || allocated < MIN_INDEX_SIZE || allocated & 7 != 0 {
        return Err(bogus(format!(
            "bogus index allocation size: {:#x} (min {:#x}, max {:#x}, 8 byte aligned)",
            allocated, MIN_INDEX_SIZE, available
        )));
    }
    let used = read_u32(hdr, IDX_HDR_USED) as usize;
    if used > allocated || used < MIN_INDEX_SIZE || used & 7 != 0 {
        return Err(bogus(format!(
            "bogus index used size: {:#x} (min {:#x}, max {:#x}, 8 byte aligned)",
            used, MIN_INDEX_SIZE, allocated
        )));
    }
    let first = read_u32(hdr, IDX_HDR_FIRST_ENTRY) as usize;
    if first < IDX_HDR_SIZE
        || (first > used - IDX_ENTRY_HEADER_SIZE && first != used)
        || first & 7 != 0
    {
        return Err(bogus(format!(
            "bogus first entry offset: {:#x} (min {:#x}, max {:#x}, 8 byte aligned)",
            first,
            IDX_HDR_SIZE,
            used - IDX_ENTRY_HEADER_SIZE
        )));
    }

    let mut entries = Vec::new();
    let mut off = first;
    loop {
        let index = entries.len();
        if off + IDX_ENTRY_HEADER_SIZE > used {
            return Err(bogus(format!(
                "entry #{} is out of bounds: offset {:#x} (used {:#x})",
                index, off, used
            )));
        }
        let entry_len = read_u16(hdr, off + IDX_ENTRY_LENGTH) as usize;
        let flags = read_u16(hdr, off + IDX_ENTRY_FLAGS);
        let internal = flags & IDX_ENTRY_F_INTERNAL != 0;
        let is_end = flags & IDX_ENTRY_F_END != 0;
        let subnode_size = if internal { SUBNODE_SIZE } else { 0 };
        let min_entry = IDX_ENTRY_HEADER_SIZE + subnode_size;
        if entry_len < min_entry || off + entry_len > used || entry_len & 7 != 0 {
            return Err(bogus(format!(
                "entry #{} has a bogus size: {:#x} (min {:#x}, max {:#x}, 8 byte aligned)",
                index,
                entry_len,
                min_entry,
                used - off
            )));
        }

        let max_key = entry_len - IDX_ENTRY_HEADER_SIZE - subnode_size;
        let min_key = if !is_end && addressing.index_type == INDEX_TYPE_FILENAME {
            FN_NAME
        } else {
            0
        };
        let key_len = read_u16(hdr, off + IDX_ENTRY_KEY_LENGTH) as usize;
        if key_len < min_key || key_len > max_key {
            return Err(bogus(format!(
                "entry #{} has a bogus key size: {:#x} (min {:#x}, max {:#x})",
                index, key_len, min_key, max_key
            )));
        }
        if !is_end && addressing.index_type == INDEX_TYPE_FILENAME {
            let name_len = hdr[off + IDX_ENTRY_HEADER_SIZE + FN_NAME_LENGTH] as usize;
            if FN_NAME + name_len * 2 > key_len {
                return Err(bogus(format!(
                    "entry #{} filename is out of bounds: {} units -> {:#x} key, max {:#x}",
                    index,
                    name_len,
                    FN_NAME + name_len * 2,
                    key_len
                )));
            }
        }

        if internal {
            let subnode = read_i64(hdr, off + entry_len - SUBNODE_SIZE);
            if subnode < 0
                || subnode as u64 >= addressing.end_address
                || subnode as u64 & addressing.misalign_mask() != 0
            {
                return Err(bogus(format!(
                    "entry #{} has bogus subnode address: {:#x} (max {:#x}, misalign {:#x})",
                    index,
                    subnode,
                    addressing.end_address,
                    addressing.misalign_mask()
                )));
            }
        }

        entries.push(header_offset + off);
        off += entry_len;
        if is_end {
            break;
        }
    }

    Ok(IndexNodeInfo {
        entries,
        internal: read_u32(hdr, IDX_HDR_FLAGS) & IDX_HDR_F_INTERNAL as u32 != 0,
    })
}

/// An INDX allocation node, validated and fixed up.
#[derive(Debug)]
pub struct IndexNode {
    pub address: i64,
    pub disk_offset: u64,
    pub data: Vec<u8>,
    pub info: IndexNodeInfo,
}

impl CacheCost for IndexNode {
    fn cache_cost(&self) -> usize {
        self.data.len() + self.info.len() * 8
    }
}

impl IndexNode {
    pub fn entry(&self, i: usize) -> IndexEntry<'_> {
        self.info.entry(&self.data, i)
    }
}

/// Loads index allocation nodes through the shared node cache.
pub struct NodeLoader<'a> {
    pub backing: &'a mut dyn BackingStore,
    pub cache: &'a mut ObjectCache<IndexNode>,
}

impl<'a> NodeLoader<'a> {
    /// Get node `address` of the index whose INDEX_ALLOCATION is `alloc`.
    pub fn query_node(
        &mut self,
        core: &Core,
        alloc: &Attribute,
        addressing: &NodeAddressing,
        address: i64,
    ) -> Result<Arc<IndexNode>, NtvfsError> {
        addressing.check_address(address)?;
        let offset = (address as u64) << addressing.address_shift;
        let extents = alloc.extents().ok_or_else(|| {
            NtvfsError::BogusFormat("INDEX_ALLOCATION is resident".to_string())
        })?;
        let disk_offset = match extents.offset_to_disk(offset) {
            Some((disk, _)) if disk != super::data_runs::UNMAPPED => disk,
            _ => {
                return Err(NtvfsError::BogusFormat(format!(
                    "index node {:#x} of MFT record {:#x} is not backed by disk space",
                    address, core.mft_index
                )))
            }
        };

        if let Some(node) = self.cache.get(disk_offset) {
            return Ok(node);
        }

        let node_size = addressing.node_size as usize;
        let mut data = alloc_buffer(node_size)?;
        read_attribute(&mut *self.backing, core, alloc, offset, &mut data)?;
        if &data[REC_MAGIC..REC_MAGIC + 4] != INDX_MAGIC {
            return Err(NtvfsError::BogusFormat(format!(
                "index node {:#x}: bad signature {:02x?}",
                address,
                &data[REC_MAGIC..REC_MAGIC + 4]
            )));
        }
        let self_address = read_i64(&data, IDX_NODE_SELF_ADDRESS);
        if self_address != address {
            return Err(NtvfsError::BogusFormat(format!(
                "index node {:#x}: wrong self address {:#x}",
                address, self_address
            )));
        }
        apply_fixups(&mut data, false)?;
        let info = load_node_info(
            &data,
            IDX_NODE_HEADER,
            node_size - IDX_NODE_HEADER,
            addressing,
            "index node",
        )?;
        trace!(
            "Loaded index node {:#x} of MFT record {:#x} at {:#x}: {} entries{}",
            address,
            core.mft_index,
            disk_offset,
            info.len(),
            if info.internal { " (internal)" } else { "" }
        );

        let node = IndexNode {
            address,
            disk_offset,
            data,
            info,
        };
        Ok(self.cache.insert(disk_offset, node))
    }
}

/// Validated $I30 index root of a directory.
#[derive(Debug, Clone)]
pub struct IndexRootInfo {
    /// Position of the INDEX_ROOT in the core's attribute table
    pub root_attr: usize,
    pub alloc_attr: Option<usize>,
    pub addressing: NodeAddressing,
    /// Entries of the root node, as offsets into the INDEX_ROOT value
    pub root: IndexNodeInfo,
    pub allocation_size: u64,
}

impl IndexRootInfo {
    /// Validate the $I30 INDEX_ROOT, INDEX_ALLOCATION and BITMAP of a directory core.
    pub fn load(core: &Core, cluster_size: u32, cluster_shift: u8, what: &str) -> Result<Self, NtvfsError> {
        let bogus = |msg: String| NtvfsError::BogusFormat(format!("{}: {}", what, msg));

        let root_attr = core
            .attributes
            .iter()
            .position(|a| a.attr_type == ATTR_TYPE_INDEX_ROOT && a.has_name(DIR_INDEX_NAME))
            .ok_or_else(|| bogus("found no INDEX_ROOT attribute named $I30".to_string()))?;
        let root = &core.attributes[root_attr];
        let value = core
            .resident_value(root)
            .ok_or_else(|| bogus("INDEX_ROOT is not resident".to_string()))?;
        if value.len() < IDX_ROOT_SIZE {
            return Err(bogus(format!(
                "INDEX_ROOT is too small: {:#x}, min {:#x}",
                value.len(),
                IDX_ROOT_SIZE
            )));
        }

        let index_type = read_u32(value, IDX_ROOT_TYPE);
        if index_type != INDEX_TYPE_FILENAME {
            return Err(bogus(format!(
                "wrong INDEX_ROOT type for a directory: {:#x}, expected {:#x}",
                index_type, INDEX_TYPE_FILENAME
            )));
        }
        let collation = read_u32(value, IDX_ROOT_COLLATION);
        if collation != COLLATION_FILENAME {
            return Err(bogus(format!(
                "wrong collation rules for a directory: {:#x}, expected {:#x}",
                collation, COLLATION_FILENAME
            )));
        }
        let node_size = read_u32(value, IDX_ROOT_NODE_SIZE);
        if !(512..=0x10000).contains(&node_size) || !node_size.is_power_of_two() {
            return Err(bogus(format!(
                "bogus index node size: {:#x} (expected power of two between 512 and 64KB)",
                node_size
            )));
        }
        let address_shift = if node_size >= cluster_size { cluster_shift } else { 9 };
        let addresses_per_node = value[IDX_ROOT_ADDRESSES_PER_NODE] as u32;
        if addresses_per_node << address_shift != node_size {
            return Err(bogus(format!(
                "bogus addresses per index node value: {:#x} (node size {:#x}, shift {})",
                addresses_per_node, node_size, address_shift
            )));
        }

        let alloc_attr = core
            .attributes
            .iter()
            .position(|a| a.attr_type == ATTR_TYPE_INDEX_ALLOCATION && a.has_name(DIR_INDEX_NAME));
        let bitmap = core
            .attributes
            .iter()
            .find(|a| a.attr_type == ATTR_TYPE_BITMAP && a.has_name(DIR_INDEX_NAME));
        let mut end_address = 0;
        let mut allocation_size = 0;
        match (alloc_attr, bitmap) {
            (Some(_), None) => {
                return Err(bogus("INDEX_ALLOCATION attribute without BITMAP".to_string()))
            }
            (None, Some(_)) => {
                return Err(bogus("BITMAP attribute without INDEX_ALLOCATION".to_string()))
            }
            (Some(i), Some(bitmap)) => {
                let alloc = &core.attributes[i];
                if alloc.is_resident() {
                    return Err(bogus("INDEX_ALLOCATION is resident".to_string()));
                }
                if alloc.value_size & (node_size as u64 - 1) != 0 {
                    return Err(bogus(format!(
                        "INDEX_ALLOCATION size isn't aligned on node boundary: {:#x}, node size {:#x}",
                        alloc.value_size, node_size
                    )));
                }
                let nodes = alloc.value_size / node_size as u64;
                let min_bitmap = ((nodes + 63) & !63) >> 3;
                if bitmap.value_size < min_bitmap {
                    return Err(bogus(format!(
                        "BITMAP size does not match INDEX_ALLOCATION: {:#x}, expected min {:#x} ({:#x} nodes)",
                        bitmap.value_size, min_bitmap, nodes
                    )));
                }
                end_address = nodes * addresses_per_node as u64;
                allocation_size = alloc.value_size;
            }
            (None, None) => {}
        }

        let addressing = NodeAddressing {
            index_type,
            node_size,
            address_shift,
            addresses_per_node,
            end_address,
        };
        let root_info = load_node_info(
            value,
            IDX_ROOT_HEADER,
            value.len() - IDX_ROOT_HEADER,
            &addressing,
            what,
        )?;
        debug!(
            "{}: index root with {} entries, node size {:#x}, {:#x} node addresses",
            what,
            root_info.len(),
            node_size,
            end_address
        );

        Ok(IndexRootInfo {
            root_attr,
            alloc_attr,
            addressing,
            root: root_info,
            allocation_size,
        })
    }
}
