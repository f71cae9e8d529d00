// Synthetic NTFS images for the integration tests
// Layout (4K clusters, 1K records, 4K index nodes):
//   LCN 0       boot sector
//   LCN 2       $MFTMirr
//   LCN 4..68   $MFT (256 records)
//   LCN 68      $Bitmap
//   LCN 69..101 $UpCase
//   LCN 101..   file data and index nodes, bump allocated

#![allow(dead_code)]

use ntvfs_core::{BackingStore, MemoryBacking, MountOptions};
use ntvfs_filesystems::ntfs::fixup::protect_record;
use ntvfs_filesystems::ntfs::structures::*;
use ntvfs_filesystems::ntfs::upcase::UpcaseTable;
use ntvfs_filesystems::NtfsVolume;
use std::collections::BTreeMap;
use std::io::Write;
use tempfile::NamedTempFile;

pub const CLUSTER_SIZE: usize = 4096;
pub const RECORD_SIZE: usize = 1024;
pub const NODE_SIZE: usize = 4096;
pub const MFT_LCN: u64 = 4;
pub const MFT_MIRROR_LCN: u64 = 2;
pub const MFT_RECORDS: u64 = 256;
pub const MFT_CLUSTERS: u64 = MFT_RECORDS * RECORD_SIZE as u64 / CLUSTER_SIZE as u64;
pub const BITMAP_LCN: u64 = MFT_LCN + MFT_CLUSTERS;
pub const UPCASE_LCN: u64 = BITMAP_LCN + 1;
const UPCASE_CLUSTERS: u64 = 32;
const FIRST_FREE_LCN: u64 = UPCASE_LCN + UPCASE_CLUSTERS;
const FIRST_USER_RECORD: u64 = 16;

pub const SERIAL: u64 = 0x1234_5678_9ABC_DEF0;
/// 2020-01-01T00:00:00Z as a FILETIME
pub const TIMESTAMP: u64 = 132_223_104_000_000_000;
pub const LABEL: &str = "TESTVOL";

/// Byte pattern that must never be visible through a read.
pub const STALE_BYTE: u8 = 0xEE;

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub fn root_ref() -> MftRef {
    MftRef::new(MFT_RECORD_ROOT, MFT_RECORD_ROOT as u16)
}

/// Deterministic file content.
pub fn pattern(len: usize, seed: u8) -> Vec<u8> {
    (0..len).map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed)).collect()
}

fn align8(n: usize) -> usize {
    (n + 7) & !7
}

fn put_u16(buf: &mut [u8], off: usize, v: u16) {
    buf[off..off + 2].copy_from_slice(&v.to_le_bytes());
}

fn put_u32(buf: &mut [u8], off: usize, v: u32) {
    buf[off..off + 4].copy_from_slice(&v.to_le_bytes());
}

fn put_u64(buf: &mut [u8], off: usize, v: u64) {
    buf[off..off + 8].copy_from_slice(&v.to_le_bytes());
}

fn put_name(buf: &mut [u8], off: usize, name: &[u16]) {
    for (i, unit) in name.iter().enumerate() {
        put_u16(buf, off + i * 2, *unit);
    }
}

#[derive(Debug, Clone, Copy)]
enum Run {
    Data { lcn: u64, clusters: u64 },
    Hole { clusters: u64 },
}

/// Smallest little-endian two's complement encoding of `v`.
fn le_signed(v: i64) -> Vec<u8> {
    let mut n = 1;
    while n < 8 {
        let bits = 8 * n as u32;
        let min = -(1i64 << (bits - 1));
        let max = (1i64 << (bits - 1)) - 1;
        if v >= min && v <= max {
            break;
        }
        n += 1;
    }
    v.to_le_bytes()[..n].to_vec()
}

fn mapping_pairs(runs: &[Run]) -> Vec<u8> {
    let mut out = Vec::new();
    let mut prev_lcn = 0i64;
    for run in runs {
        match *run {
            Run::Data { lcn, clusters } => {
                let len = le_signed(clusters as i64);
                let delta = le_signed(lcn as i64 - prev_lcn);
                prev_lcn = lcn as i64;
                out.push(((delta.len() as u8) << 4) | len.len() as u8);
                out.extend(len);
                out.extend(delta);
            }
            Run::Hole { clusters } => {
                let len = le_signed(clusters as i64);
                out.push(len.len() as u8);
                out.extend(len);
            }
        }
    }
    out.push(0);
    out
}

fn resident_attr(attr_type: u32, name: &str, value: &[u8]) -> Vec<u8> {
    let name: Vec<u16> = name.encode_utf16().collect();
    let name_off = ATTR_RES_HEADER_SIZE;
    let value_off = align8(name_off + name.len() * 2);
    let len = align8(value_off + value.len());
    let mut a = vec![0u8; len];
    put_u32(&mut a, ATTR_TYPE, attr_type);
    put_u32(&mut a, ATTR_LENGTH, len as u32);
    a[ATTR_NON_RESIDENT] = 0;
    a[ATTR_NAME_LENGTH] = name.len() as u8;
    put_u16(&mut a, ATTR_NAME_OFFSET, name_off as u16);
    put_name(&mut a, name_off, &name);
    put_u32(&mut a, ATTR_RES_VALUE_LENGTH, value.len() as u32);
    put_u16(&mut a, ATTR_RES_VALUE_OFFSET, value_off as u16);
    a[value_off..value_off + value.len()].copy_from_slice(value);
    a
}

fn non_resident_attr(
    attr_type: u32,
    name: &str,
    flags: u16,
    runs: &[Run],
    allocated: u64,
    data_size: u64,
    initialized: u64,
) -> Vec<u8> {
    let name: Vec<u16> = name.encode_utf16().collect();
    let name_off = ATTR_NONRES_HEADER_SIZE;
    let pairs_off = align8(name_off + name.len() * 2);
    let program = mapping_pairs(runs);
    let len = align8(pairs_off + program.len());
    let clusters: u64 = runs
        .iter()
        .map(|r| match *r {
            Run::Data { clusters, .. } | Run::Hole { clusters } => clusters,
        })
        .sum();

    let mut a = vec![0u8; len];
    put_u32(&mut a, ATTR_TYPE, attr_type);
    put_u32(&mut a, ATTR_LENGTH, len as u32);
    a[ATTR_NON_RESIDENT] = 1;
    a[ATTR_NAME_LENGTH] = name.len() as u8;
    put_u16(&mut a, ATTR_NAME_OFFSET, name_off as u16);
    put_u16(&mut a, ATTR_FLAGS, flags);
    put_name(&mut a, name_off, &name);
    put_u64(&mut a, ATTR_NONRES_FIRST_VCN, 0);
    put_u64(&mut a, ATTR_NONRES_LAST_VCN, (clusters as i64 - 1) as u64);
    put_u16(&mut a, ATTR_NONRES_MAPPING_PAIRS, pairs_off as u16);
    put_u64(&mut a, ATTR_NONRES_ALLOCATED, allocated);
    put_u64(&mut a, ATTR_NONRES_DATA_SIZE, data_size);
    put_u64(&mut a, ATTR_NONRES_INITIALIZED, initialized);
    a[pairs_off..pairs_off + program.len()].copy_from_slice(&program);
    a
}

fn standard_info(attributes: u32) -> Vec<u8> {
    let mut v = vec![0u8; 0x48];
    for off in [
        STDINFO_CREATION_TIME,
        STDINFO_MODIFICATION_TIME,
        STDINFO_MFT_MODIFICATION_TIME,
        STDINFO_ACCESS_TIME,
    ] {
        put_u64(&mut v, off, TIMESTAMP);
    }
    put_u32(&mut v, STDINFO_FILE_ATTRIBUTES, attributes);
    v
}

fn file_name_value(parent: MftRef, name: &str, attributes: u32, allocated: u64, size: u64) -> Vec<u8> {
    let units: Vec<u16> = name.encode_utf16().collect();
    let mut v = vec![0u8; FN_NAME + units.len() * 2];
    put_u64(&mut v, FN_PARENT_REF, parent.0);
    for off in [
        FN_CREATION_TIME,
        FN_MODIFICATION_TIME,
        FN_MFT_MODIFICATION_TIME,
        FN_ACCESS_TIME,
    ] {
        put_u64(&mut v, off, TIMESTAMP);
    }
    put_u64(&mut v, FN_ALLOCATED_SIZE, allocated);
    put_u64(&mut v, FN_DATA_SIZE, size);
    put_u32(&mut v, FN_FILE_ATTRIBUTES, attributes);
    if attributes & FILE_ATTR_REPARSE_POINT != 0 {
        put_u32(&mut v, FN_REPARSE_TAG, REPARSE_TAG_SYMLINK);
    }
    v[FN_NAME_LENGTH] = units.len() as u8;
    v[FN_NAMESPACE] = 3; // Win32 & DOS
    put_name(&mut v, FN_NAME, &units);
    v
}

fn mft_record(sequence: u16, flags: u16, attrs: &[Vec<u8>]) -> Vec<u8> {
    let mut rec = vec![0u8; RECORD_SIZE];
    rec[REC_MAGIC..REC_MAGIC + 4].copy_from_slice(FILE_MAGIC);
    put_u16(&mut rec, REC_USA_OFFSET, 0x30);
    put_u16(&mut rec, REC_USA_COUNT, (1 + RECORD_SIZE / 512) as u16);
    put_u16(&mut rec, MFT_REC_SEQUENCE, sequence);
    put_u16(&mut rec, MFT_REC_LINK_COUNT, 1);
    put_u16(&mut rec, MFT_REC_ATTRS_OFFSET, 0x38);
    put_u16(&mut rec, MFT_REC_FLAGS, flags);

    let mut off = 0x38;
    for (i, attr) in attrs.iter().enumerate() {
        rec[off..off + attr.len()].copy_from_slice(attr);
        put_u16(&mut rec, off + ATTR_INSTANCE, i as u16);
        off += attr.len();
    }
    put_u32(&mut rec, off, ATTR_TYPE_END);
    off += 8;
    assert!(off <= RECORD_SIZE, "MFT record overflow: {:#x} bytes", off);
    put_u32(&mut rec, MFT_REC_BYTES_USED, off as u32);
    put_u32(&mut rec, MFT_REC_BYTES_ALLOCATED, RECORD_SIZE as u32);
    protect_record(&mut rec, sequence.wrapping_add(0x100)).unwrap();
    rec
}

fn index_entry(file_ref: MftRef, key: &[u8], subnode: Option<u64>) -> Vec<u8> {
    let key_area = align8(IDX_ENTRY_HEADER_SIZE + key.len());
    let len = key_area + if subnode.is_some() { 8 } else { 0 };
    let mut e = vec![0u8; len];
    put_u64(&mut e, IDX_ENTRY_FILE_REF, file_ref.0);
    put_u16(&mut e, IDX_ENTRY_LENGTH, len as u16);
    put_u16(&mut e, IDX_ENTRY_KEY_LENGTH, key.len() as u16);
    if let Some(address) = subnode {
        put_u16(&mut e, IDX_ENTRY_FLAGS, IDX_ENTRY_F_INTERNAL);
        put_u64(&mut e, len - 8, address);
    }
    e[IDX_ENTRY_HEADER_SIZE..IDX_ENTRY_HEADER_SIZE + key.len()].copy_from_slice(key);
    e
}

fn end_entry(subnode: Option<u64>) -> Vec<u8> {
    let len = IDX_ENTRY_HEADER_SIZE + if subnode.is_some() { 8 } else { 0 };
    let mut e = vec![0u8; len];
    put_u16(&mut e, IDX_ENTRY_LENGTH, len as u16);
    let mut flags = IDX_ENTRY_F_END;
    if let Some(address) = subnode {
        flags |= IDX_ENTRY_F_INTERNAL;
        put_u64(&mut e, len - 8, address);
    }
    put_u16(&mut e, IDX_ENTRY_FLAGS, flags);
    e
}

fn index_header(buf: &mut [u8], off: usize, first: usize, entries: usize, allocated: usize, internal: bool) {
    put_u32(buf, off + IDX_HDR_FIRST_ENTRY, first as u32);
    put_u32(buf, off + IDX_HDR_USED, (first + entries) as u32);
    put_u32(buf, off + IDX_HDR_ALLOCATED, allocated as u32);
    buf[off + IDX_HDR_FLAGS] = if internal { IDX_HDR_F_INTERNAL } else { 0 };
}

fn index_root_value(entries: &[u8], internal: bool) -> Vec<u8> {
    let mut v = vec![0u8; IDX_ROOT_SIZE + entries.len()];
    put_u32(&mut v, IDX_ROOT_TYPE, ATTR_TYPE_FILE_NAME);
    put_u32(&mut v, IDX_ROOT_COLLATION, COLLATION_FILENAME);
    put_u32(&mut v, IDX_ROOT_NODE_SIZE, NODE_SIZE as u32);
    v[IDX_ROOT_ADDRESSES_PER_NODE] = (NODE_SIZE / CLUSTER_SIZE) as u8;
    let used = IDX_HDR_SIZE + entries.len();
    index_header(&mut v, IDX_ROOT_HEADER, IDX_HDR_SIZE, entries.len(), used, internal);
    v[IDX_ROOT_SIZE..].copy_from_slice(entries);
    v
}

fn index_node(address: u64, entries: &[u8], internal: bool) -> Vec<u8> {
    const FIRST: usize = 0x40;
    let mut n = vec![0u8; NODE_SIZE];
    n[REC_MAGIC..REC_MAGIC + 4].copy_from_slice(INDX_MAGIC);
    put_u16(&mut n, REC_USA_OFFSET, 0x28);
    put_u16(&mut n, REC_USA_COUNT, (1 + NODE_SIZE / 512) as u16);
    put_u64(&mut n, IDX_NODE_SELF_ADDRESS, address);
    let allocated = NODE_SIZE - IDX_NODE_HEADER;
    assert!(FIRST + entries.len() <= allocated, "index node overflow");
    index_header(&mut n, IDX_NODE_HEADER, FIRST, entries.len(), allocated, internal);
    let start = IDX_NODE_HEADER + FIRST;
    n[start..start + entries.len()].copy_from_slice(entries);
    protect_record(&mut n, 0x4242).unwrap();
    n
}

/// One node of the directory B+tree being built; entries index the sorted keys.
struct TreeNode {
    entries: Vec<(usize, Option<Box<TreeNode>>)>,
    end: Option<Box<TreeNode>>,
}

fn split_tree(items: &[usize], fanout: usize) -> TreeNode {
    if items.len() <= fanout {
        return TreeNode {
            entries: items.iter().map(|&i| (i, None)).collect(),
            end: None,
        };
    }
    let seps = fanout.min((items.len() - 1) / 2).max(1);
    let groups = seps + 1;
    let child_total = items.len() - seps;
    let base = child_total / groups;
    let extra = child_total % groups;

    let mut node = TreeNode {
        entries: Vec::new(),
        end: None,
    };
    let mut pos = 0;
    for g in 0..groups {
        let size = base + usize::from(g < extra);
        let child = Box::new(split_tree(&items[pos..pos + size], fanout));
        pos += size;
        if g < seps {
            node.entries.push((items[pos], Some(child)));
            pos += 1;
        } else {
            node.end = Some(child);
        }
    }
    node
}

struct Key {
    file_ref: MftRef,
    value: Vec<u8>,
}

fn node_entries(node: &TreeNode, keys: &[Key], nodes: &mut Vec<Vec<u8>>) -> (Vec<u8>, bool) {
    let mut bytes = Vec::new();
    for (i, child) in &node.entries {
        let subnode = child.as_ref().map(|c| emit_node(c, keys, nodes));
        bytes.extend(index_entry(keys[*i].file_ref, &keys[*i].value, subnode));
    }
    let end = node.end.as_ref().map(|c| emit_node(c, keys, nodes));
    bytes.extend(end_entry(end));
    (bytes, node.end.is_some())
}

fn emit_node(node: &TreeNode, keys: &[Key], nodes: &mut Vec<Vec<u8>>) -> u64 {
    let (bytes, internal) = node_entries(node, keys, nodes);
    let address = nodes.len() as u64;
    nodes.push(index_node(address, &bytes, internal));
    address
}

#[derive(Debug, Clone)]
enum Content {
    Resident(Vec<u8>),
    NonResident {
        data: Vec<u8>,
        initialized: u64,
        /// File clusters left sparse
        holes: Vec<u64>,
    },
    Directory {
        children: Vec<u64>,
    },
}

#[derive(Debug, Clone)]
struct Object {
    sequence: u16,
    parent: MftRef,
    name: String,
    attributes: u32,
    content: Content,
}

impl Object {
    fn sizes(&self) -> (u64, u64) {
        match &self.content {
            Content::Resident(data) => (align8(data.len()) as u64, data.len() as u64),
            Content::NonResident { data, .. } => {
                let size = data.len() as u64;
                let cluster = CLUSTER_SIZE as u64;
                ((size + cluster - 1) / cluster * cluster, size)
            }
            Content::Directory { .. } => (0, 0),
        }
    }

    fn key_attributes(&self) -> u32 {
        match self.content {
            Content::Directory { .. } => self.attributes | FILE_ATTR_DIRECTORY,
            _ => self.attributes,
        }
    }
}

/// Builds a small but complete NTFS volume image.
pub struct VolumeBuilder {
    size: u64,
    fanout: usize,
    volume_flags: u16,
    objects: BTreeMap<u64, Object>,
    next_record: u64,
}

impl VolumeBuilder {
    pub fn new(size: u64) -> Self {
        let mut objects = BTreeMap::new();
        objects.insert(
            MFT_RECORD_ROOT,
            Object {
                sequence: MFT_RECORD_ROOT as u16,
                parent: root_ref(),
                name: ".".to_string(),
                attributes: FILE_ATTR_HIDDEN | FILE_ATTR_SYSTEM,
                content: Content::Directory { children: Vec::new() },
            },
        );
        VolumeBuilder {
            size,
            fanout: usize::MAX,
            volume_flags: 0,
            objects,
            next_record: FIRST_USER_RECORD,
        }
    }

    /// Maximum entries per index node; directories with more entries get
    /// an INDEX_ALLOCATION tree.
    pub fn index_fanout(mut self, fanout: usize) -> Self {
        self.fanout = fanout.max(1);
        self
    }

    pub fn volume_flags(mut self, flags: u16) -> Self {
        self.volume_flags = flags;
        self
    }

    fn add(&mut self, parent: MftRef, name: &str, attributes: u32, content: Content) -> MftRef {
        let index = self.next_record;
        assert!(index < MFT_RECORDS, "out of MFT records");
        self.next_record += 1;
        match &mut self.objects.get_mut(&parent.index()).expect("parent exists").content {
            Content::Directory { children } => children.push(index),
            _ => panic!("parent is not a directory"),
        }
        self.objects.insert(
            index,
            Object {
                sequence: 1,
                parent,
                name: name.to_string(),
                attributes,
                content,
            },
        );
        MftRef::new(index, 1)
    }

    pub fn add_dir(&mut self, parent: MftRef, name: &str) -> MftRef {
        self.add(parent, name, 0, Content::Directory { children: Vec::new() })
    }

    pub fn add_resident_file(&mut self, parent: MftRef, name: &str, data: &[u8]) -> MftRef {
        self.add(parent, name, FILE_ATTR_ARCHIVE, Content::Resident(data.to_vec()))
    }

    pub fn add_file(&mut self, parent: MftRef, name: &str, data: &[u8]) -> MftRef {
        self.add_sparse_file(parent, name, data, data.len() as u64, &[])
    }

    /// Non-resident file with an initialized size below the data size and
    /// optional sparse clusters.
    pub fn add_sparse_file(
        &mut self,
        parent: MftRef,
        name: &str,
        data: &[u8],
        initialized: u64,
        holes: &[u64],
    ) -> MftRef {
        let attributes = if holes.is_empty() {
            FILE_ATTR_ARCHIVE
        } else {
            FILE_ATTR_ARCHIVE | FILE_ATTR_SPARSE_FILE
        };
        self.add(
            parent,
            name,
            attributes,
            Content::NonResident {
                data: data.to_vec(),
                initialized,
                holes: holes.to_vec(),
            },
        )
    }

    pub fn set_attributes(&mut self, file: MftRef, attributes: u32) {
        if let Some(object) = self.objects.get_mut(&file.index()) {
            object.attributes = attributes;
        }
    }

    pub fn build(self) -> TestImage {
        Layout::new(self.size).build(&self)
    }
}

struct Layout {
    bytes: Vec<u8>,
    used: Vec<bool>,
    next_lcn: u64,
    records: BTreeMap<u64, Vec<u8>>,
}

impl Layout {
    fn new(size: u64) -> Self {
        let clusters = (size / CLUSTER_SIZE as u64) as usize;
        let mut layout = Layout {
            bytes: vec![0u8; size as usize],
            used: vec![false; clusters],
            next_lcn: FIRST_FREE_LCN,
            records: BTreeMap::new(),
        };
        layout.mark(0, 1);
        layout.mark(MFT_MIRROR_LCN, 1);
        layout.mark(MFT_LCN, MFT_CLUSTERS);
        layout.mark(BITMAP_LCN, 1);
        layout.mark(UPCASE_LCN, UPCASE_CLUSTERS);
        layout
    }

    fn mark(&mut self, lcn: u64, clusters: u64) {
        for c in lcn..lcn + clusters {
            self.used[c as usize] = true;
        }
    }

    fn alloc(&mut self, clusters: u64) -> u64 {
        let lcn = self.next_lcn;
        assert!(
            (lcn + clusters) as usize <= self.used.len(),
            "volume full"
        );
        self.mark(lcn, clusters);
        self.next_lcn += clusters;
        lcn
    }

    fn cluster_offset(lcn: u64) -> usize {
        lcn as usize * CLUSTER_SIZE
    }

    fn build(mut self, builder: &VolumeBuilder) -> TestImage {
        self.write_boot_sector();
        let upcase = UpcaseTable::ascii().to_le_bytes();
        let at = Self::cluster_offset(UPCASE_LCN);
        self.bytes[at..at + upcase.len()].copy_from_slice(&upcase);

        for (&index, object) in &builder.objects {
            let record = match &object.content {
                Content::Directory { children } => self.dir_record(builder, index, object, children),
                _ => self.file_record(object),
            };
            self.records.insert(index, record);
        }
        self.system_records(builder);

        let cluster_count = self.used.len();
        let bitmap_size = ((cluster_count >> 3) + 7) & !7;
        let mut bitmap = vec![0u8; bitmap_size];
        for (c, used) in self.used.iter().enumerate() {
            if *used {
                bitmap[c >> 3] |= 1 << (c & 7);
            }
        }
        let at = Self::cluster_offset(BITMAP_LCN);
        self.bytes[at..at + bitmap_size].copy_from_slice(&bitmap);

        for (&index, record) in &self.records {
            let at = Self::cluster_offset(MFT_LCN) + index as usize * RECORD_SIZE;
            self.bytes[at..at + RECORD_SIZE].copy_from_slice(record);
            if index < 4 {
                let at = Self::cluster_offset(MFT_MIRROR_LCN) + index as usize * RECORD_SIZE;
                self.bytes[at..at + RECORD_SIZE].copy_from_slice(record);
            }
        }
        TestImage { bytes: self.bytes }
    }

    fn write_boot_sector(&mut self) {
        let total_sectors = (self.used.len() * CLUSTER_SIZE / 512) as u64;
        let b = &mut self.bytes[..512];
        b[0..3].copy_from_slice(&[0xEB, 0x52, 0x90]);
        b[3..11].copy_from_slice(b"NTFS    ");
        put_u16(b, 0x0B, 512);
        b[0x0D] = (CLUSTER_SIZE / 512) as u8;
        b[0x15] = 0xF8;
        put_u64(b, 0x28, total_sectors);
        put_u64(b, 0x30, MFT_LCN);
        put_u64(b, 0x38, MFT_MIRROR_LCN);
        b[0x40] = (-(RECORD_SIZE.trailing_zeros() as i8)) as u8;
        b[0x44] = (NODE_SIZE / CLUSTER_SIZE) as u8;
        put_u64(b, 0x48, SERIAL);
        b[510] = 0x55;
        b[511] = 0xAA;
    }

    fn file_record(&mut self, object: &Object) -> Vec<u8> {
        let (allocated, size) = object.sizes();
        let mut attrs = vec![
            resident_attr(ATTR_TYPE_STANDARD_INFORMATION, "", &standard_info(object.attributes)),
            resident_attr(
                ATTR_TYPE_FILE_NAME,
                "",
                &file_name_value(object.parent, &object.name, object.attributes, allocated, size),
            ),
        ];
        match &object.content {
            Content::Resident(data) => attrs.push(resident_attr(ATTR_TYPE_DATA, "", data)),
            Content::NonResident {
                data,
                initialized,
                holes,
            } => {
                let runs = self.write_data(data, *initialized, holes);
                let flags = if holes.is_empty() { 0 } else { ATTR_FLAG_SPARSE };
                attrs.push(non_resident_attr(
                    ATTR_TYPE_DATA,
                    "",
                    flags,
                    &runs,
                    allocated,
                    size,
                    *initialized,
                ));
            }
            Content::Directory { .. } => unreachable!(),
        }
        mft_record(object.sequence, MFT_RECORD_IN_USE, &attrs)
    }

    /// Allocate and write non-resident data; bytes past `initialized` on disk
    /// are filled with STALE_BYTE.
    fn write_data(&mut self, data: &[u8], initialized: u64, holes: &[u64]) -> Vec<Run> {
        let clusters = (data.len() + CLUSTER_SIZE - 1) / CLUSTER_SIZE;
        let mut runs: Vec<Run> = Vec::new();
        let mut vcn = 0u64;
        while vcn < clusters as u64 {
            let hole = holes.contains(&vcn);
            let mut len = 1;
            while vcn + len < clusters as u64 && holes.contains(&(vcn + len)) == hole {
                len += 1;
            }
            if hole {
                runs.push(Run::Hole { clusters: len });
            } else {
                let lcn = self.alloc(len);
                for i in 0..len {
                    let file_off = ((vcn + i) as usize) * CLUSTER_SIZE;
                    let disk = Self::cluster_offset(lcn + i);
                    for j in 0..CLUSTER_SIZE {
                        let pos = file_off + j;
                        self.bytes[disk + j] = if (pos as u64) < initialized && pos < data.len() {
                            data[pos]
                        } else {
                            STALE_BYTE
                        };
                    }
                }
                runs.push(Run::Data { lcn, clusters: len });
            }
            vcn += len;
        }
        runs
    }

    fn dir_record(&mut self, builder: &VolumeBuilder, index: u64, object: &Object, children: &[u64]) -> Vec<u8> {
        let dir_ref = MftRef::new(index, object.sequence);
        let upcase = UpcaseTable::ascii();
        let mut keys: Vec<(Vec<u16>, Key)> = children
            .iter()
            .map(|c| {
                let child = &builder.objects[c];
                let (allocated, size) = child.sizes();
                (
                    upcase.upcase_str(&child.name),
                    Key {
                        file_ref: MftRef::new(*c, child.sequence),
                        value: file_name_value(dir_ref, &child.name, child.key_attributes(), allocated, size),
                    },
                )
            })
            .collect();
        keys.sort_by(|a, b| a.0.cmp(&b.0));
        let keys: Vec<Key> = keys.into_iter().map(|(_, k)| k).collect();

        let order: Vec<usize> = (0..keys.len()).collect();
        let tree = split_tree(&order, builder.fanout);
        let mut nodes = Vec::new();
        let (root_entries, internal) = node_entries(&tree, &keys, &mut nodes);

        let mut attrs = vec![
            resident_attr(ATTR_TYPE_STANDARD_INFORMATION, "", &standard_info(object.attributes)),
            resident_attr(
                ATTR_TYPE_FILE_NAME,
                "",
                &file_name_value(object.parent, &object.name, object.key_attributes(), 0, 0),
            ),
            resident_attr(
                ATTR_TYPE_INDEX_ROOT,
                DIR_INDEX_NAME,
                &index_root_value(&root_entries, internal),
            ),
        ];
        if !nodes.is_empty() {
            let count = nodes.len() as u64;
            let lcn = self.alloc(count);
            for (i, node) in nodes.iter().enumerate() {
                let at = Self::cluster_offset(lcn + i as u64);
                self.bytes[at..at + NODE_SIZE].copy_from_slice(node);
            }
            let size = count * NODE_SIZE as u64;
            attrs.push(non_resident_attr(
                ATTR_TYPE_INDEX_ALLOCATION,
                DIR_INDEX_NAME,
                0,
                &[Run::Data { lcn, clusters: count }],
                size,
                size,
                size,
            ));
            let mut bits = vec![0u8; (((count + 63) & !63) >> 3) as usize];
            for i in 0..count as usize {
                bits[i >> 3] |= 1 << (i & 7);
            }
            attrs.push(resident_attr(ATTR_TYPE_BITMAP, DIR_INDEX_NAME, &bits));
        }
        mft_record(object.sequence, MFT_RECORD_IN_USE | MFT_RECORD_IS_DIRECTORY, &attrs)
    }

    fn system_file(&self, name: &str, extra: Vec<Vec<u8>>) -> Vec<Vec<u8>> {
        let mut attrs = vec![
            resident_attr(
                ATTR_TYPE_STANDARD_INFORMATION,
                "",
                &standard_info(FILE_ATTR_HIDDEN | FILE_ATTR_SYSTEM),
            ),
            resident_attr(
                ATTR_TYPE_FILE_NAME,
                "",
                &file_name_value(root_ref(), name, FILE_ATTR_HIDDEN | FILE_ATTR_SYSTEM, 0, 0),
            ),
        ];
        attrs.extend(extra);
        attrs
    }

    fn system_records(&mut self, builder: &VolumeBuilder) {
        let cluster = CLUSTER_SIZE as u64;
        let empty_data = || vec![resident_attr(ATTR_TYPE_DATA, "", &[])];

        let mirror = self.system_file(
            "$MFTMirr",
            vec![non_resident_attr(
                ATTR_TYPE_DATA,
                "",
                0,
                &[Run::Data { lcn: MFT_MIRROR_LCN, clusters: 1 }],
                cluster,
                cluster,
                cluster,
            )],
        );
        self.records.insert(MFT_RECORD_MFTMIRR, mft_record(1, MFT_RECORD_IN_USE, &mirror));

        for (index, name) in [
            (MFT_RECORD_LOGFILE, "$LogFile"),
            (MFT_RECORD_ATTRDEF, "$AttrDef"),
            (MFT_RECORD_BADCLUS, "$BadClus"),
            (MFT_RECORD_SECURE, "$Secure"),
            (MFT_RECORD_EXTEND, "$Extend"),
        ] {
            let attrs = self.system_file(name, empty_data());
            self.records.insert(index, mft_record(index as u16, MFT_RECORD_IN_USE, &attrs));
        }

        let boot = self.system_file(
            "$Boot",
            vec![non_resident_attr(
                ATTR_TYPE_DATA,
                "",
                0,
                &[Run::Data { lcn: 0, clusters: 1 }],
                cluster,
                cluster,
                cluster,
            )],
        );
        self.records.insert(MFT_RECORD_BOOT, mft_record(MFT_RECORD_BOOT as u16, MFT_RECORD_IN_USE, &boot));

        let label: Vec<u8> = LABEL.encode_utf16().flat_map(|u| u.to_le_bytes()).collect();
        let mut volinfo = vec![0u8; VOLINFO_SIZE];
        volinfo[VOLINFO_MAJOR_VERSION] = 3;
        volinfo[VOLINFO_MINOR_VERSION] = 1;
        put_u16(&mut volinfo, VOLINFO_FLAGS, builder.volume_flags);
        let volume = self.system_file(
            "$Volume",
            vec![
                resident_attr(ATTR_TYPE_VOLUME_NAME, "", &label),
                resident_attr(ATTR_TYPE_VOLUME_INFORMATION, "", &volinfo),
                resident_attr(ATTR_TYPE_DATA, "", &[]),
            ],
        );
        self.records.insert(MFT_RECORD_VOLUME, mft_record(MFT_RECORD_VOLUME as u16, MFT_RECORD_IN_USE, &volume));

        let bitmap_size = (((self.used.len() >> 3) + 7) & !7) as u64;
        let bitmap = self.system_file(
            "$Bitmap",
            vec![non_resident_attr(
                ATTR_TYPE_DATA,
                "",
                0,
                &[Run::Data { lcn: BITMAP_LCN, clusters: 1 }],
                cluster,
                bitmap_size,
                bitmap_size,
            )],
        );
        self.records.insert(MFT_RECORD_BITMAP, mft_record(MFT_RECORD_BITMAP as u16, MFT_RECORD_IN_USE, &bitmap));

        let upcase_size = UPCASE_CLUSTERS * cluster;
        let upcase = self.system_file(
            "$UpCase",
            vec![non_resident_attr(
                ATTR_TYPE_DATA,
                "",
                0,
                &[Run::Data { lcn: UPCASE_LCN, clusters: UPCASE_CLUSTERS }],
                upcase_size,
                upcase_size,
                upcase_size,
            )],
        );
        self.records.insert(MFT_RECORD_UPCASE, mft_record(MFT_RECORD_UPCASE as u16, MFT_RECORD_IN_USE, &upcase));

        // $MFT last: its BITMAP reflects every record written so far
        let mut mft_bitmap = vec![0u8; (MFT_RECORDS / 8) as usize];
        for index in self.records.keys().copied().chain([MFT_RECORD_MFT]) {
            mft_bitmap[(index >> 3) as usize] |= 1 << (index & 7);
        }
        let mft_size = MFT_RECORDS * RECORD_SIZE as u64;
        let mft = self.system_file(
            "$MFT",
            vec![
                non_resident_attr(
                    ATTR_TYPE_DATA,
                    "",
                    0,
                    &[Run::Data { lcn: MFT_LCN, clusters: mft_size / cluster }],
                    mft_size,
                    mft_size,
                    mft_size,
                ),
                resident_attr(ATTR_TYPE_BITMAP, "", &mft_bitmap),
            ],
        );
        self.records.insert(MFT_RECORD_MFT, mft_record(1, MFT_RECORD_IN_USE, &mft));
    }
}

/// A finished image plus helpers to damage it.
#[derive(Clone)]
pub struct TestImage {
    pub bytes: Vec<u8>,
}

impl TestImage {
    pub fn backing(&self) -> Box<dyn BackingStore> {
        Box::new(MemoryBacking::new(self.bytes.clone()))
    }

    pub fn mount(&self) -> NtfsVolume {
        self.mount_with(MountOptions::default()).expect("mount")
    }

    pub fn mount_with(&self, options: MountOptions) -> Result<NtfsVolume, ntvfs_core::NtvfsError> {
        NtfsVolume::mount(self.backing(), options)
    }

    pub fn record_offset(index: u64) -> usize {
        Layout::cluster_offset(MFT_LCN) + index as usize * RECORD_SIZE
    }

    /// Bump a record's sequence number, as if it had been deleted and reused.
    pub fn set_sequence(&mut self, index: u64, sequence: u16) {
        let at = Self::record_offset(index) + MFT_REC_SEQUENCE;
        put_u16(&mut self.bytes, at, sequence);
    }

    pub fn set_cluster_allocated(&mut self, lcn: u64, allocated: bool) {
        let at = Layout::cluster_offset(BITMAP_LCN) + (lcn >> 3) as usize;
        let bit = 1u8 << (lcn & 7);
        if allocated {
            self.bytes[at] |= bit;
        } else {
            self.bytes[at] &= !bit;
        }
    }

    pub fn to_temp_file(&self) -> NamedTempFile {
        let mut file = NamedTempFile::new().expect("temp file");
        file.write_all(&self.bytes).expect("write image");
        file.flush().expect("flush image");
        file
    }
}

/// The 10 MiB volume: /file1.txt (resident "hello") and an empty /sub.
pub fn scenario_volume() -> TestImage {
    let mut builder = VolumeBuilder::new(10 * 1024 * 1024);
    builder.add_resident_file(root_ref(), "file1.txt", b"hello");
    builder.add_dir(root_ref(), "sub");
    builder.build()
}
