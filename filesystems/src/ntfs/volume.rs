// NTFS volume instance
// Mounting bootstraps $MFT, $Volume, $Bitmap, $UpCase and the root directory
// in that order; each stage validates its system file before the next one
// depends on it.

use super::attr_io::{read_attribute, write_attribute};
use super::bitmap::ClusterBitmap;
use super::cache::{CacheStats, ObjectCache};
use super::dir::{DirCursor, DirEntry, DirLookup, DirShared};
use super::geometry::{VolumeGeometry, BOOT_SECTOR_SIZE};
use super::index::{IndexNode, NodeLoader};
use super::info::ObjectInfo;
use super::record::{Attribute, AttributeKind, Core, FileNameAttr};
use super::structures::*;
use super::upcase::UpcaseTable;
use log::{debug, info, trace, warn};
use ntvfs_core::{BackingStore, MountOptions, NtvfsError};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::{Arc, Weak};

const MFT_MIN_RECORDS: u64 = 16;
const UPCASE_MIN_SIZE: u64 = 512;
const UPCASE_MAX_SIZE: u64 = 128 * 1024;

/// An open file: its core and unnamed DATA attribute.
#[derive(Debug, Clone)]
pub struct FileHandle {
    core: Arc<Core>,
    data_attr: usize,
}

impl FileHandle {
    pub fn core(&self) -> &Arc<Core> {
        &self.core
    }

    pub fn data(&self) -> &Attribute {
        &self.core.attributes[self.data_attr]
    }

    pub fn size(&self) -> u64 {
        self.data().value_size
    }

    pub fn file_ref(&self) -> MftRef {
        self.core.mft_ref()
    }
}

/// Result of resolving a path.
#[derive(Debug, Clone)]
pub enum NtfsObject {
    Dir(Arc<DirShared>),
    File(FileHandle),
}

/// Volume-wide information and cache statistics.
#[derive(Debug, Clone, Serialize)]
pub struct VolumeInfo {
    pub major_version: u8,
    pub minor_version: u8,
    pub flags: u16,
    pub serial_number: u64,
    pub label: Option<String>,
    pub read_only: bool,
    pub geometry: VolumeGeometry,
    pub whole_bitmap_cached: bool,
    pub core_cache: CacheStats,
    pub node_cache: CacheStats,
}

impl VolumeInfo {
    pub fn is_dirty(&self) -> bool {
        self.flags & VOLUME_FLAG_DIRTY != 0
    }
}

/// The $MFT record and the cache of cores loaded through its data.
#[derive(Debug)]
struct MftTable {
    core: Arc<Core>,
    data_attr: usize,
    cache: ObjectCache<Core>,
}

impl MftTable {
    fn data(&self) -> &Attribute {
        &self.core.attributes[self.data_attr]
    }

    fn query_core(
        &mut self,
        backing: &mut dyn BackingStore,
        geometry: &VolumeGeometry,
        mft_index: u64,
    ) -> Result<Arc<Core>, NtvfsError> {
        if mft_index == MFT_RECORD_MFT {
            return Ok(self.core.clone());
        }
        if let Some(core) = self.cache.get(mft_index) {
            return Ok(core);
        }

        let record_size = geometry.mft_record_size as u64;
        let mft_size = self.data().value_size;
        let offset = mft_index
            .checked_mul(record_size)
            .filter(|off| off.checked_add(record_size).map_or(false, |end| end <= mft_size))
            .ok_or_else(|| {
                NtvfsError::BogusOffset(format!(
                    "MFT record {:#x} is beyond the end of the MFT ({:#x} bytes)",
                    mft_index, mft_size
                ))
            })?;
        let mut record = alloc_buffer(record_size as usize)?;
        read_attribute(backing, &self.core, self.data(), offset, &mut record)?;
        let core = Core::load(mft_index, record, geometry, false)?;
        trace!(
            "Loaded MFT record {:#x}: sequence {:#x}, {} attributes",
            mft_index,
            core.sequence,
            core.attributes.len()
        );
        Ok(self.cache.insert(mft_index, core))
    }
}

/// Check the name of a system file: the first FILENAME must be resident and
/// match one of `expected`.
fn check_system_name(core: &Core, expected: &[&str], what: &str) -> Result<(), NtvfsError> {
    let attr = core
        .find_unnamed(ATTR_TYPE_FILE_NAME)
        .ok_or_else(|| NtvfsError::BogusFormat(format!("{} has no FILENAME attribute", what)))?;
    let value = core.resident_value(attr).ok_or_else(|| {
        NtvfsError::BogusFormat(format!("{} FILENAME attribute is non-resident", what))
    })?;
    let name = FileNameAttr::parse(value)?;
    if !expected.iter().any(|e| name.name_eq_ascii(e)) {
        return Err(NtvfsError::BogusFormat(format!(
            "{}: FILENAME isn't '{}': '{}'",
            what,
            expected.join("' nor '"),
            name.name_string()
        )));
    }
    Ok(())
}

struct NonResidentSizes<'a> {
    allocated: u64,
    data: u64,
    initialized: u64,
    compression_unit: u8,
    extents: &'a super::data_runs::ExtentTable,
}

fn non_resident_sizes<'a>(attr: &'a Attribute, what: &str) -> Result<NonResidentSizes<'a>, NtvfsError> {
    match &attr.kind {
        AttributeKind::NonResident {
            allocated,
            initialized,
            compression_unit,
            extents,
            ..
        } => Ok(NonResidentSizes {
            allocated: *allocated,
            data: attr.value_size,
            initialized: *initialized,
            compression_unit: *compression_unit,
            extents,
        }),
        AttributeKind::Resident { .. } => Err(NtvfsError::BogusFormat(format!(
            "{}: unnamed DATA attribute is resident",
            what
        ))),
    }
}

/// A mounted NTFS volume.
pub struct NtfsVolume {
    backing: Box<dyn BackingStore>,
    options: MountOptions,
    geometry: VolumeGeometry,

    // $MFT and the core cache
    mft: MftTable,
    node_cache: ObjectCache<IndexNode>,
    dirs: BTreeMap<u64, Weak<DirShared>>,

    bitmap: ClusterBitmap,
    upcase: UpcaseTable,
    root: Arc<DirShared>,

    // From $Volume
    label: Option<String>,
    major_version: u8,
    minor_version: u8,
    volume_flags: u16,
}

impl std::fmt::Debug for NtfsVolume {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NtfsVolume")
            .field("geometry", &self.geometry)
            .field("version", &(self.major_version, self.minor_version))
            .field("flags", &self.volume_flags)
            .finish_non_exhaustive()
    }
}

impl NtfsVolume {
    /// Mount the NTFS volume in `backing`.
    pub fn mount(mut backing: Box<dyn BackingStore>, options: MountOptions) -> Result<Self, NtvfsError> {
        options.validate()?;
        let backing_size = backing.size();
        info!("Mounting NTFS volume ({} bytes)", backing_size);
        if backing_size < BOOT_SECTOR_SIZE as u64 {
            return Err(NtvfsError::UnknownFormat(format!(
                "backing store too small for a boot sector: {} bytes",
                backing_size
            )));
        }

        let mut boot = [0u8; BOOT_SECTOR_SIZE];
        backing.read_at(0, &mut boot)?;
        let geometry = VolumeGeometry::parse(&boot, backing_size)?;
        debug!(
            "Geometry: {} byte clusters, {} clusters, MFT at LCN {:#x}, {} byte records",
            geometry.cluster_size, geometry.cluster_count, geometry.mft_lcn, geometry.mft_record_size
        );

        let mut mft = Self::load_mft(&mut *backing, &geometry, &options)?;
        let (label, major_version, minor_version, volume_flags) =
            Self::load_volume_info(&mut *backing, &geometry, &mut mft)?;
        let mut bitmap = Self::load_bitmap(&mut *backing, &geometry, &options, &mut mft)?;
        let upcase = Self::load_upcase(&mut *backing, &geometry, &mut mft, &mut bitmap)?;
        let root = Self::load_root_dir(&mut *backing, &geometry, &mut mft, &mut bitmap)?;

        let mut dirs = BTreeMap::new();
        dirs.insert(root.mft_index(), Arc::downgrade(&root));

        info!(
            "Mounted NTFS {}.{} volume, serial {:016x}{}",
            major_version,
            minor_version,
            geometry.serial_number,
            if options.read_only { " (read-only)" } else { "" }
        );
        let node_cache = ObjectCache::new("index nodes", options.node_cache_budget);
        Ok(NtfsVolume {
            backing,
            options,
            geometry,
            mft,
            node_cache,
            dirs,
            bitmap,
            upcase,
            root,
            label,
            major_version,
            minor_version,
            volume_flags,
        })
    }

    fn load_mft(
        backing: &mut dyn BackingStore,
        geometry: &VolumeGeometry,
        options: &MountOptions,
    ) -> Result<MftTable, NtvfsError> {
        let disk_offset = geometry.mft_offset();
        let mut record = alloc_buffer(geometry.mft_record_size as usize)?;
        backing.read_at(disk_offset, &mut record)?;
        let core = Core::load(MFT_RECORD_MFT, record, geometry, !options.strict_bootstrap_fixups)?;

        let data_attr = core
            .attributes
            .iter()
            .position(|a| a.attr_type == ATTR_TYPE_DATA && a.is_unnamed())
            .ok_or_else(|| NtvfsError::BogusFormat("MFT record #0 has no unnamed DATA attribute".to_string()))?;
        let data = &core.attributes[data_attr];
        let sizes = non_resident_sizes(data, "MFT record #0")?;
        let min = geometry.mft_record_size as u64 * MFT_MIN_RECORDS;
        let limit = backing.size();
        for (field, value) in [
            ("allocated", sizes.allocated),
            ("initialized", sizes.initialized),
            ("data", sizes.data),
        ] {
            if value < min || value >= limit {
                return Err(NtvfsError::BogusFormat(format!(
                    "MFT record #0 unnamed DATA attribute {} size is out of range: {:#x} (min {:#x}, below {:#x})",
                    field, value, min, limit
                )));
            }
        }
        if sizes.compression_unit != 0 {
            return Err(NtvfsError::BogusFormat(format!(
                "MFT record #0 unnamed DATA attribute is compressed: {:#x}",
                sizes.compression_unit
            )));
        }
        let first = sizes.extents.iter().next().ok_or_else(|| {
            NtvfsError::BogusFormat("MFT record #0 unnamed DATA attribute has no data on the disk".to_string())
        })?;
        if first.disk_offset != disk_offset {
            return Err(NtvfsError::BogusFormat(format!(
                "MFT record #0 unnamed DATA attribute has a bogus disk offset: {:#x}, expected {:#x}",
                first.disk_offset, disk_offset
            )));
        }
        if core.find_unnamed(ATTR_TYPE_BITMAP).is_none() {
            return Err(NtvfsError::BogusFormat("MFT record #0 has no unnamed BITMAP attribute".to_string()));
        }
        check_system_name(&core, &["$MFT"], "MFT record #0")?;
        debug!(
            "$MFT: {:#x} bytes in {} extents",
            data.value_size,
            sizes.extents.len()
        );

        Ok(MftTable {
            core: Arc::new(core),
            data_attr,
            cache: ObjectCache::new("MFT cores", options.core_cache_budget),
        })
    }

    fn load_volume_info(
        backing: &mut dyn BackingStore,
        geometry: &VolumeGeometry,
        mft: &mut MftTable,
    ) -> Result<(Option<String>, u8, u8, u16), NtvfsError> {
        let core = mft.query_core(backing, geometry, MFT_RECORD_VOLUME)?;
        let attr = core.find_unnamed(ATTR_TYPE_VOLUME_INFORMATION).ok_or_else(|| {
            NtvfsError::BogusFormat("$Volume has no unnamed VOLUME_INFORMATION attribute".to_string())
        })?;
        let value = core.resident_value(attr).ok_or_else(|| {
            NtvfsError::BogusFormat("$Volume VOLUME_INFORMATION attribute is not resident".to_string())
        })?;
        if value.len() != VOLINFO_SIZE || attr.value_size != VOLINFO_SIZE as u64 {
            return Err(NtvfsError::BogusFormat(format!(
                "$Volume VOLUME_INFORMATION attribute has the wrong size: {:#x} ({:#x} resident), expected {:#x}",
                attr.value_size,
                value.len(),
                VOLINFO_SIZE
            )));
        }
        check_system_name(&core, &["$Volume"], "$Volume")?;

        let major = value[VOLINFO_MAJOR_VERSION];
        let minor = value[VOLINFO_MINOR_VERSION];
        let flags = read_u16(value, VOLINFO_FLAGS);
        let label = core
            .find_unnamed(ATTR_TYPE_VOLUME_NAME)
            .and_then(|a| core.resident_value(a))
            .filter(|v| !v.is_empty())
            .map(|v| decode_utf16_name(v, 0, v.len() / 2));
        debug!("NTFS version {}.{}, flags {:#x}, label {:?}", major, minor, flags, label);
        if flags & VOLUME_FLAG_DIRTY != 0 {
            warn!("Volume is marked dirty");
        }
        Ok((label, major, minor, flags))
    }

    fn load_bitmap(
        backing: &mut dyn BackingStore,
        geometry: &VolumeGeometry,
        options: &MountOptions,
        mft: &mut MftTable,
    ) -> Result<ClusterBitmap, NtvfsError> {
        let core = mft.query_core(backing, geometry, MFT_RECORD_BITMAP)?;
        let data = core
            .find_unnamed(ATTR_TYPE_DATA)
            .ok_or_else(|| NtvfsError::BogusFormat("$Bitmap: has no unnamed DATA attribute".to_string()))?;
        let sizes = non_resident_sizes(data, "$Bitmap")?;

        let cluster_size = geometry.cluster_size as u64;
        let min = ((geometry.volume_size >> (geometry.cluster_shift + 3)) + 7) & !7;
        let max = (min + cluster_size - 1) & !(cluster_size - 1);
        if sizes.allocated < min || sizes.allocated > max {
            return Err(NtvfsError::BogusFormat(format!(
                "$Bitmap: unnamed DATA attribute allocated size is out of range: {:#x}, expected at least {:#x} and no more than {:#x}",
                sizes.allocated, min, max
            )));
        }
        if sizes.data < min {
            return Err(NtvfsError::BogusFormat(format!(
                "$Bitmap: unnamed DATA attribute data size is too small: {:#x}, expected at least {:#x}",
                sizes.data, min
            )));
        }
        if sizes.initialized < min || sizes.initialized > sizes.allocated {
            return Err(NtvfsError::BogusFormat(format!(
                "$Bitmap: unnamed DATA attribute initialized size is out of range: {:#x}, expected at least {:#x} and no more than {:#x}",
                sizes.initialized, min, sizes.allocated
            )));
        }
        if sizes.compression_unit != 0 {
            return Err(NtvfsError::BogusFormat(format!(
                "$Bitmap: unnamed DATA attribute is compressed: {:#x}",
                sizes.compression_unit
            )));
        }
        if sizes.extents.len() != 1 {
            return Err(NtvfsError::BogusFormat(format!(
                "$Bitmap: unnamed DATA attribute is expected to have a single extent: {} extents",
                sizes.extents.len()
            )));
        }
        if sizes.extents.extents[0].is_sparse() {
            return Err(NtvfsError::BogusFormat("$Bitmap: unnamed DATA attribute is sparse".to_string()));
        }
        check_system_name(&core, &["$Bitmap"], "$Bitmap")?;

        let mut bitmap = ClusterBitmap::new(core.clone(), geometry, options.max_whole_bitmap_cache)?;
        match bitmap.query_cluster(backing, 0) {
            Ok(true) => {}
            Ok(false) => {
                return Err(NtvfsError::BogusFormat(
                    "allocation bitmap error: boot sector isn't marked allocated".to_string(),
                ))
            }
            Err(e) => {
                return Err(NtvfsError::BogusFormat(format!(
                    "allocation bitmap (offset 0) read error: {}",
                    e
                )))
            }
        }

        bitmap.check_allocated(backing, data, "allocation bitmap")?;
        let mft_core = mft.core.clone();
        bitmap.check_allocated(backing, mft.data(), "MFT")?;
        if let Some(mft_bitmap) = mft_core.find_unnamed(ATTR_TYPE_BITMAP) {
            bitmap.check_allocated(backing, mft_bitmap, "MFT Bitmap")?;
        }
        debug!(
            "$Bitmap: {:#x} bytes, {}",
            sizes.data,
            if bitmap.is_whole() { "cached whole" } else { "windowed" }
        );
        Ok(bitmap)
    }

    fn load_upcase(
        backing: &mut dyn BackingStore,
        geometry: &VolumeGeometry,
        mft: &mut MftTable,
        bitmap: &mut ClusterBitmap,
    ) -> Result<UpcaseTable, NtvfsError> {
        let core = mft.query_core(backing, geometry, MFT_RECORD_UPCASE)?;
        let data = core
            .find_unnamed(ATTR_TYPE_DATA)
            .ok_or_else(|| NtvfsError::BogusFormat("$UpCase: has no unnamed DATA attribute".to_string()))?;
        let sizes = non_resident_sizes(data, "$UpCase")?;
        if sizes.allocated < UPCASE_MIN_SIZE || sizes.allocated > UPCASE_MAX_SIZE {
            return Err(NtvfsError::BogusFormat(format!(
                "$UpCase: unnamed DATA attribute allocated size is out of range: {:#x}, expected at least {:#x} and no more than {:#x}",
                sizes.allocated, UPCASE_MIN_SIZE, UPCASE_MAX_SIZE
            )));
        }
        for (field, value) in [("data", sizes.data), ("initialized", sizes.initialized)] {
            if value < UPCASE_MIN_SIZE || value > sizes.allocated || value & 1 != 0 {
                return Err(NtvfsError::BogusFormat(format!(
                    "$UpCase: unnamed DATA attribute {} size is out of range: {:#x}, expected at least {:#x} and no more than {:#x}",
                    field, value, UPCASE_MIN_SIZE, sizes.allocated
                )));
            }
        }
        if sizes.compression_unit != 0 {
            return Err(NtvfsError::BogusFormat(format!(
                "$UpCase: unnamed DATA attribute is compressed: {:#x}",
                sizes.compression_unit
            )));
        }
        check_system_name(&core, &["$UpCase"], "$UpCase")?;

        let mut raw = alloc_buffer(sizes.data as usize)?;
        read_attribute(backing, &core, data, 0, &mut raw)?;
        let upcase = UpcaseTable::from_le_bytes(&raw)
            .map_err(|i| NtvfsError::BogusFormat(format!("$UpCase entry {:#x} is zero", i)))?;
        bitmap.check_allocated(backing, data, "$UpCase")?;
        debug!("$UpCase: {} entries loaded", sizes.data / 2);
        Ok(upcase)
    }

    fn load_root_dir(
        backing: &mut dyn BackingStore,
        geometry: &VolumeGeometry,
        mft: &mut MftTable,
        bitmap: &mut ClusterBitmap,
    ) -> Result<Arc<DirShared>, NtvfsError> {
        let core = mft.query_core(backing, geometry, MFT_RECORD_ROOT)?;
        check_system_name(&core, &[".", "$"], "RootDir")?;

        if core.find_named(ATTR_TYPE_INDEX_ROOT, DIR_INDEX_NAME).is_none() {
            return Err(NtvfsError::BogusFormat(
                "RootDir: found no INDEX_ROOT attribute named $I30".to_string(),
            ));
        }
        let alloc = core.find_named(ATTR_TYPE_INDEX_ALLOCATION, DIR_INDEX_NAME);
        let index_bitmap = core.find_named(ATTR_TYPE_BITMAP, DIR_INDEX_NAME);
        match (alloc, index_bitmap) {
            (None, Some(_)) => {
                return Err(NtvfsError::BogusFormat(
                    "RootDir: found no INDEX_ALLOCATION attribute named $I30".to_string(),
                ))
            }
            (Some(_), None) => {
                return Err(NtvfsError::BogusFormat(
                    "RootDir: found no BITMAP attribute named $I30".to_string(),
                ))
            }
            (Some(alloc), Some(index_bitmap)) => {
                bitmap.check_allocated(backing, alloc, "RootDir")?;
                bitmap.check_allocated(backing, index_bitmap, "RootDir/bitmap")?;
            }
            (None, None) => {}
        }

        let dir = DirShared::new(core, geometry.cluster_size, geometry.cluster_shift).map_err(|e| match e {
            NtvfsError::NotADirectory(msg) => NtvfsError::BogusFormat(format!("RootDir: {}", msg)),
            other => other,
        })?;
        debug!("Root directory: {} entries in the index root", dir.root.root.len());
        Ok(Arc::new(dir))
    }

    pub fn geometry(&self) -> &VolumeGeometry {
        &self.geometry
    }

    pub fn options(&self) -> &MountOptions {
        &self.options
    }

    pub fn is_read_only(&self) -> bool {
        self.options.read_only
    }

    pub fn upcase(&self) -> &UpcaseTable {
        &self.upcase
    }

    pub fn volume_info(&self) -> VolumeInfo {
        VolumeInfo {
            major_version: self.major_version,
            minor_version: self.minor_version,
            flags: self.volume_flags,
            serial_number: self.geometry.serial_number,
            label: self.label.clone(),
            read_only: self.options.read_only,
            geometry: self.geometry.clone(),
            whole_bitmap_cached: self.bitmap.is_whole(),
            core_cache: self.mft.cache.stats(),
            node_cache: self.node_cache.stats(),
        }
    }

    /// Clusters marked in use in the allocation bitmap.
    pub fn allocated_clusters(&mut self) -> Result<u64, NtvfsError> {
        self.bitmap.count_allocated(&mut *self.backing)
    }

    pub fn flush(&mut self) -> Result<(), NtvfsError> {
        self.backing.flush()
    }

    /// Core for an MFT index, from the cache or loaded through $MFT.
    pub fn query_core(&mut self, mft_index: u64) -> Result<Arc<Core>, NtvfsError> {
        self.mft.query_core(&mut *self.backing, &self.geometry, mft_index)
    }

    /// Core for `file_ref`, which must not be stale.
    pub fn query_core_for_mft_ref(&mut self, file_ref: MftRef) -> Result<Arc<Core>, NtvfsError> {
        let core = self.query_core(file_ref.index())?;
        if core.sequence != file_ref.sequence() {
            return Err(NtvfsError::BogusOffset(format!(
                "stale MFT reference {}: current sequence {:#x}",
                file_ref, core.sequence
            )));
        }
        Ok(core)
    }

    fn shared_dir_for_core(&mut self, core: Arc<Core>) -> Result<Arc<DirShared>, NtvfsError> {
        if let Some(dir) = self.dirs.get(&core.mft_index).and_then(Weak::upgrade) {
            if Arc::ptr_eq(&dir.core, &core) {
                return Ok(dir);
            }
        }
        let mft_index = core.mft_index;
        let dir = Arc::new(DirShared::new(
            core,
            self.geometry.cluster_size,
            self.geometry.cluster_shift,
        )?);
        self.dirs.retain(|_, weak| weak.strong_count() > 0);
        self.dirs.insert(mft_index, Arc::downgrade(&dir));
        Ok(dir)
    }

    fn node_loader(&mut self) -> NodeLoader<'_> {
        NodeLoader {
            backing: &mut *self.backing,
            cache: &mut self.node_cache,
        }
    }

    pub fn open_root(&self) -> Arc<DirShared> {
        self.root.clone()
    }

    pub fn open_dir(&mut self, file_ref: MftRef) -> Result<Arc<DirShared>, NtvfsError> {
        let core = self.query_core_for_mft_ref(file_ref)?;
        self.shared_dir_for_core(core)
    }

    pub fn open_file(&mut self, file_ref: MftRef) -> Result<FileHandle, NtvfsError> {
        let core = self.query_core_for_mft_ref(file_ref)?;
        if core.is_directory() {
            return Err(NtvfsError::NotAFile(format!("{} is a directory", file_ref)));
        }
        let data_attr = core
            .attributes
            .iter()
            .position(|a| a.attr_type == ATTR_TYPE_DATA && a.is_unnamed());
        match data_attr {
            Some(data_attr) => Ok(FileHandle { core, data_attr }),
            None if core.has_attribute_list => Err(core.missing_attribute("unnamed DATA")),
            None => Err(NtvfsError::NotAFile(format!("{} has no unnamed DATA attribute", file_ref))),
        }
    }

    /// Find `name` in `dir`.
    pub fn dir_lookup(&mut self, dir: &DirShared, name: &str) -> Result<DirLookup, NtvfsError> {
        let upcase = &self.upcase;
        let mut loader = NodeLoader {
            backing: &mut *self.backing,
            cache: &mut self.node_cache,
        };
        dir.lookup(upcase, name, &mut loader)
    }

    /// The directory containing `dir`; the root is its own parent.
    pub fn dir_parent(&mut self, dir: &DirShared) -> Result<Arc<DirShared>, NtvfsError> {
        if dir.mft_index() == MFT_RECORD_ROOT {
            return Ok(self.root.clone());
        }
        let parent = dir
            .core
            .attributes
            .iter()
            .filter(|a| a.attr_type == ATTR_TYPE_FILE_NAME)
            .filter_map(|a| dir.core.resident_value(a))
            .find(|value| value.len() >= FN_NAME)
            .map(|value| MftRef::read(value, FN_PARENT_REF))
            .ok_or_else(|| {
                NtvfsError::BogusFormat(format!(
                    "Dir {:#x}: no resident FILENAME to find the parent with",
                    dir.mft_index()
                ))
            })?;
        self.open_dir(parent)
    }

    /// Next entry of an enumeration, or None at the end.
    pub fn dir_enumerate(&mut self, cursor: &mut DirCursor) -> Result<Option<DirEntry>, NtvfsError> {
        if cursor.at_dot() {
            let dir = cursor.dir().clone();
            let entry = DirEntry {
                name: ".".to_string(),
                file_ref: dir.core.mft_ref(),
                info: self.query_dir_info(&dir)?,
            };
            cursor.skip_dot();
            return Ok(Some(entry));
        }
        if cursor.at_dot_dot() {
            let dir = cursor.dir().clone();
            let parent = self.dir_parent(&dir)?;
            let entry = DirEntry {
                name: "..".to_string(),
                file_ref: parent.core.mft_ref(),
                info: self.query_dir_info(&parent)?,
            };
            cursor.skip_dot();
            return Ok(Some(entry));
        }
        let mut loader = self.node_loader();
        cursor.next_tree_entry(&mut loader)
    }

    /// Resolve a slash separated path from the root.
    pub fn resolve_path(&mut self, path: &str) -> Result<NtfsObject, NtvfsError> {
        let components: Vec<&str> = path
            .split('/')
            .filter(|c| !c.is_empty() && *c != ".")
            .collect();
        let mut dir = self.open_root();
        for (i, component) in components.iter().enumerate() {
            if component.contains(':') {
                return Err(NtvfsError::NotSupported(format!(
                    "named streams are not supported: '{}'",
                    component
                )));
            }
            if *component == ".." {
                dir = self.dir_parent(&dir)?;
                continue;
            }
            let hit = self.dir_lookup(&dir, component)?;
            if hit.is_directory {
                dir = self.open_dir(hit.file_ref)?;
            } else if i + 1 == components.len() {
                return Ok(NtfsObject::File(self.open_file(hit.file_ref)?));
            } else {
                return Err(NtvfsError::NotADirectory(format!(
                    "'{}' in '{}'",
                    component, path
                )));
            }
        }
        Ok(NtfsObject::Dir(dir))
    }

    /// Read file data at `offset`; returns the number of bytes copied.
    pub fn file_read(&mut self, file: &FileHandle, offset: u64, buf: &mut [u8]) -> Result<usize, NtvfsError> {
        let size = file.size();
        if offset >= size {
            return Err(NtvfsError::Eof(format!(
                "read at {:#x}, file size {:#x}",
                offset, size
            )));
        }
        let len = (size - offset).min(buf.len() as u64) as usize;
        read_attribute(&mut *self.backing, &file.core, file.data(), offset, &mut buf[..len])?;
        Ok(len)
    }

    /// Overwrite existing file data in place.
    pub fn file_write(&mut self, file: &FileHandle, offset: u64, buf: &[u8]) -> Result<usize, NtvfsError> {
        if self.options.read_only {
            return Err(NtvfsError::WriteProtected("volume is mounted read-only".to_string()));
        }
        if buf.is_empty() {
            return Ok(0);
        }
        let size = file.size();
        let end = offset.checked_add(buf.len() as u64);
        if end.map_or(true, |end| end > size) {
            return Err(NtvfsError::Eof(format!(
                "write at {:#x} LB {:#x} would extend the file ({:#x} bytes)",
                offset,
                buf.len(),
                size
            )));
        }
        write_attribute(&mut *self.backing, &file.core, file.data(), offset, buf)?;
        trace!(
            "Wrote {:#x} bytes at {:#x} to MFT record {:#x}",
            buf.len(),
            offset,
            file.core.mft_index
        );
        Ok(buf.len())
    }

    pub fn query_info(&self, file: &FileHandle) -> Result<ObjectInfo, NtvfsError> {
        ObjectInfo::from_core(&file.core, file.data())
    }

    pub fn query_dir_info(&self, dir: &DirShared) -> Result<ObjectInfo, NtvfsError> {
        let attr = dir.alloc_attr().unwrap_or_else(|| dir.root_attr());
        ObjectInfo::from_core(&dir.core, attr)
    }

    /// Whether any cluster in the byte range is marked in use.
    pub fn query_range_state(&mut self, offset: u64, len: u64) -> Result<bool, NtvfsError> {
        self.bitmap.query_range_state(&mut *self.backing, offset, len)
    }
}
