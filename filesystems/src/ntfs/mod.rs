// NTFS filesystem support module
// Read-only metadata engine with in-place overwrite of existing file data.
// Fully portable - no OS-specific dependencies

pub mod structures;
pub mod geometry;
pub mod fixup;
pub mod data_runs;
pub mod record;
pub mod cache;
pub mod attr_io;
pub mod bitmap;
pub mod upcase;
pub mod index;
pub mod dir;
pub mod info;
pub mod volume;
pub mod ops;

// Re-export main types
pub use dir::{DirCursor, DirEntry, DirLookup, DirShared};
pub use geometry::VolumeGeometry;
pub use info::{mode_string, ObjectInfo};
pub use ops::NtfsOps;
pub use structures::MftRef;
pub use volume::{FileHandle, NtfsObject, NtfsVolume, VolumeInfo};
