// NTFS volume engine
pub mod ntfs;
pub mod ops;

pub use ntfs::{NtfsOps, NtfsVolume};

// Re-export filesystem operations
pub use ops::{DirectoryEntry, FileAttributes, FilesystemInfo, FilesystemOps};
