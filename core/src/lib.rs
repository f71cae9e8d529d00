pub mod backing;
pub mod error;
pub mod options;

pub use backing::{BackingStore, FileBacking, MemoryBacking};
pub use error::NtvfsError;
pub use options::MountOptions;
