use crate::error::NtvfsError;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Default byte budget for cached MFT cores.
pub const DEFAULT_CORE_CACHE_BUDGET: usize = 512 * 1024;
/// Default byte budget for cached index allocation nodes.
pub const DEFAULT_NODE_CACHE_BUDGET: usize = 1024 * 1024;
/// Bitmaps up to this size are cached whole, larger ones through a window.
pub const DEFAULT_MAX_WHOLE_BITMAP_CACHE: usize = 64 * 1024;

/// Mount configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct MountOptions {
    /// Reject every write, including the in-place overwrites the engine can do.
    pub read_only: bool,
    pub core_cache_budget: usize,
    pub node_cache_budget: usize,
    pub max_whole_bitmap_cache: usize,
    /// Apply strict update sequence checks to `$MFT` record 0 too.
    pub strict_bootstrap_fixups: bool,
}

impl Default for MountOptions {
    fn default() -> Self {
        Self {
            read_only: true,
            core_cache_budget: DEFAULT_CORE_CACHE_BUDGET,
            node_cache_budget: DEFAULT_NODE_CACHE_BUDGET,
            max_whole_bitmap_cache: DEFAULT_MAX_WHOLE_BITMAP_CACHE,
            strict_bootstrap_fixups: false,
        }
    }
}

impl MountOptions {
    /// Load options from a JSON file. Missing fields keep their defaults.
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self, NtvfsError> {
        let text = std::fs::read_to_string(path.as_ref())?;
        let options: MountOptions = serde_json::from_str(&text)?;
        options.validate()?;
        Ok(options)
    }

    pub fn validate(&self) -> Result<(), NtvfsError> {
        if self.core_cache_budget == 0 {
            return Err(NtvfsError::Configuration("core_cache_budget must be non-zero".to_string()));
        }
        if self.node_cache_budget == 0 {
            return Err(NtvfsError::Configuration("node_cache_budget must be non-zero".to_string()));
        }
        if self.max_whole_bitmap_cache > 16 * 1024 * 1024 {
            return Err(NtvfsError::Configuration(format!(
                "max_whole_bitmap_cache of {} bytes is unreasonably large",
                self.max_whole_bitmap_cache
            )));
        }
        Ok(())
    }
}
