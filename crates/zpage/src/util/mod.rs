//! Util Module - Shared Utilities
//!
//! Utilities and helper functions used throughout zpage.

pub mod alignment;
pub mod atomic;

pub use alignment::Alignment;
pub use atomic::AtomicUtils;

/// Size constants
pub mod constants {
    /// 1 Kilobyte
    pub const KB: usize = 1024;
    /// 1 Megabyte
    pub const MB: usize = 1024 * 1024;
    /// 1 Gigabyte
    pub const GB: usize = 1024 * 1024 * 1024;

    /// Default granule size (2MB)
    pub const DEFAULT_GRANULE_SIZE: usize = 2 * MB;

    /// Object alignment inside pages
    pub const OBJECT_ALIGNMENT: usize = 8;
}

/// Format a byte count as whole megabytes for log lines
pub fn to_mb(bytes: usize) -> usize {
    bytes / constants::MB
}

/// Percentage of `part` relative to `whole`
pub fn percent_of(part: usize, whole: usize) -> f64 {
    if whole == 0 {
        0.0
    } else {
        part as f64 / whole as f64 * 100.0
    }
}
