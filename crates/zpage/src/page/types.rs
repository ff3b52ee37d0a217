//! Page classification: type, age and allocation flags

use crate::config::SURVIVOR_AGES;
use crate::generation::GenerationId;
use serde::Serialize;
use std::fmt;

/// PageType - size class of a page
///
/// - Small: one granule, shared by many small objects
/// - Medium: a power of two of granules, shared by medium objects
/// - Large: one object, rounded up to whole granules
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PageType {
    Small,
    Medium,
    Large,
}

impl fmt::Display for PageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PageType::Small => "Small",
            PageType::Medium => "Medium",
            PageType::Large => "Large",
        };
        f.write_str(name)
    }
}

/// PageAge - how many collections the objects on a page survived
///
/// Ordered: eden < survivor1 < ... < survivor14 < old.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct PageAge(u8);

impl PageAge {
    pub const EDEN: PageAge = PageAge(0);
    pub const OLD: PageAge = PageAge(SURVIVOR_AGES + 1);

    /// Number of distinct ages
    pub const COUNT: usize = SURVIVOR_AGES as usize + 2;

    /// Survivor age `n`, 1-based
    pub fn survivor(n: u8) -> PageAge {
        debug_assert!((1..=SURVIVOR_AGES).contains(&n));
        PageAge(n)
    }

    /// Age from its dense index in `[0, COUNT)`
    pub fn from_index(index: usize) -> PageAge {
        debug_assert!(index < Self::COUNT);
        PageAge(index as u8)
    }

    pub fn index(&self) -> usize {
        self.0 as usize
    }

    pub fn is_eden(&self) -> bool {
        *self == Self::EDEN
    }

    pub fn is_survivor(&self) -> bool {
        !self.is_eden() && !self.is_old()
    }

    pub fn is_old(&self) -> bool {
        *self == Self::OLD
    }

    /// Age after surviving one more young collection
    ///
    /// Ages past `tenuring_threshold` survivors go straight to old.
    pub fn next(&self, tenuring_threshold: u8) -> PageAge {
        if self.is_old() || self.0 >= tenuring_threshold {
            Self::OLD
        } else {
            PageAge(self.0 + 1)
        }
    }

    pub fn generation_id(&self) -> GenerationId {
        if self.is_old() {
            GenerationId::Old
        } else {
            GenerationId::Young
        }
    }

    pub fn all() -> impl Iterator<Item = PageAge> {
        (0..Self::COUNT).map(Self::from_index)
    }
}

impl fmt::Display for PageAge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_eden() {
            f.write_str("eden")
        } else if self.is_old() {
            f.write_str("old")
        } else {
            write!(f, "survivor{}", self.0)
        }
    }
}

/// AllocationFlags - options for a single page allocation
#[derive(Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct AllocationFlags(u8);

impl AllocationFlags {
    const NON_BLOCKING: u8 = 1 << 0;
    const GC_RELOCATION: u8 = 1 << 1;
    const FAST_MEDIUM: u8 = 1 << 2;

    pub fn new() -> Self {
        Self::default()
    }

    /// Fail instead of stalling when capacity is short
    pub fn set_non_blocking(&mut self) {
        self.0 |= Self::NON_BLOCKING;
    }

    /// Allocation made by the collector while relocating
    pub fn set_gc_relocation(&mut self) {
        self.0 |= Self::GC_RELOCATION;
    }

    /// Only take a power-of-two medium range from the cache
    pub fn set_fast_medium(&mut self) {
        self.0 |= Self::FAST_MEDIUM;
    }

    pub fn non_blocking(&self) -> bool {
        self.0 & Self::NON_BLOCKING != 0
    }

    pub fn gc_relocation(&self) -> bool {
        self.0 & Self::GC_RELOCATION != 0
    }

    pub fn fast_medium(&self) -> bool {
        self.0 & Self::FAST_MEDIUM != 0
    }
}

impl fmt::Debug for AllocationFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AllocationFlags")
            .field("non_blocking", &self.non_blocking())
            .field("gc_relocation", &self.gc_relocation())
            .field("fast_medium", &self.fast_medium())
            .finish()
    }
}
