//! Configuration Module - Allocator Tuning Parameters
//!
//! Manages all configuration parameters for the page allocator.
//! Capacities are expressed in bytes and must be granule multiples.

use crate::util::constants::{DEFAULT_GRANULE_SIZE, GB, KB, MB};
use crate::util::Alignment;
use std::time::Duration;

/// Number of survivor ages between eden and old
pub const SURVIVOR_AGES: u8 = 14;

/// Main configuration for the page allocator
///
/// # Examples
///
/// ```rust
/// use zpage::AllocatorConfig;
///
/// // Use default configuration
/// let config = AllocatorConfig::default();
/// assert!(config.validate().is_ok());
///
/// // Small two-partition heap for testing
/// let config = AllocatorConfig {
///     max_capacity: 64 * 1024 * 1024,
///     soft_max_capacity: 64 * 1024 * 1024,
///     min_capacity: 0,
///     initial_capacity: 0,
///     numa_partitions: Some(2),
///     ..Default::default()
/// };
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone)]
pub struct AllocatorConfig {
    /// Capacity the uncommitter never goes below
    ///
    /// Default: max_capacity / 16
    pub min_capacity: usize,

    /// Capacity committed and cached at startup
    ///
    /// Default: min_capacity
    pub initial_capacity: usize,

    /// Hard capacity limit, split evenly across partitions
    ///
    /// Default: fraction of physical memory (30-50%), at most 32GB
    pub max_capacity: usize,

    /// Soft capacity target reported to the collector heuristics
    ///
    /// Default: max_capacity
    pub soft_max_capacity: usize,

    /// Unit of physical memory and virtual address management
    ///
    /// Must be a power of two and a multiple of the OS page size.
    /// Default: 2MB
    pub granule_size: usize,

    /// Smallest medium page handed out by the fast-medium path
    ///
    /// Equal to `page_size_medium_max` disables variable medium pages.
    /// Default: 2 granules
    pub page_size_medium_min: usize,

    /// Regular medium page size
    ///
    /// Default: 16 granules (32MB)
    pub page_size_medium_max: usize,

    /// Objects up to this size go into shared small pages
    ///
    /// Default: granule_size / 8
    pub object_size_limit_small: usize,

    /// Objects up to this size go into shared medium pages
    ///
    /// Larger objects get a dedicated large page.
    /// Default: page_size_medium_max / 8
    pub object_size_limit_medium: usize,

    /// Detect NUMA nodes and create one partition per node
    ///
    /// Default: false
    pub numa_aware: bool,

    /// Explicit partition count, overrides detection
    ///
    /// Default: None
    pub numa_partitions: Option<usize>,

    /// Allow splitting one page across several partitions
    ///
    /// Default: true
    pub multi_partition: bool,

    /// Touch every OS page of the initial capacity at startup
    ///
    /// Default: false
    pub always_pre_touch: bool,

    /// Return idle cached memory to the OS
    ///
    /// Default: true
    pub uncommit: bool,

    /// How long memory must sit unused in the cache before uncommit
    ///
    /// Default: 300s
    pub uncommit_delay: Duration,

    /// Worker threads for pre-touching
    ///
    /// If None, auto-detects: min(4, num_cpus / 2)
    pub gc_threads: Option<usize>,

    /// Reserved virtual address space per byte of max capacity
    ///
    /// Default: 4
    pub virtual_to_physical_ratio: usize,

    /// Survivor ages before promotion to old
    ///
    /// Recommended: 1-14
    /// Default: 14
    pub tenuring_threshold: u8,

    /// Emit telemetry events through the `log` facade
    ///
    /// Default: false
    pub verbose: bool,
}

impl Default for AllocatorConfig {
    fn default() -> Self {
        let num_cpus = num_cpus::get();
        let granule = DEFAULT_GRANULE_SIZE;
        let max_capacity = Alignment::align_down(calculate_max_capacity(get_total_memory()), granule)
            .max(granule);
        let min_capacity = Alignment::align_down(max_capacity / 16, granule);

        AllocatorConfig {
            // Capacity
            min_capacity,
            initial_capacity: min_capacity,
            max_capacity,
            soft_max_capacity: max_capacity,

            // Pages
            granule_size: granule,
            page_size_medium_min: 2 * granule,
            page_size_medium_max: 16 * granule,
            object_size_limit_small: granule / 8,
            object_size_limit_medium: 16 * granule / 8,

            // NUMA
            numa_aware: false,
            numa_partitions: None,
            multi_partition: true,

            // Commit / uncommit
            always_pre_touch: false,
            uncommit: true,
            uncommit_delay: Duration::from_secs(300),

            // Threading
            gc_threads: Some((num_cpus / 2).max(1).min(4)),

            virtual_to_physical_ratio: 4,
            tenuring_threshold: SURVIVOR_AGES,
            verbose: false,
        }
    }
}

impl AllocatorConfig {
    /// Validate configuration
    ///
    /// Checks if all values are in valid ranges.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use zpage::AllocatorConfig;
    ///
    /// let config = AllocatorConfig {
    ///     max_capacity: 0,  // Invalid!
    ///     ..Default::default()
    /// };
    ///
    /// assert!(config.validate().is_err());
    /// ```
    pub fn validate(&self) -> Result<(), ConfigError> {
        let granule = self.granule_size;

        // Granule validation
        if !granule.is_power_of_two() || granule < page_size::get() {
            return Err(ConfigError::InvalidGranule(format!(
                "granule_size {} must be a power of two and at least the OS page size ({})",
                granule,
                page_size::get()
            )));
        }

        // Capacity validation
        if self.max_capacity == 0 {
            return Err(ConfigError::InvalidCapacity(
                "max_capacity must be > 0".to_string(),
            ));
        }

        for (name, value) in [
            ("min_capacity", self.min_capacity),
            ("initial_capacity", self.initial_capacity),
            ("max_capacity", self.max_capacity),
        ] {
            if !Alignment::is_aligned(value, granule) {
                return Err(ConfigError::InvalidCapacity(format!(
                    "{} ({}) must be a multiple of granule_size ({})",
                    name, value, granule
                )));
            }
        }

        if self.min_capacity > self.initial_capacity || self.initial_capacity > self.max_capacity {
            return Err(ConfigError::InvalidCapacity(
                "capacities must satisfy min <= initial <= max".to_string(),
            ));
        }

        if self.soft_max_capacity > self.max_capacity {
            return Err(ConfigError::InvalidCapacity(
                "soft_max_capacity cannot exceed max_capacity".to_string(),
            ));
        }

        // Partition validation
        let partitions = self.partition_count();
        if partitions == 0 {
            return Err(ConfigError::InvalidPartitions(
                "numa_partitions must be > 0".to_string(),
            ));
        }

        if self.max_capacity / granule < partitions {
            return Err(ConfigError::InvalidPartitions(format!(
                "max_capacity must give each of the {} partitions at least one granule",
                partitions
            )));
        }

        // Page size validation
        for (name, value) in [
            ("page_size_medium_min", self.page_size_medium_min),
            ("page_size_medium_max", self.page_size_medium_max),
        ] {
            if !value.is_power_of_two() || value < granule {
                return Err(ConfigError::InvalidPageSize(format!(
                    "{} ({}) must be a power of two of at least one granule",
                    name, value
                )));
            }
        }

        if self.page_size_medium_min > self.page_size_medium_max {
            return Err(ConfigError::InvalidPageSize(
                "page_size_medium_min cannot exceed page_size_medium_max".to_string(),
            ));
        }

        // Object size limits
        if self.object_size_limit_small == 0
            || self.object_size_limit_small > granule
            || self.object_size_limit_small >= self.object_size_limit_medium
            || self.object_size_limit_medium > self.page_size_medium_max
        {
            return Err(ConfigError::InvalidThreshold(
                "object size limits must satisfy 0 < small < medium, small <= granule, medium <= medium page"
                    .to_string(),
            ));
        }

        if self.virtual_to_physical_ratio < 2 {
            return Err(ConfigError::InvalidCapacity(
                "virtual_to_physical_ratio must be >= 2".to_string(),
            ));
        }

        if self.tenuring_threshold > SURVIVOR_AGES {
            return Err(ConfigError::InvalidThreshold(format!(
                "tenuring_threshold must be <= {}",
                SURVIVOR_AGES
            )));
        }

        // Threads validation
        if let Some(threads) = self.gc_threads {
            if threads == 0 {
                return Err(ConfigError::InvalidGcThreads(
                    "gc_threads must be > 0".to_string(),
                ));
            }
        }

        if self.uncommit && self.uncommit_delay.is_zero() {
            return Err(ConfigError::InvalidUncommitDelay(
                "uncommit_delay must be > 0 when uncommit is enabled".to_string(),
            ));
        }

        Ok(())
    }

    /// Build configuration from environment variables
    ///
    /// Overrides defaults with environment variables:
    /// - ZPAGE_MAX_CAPACITY
    /// - ZPAGE_MIN_CAPACITY
    /// - ZPAGE_INITIAL_CAPACITY
    /// - ZPAGE_SOFT_MAX_CAPACITY
    /// - ZPAGE_NUMA_PARTITIONS
    /// - ZPAGE_PRE_TOUCH
    /// - ZPAGE_UNCOMMIT
    /// - ZPAGE_UNCOMMIT_DELAY_MS
    /// - ZPAGE_GC_THREADS
    /// - ZPAGE_VERBOSE
    ///
    /// # Examples
    ///
    /// ```bash
    /// export ZPAGE_MAX_CAPACITY=4294967296  # 4GB
    /// export ZPAGE_NUMA_PARTITIONS=2
    /// export ZPAGE_VERBOSE=1
    /// ```
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(size) = env_parse::<usize>("ZPAGE_MAX_CAPACITY") {
            config.max_capacity = size;
            config.soft_max_capacity = config.soft_max_capacity.min(size);
            config.initial_capacity = config.initial_capacity.min(size);
            config.min_capacity = config.min_capacity.min(size);
        }

        if let Some(size) = env_parse::<usize>("ZPAGE_MIN_CAPACITY") {
            config.min_capacity = size;
            config.initial_capacity = config.initial_capacity.max(size);
        }

        if let Some(size) = env_parse::<usize>("ZPAGE_INITIAL_CAPACITY") {
            config.initial_capacity = size;
        }

        if let Some(size) = env_parse::<usize>("ZPAGE_SOFT_MAX_CAPACITY") {
            config.soft_max_capacity = size;
        }

        if let Some(count) = env_parse::<usize>("ZPAGE_NUMA_PARTITIONS") {
            config.numa_partitions = Some(count);
        }

        if let Some(flag) = env_flag("ZPAGE_PRE_TOUCH") {
            config.always_pre_touch = flag;
        }

        if let Some(flag) = env_flag("ZPAGE_UNCOMMIT") {
            config.uncommit = flag;
        }

        if let Some(ms) = env_parse::<u64>("ZPAGE_UNCOMMIT_DELAY_MS") {
            config.uncommit_delay = Duration::from_millis(ms);
        }

        if let Some(threads) = env_parse::<usize>("ZPAGE_GC_THREADS") {
            config.gc_threads = Some(threads);
        }

        if let Some(flag) = env_flag("ZPAGE_VERBOSE") {
            config.verbose = flag;
        }

        config
    }

    /// Number of partitions the allocator is split into
    pub fn partition_count(&self) -> usize {
        match self.numa_partitions {
            Some(count) => count,
            None if self.numa_aware => crate::numa::node_count(),
            None => 1,
        }
    }

    /// Worker threads used for pre-touching
    pub fn workers(&self) -> usize {
        self.gc_threads
            .unwrap_or_else(|| (num_cpus::get() / 2).max(1).min(4))
    }

    /// Small page size, always one granule
    pub fn page_size_small(&self) -> usize {
        self.granule_size
    }

    /// Whether the fast-medium path has a range of sizes to pick from
    pub fn variable_medium_pages(&self) -> bool {
        self.page_size_medium_min < self.page_size_medium_max
    }
}

/// Error types for configuration
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid capacity: {0}")]
    InvalidCapacity(String),

    #[error("Invalid granule: {0}")]
    InvalidGranule(String),

    #[error("Invalid page size: {0}")]
    InvalidPageSize(String),

    #[error("Invalid threshold: {0}")]
    InvalidThreshold(String),

    #[error("Invalid partitions: {0}")]
    InvalidPartitions(String),

    #[error("Invalid GC threads: {0}")]
    InvalidGcThreads(String),

    #[error("Invalid uncommit delay: {0}")]
    InvalidUncommitDelay(String),
}

// ============================================================================
// HELPERS
// ============================================================================

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok()?.parse().ok()
}

fn env_flag(name: &str) -> Option<bool> {
    let val = std::env::var(name).ok()?;
    Some(val == "1" || val.eq_ignore_ascii_case("true"))
}

/// Get total physical memory in bytes
fn get_total_memory() -> usize {
    #[cfg(target_os = "linux")]
    {
        if let Ok(meminfo) = std::fs::read_to_string("/proc/meminfo") {
            for line in meminfo.lines() {
                if let Some(rest) = line.strip_prefix("MemTotal:") {
                    if let Some(kb) = rest
                        .split_whitespace()
                        .next()
                        .and_then(|v| v.parse::<usize>().ok())
                    {
                        return kb * KB;
                    }
                }
            }
        }
    }

    8 * GB
}

/// Calculate max capacity based on available memory
fn calculate_max_capacity(total_memory: usize) -> usize {
    let ratio = if total_memory < 4 * GB {
        0.5
    } else if total_memory < 16 * GB {
        0.4
    } else {
        0.3
    };

    let calculated = (total_memory as f64 * ratio) as usize;
    calculated.clamp(64 * MB, 32 * GB)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_env() {
        std::env::set_var("ZPAGE_UNCOMMIT_DELAY_MS", "1500");
        std::env::set_var("ZPAGE_VERBOSE", "true");
        std::env::set_var("ZPAGE_NUMA_PARTITIONS", "2");

        let config = AllocatorConfig::from_env();

        std::env::remove_var("ZPAGE_UNCOMMIT_DELAY_MS");
        std::env::remove_var("ZPAGE_VERBOSE");
        std::env::remove_var("ZPAGE_NUMA_PARTITIONS");

        assert_eq!(config.uncommit_delay, Duration::from_millis(1500));
        assert!(config.verbose);
        assert_eq!(config.partition_count(), 2);
    }

    #[test]
    fn test_default_config() {
        let config = AllocatorConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.granule_size, 2 * MB);
        assert_eq!(config.partition_count(), 1);
        assert!(config.variable_medium_pages());
    }

    #[test]
    fn test_invalid_capacity() {
        let config = AllocatorConfig {
            max_capacity: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = AllocatorConfig {
            max_capacity: 64 * MB,
            initial_capacity: 3 * MB,
            min_capacity: 0,
            soft_max_capacity: 64 * MB,
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidCapacity(_))
        ));
    }

    #[test]
    fn test_invalid_granule() {
        let config = AllocatorConfig {
            granule_size: 3 * MB,
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidGranule(_))
        ));
    }

    #[test]
    fn test_partitions_need_a_granule_each() {
        let config = AllocatorConfig {
            max_capacity: 4 * MB,
            soft_max_capacity: 4 * MB,
            min_capacity: 0,
            initial_capacity: 0,
            numa_partitions: Some(4),
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidPartitions(_))
        ));
    }

    #[test]
    fn test_object_limits() {
        let config = AllocatorConfig {
            object_size_limit_small: 64 * MB,
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidThreshold(_))
        ));
    }

    #[test]
    fn test_calculate_max_capacity() {
        assert_eq!(calculate_max_capacity(2 * GB), GB);
        assert_eq!(calculate_max_capacity(512 * GB), 32 * GB);
        assert_eq!(calculate_max_capacity(16 * MB), 64 * MB);
    }
}
