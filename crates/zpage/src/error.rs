//! Error Module - zpage Error Types
//!
//! Allocation paths never return these: a page or object allocation that
//! cannot be satisfied yields `None`, and the caller decides whether that
//! is an out-of-memory condition. Errors are produced by construction,
//! configuration, verification and the `Heap` front end.
//!
//! # Error Categories
//!
//! ## Memory Errors
//! - `OutOfMemory` - Allocation failed after stalling
//! - `AddressSpaceExhausted` - No virtual range left for a claim
//!
//! ## Setup Errors
//! - `HeapInitialization` - Reservation or priming failed
//! - `Configuration` - Invalid configuration
//! - `ThreadSpawn` - Background thread could not be started
//!
//! ## Bugs
//! - `InvariantViolation` - Accounting check failed
//! - `InvalidArgument` - Invalid function argument

use crate::config::ConfigError;
use thiserror::Error;

/// Main error type for all zpage operations
#[derive(Debug, Error)]
pub enum ZError {
    /// Out of memory
    ///
    /// **When returned:** An allocation was failed by out-of-memory
    /// notification after stalling, or a non-blocking allocation found no
    /// capacity.
    ///
    /// **Recovery strategy:** Free memory or run a full collection that
    /// clears soft references, then retry.
    #[error("Out of memory: requested {requested} bytes, used {used} bytes")]
    OutOfMemory { requested: usize, used: usize },

    /// Address space exhausted
    ///
    /// **When returned:** Capacity was available but no virtual range of the
    /// requested size could be claimed.
    #[error("Address space exhausted: requested {requested} bytes")]
    AddressSpaceExhausted { requested: usize },

    /// Heap initialization failed
    ///
    /// **When returned:** Virtual memory reservation or initial commit fails
    ///
    /// **Recovery strategy:** Cannot recover - terminate gracefully
    #[error("Heap initialization failed: {0}")]
    HeapInitialization(String),

    /// Virtual memory error
    #[error("Virtual memory error: {0}")]
    VirtualMemory(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigError),

    /// Background thread could not be started
    #[error("Failed to spawn {name} thread: {source}")]
    ThreadSpawn {
        name: String,
        #[source]
        source: std::io::Error,
    },

    /// Internal accounting invariant does not hold
    #[error("Invariant violation: {0}")]
    InvariantViolation(String),

    /// Invalid argument
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
}

impl ZError {
    /// Whether the caller may retry after freeing memory
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            ZError::OutOfMemory { .. } | ZError::AddressSpaceExhausted { .. }
        )
    }

    /// Whether this error indicates a bug in zpage
    pub fn is_bug(&self) -> bool {
        matches!(self, ZError::InvariantViolation(_))
    }
}

/// Result type alias for zpage operations
pub type Result<T> = std::result::Result<T, ZError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        let oom = ZError::OutOfMemory {
            requested: 4096,
            used: 1024,
        };
        assert!(oom.is_recoverable());
        assert!(!oom.is_bug());
        assert_eq!(
            oom.to_string(),
            "Out of memory: requested 4096 bytes, used 1024 bytes"
        );

        let bug = ZError::InvariantViolation("used > capacity".to_string());
        assert!(bug.is_bug());
        assert!(!bug.is_recoverable());
    }

    #[test]
    fn test_config_error_conversion() {
        let err: ZError = ConfigError::InvalidCapacity("max_capacity must be > 0".into()).into();
        assert!(matches!(err, ZError::Configuration(_)));
    }
}
