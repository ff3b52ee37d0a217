//! Atomic Utilities
//!
//! Helper functions for atomic operations.

use std::sync::atomic::{AtomicUsize, Ordering};

/// AtomicUtils - utility for atomic operations
pub struct AtomicUtils;

impl AtomicUtils {
    /// Raise `atomic` to `value` if it is currently lower
    ///
    /// Returns the previous value.
    pub fn fetch_max(atomic: &AtomicUsize, value: usize) -> usize {
        let mut current = atomic.load(Ordering::Relaxed);

        while value > current {
            match atomic.compare_exchange_weak(
                current,
                value,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return current,
                Err(actual) => current = actual,
            }
        }

        current
    }

    /// Lower `atomic` to `value` if it is currently higher
    pub fn fetch_min(atomic: &AtomicUsize, value: usize) -> usize {
        let mut current = atomic.load(Ordering::Relaxed);

        while value < current {
            match atomic.compare_exchange_weak(
                current,
                value,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return current,
                Err(actual) => current = actual,
            }
        }

        current
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fetch_max_min() {
        let value = AtomicUsize::new(10);

        assert_eq!(AtomicUtils::fetch_max(&value, 5), 10);
        assert_eq!(value.load(Ordering::Relaxed), 10);
        assert_eq!(AtomicUtils::fetch_max(&value, 20), 10);
        assert_eq!(value.load(Ordering::Relaxed), 20);

        assert_eq!(AtomicUtils::fetch_min(&value, 30), 20);
        assert_eq!(AtomicUtils::fetch_min(&value, 3), 20);
        assert_eq!(value.load(Ordering::Relaxed), 3);
    }
}
