//! Heap configuration
//!
//! Defaults are tuned for a heap serving one mutator thread. Any of
//! them may be overridden from the environment:
//!
//! | variable                    | field                |
//! |-----------------------------|----------------------|
//! | `SWEEPHEAP_RECURSION_LIMIT` | `recursion_limit`    |
//! | `SWEEPHEAP_PAGE_POOL`       | `page_pool_capacity` |
//! | `SWEEPHEAP_GC_THRESHOLD`    | `gc_threshold_bytes` |
//! | `SWEEPHEAP_EAGER_SWEEP`     | `sweeping`           |
//! | `SWEEPHEAP_DUMP_HEAP`       | `dump_heap`          |

use std::env;
use std::str::FromStr;

/// When unreachable memory is reclaimed after marking
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SweepingType {
    /// Pages are swept on demand by allocation
    Lazy,
    /// All pages are swept before the collection returns
    Eager,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeapConfig {
    /// Maximum depth of eager (recursive) tracing
    pub recursion_limit: usize,
    /// Bytes of native stack tracing may use before deferring
    pub native_stack_budget: usize,
    /// Empty normal pages kept for reuse
    pub page_pool_capacity: usize,
    /// Default sweeping for policy-triggered collections
    pub sweeping: SweepingType,
    /// Allocation volume since the last cycle that triggers a new one
    pub gc_threshold_bytes: usize,
    /// Overwrite reclaimed memory with a known pattern
    pub zap_freed_memory: bool,
    /// Log a dump of the heap after each cycle
    pub dump_heap: bool,
}

impl Default for HeapConfig {
    fn default() -> Self {
        HeapConfig {
            recursion_limit: 100,
            native_stack_budget: 256 * 1024,
            page_pool_capacity: 16,
            sweeping: SweepingType::Lazy,
            gc_threshold_bytes: 4 * 1024 * 1024,
            zap_freed_memory: cfg!(debug_assertions),
            dump_heap: false,
        }
    }
}

fn env_value<T: FromStr>(name: &str) -> Option<T> {
    let raw = env::var(name).ok()?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            log::warn!("ignoring malformed {}={:?}", name, raw);
            None
        }
    }
}

fn env_flag(name: &str) -> Option<bool> {
    let raw = env::var(name).ok()?;
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" | "" => Some(false),
        _ => {
            log::warn!("ignoring malformed {}={:?}", name, raw);
            None
        }
    }
}

impl HeapConfig {
    /// Defaults overlaid with any environment overrides
    pub fn from_env() -> Self {
        HeapConfig::default().with_env_overrides()
    }

    pub fn with_env_overrides(mut self) -> Self {
        if let Some(limit) = env_value("SWEEPHEAP_RECURSION_LIMIT") {
            self.recursion_limit = limit;
        }
        if let Some(capacity) = env_value("SWEEPHEAP_PAGE_POOL") {
            self.page_pool_capacity = capacity;
        }
        if let Some(threshold) = env_value("SWEEPHEAP_GC_THRESHOLD") {
            self.gc_threshold_bytes = threshold;
        }
        if let Some(eager) = env_flag("SWEEPHEAP_EAGER_SWEEP") {
            self.sweeping = if eager {
                SweepingType::Eager
            } else {
                SweepingType::Lazy
            };
        }
        if let Some(dump) = env_flag("SWEEPHEAP_DUMP_HEAP") {
            self.dump_heap = dump;
        }
        self
    }

    pub fn with_recursion_limit(mut self, limit: usize) -> Self {
        self.recursion_limit = limit;
        self
    }

    pub fn with_native_stack_budget(mut self, bytes: usize) -> Self {
        self.native_stack_budget = bytes;
        self
    }

    pub fn with_page_pool_capacity(mut self, pages: usize) -> Self {
        self.page_pool_capacity = pages;
        self
    }

    pub fn with_sweeping(mut self, sweeping: SweepingType) -> Self {
        self.sweeping = sweeping;
        self
    }

    pub fn with_gc_threshold(mut self, bytes: usize) -> Self {
        self.gc_threshold_bytes = bytes;
        self
    }

    pub fn with_zapping(mut self, zap: bool) -> Self {
        self.zap_freed_memory = zap;
        self
    }

    pub fn with_heap_dump(mut self) -> Self {
        self.dump_heap = true;
        self
    }
}

#[cfg(test)]
pub mod tests {
    use super::*;

    #[test]
    pub fn test_defaults() {
        let config = HeapConfig::default();
        assert_eq!(config.recursion_limit, 100);
        assert_eq!(config.page_pool_capacity, 16);
        assert_eq!(config.sweeping, SweepingType::Lazy);
        assert!(!config.dump_heap);
    }

    #[test]
    pub fn test_env_overrides() {
        env::set_var("SWEEPHEAP_RECURSION_LIMIT", "7");
        env::set_var("SWEEPHEAP_PAGE_POOL", "not-a-number");
        env::set_var("SWEEPHEAP_EAGER_SWEEP", "yes");
        let config = HeapConfig::from_env();
        env::remove_var("SWEEPHEAP_RECURSION_LIMIT");
        env::remove_var("SWEEPHEAP_PAGE_POOL");
        env::remove_var("SWEEPHEAP_EAGER_SWEEP");

        assert_eq!(config.recursion_limit, 7);
        assert_eq!(config.page_pool_capacity, 16);
        assert_eq!(config.sweeping, SweepingType::Eager);
    }

    #[test]
    pub fn test_builders() {
        let config = HeapConfig::default()
            .with_gc_threshold(1024)
            .with_sweeping(SweepingType::Eager)
            .with_zapping(true)
            .with_heap_dump();
        assert_eq!(config.gc_threshold_bytes, 1024);
        assert_eq!(config.sweeping, SweepingType::Eager);
        assert!(config.zap_freed_memory);
        assert!(config.dump_heap);
    }
}
