//! Memory accounting for numeric buffers
//!
//! Buffers do not allocate through the pool; they report to it. A pool sees
//! exactly one `allocate` when a buffer's storage is created and exactly one
//! `deallocate` when the last handle to that storage is dropped, which makes
//! the live allocation count a direct measure of how many buffers are
//! resident.

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Instant;

use serde::Serialize;

use crate::error::{Error, Result};

/// Interface for memory pool implementations
pub trait MemoryPool: Send + Sync + fmt::Debug {
    /// Account for a new allocation of `size` bytes
    fn allocate(&self, size: usize) -> Result<()>;

    /// Account for the release of a previous allocation of `size` bytes
    fn deallocate(&self, size: usize);

    /// Get memory usage statistics for this pool
    fn usage_stats(&self) -> MemoryPoolStats;
}

/// Memory usage statistics for a memory pool
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MemoryPoolStats {
    /// Total allocated memory in bytes
    pub allocated_bytes: usize,

    /// Total deallocated memory in bytes
    pub deallocated_bytes: usize,

    /// Current outstanding allocations in bytes
    pub current_bytes: usize,

    /// Peak memory usage in bytes
    pub peak_bytes: usize,

    /// Number of live allocations
    pub allocation_count: usize,

    /// Total number of allocations performed
    pub total_allocations: usize,

    /// Total number of deallocations performed
    pub total_deallocations: usize,
}

/// Pool that counts every buffer created and released through it
#[derive(Debug, Default)]
pub struct TrackingMemoryPool {
    /// Stats for this memory pool
    stats: Mutex<MemoryPoolStats>,

    /// Optional hard limit on resident bytes
    budget: Option<Arc<MemoryBudget>>,
}

impl TrackingMemoryPool {
    /// Create a new unbounded tracking pool
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a tracking pool that refuses allocations beyond `budget`
    pub fn with_budget(budget: Arc<MemoryBudget>) -> Self {
        Self {
            stats: Mutex::default(),
            budget: Some(budget),
        }
    }

    /// Get the budget enforced by this pool, if any
    pub fn budget(&self) -> Option<&Arc<MemoryBudget>> {
        self.budget.as_ref()
    }
}

impl MemoryPool for TrackingMemoryPool {
    fn allocate(&self, size: usize) -> Result<()> {
        if let Some(budget) = &self.budget {
            budget.allocate(size)?;
        }

        let mut stats = self.stats.lock().unwrap_or_else(PoisonError::into_inner);
        stats.allocated_bytes += size;
        stats.current_bytes += size;
        stats.peak_bytes = stats.peak_bytes.max(stats.current_bytes);
        stats.allocation_count += 1;
        stats.total_allocations += 1;

        Ok(())
    }

    fn deallocate(&self, size: usize) {
        if let Some(budget) = &self.budget {
            budget.release(size);
        }

        let mut stats = self.stats.lock().unwrap_or_else(PoisonError::into_inner);
        stats.deallocated_bytes += size;
        stats.current_bytes = stats.current_bytes.saturating_sub(size);
        stats.allocation_count = stats.allocation_count.saturating_sub(1);
        stats.total_deallocations += 1;
    }

    fn usage_stats(&self) -> MemoryPoolStats {
        self.stats
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

/// Memory budget for controlling and tracking memory usage
#[derive(Debug)]
pub struct MemoryBudget {
    /// The total memory budget in bytes
    total_budget: usize,

    /// The current memory usage in bytes
    current_usage: AtomicUsize,

    /// Memory usage statistics
    stats: RwLock<MemoryStats>,
}

/// Memory usage statistics
#[derive(Debug, Clone)]
pub struct MemoryStats {
    /// Total allocated memory in bytes
    pub total_allocated: usize,

    /// Peak memory usage in bytes
    pub peak_usage: usize,

    /// Last time the stats were updated
    pub last_updated: Instant,
}

impl MemoryBudget {
    /// Create a new memory budget with the given total budget
    pub fn new(total_budget: usize) -> Self {
        Self {
            total_budget,
            current_usage: AtomicUsize::new(0),
            stats: RwLock::new(MemoryStats {
                total_allocated: 0,
                peak_usage: 0,
                last_updated: Instant::now(),
            }),
        }
    }

    /// Try to allocate memory, returns false if exceeds budget
    pub fn try_allocate(&self, bytes: usize) -> bool {
        let mut current = self.current_usage.load(Ordering::SeqCst);

        loop {
            if current + bytes > self.total_budget {
                return false;
            }

            match self.current_usage.compare_exchange(
                current,
                current + bytes,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => {
                    let mut stats = self.stats.write().unwrap_or_else(PoisonError::into_inner);
                    stats.total_allocated += bytes;
                    stats.peak_usage = stats.peak_usage.max(current + bytes);
                    stats.last_updated = Instant::now();

                    return true;
                }
                Err(actual) => {
                    current = actual;
                }
            }
        }
    }

    /// Allocate memory, returning an error if it exceeds budget
    pub fn allocate(&self, bytes: usize) -> Result<()> {
        if self.try_allocate(bytes) {
            Ok(())
        } else {
            Err(Error::MemoryBudgetExceeded {
                requested: bytes,
                available: self.total_budget.saturating_sub(self.usage()),
            })
        }
    }

    /// Release previously allocated memory
    pub fn release(&self, bytes: usize) {
        let prev = self.current_usage.fetch_sub(bytes, Ordering::SeqCst);

        let mut stats = self.stats.write().unwrap_or_else(PoisonError::into_inner);
        stats.last_updated = Instant::now();

        debug_assert!(
            prev >= bytes,
            "Attempted to release more memory than allocated: prev={prev}, release={bytes}"
        );
    }

    /// Get the total budget in bytes
    pub fn total(&self) -> usize {
        self.total_budget
    }

    /// Get current memory usage
    pub fn usage(&self) -> usize {
        self.current_usage.load(Ordering::SeqCst)
    }

    /// Get percent of budget used
    #[allow(clippy::cast_precision_loss)]
    pub fn percent_used(&self) -> f64 {
        if self.total_budget == 0 {
            return 100.0;
        }
        (self.usage() as f64 / self.total_budget as f64) * 100.0
    }

    /// Get memory statistics
    pub fn stats(&self) -> MemoryStats {
        self.stats
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tracking_pool_counts_live_allocations() {
        let pool = TrackingMemoryPool::new();
        pool.allocate(64).unwrap();
        pool.allocate(32).unwrap();
        pool.deallocate(64);

        let stats = pool.usage_stats();
        assert_eq!(stats.allocation_count, 1);
        assert_eq!(stats.current_bytes, 32);
        assert_eq!(stats.peak_bytes, 96);
        assert_eq!(stats.total_allocations, 2);
        assert_eq!(stats.total_deallocations, 1);
    }

    #[test]
    fn test_budget_rejects_over_limit() {
        let budget = Arc::new(MemoryBudget::new(100));
        let pool = TrackingMemoryPool::with_budget(budget.clone());

        pool.allocate(60).unwrap();
        let err = pool.allocate(60).unwrap_err();
        assert_eq!(
            err,
            Error::MemoryBudgetExceeded {
                requested: 60,
                available: 40
            }
        );

        // A refused allocation leaves no trace in the pool
        assert_eq!(pool.usage_stats().allocation_count, 1);

        pool.deallocate(60);
        assert_eq!(budget.usage(), 0);
        assert_eq!(budget.stats().peak_usage, 60);
    }

    #[test]
    fn test_budget_percent_used() {
        let budget = MemoryBudget::new(200);
        assert!(budget.try_allocate(50));
        assert!((budget.percent_used() - 25.0).abs() < f64::EPSILON);
        assert!(!budget.try_allocate(151));
    }
}
