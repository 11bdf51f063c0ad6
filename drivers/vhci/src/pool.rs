//! # Object Pool
//!
//! Fixed-capacity pool of preallocated records.
//!
//! Every record is boxed once when the pool is built. After that,
//! [`ObjectPool::allocate`] and [`ObjectPool::release`] only move boxes in and
//! out of a free stack guarded by a spin lock, so both are O(1), never touch
//! the global allocator and are safe to call while another spin lock is held.

use alloc::boxed::Box;
use alloc::vec::Vec;

use spin::Mutex;

use crate::config::PoolConfig;
use crate::error::{Error, Result};

// =============================================================================
// POOL STATISTICS
// =============================================================================

/// Pool statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Total allocations
    pub allocs: u64,
    /// Total frees
    pub frees: u64,
    /// Allocations refused because the pool was empty
    pub failures: u64,
    /// High water mark
    pub peak_used: usize,
}

// =============================================================================
// OBJECT POOL
// =============================================================================

struct PoolInner<T> {
    /// Free records (stack for O(1) alloc/free)
    free_stack: Vec<Box<T>>,
    /// Statistics
    stats: PoolStats,
}

/// Fixed-size object pool for fast, non-blocking allocation
pub struct ObjectPool<T> {
    /// Configuration
    config: PoolConfig,
    /// Free stack and counters
    inner: Mutex<PoolInner<T>>,
}

impl<T: Default> ObjectPool<T> {
    /// Create a new pool with every record preallocated
    pub fn new(config: PoolConfig) -> Result<Self> {
        config.validate()?;

        let mut free_stack = Vec::with_capacity(config.capacity);
        for _ in 0..config.capacity {
            free_stack.push(Box::new(T::default()));
        }

        log::debug!(
            "ObjectPool '{}': {} records preallocated",
            config.name,
            config.capacity
        );

        Ok(Self {
            config,
            inner: Mutex::new(PoolInner {
                free_stack,
                stats: PoolStats::default(),
            }),
        })
    }

    /// Allocate a zero-initialized record from the pool
    pub fn allocate(&self) -> Result<Box<T>> {
        let mut inner = self.inner.lock();
        let Some(mut record) = inner.free_stack.pop() else {
            inner.stats.failures += 1;
            return Err(Error::OutOfMemory);
        };

        inner.stats.allocs += 1;
        let used = self.config.capacity - inner.free_stack.len();
        inner.stats.peak_used = inner.stats.peak_used.max(used);
        drop(inner);

        *record = T::default();
        Ok(record)
    }
}

impl<T> ObjectPool<T> {
    /// Return a record to the pool
    ///
    /// A record beyond the pool's capacity did not come from this pool; it is
    /// dropped so the free stack never grows.
    pub fn release(&self, record: Box<T>) {
        let mut inner = self.inner.lock();
        if inner.free_stack.len() >= self.config.capacity {
            drop(inner);
            log::warn!(
                "ObjectPool '{}': release past capacity, record dropped",
                self.config.name
            );
            return;
        }

        inner.free_stack.push(record);
        inner.stats.frees += 1;
    }

    /// Get pool statistics
    pub fn stats(&self) -> PoolStats {
        self.inner.lock().stats
    }

    /// Get number of free records
    pub fn free_count(&self) -> usize {
        self.inner.lock().free_stack.len()
    }

    /// Get number of records handed out
    pub fn used_count(&self) -> usize {
        self.config.capacity - self.free_count()
    }

    /// Get pool capacity
    pub fn capacity(&self) -> usize {
        self.config.capacity
    }

    /// Get pool name
    pub fn name(&self) -> &'static str {
        self.config.name
    }
}

impl<T> core::fmt::Debug for ObjectPool<T> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ObjectPool")
            .field("name", &self.config.name)
            .field("capacity", &self.config.capacity)
            .field("free", &self.free_count())
            .finish()
    }
}

static_assertions::assert_impl_all!(ObjectPool<u64>: Send, Sync);
