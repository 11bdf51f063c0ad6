//! # Configuration
//!
//! Sizing for the request pool and the per-endpoint broker.

use crate::error::{Error, Result};

/// Default number of request records per pool
pub const DEFAULT_POOL_CAPACITY: usize = 256;

/// Hard ceiling for a single pool
pub const MAX_POOL_CAPACITY: usize = 1 << 16;

static_assertions::const_assert!(DEFAULT_POOL_CAPACITY <= MAX_POOL_CAPACITY);

// =============================================================================
// POOL CONFIGURATION
// =============================================================================

/// Request pool configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolConfig {
    /// Number of preallocated records
    pub capacity: usize,
    /// Pool name for debugging
    pub name: &'static str,
}

impl PoolConfig {
    /// Pool config for URB request records
    pub const fn urb_requests(capacity: usize) -> Self {
        Self {
            capacity,
            name: "urb_req_pool",
        }
    }

    /// Check the configuration
    pub fn validate(&self) -> Result<()> {
        if self.capacity == 0 || self.capacity > MAX_POOL_CAPACITY {
            return Err(Error::InvalidParameter);
        }
        Ok(())
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self::urb_requests(DEFAULT_POOL_CAPACITY)
    }
}

// =============================================================================
// BROKER CONFIGURATION
// =============================================================================

/// Per-endpoint broker configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BrokerConfig {
    /// Endpoint name used in log lines
    pub name: &'static str,
    /// Expected number of simultaneously tracked requests.
    ///
    /// The sent index and the tracking index are sized for this many entries
    /// up front, so matching it to the pool capacity keeps the lock holders
    /// free of rehashing.
    pub tracked_capacity: usize,
}

impl BrokerConfig {
    /// Broker config sized for a given pool
    pub const fn for_pool(name: &'static str, pool: &PoolConfig) -> Self {
        Self {
            name,
            tracked_capacity: pool.capacity,
        }
    }

    /// Check the configuration
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() || self.tracked_capacity > MAX_POOL_CAPACITY {
            return Err(Error::InvalidParameter);
        }
        Ok(())
    }
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            name: "vhci",
            tracked_capacity: DEFAULT_POOL_CAPACITY,
        }
    }
}
