//! # Request Store
//!
//! The transport encoding step: serializing a request into the destination
//! buffer of a consumer pull. The encoding itself lives with the transport;
//! the broker only sees how far the copy got.

use crate::error::Result;
use crate::request::Request;

/// Outcome of a successful store
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreProgress {
    /// The whole request was written
    Complete,
    /// Part of the request was written; more payload remains
    Partial {
        /// Bytes still to transfer
        bytes_remaining: usize,
    },
}

impl StoreProgress {
    /// Progress from a remaining byte count
    pub fn from_remaining(bytes_remaining: usize) -> Self {
        if bytes_remaining == 0 {
            StoreProgress::Complete
        } else {
            StoreProgress::Partial { bytes_remaining }
        }
    }

    /// Bytes still to transfer
    pub fn bytes_remaining(&self) -> usize {
        match self {
            StoreProgress::Complete => 0,
            StoreProgress::Partial { bytes_remaining } => *bytes_remaining,
        }
    }
}

/// Transport encoding step invoked by the broker
///
/// Called without any broker lock held; it may take arbitrarily long.
pub trait RequestStore<C, R>: Send + Sync {
    /// Write `request` into `consumer`'s destination buffer
    fn store(&self, request: &Request<C>, consumer: &mut R) -> Result<StoreProgress>;
}
