//! # VHCI Error Handling
//!
//! Error types shared by the request pool and the broker.
//!
//! - Errors are `Copy` and `no_std` compatible
//! - Operations that consume an owned value hand it back on failure
//!   through [`Rejected`]

use core::fmt;

// =============================================================================
// RESULT TYPE
// =============================================================================

/// VHCI Result type alias
pub type Result<T> = core::result::Result<T, Error>;

// =============================================================================
// ERROR ENUM
// =============================================================================

/// Broker and pool error type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum Error {
    /// The request pool is exhausted
    OutOfMemory,
    /// The transport encoding step failed
    StoreFailed,
    /// No matching request or transfer
    NotFound,
    /// A consumer is already parked or a transfer is running
    Busy,
    /// The caller operation is already tracked by this broker
    AlreadyTracked,
    /// The operation was cancelled
    Cancelled,
    /// Invalid parameter provided
    InvalidParameter,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OutOfMemory => write!(f, "request pool exhausted"),
            Self::StoreFailed => write!(f, "failed to store request into consumer buffer"),
            Self::NotFound => write!(f, "no matching request"),
            Self::Busy => write!(f, "consumer slot busy"),
            Self::AlreadyTracked => write!(f, "caller operation already tracked"),
            Self::Cancelled => write!(f, "operation cancelled"),
            Self::InvalidParameter => write!(f, "invalid parameter"),
        }
    }
}

// =============================================================================
// REJECTED
// =============================================================================

/// An owned value handed back together with the reason it was refused.
///
/// The broker never drops a request it could not accept: the submitter gets
/// it back and is responsible for completing its caller and releasing it.
pub struct Rejected<T> {
    /// Why the value was refused
    pub error: Error,
    /// The refused value
    pub item: T,
}

impl<T> Rejected<T> {
    /// Wrap a refused value
    pub fn new(error: Error, item: T) -> Self {
        Self { error, item }
    }

    /// Take the refused value back
    pub fn into_inner(self) -> T {
        self.item
    }
}

impl<T> fmt::Debug for Rejected<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Rejected")
            .field("error", &self.error)
            .finish_non_exhaustive()
    }
}

impl<T> fmt::Display for Rejected<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "rejected: {}", self.error)
    }
}

impl<T> From<Rejected<T>> for Error {
    fn from(rejected: Rejected<T>) -> Self {
        rejected.error
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::format;

    #[test]
    fn test_error_display() {
        let s = format!("{}", Error::OutOfMemory);
        assert!(s.contains("exhausted"));
    }

    #[test]
    fn test_rejected_returns_item() {
        let rejected = Rejected::new(Error::StoreFailed, 42u32);
        assert_eq!(format!("{}", rejected), "rejected: failed to store request into consumer buffer");
        assert_eq!(rejected.into_inner(), 42);
    }

    #[test]
    fn test_rejected_conversion() {
        let err: Error = Rejected::new(Error::Busy, ()).into();
        assert_eq!(err, Error::Busy);
    }
}
