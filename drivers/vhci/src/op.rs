//! # Asynchronous Operations
//!
//! Contracts for the two kinds of operation the broker juggles:
//!
//! - **Caller operations**: device I/O issued against the virtual device.
//!   Each one rides inside a [`Request`](crate::Request) until a response
//!   arrives or it is cancelled.
//! - **Consumer operations**: the transport agent's pulls. At most one is
//!   parked in a broker at a time.
//!
//! Both are implemented by the operating environment. Completing an
//! operation consumes it, so an operation cannot be completed twice.

use core::fmt;

use crate::error::Error;
use crate::urb::Transfer;

// =============================================================================
// OPERATION ID
// =============================================================================

/// Stable identity of a caller operation.
///
/// The environment's cancellation machinery names the operation to cancel by
/// this id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct OpId(pub u64);

impl fmt::Display for OpId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "op#{:x}", self.0)
    }
}

static_assertions::assert_eq_size!(OpId, u64);

// =============================================================================
// OPERATION STATUS
// =============================================================================

/// Final status an operation is completed with
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpStatus {
    /// Operation succeeded
    Success,
    /// Operation was cancelled
    Cancelled,
    /// Operation failed
    Failed(Error),
}

impl OpStatus {
    /// Did the operation succeed?
    pub fn is_success(&self) -> bool {
        matches!(self, OpStatus::Success)
    }
}

// =============================================================================
// CALLER OPERATION
// =============================================================================

/// A caller's asynchronous operation (the I/O request being brokered)
pub trait CallerOp: Send {
    /// Identity used for cancellation lookup
    fn id(&self) -> OpId;

    /// Mark the operation as completing asynchronously
    fn mark_pending(&mut self);

    /// Arm cancellation.
    ///
    /// Once armed, the environment may call
    /// [`Broker::cancel`](crate::Broker::cancel) with this operation's id at
    /// any time, at most once.
    fn register_cancel(&mut self);

    /// Disarm cancellation before completing the operation normally
    fn release_cancel_registration(&mut self);

    /// Complete the operation
    fn complete(self, status: OpStatus);

    /// URB function and target pipe, if the operation carries one
    fn transfer(&self) -> Option<Transfer> {
        None
    }
}

// =============================================================================
// CONSUMER OPERATION
// =============================================================================

/// The transport agent's pull: a destination buffer waiting for one request
pub trait ConsumerOp: Send {
    /// Complete the pull
    fn complete(self, status: OpStatus);
}
