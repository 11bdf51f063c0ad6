//! # URB Requests
//!
//! A [`Request`] is one in-flight (or about to be in-flight) operation owned
//! by a broker. Its storage is a pooled [`RequestRecord`]; its position inside
//! the broker is an explicit [`Location`] tag rather than list linkage.

use alloc::boxed::Box;
use core::fmt;
use core::sync::atomic::{AtomicU32, Ordering};

use crate::op::{CallerOp, OpId};
use crate::pool::ObjectPool;
use crate::urb::EndpointAddress;

// =============================================================================
// CONTEXT ID
// =============================================================================

/// Identity of the broker (endpoint context) a request belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(transparent)]
pub struct ContextId(pub u32);

static NEXT_CONTEXT_ID: AtomicU32 = AtomicU32::new(1);

impl ContextId {
    /// Allocate a fresh context id
    pub fn next() -> Self {
        Self(NEXT_CONTEXT_ID.fetch_add(1, Ordering::Relaxed))
    }
}

// =============================================================================
// LOCATION
// =============================================================================

/// Where a request currently sits inside its broker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Location {
    /// Not held by any broker container
    #[default]
    Detached,
    /// Waiting in the pending queue
    Pending,
    /// Taken off the pending queue and being stored outside the lock
    Delivering,
    /// Occupying the partial-transfer slot
    Partial,
    /// Delivered, waiting for its response
    Sent,
}

// =============================================================================
// REQUEST RECORD
// =============================================================================

/// Pooled storage behind a [`Request`]
pub struct RequestRecord<C> {
    /// Sequence number, 0 until handed to the consumer
    seq_num: u64,
    /// Sequence number to abandon (unlink requests only)
    unlink_target: Option<u64>,
    /// Caller operation, absent for unlink requests
    caller: Option<C>,
    /// Owning broker
    context: ContextId,
    /// Membership tag
    location: Location,
}

impl<C> Default for RequestRecord<C> {
    fn default() -> Self {
        Self {
            seq_num: 0,
            unlink_target: None,
            caller: None,
            context: ContextId::default(),
            location: Location::Detached,
        }
    }
}

/// Pool of request records
pub type RequestPool<C> = ObjectPool<RequestRecord<C>>;

// =============================================================================
// REQUEST
// =============================================================================

/// A brokered URB request
pub struct Request<C> {
    record: Box<RequestRecord<C>>,
}

impl<C: CallerOp> Request<C> {
    pub(crate) fn init(
        mut record: Box<RequestRecord<C>>,
        context: ContextId,
        caller: Option<C>,
        unlink_target: Option<u64>,
    ) -> Self {
        record.context = context;
        record.caller = caller;
        record.unlink_target = unlink_target;
        Self { record }
    }

    /// Sequence number (0 while pending)
    pub fn seq_num(&self) -> u64 {
        self.record.seq_num
    }

    /// Sequence number this unlink request abandons
    pub fn unlink_target(&self) -> Option<u64> {
        self.record.unlink_target
    }

    /// Is this a synthetic unlink request?
    pub fn is_unlink(&self) -> bool {
        self.record.unlink_target.is_some()
    }

    /// Caller operation, if any
    pub fn caller(&self) -> Option<&C> {
        self.record.caller.as_ref()
    }

    /// Mutable caller operation, if any
    pub fn caller_mut(&mut self) -> Option<&mut C> {
        self.record.caller.as_mut()
    }

    /// Detach the caller operation
    pub fn take_caller(&mut self) -> Option<C> {
        self.record.caller.take()
    }

    /// Caller operation id, if any
    pub fn op_id(&self) -> Option<OpId> {
        self.record.caller.as_ref().map(CallerOp::id)
    }

    /// Owning broker
    pub fn context(&self) -> ContextId {
        self.record.context
    }

    /// Current membership tag
    pub fn location(&self) -> Location {
        self.record.location
    }

    /// Is this request addressed to the given endpoint?
    ///
    /// Only requests with a live caller carrying a bulk, interrupt or
    /// isochronous transfer can match.
    pub fn belongs_to_endpoint(&self, address: EndpointAddress) -> bool {
        self.caller()
            .and_then(CallerOp::transfer)
            .is_some_and(|transfer| transfer.targets(address))
    }

    pub(crate) fn set_seq_num(&mut self, seq_num: u64) {
        self.record.seq_num = seq_num;
    }

    pub(crate) fn set_location(&mut self, location: Location) {
        self.record.location = location;
    }

    pub(crate) fn into_record(self) -> Box<RequestRecord<C>> {
        self.record
    }
}

impl<C> fmt::Display for Request<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.record.unlink_target {
            Some(target) => write!(f, "[seq:{} unlink:{}]", self.record.seq_num, target),
            None => write!(f, "[seq:{}]", self.record.seq_num),
        }
    }
}

impl<C> fmt::Debug for Request<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Request")
            .field("seq_num", &self.record.seq_num)
            .field("unlink_target", &self.record.unlink_target)
            .field("has_caller", &self.record.caller.is_some())
            .field("context", &self.record.context)
            .field("location", &self.record.location)
            .finish()
    }
}
