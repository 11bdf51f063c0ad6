//! # URB Request Broker
//!
//! Multiplexes caller requests onto the single pull channel of the transport
//! agent for one virtual endpoint.
//!
//! ## Request flow
//!
//! ```text
//!  submit ──┬── consumer parked ──▶ store ──┬── Complete ──▶ sent ──▶ match_response
//!           │                               └── Partial ───▶ partial ──▶ complete_partial
//!           └── otherwise ─────────▶ pending ──▶ pull / fetch_next_pending ──▶ store
//! ```
//!
//! ## Locking
//!
//! One spin lock per broker guards every container and slot. It is never held
//! across the store step or across the completion of an operation.
//!
//! ## Cancellation
//!
//! [`Broker::cancel`] is just another lock holder: whichever of cancel,
//! delivery or response matching takes the lock first owns the request. A
//! request that is being stored outside the lock cannot be reached, so cancel
//! flags its tracking entry and the delivery path finishes the cancellation
//! when it relocks.
//!
//! ## Parked consumer
//!
//! Submissions that arrive during a transfer are queued. Any path that leaves
//! the consumer parked while the queue is non-empty hands it the queue head
//! before returning.

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;
use core::sync::atomic::{AtomicU64, Ordering};

use hashbrown::HashMap;
use spin::Mutex;

use crate::config::BrokerConfig;
use crate::error::{Error, Rejected, Result};
use crate::op::{CallerOp, ConsumerOp, OpId, OpStatus};
use crate::request::{ContextId, Location, Request, RequestPool};
use crate::store::{RequestStore, StoreProgress};
use crate::urb::EndpointAddress;

// =============================================================================
// OUTCOMES
// =============================================================================

/// Result of a consumer pull or a partial-transfer progress report
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pulled {
    /// Nothing pending; the consumer is parked until the next submit
    Parked,
    /// A request was fully delivered and now awaits its response
    Delivered {
        /// Sequence number of the delivered request
        seq_num: u64,
    },
    /// A request is mid-transfer; the consumer stays parked
    Partial {
        /// Sequence number of the request
        seq_num: u64,
        /// Bytes still to transfer
        bytes_remaining: usize,
    },
    /// The request was cancelled while being stored
    Cancelled {
        /// Sequence number of the request
        seq_num: u64,
    },
}

/// Result of re-indexing a fetched request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivered {
    /// The request is now waiting for its response
    Sent(u64),
    /// Its caller was cancelled meanwhile; the request is gone
    Cancelled,
}

// =============================================================================
// STATISTICS
// =============================================================================

/// Broker statistics snapshot
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BrokerStats {
    /// Requests accepted by submit
    pub submitted: u64,
    /// Requests that went through the pending queue
    pub queued: u64,
    /// Requests handed straight to a parked consumer
    pub direct_handoffs: u64,
    /// Requests fully delivered to the consumer
    pub delivered: u64,
    /// Deliveries that stopped mid-transfer
    pub partial_transfers: u64,
    /// Responses matched to a sent request
    pub matched: u64,
    /// Responses with no matching request
    pub stale_responses: u64,
    /// Requests cancelled
    pub cancelled: u64,
    /// Cancellations finished by the delivery path
    pub deferred_cancels: u64,
    /// Unlink requests submitted
    pub unlinks_submitted: u64,
    /// Unlink requests lost to allocation or submit failure
    pub unlinks_dropped: u64,
    /// Store step failures
    pub store_failures: u64,
}

#[derive(Default)]
struct BrokerCounters {
    submitted: AtomicU64,
    queued: AtomicU64,
    direct_handoffs: AtomicU64,
    delivered: AtomicU64,
    partial_transfers: AtomicU64,
    matched: AtomicU64,
    stale_responses: AtomicU64,
    cancelled: AtomicU64,
    deferred_cancels: AtomicU64,
    unlinks_submitted: AtomicU64,
    unlinks_dropped: AtomicU64,
    store_failures: AtomicU64,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

impl BrokerCounters {
    fn snapshot(&self) -> BrokerStats {
        BrokerStats {
            submitted: self.submitted.load(Ordering::Relaxed),
            queued: self.queued.load(Ordering::Relaxed),
            direct_handoffs: self.direct_handoffs.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            partial_transfers: self.partial_transfers.load(Ordering::Relaxed),
            matched: self.matched.load(Ordering::Relaxed),
            stale_responses: self.stale_responses.load(Ordering::Relaxed),
            cancelled: self.cancelled.load(Ordering::Relaxed),
            deferred_cancels: self.deferred_cancels.load(Ordering::Relaxed),
            unlinks_submitted: self.unlinks_submitted.load(Ordering::Relaxed),
            unlinks_dropped: self.unlinks_dropped.load(Ordering::Relaxed),
            store_failures: self.store_failures.load(Ordering::Relaxed),
        }
    }
}

// =============================================================================
// BROKER STATE
// =============================================================================

/// Where a tracked request sits, with the key needed to remove it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Slot {
    Pending(u64),
    Delivering,
    Partial,
    Sent(u64),
}

/// Who asked for a cancellation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CancelOrigin {
    /// The environment fired the caller's cancel routine
    Caller,
    /// The broker itself (endpoint reset); the caller's registration is
    /// still armed and must be released
    Broker,
}

#[derive(Debug, Clone, Copy)]
struct Tracked {
    slot: Slot,
    /// Cancel arrived while the request was outside the lock
    cancel_requested: Option<CancelOrigin>,
}

struct PartialTransfer<C> {
    request: Request<C>,
    bytes_remaining: usize,
    /// Caller's cancellation was registered before the transfer started
    cancel_armed: bool,
}

struct BrokerState<C, R> {
    /// Not yet delivered, keyed by submission ticket (FIFO)
    pending: BTreeMap<u64, Request<C>>,
    next_ticket: u64,
    /// Delivered, keyed by sequence number
    sent: HashMap<u64, Request<C>>,
    /// Request mid-transfer
    partial: Option<PartialTransfer<C>>,
    /// A store step, or a fetched delivery, is running outside the lock
    in_transfer: bool,
    /// The parked consumer pull
    consumer: Option<R>,
    /// Last assigned sequence number
    seq_num: u64,
    /// Requests with a caller, by operation id
    tracked: HashMap<OpId, Tracked>,
}

impl<C: CallerOp, R> BrokerState<C, R> {
    fn new(capacity: usize) -> Self {
        Self {
            pending: BTreeMap::new(),
            next_ticket: 0,
            sent: HashMap::with_capacity(capacity),
            partial: None,
            in_transfer: false,
            consumer: None,
            seq_num: 0,
            tracked: HashMap::with_capacity(capacity),
        }
    }

    fn next_seq_num(&mut self) -> u64 {
        self.seq_num += 1;
        self.seq_num
    }

    fn transfer_busy(&self) -> bool {
        self.in_transfer || self.partial.is_some()
    }

    /// A submit may hand straight to the parked consumer
    fn can_hand_off(&self) -> bool {
        self.consumer.is_some() && !self.transfer_busy() && self.pending.is_empty()
    }

    /// Record or move a request's tracking entry, keeping any deferred cancel
    fn track(&mut self, request: &Request<C>, slot: Slot) {
        if let Some(id) = request.op_id() {
            self.tracked
                .entry(id)
                .and_modify(|tracked| tracked.slot = slot)
                .or_insert(Tracked {
                    slot,
                    cancel_requested: None,
                });
        }
    }

    fn enqueue(&mut self, mut request: Request<C>) {
        let ticket = self.next_ticket;
        self.next_ticket += 1;
        self.track(&request, Slot::Pending(ticket));
        request.set_location(Location::Pending);
        self.pending.insert(ticket, request);
    }

    fn insert_sent(&mut self, mut request: Request<C>) {
        let seq_num = request.seq_num();
        self.track(&request, Slot::Sent(seq_num));
        request.set_location(Location::Sent);
        self.sent.insert(seq_num, request);
    }

    fn set_partial(&mut self, mut request: Request<C>, bytes_remaining: usize, cancel_armed: bool) {
        self.track(&request, Slot::Partial);
        request.set_location(Location::Partial);
        self.partial = Some(PartialTransfer {
            request,
            bytes_remaining,
            cancel_armed,
        });
    }

    /// Pop the pending head and give it the next sequence number
    fn take_next(&mut self) -> Option<Request<C>> {
        let (_, mut request) = self.pending.pop_first()?;
        let seq_num = self.next_seq_num();
        request.set_seq_num(seq_num);
        request.set_location(Location::Delivering);
        self.track(&request, Slot::Delivering);
        Some(request)
    }

    /// Drop the tracking entry of a request leaving the broker
    fn untrack(&mut self, request: &mut Request<C>) {
        if let Some(id) = request.op_id() {
            self.tracked.remove(&id);
        }
        request.set_location(Location::Detached);
    }

    /// Consume a deferred cancel flagged while the request was outside the lock
    fn take_cancel_request(&mut self, request: &mut Request<C>) -> Option<CancelOrigin> {
        let origin = request
            .op_id()
            .and_then(|id| self.tracked.get(&id))
            .and_then(|tracked| tracked.cancel_requested);
        if origin.is_some() {
            self.untrack(request);
        }
        origin
    }
}

// =============================================================================
// BROKER
// =============================================================================

/// Per-endpoint request broker
pub struct Broker<C, R, S> {
    /// Context identity stamped on every request
    id: ContextId,
    /// Configuration
    config: BrokerConfig,
    /// Request record pool
    pool: Arc<RequestPool<C>>,
    /// Transport encoding step
    store: S,
    /// Everything guarded by the broker lock
    state: Mutex<BrokerState<C, R>>,
    /// Statistics
    counters: BrokerCounters,
}

impl<C, R, S> Broker<C, R, S>
where
    C: CallerOp,
    R: ConsumerOp,
    S: RequestStore<C, R>,
{
    /// Create a broker for one virtual endpoint
    pub fn new(config: BrokerConfig, pool: Arc<RequestPool<C>>, store: S) -> Result<Self> {
        config.validate()?;

        let id = ContextId::next();
        log::debug!("{}: broker created (context {})", config.name, id.0);

        Ok(Self {
            id,
            config,
            pool,
            store,
            state: Mutex::new(BrokerState::new(config.tracked_capacity)),
            counters: BrokerCounters::default(),
        })
    }

    // -------------------------------------------------------------------------
    // Request lifecycle
    // -------------------------------------------------------------------------

    /// Allocate a request from the pool.
    ///
    /// On exhaustion the caller operation is handed back untouched.
    pub fn create_request(
        &self,
        caller: Option<C>,
        unlink_target: Option<u64>,
    ) -> core::result::Result<Request<C>, Rejected<Option<C>>> {
        match self.pool.allocate() {
            Ok(record) => Ok(Request::init(record, self.id, caller, unlink_target)),
            Err(error) => {
                log::warn!("{}: create_request: out of memory", self.config.name);
                Err(Rejected::new(error, caller))
            },
        }
    }

    /// Return a request to the pool.
    ///
    /// The request must not be held by any broker container. Releasing a
    /// tracked request is a bookkeeping bug: debug builds panic, release
    /// builds drop the record instead of recycling it.
    pub fn release_request(&self, request: Request<C>) {
        debug_assert_eq!(request.context(), self.id, "request released to a foreign broker");

        if request.location() != Location::Detached {
            log::error!(
                "{}: release of tracked urb {} at {:?}",
                self.config.name,
                request,
                request.location()
            );
            if cfg!(debug_assertions) {
                panic!("request released while still at {:?}", request.location());
            }
            return;
        }

        self.pool.release(request.into_record());
    }

    /// Complete a request's caller and release the request.
    ///
    /// Used once a response has been matched or a delivery has failed.
    pub fn complete_request(&self, mut request: Request<C>, status: OpStatus) {
        let caller = request.take_caller();
        self.release_request(request);
        if let Some(mut caller) = caller {
            caller.release_cancel_registration();
            caller.complete(status);
        }
    }

    // -------------------------------------------------------------------------
    // Submission
    // -------------------------------------------------------------------------

    /// Submit a request for delivery to the transport agent.
    ///
    /// `Ok` means the request is in the broker's custody and its caller will
    /// be completed later. On `Err` the request comes back untracked and the
    /// submitter completes and releases it.
    pub fn submit(&self, mut request: Request<C>) -> core::result::Result<(), Rejected<Request<C>>> {
        debug_assert_eq!(request.context(), self.id, "request submitted to a foreign broker");
        if request.location() != Location::Detached {
            return Err(Rejected::new(Error::InvalidParameter, request));
        }

        let mut guard = self.state.lock();
        if request
            .op_id()
            .is_some_and(|id| guard.tracked.contains_key(&id))
        {
            drop(guard);
            return Err(Rejected::new(Error::AlreadyTracked, request));
        }

        let consumer = if guard.can_hand_off() {
            guard.consumer.take()
        } else {
            None
        };
        let Some(mut consumer) = consumer else {
            if let Some(caller) = request.caller_mut() {
                caller.register_cancel();
                caller.mark_pending();
            }
            guard.enqueue(request);
            drop(guard);

            bump(&self.counters.submitted);
            bump(&self.counters.queued);
            log::debug!("{}: submit: urb pending", self.config.name);
            return Ok(());
        };

        guard.in_transfer = true;
        let seq_num = guard.next_seq_num();
        request.set_seq_num(seq_num);
        // Reserve the id for the duration of the store.
        guard.track(&request, Slot::Delivering);
        drop(guard);

        let progress = self.store.store(&request, &mut consumer);

        let mut guard = self.state.lock();
        guard.in_transfer = false;
        let cancelled = guard.take_cancel_request(&mut request);

        match progress {
            Ok(progress) if cancelled.is_some() => {
                match progress {
                    StoreProgress::Complete => {
                        drop(guard);
                        consumer.complete(OpStatus::Success);
                    },
                    StoreProgress::Partial { .. } => {
                        guard.consumer = Some(consumer);
                        drop(guard);
                    },
                }
                bump(&self.counters.submitted);
                bump(&self.counters.deferred_cancels);
                // Cancellation was never armed for this caller.
                self.finish_cancel(request, false);
                self.resume_parked();
                Ok(())
            },
            Ok(StoreProgress::Complete) => {
                if let Some(caller) = request.caller_mut() {
                    caller.register_cancel();
                    caller.mark_pending();
                }
                guard.insert_sent(request);
                drop(guard);

                bump(&self.counters.submitted);
                bump(&self.counters.direct_handoffs);
                bump(&self.counters.delivered);
                log::debug!("{}: submit: urb [seq:{}] delivered", self.config.name, seq_num);
                consumer.complete(OpStatus::Success);
                Ok(())
            },
            Ok(StoreProgress::Partial { bytes_remaining }) => {
                // Cancellation is armed only once the transfer completes.
                if let Some(caller) = request.caller_mut() {
                    caller.mark_pending();
                }
                guard.set_partial(request, bytes_remaining, false);
                guard.consumer = Some(consumer);
                drop(guard);

                bump(&self.counters.submitted);
                bump(&self.counters.direct_handoffs);
                bump(&self.counters.partial_transfers);
                log::debug!(
                    "{}: submit: urb [seq:{}] partial, {} bytes remaining",
                    self.config.name,
                    seq_num,
                    bytes_remaining
                );
                Ok(())
            },
            Err(error) => {
                guard.untrack(&mut request);
                guard.consumer = Some(consumer);
                drop(guard);

                bump(&self.counters.store_failures);
                log::warn!(
                    "{}: submit: failed to store urb {}: {}",
                    self.config.name,
                    request,
                    error
                );
                self.resume_parked();
                Err(Rejected::new(error, request))
            },
        }
    }

    // -------------------------------------------------------------------------
    // Consumer side
    // -------------------------------------------------------------------------

    /// Pop the oldest pending request and assign its sequence number.
    ///
    /// The request comes back outside every container and occupies the
    /// endpoint's single transfer until it is handed back with
    /// [`mark_delivered`](Self::mark_delivered) once stored, or
    /// [`abandon_delivery`](Self::abandon_delivery) if storing failed.
    /// Returns `None` while another transfer is running.
    pub fn fetch_next_pending(&self) -> Option<Request<C>> {
        let mut guard = self.state.lock();
        if guard.transfer_busy() {
            return None;
        }
        let request = guard.take_next()?;
        guard.in_transfer = true;
        drop(guard);

        log::debug!("{}: fetched pending urb {}", self.config.name, request);
        Some(request)
    }

    /// Move a fetched request into the sent index
    pub fn mark_delivered(&self, mut request: Request<C>) -> Delivered {
        let mut guard = self.state.lock();
        guard.in_transfer = false;
        if let Some(origin) = guard.take_cancel_request(&mut request) {
            drop(guard);
            bump(&self.counters.deferred_cancels);
            self.finish_cancel(request, origin == CancelOrigin::Broker);
            self.resume_parked();
            return Delivered::Cancelled;
        }

        let seq_num = request.seq_num();
        guard.insert_sent(request);
        drop(guard);

        bump(&self.counters.delivered);
        self.resume_parked();
        Delivered::Sent(seq_num)
    }

    /// Take back a fetched request whose delivery failed.
    ///
    /// Returns `None` when its caller was cancelled meanwhile; the broker has
    /// then already finished the cancellation.
    pub fn abandon_delivery(&self, mut request: Request<C>) -> Option<Request<C>> {
        let mut guard = self.state.lock();
        guard.in_transfer = false;
        if let Some(origin) = guard.take_cancel_request(&mut request) {
            drop(guard);
            bump(&self.counters.deferred_cancels);
            self.finish_cancel(request, origin == CancelOrigin::Broker);
            self.resume_parked();
            return None;
        }

        guard.untrack(&mut request);
        drop(guard);
        self.resume_parked();
        Some(request)
    }

    /// Serve a pull from the transport agent.
    ///
    /// Delivers the oldest pending request into the consumer, or parks the
    /// consumer until the next submit. A second pull while one is parked or
    /// a transfer is running is refused and completed with `Busy`.
    pub fn pull(&self, consumer: R) -> Result<Pulled> {
        let mut guard = self.state.lock();
        if guard.consumer.is_some() || guard.transfer_busy() {
            drop(guard);
            log::warn!("{}: pull: consumer slot busy", self.config.name);
            consumer.complete(OpStatus::Failed(Error::Busy));
            return Err(Error::Busy);
        }

        let Some(request) = guard.take_next() else {
            guard.consumer = Some(consumer);
            return Ok(Pulled::Parked);
        };
        guard.in_transfer = true;
        drop(guard);

        let outcome = self.deliver(request, consumer);
        self.resume_parked();
        outcome
    }

    /// Store a request taken off the pending queue and file it by outcome.
    ///
    /// Entered with the transfer flag set.
    fn deliver(&self, mut request: Request<C>, mut consumer: R) -> Result<Pulled> {
        let seq_num = request.seq_num();
        let progress = self.store.store(&request, &mut consumer);

        let mut guard = self.state.lock();
        guard.in_transfer = false;
        let cancelled = guard.take_cancel_request(&mut request);

        match progress {
            Ok(progress) if cancelled.is_some() => {
                match progress {
                    StoreProgress::Complete => {
                        drop(guard);
                        consumer.complete(OpStatus::Success);
                    },
                    StoreProgress::Partial { .. } => {
                        guard.consumer = Some(consumer);
                        drop(guard);
                    },
                }
                bump(&self.counters.deferred_cancels);
                self.finish_cancel(request, cancelled == Some(CancelOrigin::Broker));
                Ok(Pulled::Cancelled { seq_num })
            },
            Ok(StoreProgress::Complete) => {
                guard.insert_sent(request);
                drop(guard);

                bump(&self.counters.delivered);
                log::debug!("{}: urb [seq:{}] delivered", self.config.name, seq_num);
                consumer.complete(OpStatus::Success);
                Ok(Pulled::Delivered { seq_num })
            },
            Ok(StoreProgress::Partial { bytes_remaining }) => {
                guard.set_partial(request, bytes_remaining, true);
                guard.consumer = Some(consumer);
                drop(guard);

                bump(&self.counters.partial_transfers);
                Ok(Pulled::Partial {
                    seq_num,
                    bytes_remaining,
                })
            },
            Err(error) => {
                if cancelled.is_none() {
                    guard.untrack(&mut request);
                }
                drop(guard);

                bump(&self.counters.store_failures);
                log::warn!(
                    "{}: failed to store urb [seq:{}]: {}",
                    self.config.name,
                    seq_num,
                    error
                );
                consumer.complete(OpStatus::Failed(error));
                match cancelled {
                    Some(origin) => {
                        bump(&self.counters.deferred_cancels);
                        self.finish_cancel(request, origin == CancelOrigin::Broker);
                    },
                    None => self.complete_request(request, OpStatus::Failed(error)),
                }
                Err(error)
            },
        }
    }

    /// Hand the pending head to a consumer left parked beside a non-empty
    /// queue (after a failed or cancelled store, or a finished fetch)
    fn resume_parked(&self) {
        loop {
            let mut guard = self.state.lock();
            if guard.transfer_busy() || guard.pending.is_empty() {
                return;
            }
            let Some(consumer) = guard.consumer.take() else {
                return;
            };
            let Some(request) = guard.take_next() else {
                guard.consumer = Some(consumer);
                return;
            };
            guard.in_transfer = true;
            drop(guard);

            log::debug!("{}: parked consumer resumed with urb {}", self.config.name, request);
            // Failures complete both sides inside deliver.
            let _ = self.deliver(request, consumer);
        }
    }

    /// Report progress of the request in the partial slot.
    ///
    /// With nothing left to transfer the request moves to the sent index and
    /// the parked consumer completes.
    pub fn complete_partial(&self, bytes_remaining: usize) -> Result<Pulled> {
        let mut guard = self.state.lock();
        match guard.partial.as_mut() {
            None => return Err(Error::NotFound),
            Some(partial) if bytes_remaining > 0 => {
                partial.bytes_remaining = bytes_remaining;
                return Ok(Pulled::Partial {
                    seq_num: partial.request.seq_num(),
                    bytes_remaining,
                });
            },
            Some(_) => {},
        }

        let Some(PartialTransfer {
            mut request,
            cancel_armed,
            ..
        }) = guard.partial.take()
        else {
            return Err(Error::NotFound);
        };

        if !cancel_armed {
            if let Some(caller) = request.caller_mut() {
                caller.register_cancel();
            }
        }
        let seq_num = request.seq_num();
        guard.insert_sent(request);
        let consumer = guard.consumer.take();
        drop(guard);

        bump(&self.counters.delivered);
        log::debug!("{}: partial urb [seq:{}] delivered", self.config.name, seq_num);
        if let Some(consumer) = consumer {
            consumer.complete(OpStatus::Success);
        }
        Ok(Pulled::Delivered { seq_num })
    }

    /// Cancel the parked consumer.
    ///
    /// Refused while a partial transfer still owns the consumer.
    pub fn cancel_consumer(&self) -> bool {
        let mut guard = self.state.lock();
        if guard.partial.is_some() {
            return false;
        }
        let consumer = guard.consumer.take();
        drop(guard);

        match consumer {
            Some(consumer) => {
                log::debug!("{}: parked consumer cancelled", self.config.name);
                consumer.complete(OpStatus::Cancelled);
                true
            },
            None => false,
        }
    }

    // -------------------------------------------------------------------------
    // Responses
    // -------------------------------------------------------------------------

    /// Take the sent request a response belongs to.
    ///
    /// `None` means the response is stale or duplicated and should be
    /// dropped.
    pub fn match_response(&self, seq_num: u64) -> Option<Request<C>> {
        let mut guard = self.state.lock();
        let Some(mut request) = guard.sent.remove(&seq_num) else {
            drop(guard);
            bump(&self.counters.stale_responses);
            log::debug!("{}: no sent urb for [seq:{}]", self.config.name, seq_num);
            return None;
        };
        guard.untrack(&mut request);
        drop(guard);

        bump(&self.counters.matched);
        Some(request)
    }

    // -------------------------------------------------------------------------
    // Cancellation
    // -------------------------------------------------------------------------

    /// Cancel the request carrying caller operation `id`.
    ///
    /// Called from the caller's cancel routine. Returns `false` when no such
    /// request is tracked (already completed, never submitted, or a
    /// cancellation is already under way).
    pub fn cancel(&self, id: OpId) -> bool {
        self.cancel_with(id, CancelOrigin::Caller)
    }

    fn cancel_with(&self, id: OpId, origin: CancelOrigin) -> bool {
        let mut guard = self.state.lock();
        let state = &mut *guard;

        let Some(tracked) = state.tracked.get_mut(&id) else {
            drop(guard);
            log::debug!("{}: cancel: no matching urb for {}", self.config.name, id);
            return false;
        };

        let taken = match tracked.slot {
            Slot::Delivering => {
                if tracked.cancel_requested.is_some() {
                    return false;
                }
                tracked.cancel_requested = Some(origin);
                drop(guard);
                log::debug!("{}: cancel: {} deferred to delivery", self.config.name, id);
                return true;
            },
            Slot::Pending(ticket) => state.pending.remove(&ticket).map(|request| (request, true)),
            Slot::Sent(seq_num) => state.sent.remove(&seq_num).map(|request| (request, true)),
            Slot::Partial => state
                .partial
                .take()
                .map(|partial| (partial.request, partial.cancel_armed)),
        };
        state.tracked.remove(&id);
        drop(guard);

        match taken {
            Some((mut request, armed)) => {
                request.set_location(Location::Detached);
                self.finish_cancel(request, armed && origin == CancelOrigin::Broker);
                self.resume_parked();
                true
            },
            None => {
                log::error!("{}: cancel: tracking index out of sync for {}", self.config.name, id);
                false
            },
        }
    }

    /// Operations of every queued, partial or sent request on an endpoint
    pub fn ops_for_endpoint(&self, address: EndpointAddress) -> Vec<OpId> {
        let guard = self.state.lock();
        guard
            .pending
            .values()
            .chain(guard.sent.values())
            .chain(guard.partial.as_ref().map(|partial| &partial.request))
            .filter(|request| request.belongs_to_endpoint(address))
            .filter_map(Request::op_id)
            .collect()
    }

    /// Cancel every request addressed to an endpoint (endpoint reset).
    ///
    /// The broker starts these cancellations itself, so each caller's cancel
    /// registration is released before it completes.
    pub fn cancel_endpoint(&self, address: EndpointAddress) -> usize {
        let cancelled = self
            .ops_for_endpoint(address)
            .into_iter()
            .filter(|id| self.cancel_with(*id, CancelOrigin::Broker))
            .count();
        log::debug!(
            "{}: {} urbs cancelled on {}",
            self.config.name,
            cancelled,
            address
        );
        cancelled
    }

    /// Unlink the remote side, release the request and complete its caller
    fn finish_cancel(&self, mut request: Request<C>, release_registration: bool) {
        bump(&self.counters.cancelled);
        self.submit_unlink(request.seq_num());

        let caller = request.take_caller();
        log::debug!("{}: cancelled urb destroyed: {}", self.config.name, request);
        self.release_request(request);

        if let Some(mut caller) = caller {
            if release_registration {
                caller.release_cancel_registration();
            }
            caller.complete(OpStatus::Cancelled);
        }
    }

    /// Best effort: a lost unlink only delays remote cleanup
    fn submit_unlink(&self, seq_num: u64) {
        let unlink = match self.create_request(None, Some(seq_num)) {
            Ok(unlink) => unlink,
            Err(rejected) => {
                bump(&self.counters.unlinks_dropped);
                log::warn!(
                    "{}: failed to allocate unlink urb for [seq:{}]: {}",
                    self.config.name,
                    seq_num,
                    rejected.error
                );
                return;
            },
        };

        match self.submit(unlink) {
            Ok(()) => bump(&self.counters.unlinks_submitted),
            Err(rejected) => {
                bump(&self.counters.unlinks_dropped);
                log::warn!(
                    "{}: failed to submit unlink urb {}: {}",
                    self.config.name,
                    rejected.item,
                    rejected.error
                );
                self.release_request(rejected.into_inner());
            },
        }
    }

    // -------------------------------------------------------------------------
    // Introspection
    // -------------------------------------------------------------------------

    /// Context identity
    pub fn id(&self) -> ContextId {
        self.id
    }

    /// Endpoint name
    pub fn name(&self) -> &'static str {
        self.config.name
    }

    /// Statistics snapshot
    pub fn stats(&self) -> BrokerStats {
        self.counters.snapshot()
    }

    /// Number of pending requests
    pub fn pending_len(&self) -> usize {
        self.state.lock().pending.len()
    }

    /// Number of requests awaiting a response
    pub fn sent_len(&self) -> usize {
        self.state.lock().sent.len()
    }

    /// Is a sent request with this sequence number waiting?
    pub fn is_sent(&self, seq_num: u64) -> bool {
        self.state.lock().sent.contains_key(&seq_num)
    }

    /// Is a partial transfer in progress?
    pub fn has_partial(&self) -> bool {
        self.state.lock().partial.is_some()
    }

    /// Bytes remaining on the partial transfer, if one is in progress
    pub fn partial_bytes_remaining(&self) -> Option<usize> {
        self.state
            .lock()
            .partial
            .as_ref()
            .map(|partial| partial.bytes_remaining)
    }

    /// Is a consumer parked?
    pub fn has_consumer(&self) -> bool {
        self.state.lock().consumer.is_some()
    }

    /// Is a caller operation tracked?
    pub fn is_tracked(&self, id: OpId) -> bool {
        self.state.lock().tracked.contains_key(&id)
    }

    /// Last assigned sequence number
    pub fn last_seq_num(&self) -> u64 {
        self.state.lock().seq_num
    }

    /// No request is queued, in transfer, sent or tracked
    pub fn is_idle(&self) -> bool {
        let state = self.state.lock();
        state.pending.is_empty()
            && state.sent.is_empty()
            && state.partial.is_none()
            && !state.in_transfer
            && state.tracked.is_empty()
    }
}

impl<C, R, S> fmt::Debug for Broker<C, R, S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Broker")
            .field("name", &self.config.name)
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::boxed::Box;

    struct Op(u64);

    impl CallerOp for Op {
        fn id(&self) -> OpId {
            OpId(self.0)
        }
        fn mark_pending(&mut self) {}
        fn register_cancel(&mut self) {}
        fn release_cancel_registration(&mut self) {}
        fn complete(self, _status: OpStatus) {}
    }

    fn request(id: u64) -> Request<Op> {
        Request::init(Box::default(), ContextId(1), Some(Op(id)), None)
    }

    fn state() -> BrokerState<Op, ()> {
        BrokerState::new(8)
    }

    #[test]
    fn test_take_next_is_fifo() {
        let mut state = state();
        state.enqueue(request(10));
        state.enqueue(request(11));
        assert_eq!(state.tracked[&OpId(10)].slot, Slot::Pending(0));

        let first = state.take_next().unwrap();
        let second = state.take_next().unwrap();
        assert_eq!((first.op_id(), first.seq_num()), (Some(OpId(10)), 1));
        assert_eq!((second.op_id(), second.seq_num()), (Some(OpId(11)), 2));
        assert_eq!(first.location(), Location::Delivering);
        assert_eq!(state.tracked[&OpId(11)].slot, Slot::Delivering);
        assert!(state.take_next().is_none());
    }

    #[test]
    fn test_deferred_cancel_flag() {
        let mut state = state();
        state.enqueue(request(1));
        let mut req = state.take_next().unwrap();
        assert_eq!(state.take_cancel_request(&mut req), None);

        state.tracked.get_mut(&OpId(1)).unwrap().cancel_requested = Some(CancelOrigin::Broker);
        assert_eq!(state.take_cancel_request(&mut req), Some(CancelOrigin::Broker));
        assert!(state.tracked.is_empty());
        assert_eq!(req.location(), Location::Detached);
    }

    #[test]
    fn test_transfer_busy() {
        let mut state = state();
        assert!(!state.transfer_busy());
        state.in_transfer = true;
        assert!(state.transfer_busy());
        state.in_transfer = false;

        let mut req = request(1);
        req.set_seq_num(state.next_seq_num());
        state.set_partial(req, 16, false);
        assert!(state.transfer_busy());
        assert_eq!(state.tracked[&OpId(1)].slot, Slot::Partial);
    }

    #[test]
    fn test_unlinks_are_untracked() {
        let mut state = state();
        let mut unlink = Request::<Op>::init(Box::default(), ContextId(1), None, Some(3));
        unlink.set_seq_num(state.next_seq_num());
        state.insert_sent(unlink);
        assert!(state.tracked.is_empty());
        assert_eq!(state.sent[&1].unlink_target(), Some(3));
    }
}
