//! # Helix VHCI Request Broker
//!
//! URB plumbing between a virtual USB host controller and the single
//! out-of-process agent that carries its traffic over the network.
//!
//! Many callers issue URBs against a virtual device concurrently. The agent
//! pulls them one at a time, ships them to the remote host and later returns
//! responses tagged with the sequence number each request was given when it
//! was pulled. Callers may abort at any point; an aborted request is removed
//! from every internal structure before its record is recycled, and an
//! *unlink* request tells the remote side to drop work already sent.
//!
//! ## Components
//!
//! - **Object Pool**: preallocated request records, O(1) non-blocking
//!   allocate/release
//! - **Broker**: pending queue, sent index, partial-transfer slot, parked
//!   consumer and cancellation tracking for one endpoint
//! - **Operations**: traits for caller I/O and agent pulls, implemented by
//!   the operating environment
//! - **Store**: the transport encoding step, implemented by the transport
//!
//! ## Usage
//!
//! ```rust,ignore
//! use alloc::sync::Arc;
//! use vhci_broker::{Broker, BrokerConfig, PoolConfig, RequestPool};
//!
//! let pool_config = PoolConfig::urb_requests(128);
//! let pool = Arc::new(RequestPool::new(pool_config)?);
//! let broker = Broker::new(BrokerConfig::for_pool("port1", &pool_config), pool, store)?;
//!
//! // Caller side
//! let request = broker.create_request(Some(irp), None)?;
//! if let Err(rejected) = broker.submit(request) {
//!     broker.complete_request(rejected.item, OpStatus::Failed(rejected.error));
//! }
//!
//! // Agent side
//! broker.pull(read)?;
//! if let Some(request) = broker.match_response(seq_num) {
//!     broker.complete_request(request, OpStatus::Success);
//! }
//! ```

#![no_std]
#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]
#![warn(clippy::all)]

extern crate alloc;

#[cfg(test)]
extern crate std;

pub mod broker;
pub mod config;
pub mod error;
pub mod op;
pub mod pool;
pub mod request;
pub mod store;
pub mod urb;

// Re-exports for convenience
pub use broker::{Broker, BrokerStats, Delivered, Pulled};
pub use config::{BrokerConfig, PoolConfig};
pub use error::{Error, Rejected, Result};
pub use op::{CallerOp, ConsumerOp, OpId, OpStatus};
pub use pool::{ObjectPool, PoolStats};
pub use request::{ContextId, Location, Request, RequestPool, RequestRecord};
pub use store::{RequestStore, StoreProgress};
pub use urb::{EndpointAddress, PipeHandle, PipeKind, Transfer};
