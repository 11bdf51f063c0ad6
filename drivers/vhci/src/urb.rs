//! # URB Transfer Descriptors
//!
//! The slice of a caller's USB request block the broker needs to look at:
//! which function it performs and, for data transfers, which pipe it targets.

use core::fmt;

// =============================================================================
// ENDPOINT ADDRESS
// =============================================================================

/// USB endpoint address (number in bits 0..4, direction in bit 7)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct EndpointAddress(pub u8);

impl EndpointAddress {
    /// Direction bit: device to host
    pub const DIR_IN: u8 = 0x80;

    /// Build an IN endpoint address
    pub const fn input(number: u8) -> Self {
        Self((number & 0x0F) | Self::DIR_IN)
    }

    /// Build an OUT endpoint address
    pub const fn output(number: u8) -> Self {
        Self(number & 0x0F)
    }

    /// Endpoint number
    pub const fn number(self) -> u8 {
        self.0 & 0x0F
    }

    /// Is this an IN (device to host) endpoint?
    pub const fn is_in(self) -> bool {
        self.0 & Self::DIR_IN != 0
    }
}

impl fmt::Display for EndpointAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let dir = if self.is_in() { "in" } else { "out" };
        write!(f, "ep{}-{}", self.number(), dir)
    }
}

// =============================================================================
// PIPE HANDLE
// =============================================================================

/// Endpoint transfer type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PipeKind {
    /// Control pipe
    Control     = 0,
    /// Isochronous pipe
    Isochronous = 1,
    /// Bulk pipe
    Bulk        = 2,
    /// Interrupt pipe
    Interrupt   = 3,
}

/// Opaque pipe handle handed to the caller at configuration time.
///
/// Layout: endpoint address in bits 0..8, polling interval in bits 8..16,
/// pipe kind in bits 16..24.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct PipeHandle(u32);

impl PipeHandle {
    /// Pack a pipe handle
    pub const fn new(address: EndpointAddress, kind: PipeKind, interval: u8) -> Self {
        Self(address.0 as u32 | (interval as u32) << 8 | (kind as u32) << 16)
    }

    /// Wrap a raw handle value
    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    /// Raw handle value
    pub const fn raw(self) -> u32 {
        self.0
    }

    /// Endpoint address the pipe is bound to
    pub const fn address(self) -> EndpointAddress {
        EndpointAddress((self.0 & 0xFF) as u8)
    }

    /// Polling interval
    pub const fn interval(self) -> u8 {
        ((self.0 >> 8) & 0xFF) as u8
    }
}

// =============================================================================
// TRANSFER
// =============================================================================

/// URB function carried by a caller operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transfer {
    /// Bulk or interrupt transfer on a pipe
    BulkOrInterrupt {
        /// Target pipe
        pipe: PipeHandle,
    },
    /// Isochronous transfer on a pipe
    Isochronous {
        /// Target pipe
        pipe: PipeHandle,
    },
    /// Control transfer on the default pipe
    Control,
    /// Any other URB function, by raw function code
    Other(u16),
}

impl Transfer {
    /// Pipe targeted by a data transfer, if any
    pub fn pipe(&self) -> Option<PipeHandle> {
        match self {
            Transfer::BulkOrInterrupt { pipe } | Transfer::Isochronous { pipe } => Some(*pipe),
            Transfer::Control | Transfer::Other(_) => None,
        }
    }

    /// Does this transfer target the given endpoint?
    pub fn targets(&self, address: EndpointAddress) -> bool {
        self.pipe().is_some_and(|pipe| pipe.address() == address)
    }
}
