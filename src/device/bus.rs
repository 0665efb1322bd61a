//! # Trap Bus
//!
//! This module implements the dispatch table for trapped port I/O and MMIO accesses. See
//! [`IoBus`] for a starting point.

use std::fmt::{self, Debug, Display, Formatter};
use std::{convert::TryFrom, num::NonZeroU64, ops::Range, sync::Arc};
use tracing::debug;

/// The size of bus requests.
///
/// We don't use plain integers here to prevent use with illegal
/// sizes. [`RequestSize`] can be converted from and to [`u64`].
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum RequestSize {
    Size1 = 1,
    Size2 = 2,
    Size4 = 4,
    Size8 = 8,
}

impl RequestSize {
    /// The value a read of this size returns when nobody answers.
    #[must_use]
    pub const fn all_ones(self) -> u64 {
        let empty_bits = u64::BITS - u8::BITS * (self as u32);

        !0 >> empty_bits
    }

    /// Truncate `value` to the width of this request.
    #[must_use]
    pub const fn truncate(self, value: u64) -> u64 {
        value & self.all_ones()
    }

    /// Whether `offset` is naturally aligned for an access of this size.
    #[must_use]
    pub const fn is_aligned(self, offset: u64) -> bool {
        offset & (self as u64 - 1) == 0
    }
}

impl From<RequestSize> for u8 {
    fn from(r: RequestSize) -> Self {
        r as Self
    }
}

impl From<RequestSize> for u32 {
    fn from(r: RequestSize) -> Self {
        r as Self
    }
}

impl From<RequestSize> for u64 {
    fn from(r: RequestSize) -> Self {
        r as Self
    }
}

#[allow(clippy::fallible_impl_from)]
impl From<RequestSize> for NonZeroU64 {
    fn from(r: RequestSize) -> Self {
        // This cannot panic as all valid [RequestSize]s are > 0.
        Self::new(r as u64).unwrap()
    }
}

impl Display for RequestSize {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let val = u8::from(*self);
        write!(f, "{val}")
    }
}

/// An attempt was made to convert a size into a [`RequestSize`] that
/// cannot be represented.
#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
#[error("illegal request size")]
pub struct IllegalRequestSize {}

impl TryFrom<u32> for RequestSize {
    type Error = IllegalRequestSize;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        u64::from(value).try_into()
    }
}

impl TryFrom<usize> for RequestSize {
    type Error = IllegalRequestSize;

    fn try_from(value: usize) -> Result<Self, Self::Error> {
        u64::try_from(value)
            .map_err(|_| IllegalRequestSize {})?
            .try_into()
    }
}

impl TryFrom<u64> for RequestSize {
    type Error = IllegalRequestSize;

    fn try_from(value: u64) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::Size1),
            2 => Ok(Self::Size2),
            4 => Ok(Self::Size4),
            8 => Ok(Self::Size8),
            _ => Err(IllegalRequestSize {}),
        }
    }
}

/// The address-size pair for [`IoHandler`] read/write operations.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Request {
    /// The address of the request. Handlers registered on an [`IoBus`] see addresses relative to
    /// the start of the range they claimed.
    pub addr: u64,

    /// The size of this request.
    pub size: RequestSize,
}

impl fmt::Display for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let size: u64 = self.size.into();

        write!(f, "{:#016x}+{:x}", self.addr, size)
    }
}

impl Request {
    /// Create a new request from address and size.
    #[must_use]
    pub const fn new(addr: u64, size: RequestSize) -> Self {
        Self { addr, size }
    }

    /// Split a request into individual byte requests.
    pub fn iter_bytes(&self) -> impl Iterator<Item = Self> {
        (self.addr..self.addr + u64::from(self.size))
            .map(|addr| Self::new(addr, RequestSize::Size1))
    }

    /// The range of addresses this request touches, if it does not wrap around.
    #[must_use]
    pub fn range(&self) -> Option<Range<u64>> {
        Some(self.addr..self.addr.checked_add(self.size.into())?)
    }
}

/// A handler declined a request.
///
/// The trap bus then hands the request to the external device model, which is the registered
/// fallback handler of the bus.
#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
#[error("request must be handled by the device model")]
pub struct Forward;

/// A handler for trapped port I/O or MMIO accesses.
///
/// The handler may decline any request with [`Forward`]. Declined reads and writes are then
/// replayed against the device model of the [`IoBus`] the handler is registered with.
pub trait IoHandler: Debug + Send + Sync {
    /// Return the size of the range this handler claims.
    fn size(&self) -> u64;

    /// Handle a trapped read.
    fn read(&self, req: Request) -> Result<u64, Forward>;

    /// Handle a trapped write.
    fn write(&self, req: Request, value: u64) -> Result<(), Forward>;
}

/// A reference-counting and thread-safe pointer to a trap handler.
pub type IoHandlerRef = Arc<dyn IoHandler>;

/// The handler that answers requests nobody else wants.
///
/// The usual semantics is to return all bits set for reads and ignore
/// writes.
#[derive(Debug, Clone, Default)]
pub struct DefaultHandler {
    /// The size of the default handler in bytes.
    size: u64,
    name: &'static str,
}

impl DefaultHandler {
    /// Construct a default handler that spans the complete address space.
    #[must_use]
    pub const fn new(name: &'static str) -> Self {
        Self {
            size: u64::MAX,
            name,
        }
    }

    /// Construct a default handler that spans a specific size in bytes.
    #[must_use]
    pub const fn new_with_size(name: &'static str, size: u64) -> Self {
        Self { size, name }
    }
}

impl IoHandler for DefaultHandler {
    fn size(&self) -> u64 {
        self.size
    }

    fn write(&self, req: Request, v: u64) -> Result<(), Forward> {
        debug!(
            "Ignored {} write: {:#016x}+{:x} <- {:#016x}",
            self.name,
            req.addr,
            u64::from(req.size),
            v
        );

        Ok(())
    }

    /// Return a "all-bits-set" value for the given request size.
    fn read(&self, req: Request) -> Result<u64, Forward> {
        debug!(
            // The extra space aligns the output with the
            // corresponding write debug log.
            "Ignored {} read:  {:#016x}+{:x}",
            self.name,
            req.addr,
            u64::from(req.size)
        );

        Ok(req.size.all_ones())
    }
}

#[derive(Clone, Debug)]
struct HandlerEntry {
    range: Range<u64>,
    handler: IoHandlerRef,
}

fn contains_range(outer: &Range<u64>, inner: &Range<u64>) -> bool {
    outer.start <= inner.start && inner.end <= outer.end
}

fn overlaps(a: &Range<u64>, b: &Range<u64>) -> bool {
    a.start.max(b.start) < a.end.min(b.end)
}

/// A trap dispatch table.
///
/// The bus multiplexes trapped accesses to the handlers that claimed the address. Requests that
/// are not claimed, or that a handler declines, end up at the device model.
///
/// **Note:** To simplify implementation, we've made the choice to not
/// split requests when they match multiple handlers, but treat them as
/// non-matching requests.
#[derive(Clone, Debug)]
pub struct IoBus {
    /// A vector of handlers together with the range they claim. When we
    /// add handlers, we make sure there is no overlap.
    handlers: Vec<HandlerEntry>,

    /// This handler answers any "weird" requests that straddle a handler boundary.
    error_handler: DefaultHandler,

    /// Any request that was not claimed or was declined ends up being
    /// forwarded here.
    device_model: IoHandlerRef,
}

/// An error that is thrown when a handler could not be added to a bus.
#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum AddTrapError {
    /// The new handler overlaps an existing one.
    #[error(
        "New trap for {:x}-{:x} overlaps existing trap at {:x}-{:x}",
        added_range.start, added_range.end, existing_range.start, existing_range.end
    )]
    OverlapsExistingTrap {
        /// The range that already existed on the bus.
        existing_range: Range<u64>,

        /// The range that was attempted to be added.
        added_range: Range<u64>,
    },
    /// The new handler overflows the bounds of the bus.
    #[error(
        "New trap for {:x}-{:x} overflows size of bus {:x}",
        added_range.start, added_range.end, bus_size
    )]
    TrapOutOfRange {
        /// The size of the bus that was too small to add a new handler to.
        bus_size: u64,

        /// The range that was attempted to be added.
        added_range: Range<u64>,
    },
}

impl Default for IoBus {
    fn default() -> Self {
        Self::new("<unnamed>", u64::MAX)
    }
}

impl IoBus {
    /// Construct a new bus that forwards unhandled requests to `device_model`.
    #[must_use]
    pub fn new_with_device_model(name: &'static str, device_model: IoHandlerRef) -> Self {
        Self {
            handlers: Vec::new(),
            error_handler: DefaultHandler::new_with_size(name, device_model.size()),
            device_model,
        }
    }

    /// Construct a new bus with the standard device model.
    ///
    /// See [`DefaultHandler`] for a description of how it handles
    /// requests that are not claimed by other handlers.
    #[must_use]
    pub fn new(name: &'static str, size: u64) -> Self {
        Self::new_with_device_model(name, Arc::new(DefaultHandler::new_with_size(name, size)))
    }

    /// Return the size of the address space this bus covers.
    #[must_use]
    pub fn size(&self) -> u64 {
        self.device_model.size()
    }

    /// Add a new handler to the bus that claims the given range of
    /// addresses.
    pub fn add(&mut self, start_addr: u64, handler: IoHandlerRef) -> Result<(), AddTrapError> {
        let range = start_addr..start_addr.checked_add(handler.size()).ok_or_else(|| {
            AddTrapError::TrapOutOfRange {
                bus_size: self.size(),
                added_range: start_addr..start_addr.overflowing_add(handler.size()).0,
            }
        })?;
        if range.end > self.size() {
            Err(AddTrapError::TrapOutOfRange {
                bus_size: self.size(),
                added_range: range,
            })
        } else if let Some(overlap) = self.handlers.iter().find(|e| overlaps(&e.range, &range)) {
            Err(AddTrapError::OverlapsExistingTrap {
                existing_range: overlap.range.clone(),
                added_range: range,
            })
        } else {
            self.handlers.push(HandlerEntry { range, handler });
            Ok(())
        }
    }

    /// Try to find a handler for this request.
    ///
    /// We return a transformed request (relative to the handler's
    /// claimed region) and a reference to the handler itself.
    fn to_handler_request(&self, req: Request) -> Option<(Request, &dyn IoHandler)> {
        let req_range = req.range()?;

        for entry in &self.handlers {
            // If a handler fully claims the request, we have found
            // what we came for.
            if contains_range(&entry.range, &req_range) {
                return Some((
                    Request {
                        addr: req.addr - entry.range.start,
                        ..req
                    },
                    entry.handler.as_ref(),
                ));
            }

            // If a handler partially claims the request, we consider
            // this weird and let the error handler deal with this.
            if overlaps(&entry.range, &req_range) {
                return Some((req, &self.error_handler));
            }
        }

        None
    }

    /// Dispatch a trapped read.
    pub fn read(&self, req: Request) -> u64 {
        let value = match self.to_handler_request(req) {
            Some((rel_req, handler)) => handler.read(rel_req),
            None => Err(Forward),
        };

        value
            .or_else(|Forward| self.device_model.read(req))
            .unwrap_or_else(|Forward| req.size.all_ones())
    }

    /// Dispatch a trapped write.
    pub fn write(&self, req: Request, value: u64) {
        let handled = match self.to_handler_request(req) {
            Some((rel_req, handler)) => handler.write(rel_req, value),
            None => Err(Forward),
        };

        if handled.is_err() && self.device_model.write(req, value).is_err() {
            debug!("Dropped write nobody wants: {req} <- {value:#x}");
        }
    }
}
