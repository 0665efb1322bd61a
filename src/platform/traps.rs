//! # Trap Registration
//!
//! The hypervisor decides which guest port I/O and MMIO accesses it intercepts. Components claim
//! address ranges through [`TrapRegistry`].

use crate::device::{
    bus::{AddTrapError, IoHandlerRef, Request},
    dynamic_bus::TrapTable,
};

/// The size of the x86 port I/O space.
const PIO_SPACE_SIZE: u64 = 0x1_0000;

/// Where components register the accesses they want to intercept.
pub trait TrapRegistry {
    /// Intercept port I/O starting at `base`. The handler's size is the number of ports.
    fn register_pio(&self, base: u16, handler: IoHandlerRef) -> Result<(), AddTrapError>;

    /// Intercept MMIO starting at the guest physical address `base`.
    fn register_mmio(&self, base: u64, handler: IoHandlerRef) -> Result<(), AddTrapError>;

    /// Stop intercepting the port I/O registered at `base`.
    fn unregister_pio(&self, base: u16);

    /// Stop intercepting the MMIO registered at `base`.
    fn unregister_mmio(&self, base: u64);
}

/// The intercepted address spaces of one VM.
///
/// Accesses nobody claims, and accesses a handler forwards, go to the device model, which lives
/// outside the hypervisor.
#[derive(Debug)]
pub struct VmTraps {
    pio: TrapTable,
    mmio: TrapTable,
}

impl Default for VmTraps {
    fn default() -> Self {
        Self::new()
    }
}

impl VmTraps {
    /// Create empty trap tables.
    #[must_use]
    pub fn new() -> Self {
        Self {
            pio: TrapTable::new("port I/O", PIO_SPACE_SIZE),
            mmio: TrapTable::new("memory", u64::MAX),
        }
    }

    /// Route unhandled port I/O to `model`.
    pub fn set_pio_device_model(&self, model: IoHandlerRef) {
        self.pio.set_device_model(model);
    }

    /// Route unhandled MMIO to `model`.
    pub fn set_mmio_device_model(&self, model: IoHandlerRef) {
        self.mmio.set_device_model(model);
    }

    /// A trapped port read.
    pub fn pio_read(&self, req: Request) -> u64 {
        self.pio.read(req)
    }

    /// A trapped port write.
    pub fn pio_write(&self, req: Request, value: u64) {
        self.pio.write(req, value);
    }

    /// A trapped MMIO read.
    pub fn mmio_read(&self, req: Request) -> u64 {
        self.mmio.read(req)
    }

    /// A trapped MMIO write.
    pub fn mmio_write(&self, req: Request, value: u64) {
        self.mmio.write(req, value);
    }
}

impl TrapRegistry for VmTraps {
    fn register_pio(&self, base: u16, handler: IoHandlerRef) -> Result<(), AddTrapError> {
        self.pio.add(base.into(), handler)
    }

    fn register_mmio(&self, base: u64, handler: IoHandlerRef) -> Result<(), AddTrapError> {
        self.mmio.add(base, handler)
    }

    fn unregister_pio(&self, base: u16) {
        self.pio.remove(base.into());
    }

    fn unregister_mmio(&self, base: u64) {
        self.mmio.remove(base);
    }
}
