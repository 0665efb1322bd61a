//! # PCI Function Addressing
//!
//! Guests name PCI functions in two ways: through the CONFIG_ADDRESS register of Configuration
//! Mechanism #1 and through the address bits of an ECAM access. Both layouts are fixed by the PCI
//! specification. This module turns them into [`Bdf`] plus a register offset and back.

use std::{fmt, str::FromStr};

use super::constants::{config_address, ecam, MAX_BUS_DEVICES, MAX_DEVICE_FUNCTIONS};

/// A bus/device/function triple.
///
/// Packed into 16 bits, the bus occupies bits 15:8, the device bits 7:3 and the function bits 2:0.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Bdf {
    /// The bus number.
    pub bus: u8,
    /// The device number (5 bits).
    pub dev: u8,
    /// The function number (3 bits).
    pub func: u8,
}

impl Bdf {
    /// Create a new BDF. Out-of-range device or function numbers are a programming error.
    #[must_use]
    pub const fn new(bus: u8, dev: u8, func: u8) -> Self {
        assert!(dev < MAX_BUS_DEVICES);
        assert!(func < MAX_DEVICE_FUNCTIONS);

        Self { bus, dev, func }
    }

    /// Unpack a BDF from its 16-bit representation.
    #[must_use]
    pub const fn from_value(value: u16) -> Self {
        Self {
            bus: (value >> 8) as u8,
            dev: ((value >> 3) & 0x1F) as u8,
            func: (value & 0x7) as u8,
        }
    }

    /// Pack the BDF into its 16-bit representation.
    #[must_use]
    pub const fn value(self) -> u16 {
        (self.bus as u16) << 8 | (self.dev as u16) << 3 | self.func as u16
    }

    /// The combined device/function byte, which is how the IOMMU addresses a function on a bus.
    #[must_use]
    pub const fn devfn(self) -> u8 {
        self.dev << 3 | self.func
    }
}

impl fmt::Display for Bdf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02x}:{:02x}.{:x}", self.bus, self.dev, self.func)
    }
}

/// A string could not be parsed as `bus:dev.func`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid BDF {0:?}, expected bus:dev.func in hex")]
pub struct ParseBdfError(String);

impl FromStr for Bdf {
    type Err = ParseBdfError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || ParseBdfError(s.to_owned());

        let (bus, rest) = s.split_once(':').ok_or_else(err)?;
        let (dev, func) = rest.split_once('.').ok_or_else(err)?;

        let bus = u8::from_str_radix(bus, 16).map_err(|_| err())?;
        let dev = u8::from_str_radix(dev, 16).map_err(|_| err())?;
        let func = u8::from_str_radix(func, 16).map_err(|_| err())?;

        if dev >= MAX_BUS_DEVICES || func >= MAX_DEVICE_FUNCTIONS {
            return Err(err());
        }

        Ok(Self { bus, dev, func })
    }
}

/// The value of the CONFIG_ADDRESS register (port CF8h).
///
/// See [`config_address`] for the layout. Reserved bits are never stored, so
/// `ConfigAddress::from_raw(x).raw()` only differs from `x` in those bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ConfigAddress(u32);

impl ConfigAddress {
    /// Take a value as written by the guest, dropping reserved bits.
    #[must_use]
    pub const fn from_raw(value: u32) -> Self {
        Self(value & !config_address::RESERVED)
    }

    /// Build the register value that selects `reg` of `bdf`.
    #[must_use]
    pub const fn new(enable: bool, bdf: Bdf, reg: u32) -> Self {
        let enable = if enable { config_address::ENABLE } else { 0 };

        Self(
            enable
                | (bdf.value() as u32) << config_address::BDF_SHIFT
                | (reg & config_address::REGISTER_MASK),
        )
    }

    /// The register value as the guest reads it back.
    #[must_use]
    pub const fn raw(self) -> u32 {
        self.0
    }

    /// Whether the guest armed the data window.
    #[must_use]
    pub const fn enabled(self) -> bool {
        self.0 & config_address::ENABLE != 0
    }

    /// The function the data window points at.
    #[must_use]
    pub const fn bdf(self) -> Bdf {
        Bdf::from_value(((self.0 >> config_address::BDF_SHIFT) & config_address::BDF_MASK) as u16)
    }

    /// The dword-aligned register offset the data window points at.
    #[must_use]
    pub const fn register(self) -> u32 {
        self.0 & config_address::REGISTER_MASK
    }
}

/// Decode an ECAM access at `offset` bytes into the ECAM window.
///
/// Returns the addressed function and the register offset inside its 4 KiB page.
#[must_use]
pub const fn decode_ecam(offset: u64) -> (Bdf, u32) {
    (
        Bdf::from_value((offset >> ecam::FUNCTION_SHIFT) as u16),
        (offset & ecam::REGISTER_MASK) as u32,
    )
}

/// The offset into the ECAM window that addresses `reg` of `bdf`.
#[must_use]
pub const fn ecam_offset(bdf: Bdf, reg: u32) -> u64 {
    (bdf.value() as u64) << ecam::FUNCTION_SHIFT | (reg as u64 & ecam::REGISTER_MASK)
}
