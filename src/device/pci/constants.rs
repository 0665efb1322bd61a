//! # PCI Constants
//!
//! This module collects PCI related constants. All definitions are derived from the PCI
//! Spec, either the "PCI Local Bus Specification" or newer "PCI Express Base Specification"
//! documents.

// Allow missing docs to avoid duplicating the PCI spec for all constants.
#![allow(missing_docs)]

/// The maximum number of devices on a PCI bus.
pub const MAX_BUS_DEVICES: u8 = 32;

/// The maximum number of functions in a PCI device.
pub const MAX_DEVICE_FUNCTIONS: u8 = 8;

/// Configuration Mechanism #1: the legacy port I/O window.
pub mod pio {
    /// The CONFIG_ADDRESS register.
    pub const CONFIG_ADDRESS: u16 = 0xCF8;
    /// The ports trapped from CONFIG_ADDRESS on. Only dword accesses at CF8h are handled there.
    pub const CONFIG_ADDRESS_LEN: u16 = 4;

    /// The first port of the CONFIG_DATA window.
    pub const CONFIG_DATA: u16 = 0xCFC;
    /// CONFIG_DATA spans CFCh to CFFh.
    pub const CONFIG_DATA_LEN: u16 = 4;
}

/// Layout of the CONFIG_ADDRESS register.
///
/// ```text
///  31  30..24    23..16  15..11  10..8   7..2     1..0
/// [EN][reserved][ bus  ][ dev  ][ fn  ][ reg  ][reserved]
/// ```
pub mod config_address {
    pub const ENABLE: u32 = 1 << 31;
    pub const RESERVED: u32 = 0x7F00_0003;
    pub const BDF_SHIFT: u32 = 8;
    pub const BDF_MASK: u32 = 0xFFFF;
    pub const REGISTER_MASK: u32 = 0xFC;
}

/// The Enhanced Configuration Access Mechanism.
///
/// ```text
/// A[27:20] bus, A[19:15] device, A[14:12] function, A[11:2] register, A[1:0] byte enables
/// ```
pub mod ecam {
    /// The window covers 256 busses with 4 KiB per function.
    pub const WINDOW_SIZE: u64 = 0x1000_0000;
    /// Post-launched VMs see their ECAM window at this fixed guest physical address.
    pub const GUEST_BASE: u64 = 0xE000_0000;
    pub const FUNCTION_SHIFT: u32 = 12;
    pub const REGISTER_MASK: u64 = 0xFFF;
}

/// Constants related to the configuration space.
pub mod config_space {

    /// The extended (PCIe) config space size of a single PCI function in bytes.
    pub const SIZE: usize = 4096;

    /// The size of the standard header that precedes the capability list.
    pub const HEADER_LENGTH: u32 = 0x40;

    /// The first extended capability lives right after the legacy config space.
    pub const EXTENDED_CAPABILITIES: u32 = 0x100;

    /// The maximum number of Base Address Registers (BARs) of a type 0 header.
    pub const MAX_BARS: usize = 6;

    /// A type 1 header (PCI-to-PCI bridge) only has two BARs.
    pub const MAX_BRIDGE_BARS: usize = 2;

    /// The size in bytes of a single BAR.
    pub const BAR_ENTRY_SIZE: u32 = 4;

    /// Masks for various configuration space fields.
    pub mod mask {
        pub const CAPABILITIES_POINTER: u8 = 0xfc;
        pub const PIO_BAR_MARKER: u32 = 0x1;
        pub const PIO_BAR_ADDRESS: u32 = 0xffff_fffc;
        pub const MMIO_BAR_TYPE: u32 = 0x6;
        pub const MMIO_BAR_64_BIT: u32 = 0x4;
        pub const MMIO_BAR_PREFETCHABLE: u32 = 0x8;
        pub const MMIO_BAR_ADDRESS: u32 = 0xffff_fff0;
    }

    /// The offsets of various fields in the configuration space.
    pub mod offset {
        pub const VENDOR: usize = 0x0;
        pub const DEVICE: usize = 0x2;
        pub const COMMAND: usize = 0x4;
        pub const STATUS: usize = 0x6;
        pub const REVISION: usize = 0x8;
        pub const PROG_IF: usize = 0x9;
        pub const SUBCLASS: usize = 0xA;
        pub const CLASS: usize = 0xB;
        pub const CACHE_LINE_SIZE: usize = 0xC;
        pub const LATENCY_TIMER: usize = 0xD;
        pub const HEADER_TYPE: usize = 0xE;
        pub const BIST: usize = 0xF;

        pub const BAR_0: usize = 0x10;
        pub const BAR_1: usize = 0x14;
        pub const BAR_2: usize = 0x18;
        pub const BAR_5: usize = 0x24;

        /// Bus numbers of a type 1 header.
        pub const PRIMARY_BUS: usize = 0x18;
        pub const SUBORDINATE_BUS: usize = 0x1A;
        pub const BRIDGE_ROM_BAR: usize = 0x38;

        pub const SUBSYSTEM_VENDOR_ID: usize = 0x2C;
        pub const SUBSYSTEM_ID: usize = 0x2E;
        pub const ROM_BAR: usize = 0x30;
        pub const CAPABILITIES_POINTER: usize = 0x34;
        pub const IRQ_LINE: usize = 0x3C;
        pub const IRQ_PIN: usize = 0x3D;
        pub const MIN_GNT: usize = 0x3E;
        pub const MAX_LAT: usize = 0x3F;
    }

    /// Which 4-byte header slots are passed through or writable.
    ///
    /// Bit `n` of either mask stands for the dword at offset `4 * n`.
    pub mod header_perm {
        /// Only Command and Status (0x04-0x07) reach the physical device.
        pub const PASSTHROUGH: u16 = 0x0002;
        /// Command, Status and the BARs (0x10-0x27) are writable.
        pub const READ_ONLY: u16 = !0x03f2;
    }

    /// The device vendor.
    pub mod vendor {
        pub const INVALID: u16 = 0xFFFF;
        pub const INTEL: u16 = 0x8086;
    }

    pub mod device {
        pub const INVALID: u16 = 0xFFFF;
        pub const I440FX_HOST_BRIDGE: u16 = 0x1237;
    }

    /// Command Register Constants.
    pub mod command {
        pub const IO_SPACE: u16 = 1 << 0;
        pub const MEMORY_SPACE: u16 = 1 << 1;
        pub const SPACE_ENABLE: u16 = IO_SPACE | MEMORY_SPACE;
        pub const WRITABLE_BITS: u16 = 0x077F;
    }

    /// Status Register Constants.
    pub mod status {
        /// The device has a list of capabilities starting at
        /// [`CAPABILITIES_POINTER`](super::offset::CAPABILITIES_POINTER).
        pub const CAPABILITIES: u16 = 1 << 4;
    }

    /// PCI class constants.
    pub mod class {
        pub const NETWORK: u8 = 0x2;
        pub const BRIDGE: u8 = 0x6;
    }

    /// PCI sub-class constants.
    pub mod subclass {
        pub const ETHERNET: u8 = 0x0;
        pub const HOST_BRIDGE: u8 = 0x0;
        pub const PCI_TO_PCI_BRIDGE: u8 = 0x4;
    }

    /// PCI header type.
    ///
    /// This is usually type 0, except for PCI-to-PCI bridges and other exotic devices such as
    /// Cardbus bridges.
    pub mod header_type {
        pub const TYPE_00: u8 = 0;
        pub const BRIDGE: u8 = 1;
        pub const LAYOUT_MASK: u8 = 0x7F;
        pub const MULTIFUNCTION: u8 = 1 << 7;
    }

    /// IDs for PCI Capabilities.
    pub mod capability_id {
        pub const MSI: u8 = 0x05;
        pub const MSI_X: u8 = 0x11;
    }

    /// IDs for PCI Express extended capabilities.
    pub mod extended_capability_id {
        pub const SRIOV: u16 = 0x0010;
    }

    /// Constants for the MSI capability.
    pub mod msi {
        /// The offset of the message control register.
        pub const CONTROL: u32 = 2;

        /// Constants for the Control field.
        pub mod control {
            pub const ENABLE: u16 = 1 << 0;
            pub const MULTIPLE_MESSAGE_ENABLE: u16 = 0x7 << 4;
            pub const WRITABLE_BITS: u16 = ENABLE | MULTIPLE_MESSAGE_ENABLE;
            pub const ADDRESS_64_BIT: u16 = 1 << 7;
            pub const PER_VECTOR_MASKING: u16 = 1 << 8;
        }
    }

    /// Constants for the MSI-X capability.
    pub mod msix {
        /// The size of the MSI-X capability.
        pub const SIZE: u32 = 12;

        /// The offset of the message control register.
        pub const CONTROL: u32 = 2;
        /// The offset for MSI-X Table Offset and BAR indicator.
        pub const TABLE_INFO: u32 = 4;

        /// The size of one MSI-X table entry in bytes.
        pub const TABLE_ENTRY_SIZE: u64 = 16;

        /// The maximum number of MSI-X vectors a function can have.
        pub const MAX_VECTORS: u16 = 2048;

        /// Masks of the table info field.
        pub mod table_info {
            pub const REGION: u32 = 0b111;
            pub const OFFSET: u32 = !0b111;
        }

        /// Constants for the Control field.
        pub mod control {
            pub const TABLE_SIZE: u16 = 0x7FF;
            pub const FUNCTION_MASK: u16 = 1 << 14;
            pub const ENABLE: u16 = 1 << 15;
            pub const WRITABLE_BITS: u16 = FUNCTION_MASK | ENABLE;
        }
    }

    /// Layout of the extended capability header.
    pub mod extended_header {
        pub const ID_MASK: u32 = 0xFFFF;
        pub const VERSION_SHIFT: u32 = 16;
        pub const NEXT_SHIFT: u32 = 20;
        pub const NEXT_MASK: u32 = 0xFFC;
    }

    /// Constants for the SR-IOV extended capability.
    pub mod sriov {
        /// The size of the SR-IOV capability structure.
        pub const SIZE: u32 = 0x40;
    }
}
