//! # Virtual Machine Configuration
//!
//! The static description of a VM as far as PCI is concerned, plus the request the device model
//! sends to hand a physical function to a guest.

use std::fmt;

use crate::{
    device::pci::{address::Bdf, constants::config_space::MAX_BARS},
    platform::pci::PhysicalDevice,
    vpci::VdevOpsRef,
};

/// The identifier of a virtual machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct VmId(pub u16);

impl fmt::Display for VmId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "vm{}", self.0)
    }
}

/// When and by whom a VM is started.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadOrder {
    /// Started by the hypervisor at boot with a static device set.
    PreLaunched,
    /// The privileged service VM that hosts the device model.
    ServiceVm,
    /// A guest started later by the device model in the service VM.
    PostLaunched,
}

/// How a configured PCI function is emulated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmulationType {
    /// A physical function passed through to the VM.
    PassThrough,
    /// A purely virtual function backed by custom operations.
    Virtual,
}

/// Per-function flags set by the device model when it assigns a function.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DeviceFlags(pub u32);

impl DeviceFlags {
    /// The function needs full virtualization outside its header and capabilities. The device
    /// model handles everything the hypervisor does not.
    pub const QUIRK_PTDEV: Self = Self(1 << 0);

    /// No flags set.
    #[must_use]
    pub const fn empty() -> Self {
        Self(0)
    }

    /// Whether all flags in `other` are set.
    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl std::ops::BitOr for DeviceFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl std::ops::BitOrAssign for DeviceFlags {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

/// The static configuration of one PCI function of a VM.
#[derive(Debug, Clone)]
pub struct PciDevConfig {
    /// Where the VM sees the function.
    pub vbdf: Bdf,

    /// How the function is emulated.
    pub emu_type: EmulationType,

    /// The physical function behind a pass-through device.
    pub pdev: Option<PhysicalDevice>,

    /// Custom operations. Pass-through devices leave this empty and get the bridge or
    /// pass-through operations depending on their header type.
    pub ops: Option<VdevOpsRef>,
}

impl PciDevConfig {
    /// Pass the physical function `pdev` through at `vbdf`.
    #[must_use]
    pub fn passthrough(vbdf: Bdf, pdev: PhysicalDevice) -> Self {
        Self {
            vbdf,
            emu_type: EmulationType::PassThrough,
            pdev: Some(pdev),
            ops: None,
        }
    }

    /// Emulate a virtual function at `vbdf` with the given operations.
    #[must_use]
    pub fn emulated(vbdf: Bdf, ops: VdevOpsRef) -> Self {
        Self {
            vbdf,
            emu_type: EmulationType::Virtual,
            pdev: None,
            ops: Some(ops),
        }
    }
}

/// The static configuration of a VM.
#[derive(Debug, Clone)]
pub struct VmConfig {
    /// The VM's identifier.
    pub vm_id: VmId,

    /// How the VM is started.
    pub load_order: LoadOrder,

    /// Higher values may observe functions handed to VMs with lower values.
    pub severity: u8,

    /// The functions the VM owns from the start.
    pub pci_devs: Vec<PciDevConfig>,
}

/// A request to move a physical function from the service VM to a guest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AssignRequest {
    /// The function as the service VM sees it.
    pub phys_bdf: Bdf,

    /// Where the guest sees the function.
    pub virt_bdf: Bdf,

    /// The legacy interrupt line the guest sees.
    pub intr_line: u8,

    /// The legacy interrupt pin the guest sees.
    pub intr_pin: u8,

    /// The BAR values the guest's firmware would have programmed.
    pub bars: [u32; MAX_BARS],

    /// Extra flags for the guest's instance.
    pub flags: DeviceFlags,
}

impl AssignRequest {
    /// Assign `phys_bdf` to appear at `virt_bdf` with no interrupt pin and unprogrammed BARs.
    #[must_use]
    pub const fn new(phys_bdf: Bdf, virt_bdf: Bdf) -> Self {
        Self {
            phys_bdf,
            virt_bdf,
            intr_line: 0xFF,
            intr_pin: 0,
            bars: [0; MAX_BARS],
            flags: DeviceFlags::empty(),
        }
    }
}
