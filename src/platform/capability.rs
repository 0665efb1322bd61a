//! # Capability Emulation
//!
//! MSI, MSI-X and SR-IOV are emulated by dedicated handlers that the pass-through code hands the
//! matching Configuration Space ranges to. [`ShadowCapabilities`] is the default handler. It
//! locates the capabilities in the physical function and keeps a virtual copy of them.

use std::fmt::Debug;

use tracing::trace;

use crate::{
    device::{
        bus::{Request, RequestSize},
        pci::{
            address::Bdf,
            config_space::{capability_offsets, extended_capability_offsets, ConfigSpace},
            constants::config_space::{capability_id, extended_capability_id, msi, msix, sriov},
        },
    },
    platform::{iommu::InterruptRemapping, pci::PhysicalPci, vm::VmId},
};

/// The capabilities that get special treatment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CapabilityKind {
    /// Message Signaled Interrupts.
    Msi,
    /// Extended Message Signaled Interrupts.
    MsiX,
    /// Single Root I/O Virtualization.
    SrIov,
}

/// Where a capability lives in the Configuration Space.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CapabilityRegion {
    /// Which capability this is.
    pub kind: CapabilityKind,
    /// The offset of the capability header.
    pub offset: u32,
    /// The size of the capability including its header.
    pub len: u32,
}

impl CapabilityRegion {
    /// Whether a Configuration Space access at `offset` lands in this capability.
    #[must_use]
    pub const fn contains(&self, offset: u32) -> bool {
        self.offset <= offset && offset < self.offset + self.len
    }
}

/// Where the MSI-X table lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MsixTableLocation {
    /// The BAR that holds the table.
    pub bar: usize,
    /// The offset of the table inside the BAR.
    pub offset: u32,
    /// The number of table entries.
    pub entries: u16,
}

impl MsixTableLocation {
    /// Decode the table location from an MSI-X capability in `cfg`.
    #[must_use]
    pub fn read_from(region: &CapabilityRegion, cfg: &ConfigSpace) -> Self {
        let control = cfg.read(Request::new(
            u64::from(region.offset + msix::CONTROL),
            RequestSize::Size2,
        )) as u16;
        let table_info = cfg.read(Request::new(
            u64::from(region.offset + msix::TABLE_INFO),
            RequestSize::Size4,
        )) as u32;

        Self {
            bar: (table_info & msix::table_info::REGION) as usize,
            offset: table_info & msix::table_info::OFFSET,
            entries: (control & msix::control::TABLE_SIZE) + 1,
        }
    }

    /// The size of the table in bytes.
    #[must_use]
    pub fn size(&self) -> u64 {
        u64::from(self.entries) * msix::TABLE_ENTRY_SIZE
    }
}

/// The emulation of MSI, MSI-X and SR-IOV capabilities.
pub trait CapabilityHandler: Debug + Send + Sync {
    /// Find a capability in a physical function.
    fn locate(
        &self,
        pci: &dyn PhysicalPci,
        bdf: Bdf,
        kind: CapabilityKind,
    ) -> Option<CapabilityRegion>;

    /// Prepare the virtual state of a capability found by [`locate`](Self::locate).
    fn init(
        &self,
        region: &CapabilityRegion,
        pci: &dyn PhysicalPci,
        bdf: Bdf,
        vcfg: &mut ConfigSpace,
    );

    /// Release what the capability holds on behalf of `vm`.
    fn deinit(
        &self,
        vm: VmId,
        region: &CapabilityRegion,
        bdf: Bdf,
        interrupts: &dyn InterruptRemapping,
    );

    /// Read from the capability.
    fn read(&self, region: &CapabilityRegion, vcfg: &ConfigSpace, req: Request) -> u32;

    /// Write to the capability.
    fn write(&self, region: &CapabilityRegion, vcfg: &mut ConfigSpace, req: Request, value: u32);
}

/// A capability handler that keeps a virtual copy of each capability.
///
/// The ID and next pointer stay as they were found. Everything else is writable by the VM but
/// never reaches the hardware.
#[derive(Debug, Clone, Copy, Default)]
pub struct ShadowCapabilities;

/// The length of an MSI capability, which depends on its control register.
fn msi_len(control: u16) -> u32 {
    let mut len = if control & msi::control::ADDRESS_64_BIT != 0 {
        14
    } else {
        10
    };

    if control & msi::control::PER_VECTOR_MASKING != 0 {
        // Mask and pending bits.
        len += 10;
    }

    len
}

impl CapabilityHandler for ShadowCapabilities {
    fn locate(
        &self,
        pci: &dyn PhysicalPci,
        bdf: Bdf,
        kind: CapabilityKind,
    ) -> Option<CapabilityRegion> {
        let read = |req: Request| u64::from(pci.read_cfg(bdf, req));

        let (offset, len) = match kind {
            CapabilityKind::Msi => {
                let offset = u32::from(capability_offsets(read).find(|&off| {
                    pci.read_cfg(bdf, Request::new(off.into(), RequestSize::Size1))
                        == u32::from(capability_id::MSI)
                })?);
                let control = pci.read_cfg(
                    bdf,
                    Request::new(u64::from(offset + msi::CONTROL), RequestSize::Size2),
                ) as u16;

                (offset, msi_len(control))
            }
            CapabilityKind::MsiX => {
                let offset = capability_offsets(read).find(|&off| {
                    pci.read_cfg(bdf, Request::new(off.into(), RequestSize::Size1))
                        == u32::from(capability_id::MSI_X)
                })?;

                (offset.into(), msix::SIZE)
            }
            CapabilityKind::SrIov => {
                let (_, offset) = extended_capability_offsets(read)
                    .find(|&(id, _)| id == extended_capability_id::SRIOV)?;

                (offset, sriov::SIZE)
            }
        };

        trace!("{bdf}: {kind:?} capability at {offset:#x}+{len:#x}");

        Some(CapabilityRegion { kind, offset, len })
    }

    fn init(
        &self,
        region: &CapabilityRegion,
        pci: &dyn PhysicalPci,
        bdf: Bdf,
        vcfg: &mut ConfigSpace,
    ) {
        for offset in (region.offset..region.offset + region.len).step_by(4) {
            let req = Request::new(offset.into(), RequestSize::Size4);

            vcfg.write_direct(req, pci.read_cfg(bdf, req).into());
        }
    }

    fn deinit(
        &self,
        vm: VmId,
        region: &CapabilityRegion,
        bdf: Bdf,
        interrupts: &dyn InterruptRemapping,
    ) {
        match region.kind {
            CapabilityKind::Msi | CapabilityKind::MsiX => {
                interrupts.release_device_entries(vm, bdf, region.kind);
            }
            CapabilityKind::SrIov => {}
        }
    }

    fn read(&self, _region: &CapabilityRegion, vcfg: &ConfigSpace, req: Request) -> u32 {
        vcfg.read(req) as u32
    }

    fn write(&self, region: &CapabilityRegion, vcfg: &mut ConfigSpace, req: Request, value: u32) {
        let header_end = u64::from(region.offset) + 2;

        for (byte_req, byte) in req.iter_bytes().zip(value.to_le_bytes()) {
            if byte_req.addr >= header_end {
                vcfg.write_direct(byte_req, byte.into());
            }
        }
    }
}
