//! # Pass-through Functions
//!
//! A physical function passed through to a VM. The header is split into 4-byte slots with three
//! policies:
//!
//! | Slots                  | Policy                                                 |
//! |------------------------|--------------------------------------------------------|
//! | BARs                   | emulated, see [`VirtualBar`](super::VirtualBar)         |
//! | Command and Status     | passed through to the physical function                |
//! | everything else        | virtualized, writable only where the permission allows |
//!
//! Behind the header, MSI, MSI-X and SR-IOV are handed to the capability handler. Everything
//! else is passed through, unless the function is a quirk device.

use tracing::{debug, trace};

use crate::{
    device::{
        bus::{Request, RequestSize},
        pci::{
            address::Bdf,
            constants::config_space::{command, header_perm, offset, BAR_ENTRY_SIZE, HEADER_LENGTH},
        },
    },
    platform::{
        capability::CapabilityKind,
        iommu::DomainId,
        pci::{bar_index, bar_offset, PhysicalDevice, PhysicalPci},
        vm::{LoadOrder, VmId},
        Platform,
    },
};

use super::{Ownership, VdevContext, VdevOps, VirtualBar, VirtualDevice, VpciError};

/// Whether the header slot of `offset` has its bit set in `mask`.
const fn slot_is_set(mask: u16, offset: u32) -> bool {
    mask & (1 << (offset >> 2)) != 0
}

/// Whether `offset` lies in one of the BAR slots of the function.
const fn is_bar_offset(nr_bars: usize, offset: u32) -> bool {
    let first = offset::BAR_0 as u32;

    offset >= first && offset < first + nr_bars as u32 * BAR_ENTRY_SIZE
}

/// Copy a range of the physical Configuration Space into the virtual one.
pub(crate) fn seed_vcfg(
    pci: &dyn PhysicalPci,
    pdev: &PhysicalDevice,
    dev: &mut VirtualDevice,
    len: u32,
) {
    for reg in (0..len).step_by(4) {
        let req = Request::new(reg.into(), RequestSize::Size4);

        dev.vcfg.write_direct(req, pci.read_cfg(pdev.bdf, req).into());
    }
}

/// Move a function between IOMMU domains.
///
/// # Panics
///
/// If the IOMMU refuses the move. The function would be left in the wrong domain.
pub(crate) fn move_domain(
    platform: &Platform,
    from: Option<DomainId>,
    to: Option<DomainId>,
    bdf: Bdf,
) {
    if let Err(err) = platform.iommu.move_device(from, to, bdf.bus, bdf.devfn()) {
        panic!("failed to move iommu device {bdf} from {from:?} to {to:?}: {err}");
    }
}

/// Release the interrupt remapping entries the MSI and MSI-X capabilities of `dev` hold in
/// `vm`.
pub(crate) fn release_interrupts(platform: &Platform, vm: VmId, dev: &VirtualDevice) {
    let Some(pdev) = dev.pdev.as_ref() else {
        return;
    };

    for region in [dev.msi, dev.msix.map(|msix| msix.region)].into_iter().flatten() {
        platform
            .capabilities
            .deinit(vm, &region, pdev.bdf, platform.interrupts.as_ref());
    }
}

/// The operations of pass-through functions.
#[derive(Debug, Clone, Copy, Default)]
pub struct PassthroughOps;

impl PassthroughOps {
    fn read_header(
        dev: &VirtualDevice,
        ctx: &VdevContext<'_>,
        pdev: &PhysicalDevice,
        req: Request,
    ) -> u32 {
        let reg = req.addr as u32;

        if is_bar_offset(dev.nr_bars, reg) {
            if req.size == RequestSize::Size4 && reg % 4 == 0 {
                dev.vbars[bar_index(req.addr)].read()
            } else {
                req.size.all_ones() as u32
            }
        } else if slot_is_set(header_perm::PASSTHROUGH, reg) {
            let mut value = ctx.platform.pci.read_cfg(pdev.bdf, req);

            // A virtual function handed away from its physical function always decodes memory.
            if dev.phyfun.is_some()
                && reg == offset::COMMAND as u32
                && ctx.pf_owner != Some(dev.owner)
            {
                value |= u32::from(command::MEMORY_SPACE);
            }

            value
        } else {
            dev.vcfg.read(req) as u32
        }
    }

    fn write_header(dev: &mut VirtualDevice, ctx: &VdevContext<'_>, req: Request, value: u32) {
        let pci = ctx.platform.pci.as_ref();
        let reg = req.addr as u32;

        if is_bar_offset(dev.nr_bars, reg) {
            if req.size == RequestSize::Size4 && reg % 4 == 0 {
                Self::write_vbar(dev, ctx, bar_index(req.addr), value);
            }
            return;
        }

        let Some(pdev) = dev.pdev.as_ref() else {
            return;
        };

        if reg == offset::COMMAND as u32 {
            let phys_cmd = pci.read_cfg(
                pdev.bdf,
                Request::new(offset::COMMAND as u64, RequestSize::Size2),
            ) as u16;

            // Decoding turns back on after a reset wiped the BARs.
            if phys_cmd & command::SPACE_ENABLE == 0
                && value as u16 & command::SPACE_ENABLE != 0
                && pci.need_bar_restore(pdev)
            {
                pci.restore_bars(pdev);
            }
        }

        if !slot_is_set(header_perm::READ_ONLY, reg) {
            if slot_is_set(header_perm::PASSTHROUGH, reg) {
                pci.write_cfg(pdev.bdf, req, value);
            } else {
                dev.vcfg.write(req, value.into());
            }
        }
    }

    /// Program a BAR. Only the service VM's programming of a function it holds reaches the
    /// hardware, as its view of the function is the physical one.
    fn write_vbar(dev: &mut VirtualDevice, ctx: &VdevContext<'_>, idx: usize, value: u32) {
        let sizing = value == u32::MAX;

        dev.write_vbar(idx, value);

        if ctx.load_order != LoadOrder::ServiceVm
            || dev.owner != Ownership::Owned(ctx.vm)
            || sizing
            || dev.is_quirk()
            || dev.vbars[idx].info.is_none()
        {
            return;
        }

        let Some(pdev) = dev.pdev.as_mut() else {
            return;
        };

        let pci = ctx.platform.pci.as_ref();
        let req = Request::new(bar_offset(idx), RequestSize::Size4);

        trace!("{}: BAR{idx} <- {value:#x}", pdev.bdf);

        pci.write_cfg(pdev.bdf, req, value);
        for moved in pdev.set_bar_reg(idx, pci.read_cfg(pdev.bdf, req)) {
            dev.vbars[moved].base_hpa = pdev.bars[moved].map_or(0, |bar| bar.base);
        }

        dev.update_msix_bar();
    }
}

impl VdevOps for PassthroughOps {
    fn init(&self, dev: &mut VirtualDevice, ctx: &VdevContext<'_>) {
        let Some(pdev) = dev.pdev.clone() else {
            return;
        };
        let pci = ctx.platform.pci.as_ref();
        let caps = ctx.platform.capabilities.as_ref();

        seed_vcfg(pci, &pdev, dev, HEADER_LENGTH);

        for kind in [CapabilityKind::Msi, CapabilityKind::MsiX, CapabilityKind::SrIov] {
            if let Some(region) = caps.locate(pci, pdev.bdf, kind) {
                caps.init(&region, pci, pdev.bdf, &mut dev.vcfg);
                dev.set_capability(region);
            }
        }

        dev.nr_bars = pdev.nr_bars();
        for idx in 0..dev.nr_bars {
            dev.vbars[idx] = VirtualBar::new(pdev.bars[idx], pdev.bar_regs[idx]);
        }
        dev.update_msix_bar();

        debug!("{}: pass-through of {} in {}", dev.bdf, pdev.bdf, ctx.vm);

        move_domain(ctx.platform, None, Some(ctx.domain), pdev.bdf);
    }

    fn deinit(&self, dev: &mut VirtualDevice, ctx: &VdevContext<'_>) {
        let Some(pbdf) = dev.pdev.as_ref().map(|pdev| pdev.bdf) else {
            return;
        };

        move_domain(ctx.platform, Some(ctx.domain), None, pbdf);
        release_interrupts(ctx.platform, ctx.vm, dev);
    }

    fn read_cfg(
        &self,
        dev: &VirtualDevice,
        ctx: &VdevContext<'_>,
        req: Request,
    ) -> Result<u32, VpciError> {
        let Some(pdev) = dev.pdev.as_ref() else {
            return Err(VpciError::NotPresent(dev.bdf));
        };
        let reg = req.addr as u32;

        if reg < HEADER_LENGTH {
            Ok(Self::read_header(dev, ctx, pdev, req))
        } else if let Some(region) = dev.capability_at(reg) {
            Ok(ctx.platform.capabilities.read(&region, &dev.vcfg, req))
        } else if dev.is_quirk() {
            Err(VpciError::QuirkRegion {
                bdf: dev.bdf,
                offset: reg,
            })
        } else {
            Ok(ctx.platform.pci.read_cfg(pdev.bdf, req))
        }
    }

    fn write_cfg(
        &self,
        dev: &mut VirtualDevice,
        ctx: &VdevContext<'_>,
        req: Request,
        value: u32,
    ) -> Result<(), VpciError> {
        let Some(pbdf) = dev.pdev.as_ref().map(|pdev| pdev.bdf) else {
            return Err(VpciError::NotPresent(dev.bdf));
        };
        let reg = req.addr as u32;

        if reg < HEADER_LENGTH {
            Self::write_header(dev, ctx, req, value);
        } else if let Some(region) = dev.capability_at(reg) {
            ctx.platform
                .capabilities
                .write(&region, &mut dev.vcfg, req, value);
        } else if dev.is_quirk() {
            return Err(VpciError::QuirkRegion {
                bdf: dev.bdf,
                offset: reg,
            });
        } else {
            ctx.platform.pci.write_cfg(pbdf, req, value);
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        device::pci::constants::config_space::msix,
        platform::vm::{AssignRequest, DeviceFlags},
        vpci::{testutils::Harness, Ownership},
    };

    const NIC: Bdf = Harness::NIC_BDF;

    fn read(harness: &Harness, reg: u64, size: RequestSize) -> Result<u32, VpciError> {
        harness.service.read_cfg(NIC, Request::new(reg, size))
    }

    #[test]
    fn virtualized_header_reads_the_physical_identity() {
        let harness = Harness::new();

        assert_eq!(
            read(&harness, 0, RequestSize::Size4),
            Ok(u32::from(Harness::NIC_DEVICE_ID) << 16 | 0x8086)
        );
    }

    #[test]
    fn read_only_slots_drop_writes() {
        let harness = Harness::new();
        let before = read(&harness, 0, RequestSize::Size4);

        harness
            .service
            .write_cfg(NIC, Request::new(0, RequestSize::Size4), 0)
            .unwrap();

        assert_eq!(read(&harness, 0, RequestSize::Size4), before);
        assert!(harness.sim.pci.writes().is_empty());
    }

    #[test]
    fn command_writes_reach_the_hardware() {
        let harness = Harness::new();
        let req = Request::new(offset::COMMAND as u64, RequestSize::Size2);

        harness.service.write_cfg(NIC, req, 0x6).unwrap();

        assert_eq!(harness.sim.pci.writes(), vec![(NIC, req, 0x6)]);
        assert_eq!(read(&harness, offset::COMMAND as u64, RequestSize::Size2), Ok(0x6));
    }

    #[test]
    fn enabling_decode_after_a_reset_restores_bars() {
        let harness = Harness::new();
        let bar2 = Request::new(bar_offset(2), RequestSize::Size4);

        harness.sim.pci.reset_function(NIC);
        assert_eq!(harness.sim.pci.read_cfg(NIC, bar2), 0);

        harness
            .service
            .write_cfg(
                NIC,
                Request::new(offset::COMMAND as u64, RequestSize::Size2),
                u32::from(command::MEMORY_SPACE),
            )
            .unwrap();

        assert_eq!(harness.sim.pci.read_cfg(NIC, bar2), Harness::NIC_BAR2);
    }

    #[test]
    fn bar_accesses_must_be_aligned_dwords() {
        let harness = Harness::new();
        let bar2 = bar_offset(2);

        assert_eq!(read(&harness, bar2, RequestSize::Size2), Ok(0xFFFF));
        assert_eq!(read(&harness, bar2 + 2, RequestSize::Size2), Ok(0xFFFF));

        harness
            .service
            .write_cfg(NIC, Request::new(bar2, RequestSize::Size2), 0)
            .unwrap();

        assert_eq!(read(&harness, bar2, RequestSize::Size4), Ok(Harness::NIC_BAR2));
        assert!(harness.sim.pci.writes().is_empty());
    }

    #[test]
    fn bar_sizing_stays_virtual() {
        let harness = Harness::new();
        let bar2 = Request::new(bar_offset(2), RequestSize::Size4);

        harness.service.write_cfg(NIC, bar2, u32::MAX).unwrap();

        assert_eq!(harness.service.read_cfg(NIC, bar2), Ok(0xFFFF_F000));
        assert!(harness.sim.pci.writes().is_empty());

        harness.service.write_cfg(NIC, bar2, 0xFEC0_0000).unwrap();
        assert_eq!(harness.service.read_cfg(NIC, bar2), Ok(0xFEC0_0000));
        assert_eq!(harness.sim.pci.writes(), vec![(NIC, bar2, 0xFEC0_0000)]);
    }

    #[test]
    fn guest_bar_programming_stays_virtual() {
        let harness = Harness::with_assigned_nic();
        let bar2 = Request::new(bar_offset(2), RequestSize::Size4);

        harness
            .guest
            .write_cfg(Harness::GUEST_NIC_BDF, bar2, 0xC000_0000)
            .unwrap();

        assert_eq!(
            harness.guest.read_cfg(Harness::GUEST_NIC_BDF, bar2),
            Ok(0xC000_0000)
        );
        assert_eq!(harness.sim.pci.read_cfg(NIC, bar2), Harness::NIC_BAR2);
    }

    #[test]
    fn handed_out_functions_keep_their_bars() {
        let harness = Harness::with_assigned_nic();
        let bar2 = Request::new(bar_offset(2), RequestSize::Size4);

        harness.service.write_cfg(NIC, bar2, 0xDEAD_0000).unwrap();

        assert_eq!(harness.sim.pci.read_cfg(NIC, bar2), Harness::NIC_BAR2);
        assert!(harness.sim.pci.writes().is_empty());
    }

    #[test]
    fn assigned_functions_see_the_moved_bar() {
        let harness = Harness::new();
        let bar2 = Request::new(bar_offset(2), RequestSize::Size4);

        harness.service.write_cfg(NIC, bar2, 0xFEC0_0000).unwrap();

        {
            let table = harness.service.table.lock().unwrap();
            let dev = table.get(table.find(NIC).unwrap());

            assert_eq!(dev.vbars[2].base_hpa, 0xFEC0_0000);
            assert_eq!(dev.msix.as_ref().map(|msix| msix.mmio_hpa), Some(0xFEC0_0000));
        }

        harness
            .service
            .assign(
                &harness.guest,
                &AssignRequest::new(NIC, Harness::GUEST_NIC_BDF),
            )
            .unwrap();

        let table = harness.guest.table.lock().unwrap();
        let dev = table.get(table.find(Harness::GUEST_NIC_BDF).unwrap());

        assert_eq!(dev.vbars[2].base_hpa, 0xFEC0_0000);
        assert_eq!(dev.pdev.as_ref().map(|pdev| pdev.bar_regs[2]), Some(0xFEC0_0000));
        assert_eq!(dev.msix.as_ref().map(|msix| msix.mmio_hpa), Some(0xFEC0_0000));
    }

    #[test]
    fn capabilities_are_shadowed() {
        let harness = Harness::new();
        let msix = harness
            .sim
            .platform()
            .capabilities
            .locate(harness.sim.pci.as_ref(), NIC, CapabilityKind::MsiX)
            .unwrap();
        let control = Request::new(u64::from(msix.offset + msix::CONTROL), RequestSize::Size2);

        harness
            .service
            .write_cfg(NIC, control, u32::from(msix::control::ENABLE))
            .unwrap();

        assert_eq!(
            harness.service.read_cfg(NIC, control).map(|v| v as u16 & msix::control::ENABLE),
            Ok(msix::control::ENABLE)
        );
        assert!(harness.sim.pci.writes().is_empty());
    }

    #[test]
    fn other_registers_are_passed_through() {
        let harness = Harness::new();
        let req = Request::new(0x200, RequestSize::Size4);

        harness.service.write_cfg(NIC, req, 0x55).unwrap();

        assert_eq!(harness.sim.pci.writes(), vec![(NIC, req, 0x55)]);
    }

    #[test]
    fn quirk_devices_keep_unknown_registers_away_from_hardware() {
        let harness = Harness::new();
        let mut assign = AssignRequest::new(NIC, Harness::GUEST_NIC_BDF);
        assign.flags = DeviceFlags::QUIRK_PTDEV;
        harness.service.assign(&harness.guest, &assign).unwrap();
        harness.sim.pci.clear_writes();

        let req = Request::new(0x200, RequestSize::Size4);
        let err = Err(VpciError::QuirkRegion {
            bdf: Harness::GUEST_NIC_BDF,
            offset: 0x200,
        });

        assert_eq!(harness.guest.read_cfg(Harness::GUEST_NIC_BDF, req), err);
        assert_eq!(
            harness
                .guest
                .write_cfg(Harness::GUEST_NIC_BDF, req, 1)
                .map(|()| 0),
            err
        );
        assert!(harness.sim.pci.writes().is_empty());
    }

    #[test]
    fn assigned_virtual_functions_always_decode_memory() {
        let harness = Harness::with_virtual_function();
        let cmd = Request::new(offset::COMMAND as u64, RequestSize::Size2);
        let mse = u32::from(command::MEMORY_SPACE);

        // While the service VM owns both functions, the physical value shows.
        assert_eq!(harness.service.read_cfg(Harness::VF_BDF, cmd), Ok(0));

        harness
            .service
            .assign(
                &harness.guest,
                &AssignRequest::new(Harness::VF_BDF, Harness::GUEST_NIC_BDF),
            )
            .unwrap();

        assert_eq!(
            harness.guest.read_cfg(Harness::GUEST_NIC_BDF, cmd),
            Ok(mse)
        );
        let vf = harness
            .service
            .devices()
            .into_iter()
            .find(|dev| dev.bdf == Harness::VF_BDF)
            .unwrap();
        assert_eq!(vf.owner, Ownership::Owned(harness.guest.vm()));
    }
}
