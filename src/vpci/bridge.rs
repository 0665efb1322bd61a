//! # PCI-to-PCI Bridges
//!
//! Bridges in a VM's static configuration are not passed through. The VM gets a copy of the
//! bridge's Configuration Space taken at boot, so it can walk the hierarchy behind it, while the
//! routing programmed by firmware stays untouched.

use tracing::{debug, trace};

use crate::device::{
    bus::Request,
    pci::constants::config_space::{self, HEADER_LENGTH},
};

use super::{passthrough::seed_vcfg, VdevContext, VdevOps, VirtualDevice, VpciError};

/// The type 1 header dwords a VM may change: Command and Status, bus numbers, the windows and
/// the interrupt and bridge control registers.
const WRITABLE_DWORDS: u16 = 0x9FC2;

/// The operations of bridges.
#[derive(Debug, Clone, Copy, Default)]
pub struct BridgeOps;

impl VdevOps for BridgeOps {
    fn init(&self, dev: &mut VirtualDevice, ctx: &VdevContext<'_>) {
        if let Some(pdev) = dev.pdev.clone() {
            seed_vcfg(
                ctx.platform.pci.as_ref(),
                &pdev,
                dev,
                config_space::SIZE as u32,
            );
            debug!("{}: bridge {} in {}", dev.bdf, pdev.bdf, ctx.vm);
        }
    }

    fn deinit(&self, _dev: &mut VirtualDevice, _ctx: &VdevContext<'_>) {}

    fn read_cfg(
        &self,
        dev: &VirtualDevice,
        _ctx: &VdevContext<'_>,
        req: Request,
    ) -> Result<u32, VpciError> {
        Ok(dev.vcfg.read(req) as u32)
    }

    fn write_cfg(
        &self,
        dev: &mut VirtualDevice,
        _ctx: &VdevContext<'_>,
        req: Request,
        value: u32,
    ) -> Result<(), VpciError> {
        let reg = req.addr as u32;

        if reg < HEADER_LENGTH && WRITABLE_DWORDS & (1 << (reg >> 2)) != 0 {
            dev.vcfg.write(req, value.into());
        } else {
            trace!("{}: ignoring bridge write {req} <- {value:#x}", dev.bdf);
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        device::{
            bus::RequestSize,
            pci::{
                address::Bdf,
                constants::config_space::{class, offset, subclass},
            },
        },
        platform::{
            pci::{PhysicalDevice, PhysicalPci, ResetSupport},
            sim::{self, SimPlatform},
            traps::VmTraps,
            vm::{LoadOrder, PciDevConfig, VmConfig, VmId},
        },
        vpci::Vpci,
    };
    use std::sync::Arc;

    const BRIDGE: Bdf = Bdf::new(0, 0x1c, 0);

    fn service_with_bridge() -> (SimPlatform, Arc<Vpci>) {
        let sim = SimPlatform::new(0xF000_0000);
        sim.pci
            .add_function(BRIDGE, sim::pci_bridge(), ResetSupport::NONE);

        let pdev = PhysicalDevice::probe(sim.pci.as_ref(), BRIDGE).unwrap();
        let vpci = Vpci::init(
            &VmConfig {
                vm_id: VmId(0),
                load_order: LoadOrder::ServiceVm,
                severity: 1,
                pci_devs: vec![PciDevConfig::passthrough(BRIDGE, pdev)],
            },
            sim.platform(),
            &VmTraps::new(),
        )
        .unwrap();

        sim.pci.clear_writes();
        (sim, vpci)
    }

    #[test]
    fn bridges_show_their_physical_class() {
        let (_sim, vpci) = service_with_bridge();
        let class_req = Request::new(offset::SUBCLASS as u64, RequestSize::Size2);

        assert_eq!(
            vpci.read_cfg(BRIDGE, class_req),
            Ok(u32::from(class::BRIDGE) << 8 | u32::from(subclass::PCI_TO_PCI_BRIDGE))
        );
    }

    #[test]
    fn bus_numbers_are_virtual() {
        let (sim, vpci) = service_with_bridge();
        let buses = Request::new(offset::PRIMARY_BUS as u64, RequestSize::Size4);

        vpci.write_cfg(BRIDGE, buses, 0x0002_0100).unwrap();

        assert_eq!(vpci.read_cfg(BRIDGE, buses), Ok(0x0002_0100));
        assert_eq!(sim.pci.read_cfg(BRIDGE, buses), 0);
        assert!(sim.pci.writes().is_empty());
    }

    #[test]
    fn identity_and_capabilities_are_read_only() {
        let (_sim, vpci) = service_with_bridge();
        let id = Request::new(0, RequestSize::Size4);
        let beyond = Request::new(0x80, RequestSize::Size4);
        let before = (vpci.read_cfg(BRIDGE, id), vpci.read_cfg(BRIDGE, beyond));

        vpci.write_cfg(BRIDGE, id, 0).unwrap();
        vpci.write_cfg(BRIDGE, beyond, 0x1234).unwrap();

        assert_eq!(
            (vpci.read_cfg(BRIDGE, id), vpci.read_cfg(BRIDGE, beyond)),
            before
        );
    }

    #[test]
    fn bridges_stay_out_of_the_iommu() {
        let (sim, vpci) = service_with_bridge();

        vpci.deinit(None);

        assert!(sim.iommu.moves().is_empty());
    }
}
