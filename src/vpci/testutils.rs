//! Fixtures shared by the vPCI tests.

use std::sync::Arc;

use crate::{
    device::{
        bus::{Request, RequestSize},
        pci::address::Bdf,
    },
    platform::{
        iommu::DomainId,
        pci::{PhysicalDevice, ResetSupport},
        sim::{self, SimPlatform},
        traps::VmTraps,
        vm::{AssignRequest, LoadOrder, PciDevConfig, VmConfig, VmId},
        Platform,
    },
};

use super::{VdevContext, VdevOps, VirtualDevice, Vpci, VpciError};

/// A purely virtual function with an ID register at 0 and a scratch register at 0x40.
#[derive(Debug, Clone, Copy, Default)]
pub struct ScratchOps;

impl ScratchOps {
    /// What the function answers at offset 0.
    pub const ID: u32 = 0x1110_1af4;

    /// A context for tables built outside of a [`Vpci`].
    pub fn context(vm: VmId, platform: &Platform) -> VdevContext<'_> {
        VdevContext {
            vm,
            load_order: LoadOrder::ServiceVm,
            domain: DomainId(0),
            platform,
            pf_owner: None,
        }
    }
}

impl VdevOps for ScratchOps {
    fn init(&self, dev: &mut VirtualDevice, _ctx: &VdevContext<'_>) {
        dev.vcfg
            .write_direct(Request::new(0, RequestSize::Size4), Self::ID.into());
        dev.vcfg
            .write_direct(Request::new(0x40, RequestSize::Size4), 0);
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
        dev.vcfg.write(req, value.into());
        Ok(())
    }
}

/// A scratch function at `bdf`.
pub fn scratch_config(bdf: Bdf) -> PciDevConfig {
    PciDevConfig::emulated(bdf, Arc::new(ScratchOps))
}

/// A service VM and a guest on a simulated platform.
///
/// The service VM owns a NIC at [`Harness::NIC_BDF`]. The platform also has a hidden function at
/// [`Harness::HIDDEN_BDF`]. The guest starts with a scratch function at
/// [`Harness::SCRATCH_BDF`]. Setup writes are cleared.
pub struct Harness {
    pub sim: SimPlatform,
    pub service: Arc<Vpci>,
    pub guest: Arc<Vpci>,
    pub service_traps: VmTraps,
    pub guest_traps: VmTraps,
}

impl Harness {
    pub const SERVICE_VM: VmId = VmId(0);
    pub const GUEST_VM: VmId = VmId(1);
    pub const SERVICE_SEVERITY: u8 = 5;
    pub const GUEST_SEVERITY: u8 = 1;

    pub const MMCFG_BASE: u64 = 0xF000_0000;

    pub const SCRATCH_BDF: Bdf = Bdf::new(0, 2, 0);
    pub const NIC_BDF: Bdf = Bdf::new(0, 3, 0);
    pub const GUEST_NIC_BDF: Bdf = Bdf::new(0, 4, 0);
    pub const PF_BDF: Bdf = Bdf::new(0, 5, 0);
    pub const VF_BDF: Bdf = Bdf::new(0, 5, 1);
    pub const HIDDEN_BDF: Bdf = Bdf::new(0, 0x10, 0);

    pub const NIC_DEVICE_ID: u16 = 0x10d3;
    pub const NIC_BAR2: u32 = 0xFEB0_0000;

    fn platform() -> SimPlatform {
        let sim = SimPlatform::new(Self::MMCFG_BASE);

        sim.pci
            .add_function(Self::NIC_BDF, sim::nic(Self::NIC_DEVICE_ID), ResetSupport::ALL);
        sim.pci.program_bar(Self::NIC_BDF, 2, Self::NIC_BAR2);

        sim.pci
            .add_function(Self::HIDDEN_BDF, sim::nic(0x1539), ResetSupport::NONE);
        sim.pci.hide(Self::HIDDEN_BDF);

        sim
    }

    fn passthrough(sim: &SimPlatform, bdf: Bdf) -> PciDevConfig {
        PciDevConfig::passthrough(bdf, PhysicalDevice::probe(sim.pci.as_ref(), bdf).unwrap())
    }

    fn boot(sim: SimPlatform, service_devs: Vec<PciDevConfig>) -> Self {
        let service_traps = VmTraps::new();
        let guest_traps = VmTraps::new();

        let service = Vpci::init(
            &VmConfig {
                vm_id: Self::SERVICE_VM,
                load_order: LoadOrder::ServiceVm,
                severity: Self::SERVICE_SEVERITY,
                pci_devs: service_devs,
            },
            sim.platform(),
            &service_traps,
        )
        .unwrap();

        let guest = Vpci::init(
            &VmConfig {
                vm_id: Self::GUEST_VM,
                load_order: LoadOrder::PostLaunched,
                severity: Self::GUEST_SEVERITY,
                pci_devs: vec![scratch_config(Self::SCRATCH_BDF)],
            },
            sim.platform(),
            &guest_traps,
        )
        .unwrap();

        sim.pci.clear_writes();

        Self {
            sim,
            service,
            guest,
            service_traps,
            guest_traps,
        }
    }

    pub fn new() -> Self {
        let sim = Self::platform();
        let nic = Self::passthrough(&sim, Self::NIC_BDF);

        Self::boot(sim, vec![nic])
    }

    /// [`Harness::new`] with the NIC handed to the guest at [`Harness::GUEST_NIC_BDF`].
    pub fn with_assigned_nic() -> Self {
        let harness = Self::new();

        harness
            .service
            .assign(
                &harness.guest,
                &AssignRequest::new(Self::NIC_BDF, Self::GUEST_NIC_BDF),
            )
            .unwrap();
        harness.sim.pci.clear_writes();

        harness
    }

    /// [`Harness::new`] plus an SR-IOV NIC at [`Harness::PF_BDF`] with one virtual function
    /// at [`Harness::VF_BDF`].
    pub fn with_virtual_function() -> Self {
        let sim = Self::platform();

        sim.pci
            .add_function(Self::PF_BDF, sim::sriov_nic(), ResetSupport::ALL);
        sim.pci
            .add_function(Self::VF_BDF, sim::virtual_function(), ResetSupport::ALL);

        let nic = Self::passthrough(&sim, Self::NIC_BDF);
        let pf = Self::passthrough(&sim, Self::PF_BDF);
        let vf = Self::passthrough(&sim, Self::VF_BDF);

        let harness = Self::boot(sim, vec![nic, pf]);

        harness.service.add_vf(Self::PF_BDF, &vf).unwrap();
        harness.sim.pci.clear_writes();

        harness
    }
}
