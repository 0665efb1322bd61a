//! # vPCI Lifecycle
//!
//! A VM's vPCI instance is created with the VM and torn down with it. Tearing down a guest
//! returns every function it still holds to the service VM, whether or not the device model
//! got a chance to take them back.

use std::sync::{atomic::AtomicU32, Arc, Mutex};

use tracing::{debug, info, warn};

use crate::{
    device::{
        bus::AddTrapError,
        pci::{
            address::Bdf,
            constants::{ecam, pio},
        },
    },
    platform::{
        traps::TrapRegistry,
        vm::{LoadOrder, PciDevConfig, VmConfig},
        Platform,
    },
};

use super::{
    decode::{ConfigAddressPort, ConfigDataPort, EcamWindow},
    ownership::TransferGuard,
    DeviceHandle, DeviceTable, Ownership, Vpci,
};

impl Vpci {
    /// Create the vPCI instance of a VM and register its traps.
    ///
    /// The VM gets an IOMMU domain and an entry for every function of its static configuration.
    /// Pre-launched VMs only use Configuration Mechanism #1, everybody else also gets an ECAM
    /// window. If a trap cannot be registered, nothing of the instance is left behind.
    pub fn init(
        config: &VmConfig,
        platform: Arc<Platform>,
        traps: &dyn TrapRegistry,
    ) -> Result<Arc<Self>, AddTrapError> {
        let domain = platform.iommu.create_domain(config.vm_id);
        let mmcfg_base = match config.load_order {
            LoadOrder::PreLaunched => None,
            LoadOrder::ServiceVm => Some(platform.pci.mmcfg_base()),
            LoadOrder::PostLaunched => Some(ecam::GUEST_BASE),
        };

        let vpci = Arc::new(Self {
            vm: config.vm_id,
            load_order: config.load_order,
            severity: config.severity,
            domain,
            platform,
            addr: AtomicU32::new(0),
            mmcfg_base,
            table: Mutex::new(DeviceTable::new(config.vm_id)),
        });

        // Functions are only attached once the traps are in place.
        if let Err(err) = vpci.register_traps(traps) {
            warn!("{}: cannot register vPCI traps: {err}", vpci.vm);
            vpci.platform.iommu.destroy_domain(domain);
            return Err(err);
        }

        {
            let mut table = vpci.table.lock().unwrap();
            let ctx = vpci.context(None);

            for dev in &config.pci_devs {
                table.init_vdev(&ctx, dev, None);
            }
        }

        info!(
            "{}: vPCI with {} functions in {domain}, ECAM at {mmcfg_base:x?}",
            vpci.vm,
            config.pci_devs.len()
        );

        Ok(vpci)
    }

    /// Register CF8h, CFCh and the ECAM window. Either all of them are registered or none.
    fn register_traps(self: &Arc<Self>, traps: &dyn TrapRegistry) -> Result<(), AddTrapError> {
        traps.register_pio(pio::CONFIG_ADDRESS, Arc::new(ConfigAddressPort(self.clone())))?;

        let data_port = Arc::new(ConfigDataPort(self.clone()));
        if let Err(err) = traps.register_pio(pio::CONFIG_DATA, data_port) {
            traps.unregister_pio(pio::CONFIG_ADDRESS);
            return Err(err);
        }

        if let Some(base) = self.mmcfg_base {
            let window = Arc::new(EcamWindow(self.clone()));
            if let Err(err) = traps.register_mmio(base, window) {
                traps.unregister_pio(pio::CONFIG_DATA);
                traps.unregister_pio(pio::CONFIG_ADDRESS);
                return Err(err);
            }
        }

        Ok(())
    }

    /// Add an SR-IOV virtual function of the physical function at `pf_bdf`.
    ///
    /// Returns `None` if the VM has no such physical function.
    pub fn add_vf(&self, pf_bdf: Bdf, config: &PciDevConfig) -> Option<DeviceHandle> {
        let mut table = self.table.lock().unwrap();

        let pf = table
            .find(pf_bdf)
            .filter(|&handle| table.get(handle).sriov.is_some())?;
        let handle = table.init_vdev(&self.context(None), config, Some(pf));

        debug!("{}: {} is a VF of {pf_bdf}", self.vm, config.vbdf);

        Some(handle)
    }

    /// Tear the instance down.
    ///
    /// Tearing down a guest needs the service VM, which gets back every function the guest
    /// still holds.
    ///
    /// # Panics
    ///
    /// If a guest is torn down without the service VM, or an IOMMU move fails.
    pub fn deinit(&self, service: Option<&Self>) {
        match self.load_order {
            LoadOrder::PreLaunched | LoadOrder::ServiceVm => {
                let mut table = self.table.lock().unwrap();
                self.deinit_owned(&mut table);
            }
            LoadOrder::PostLaunched => {
                let Some(service) = service else {
                    panic!("{}: guests are torn down through the service VM", self.vm);
                };
                let mut tables = TransferGuard::lock(service, self);

                for handle in tables.service.handles() {
                    if tables.service.get(handle).owner == Ownership::Owned(self.vm) {
                        info!("{}: reclaiming {}", self.vm, tables.service.get(handle).bdf);
                        tables.reclaim(service, self, handle);
                    }
                }

                self.deinit_owned(&mut tables.guest);
            }
        }

        self.platform.interrupts.release_all_entries(self.vm);
        self.platform.iommu.destroy_domain(self.domain);

        debug!("{}: vPCI torn down", self.vm);
    }

    /// Run the teardown of every function the VM owns.
    fn deinit_owned(&self, table: &mut DeviceTable) {
        for handle in table.handles() {
            if table.get(handle).owner != Ownership::Owned(self.vm) {
                continue;
            }

            let ctx = self.context(table.pf_owner(handle));
            let dev = table.get_mut(handle);
            let ops = dev.ops.clone();

            ops.deinit(dev, &ctx);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        device::{
            bus::{DefaultHandler, Request, RequestSize},
            pci::address::ConfigAddress,
        },
        platform::{
            pci::{PhysicalDevice, ResetSupport},
            sim::{self, SimPlatform},
            traps::VmTraps,
            vm::VmId,
        },
        vpci::{host_bridge::host_bridge_config, testutils::Harness},
    };

    const NIC: Bdf = Harness::NIC_BDF;

    #[test]
    fn ecam_windows_depend_on_the_load_order() {
        let sim = SimPlatform::new(0xC000_0000);
        let window = |load_order| {
            Vpci::init(
                &VmConfig {
                    vm_id: VmId(7),
                    load_order,
                    severity: 0,
                    pci_devs: Vec::new(),
                },
                sim.platform(),
                &VmTraps::new(),
            )
            .unwrap()
            .mmcfg_base()
        };

        assert_eq!(window(LoadOrder::PreLaunched), None);
        assert_eq!(window(LoadOrder::ServiceVm), Some(0xC000_0000));
        assert_eq!(window(LoadOrder::PostLaunched), Some(ecam::GUEST_BASE));
    }

    #[test]
    fn traps_are_registered_for_both_mechanisms() {
        let harness = Harness::new();
        let req = Request::new(pio::CONFIG_ADDRESS.into(), RequestSize::Size4);

        harness
            .service_traps
            .pio_write(req, ConfigAddress::new(true, NIC, 0).raw().into());

        assert_eq!(
            harness
                .service_traps
                .pio_read(Request::new(pio::CONFIG_DATA.into(), RequestSize::Size2)),
            0x8086
        );
        assert_eq!(
            harness.service_traps.mmio_read(Request::new(
                Harness::MMCFG_BASE + (u64::from(NIC.value()) << 12),
                RequestSize::Size2,
            )),
            0x8086
        );
    }

    #[test]
    fn a_second_vm_on_the_same_traps_is_rejected() {
        let harness = Harness::new();

        let err = Vpci::init(
            &VmConfig {
                vm_id: VmId(9),
                load_order: LoadOrder::PreLaunched,
                severity: 0,
                pci_devs: Vec::new(),
            },
            harness.sim.platform(),
            &harness.guest_traps,
        );

        assert!(err.is_err());
    }

    #[test]
    fn failed_init_leaves_nothing_behind() {
        let harness = Harness::new();
        let vm = VmId(9);
        let extra = Bdf::new(0, 6, 0);

        harness
            .sim
            .pci
            .add_function(extra, sim::nic(0x10d3), ResetSupport::ALL);
        let pdev = PhysicalDevice::probe(harness.sim.pci.as_ref(), extra).unwrap();

        let err = Vpci::init(
            &VmConfig {
                vm_id: vm,
                load_order: LoadOrder::PreLaunched,
                severity: 0,
                pci_devs: vec![PciDevConfig::passthrough(extra, pdev)],
            },
            harness.sim.platform(),
            &harness.guest_traps,
        );

        assert!(err.is_err());
        assert_eq!(harness.sim.iommu.attachment(extra), None);
        assert_eq!(harness.sim.iommu.domain_of(vm), None);
        assert_eq!(harness.sim.iommu.destroyed().len(), 1);
    }

    #[test]
    fn partially_registered_traps_are_withdrawn() {
        let harness = Harness::new();
        let traps = VmTraps::new();

        // Somebody else already owns the ECAM window.
        let owner = Arc::new(DefaultHandler::new_with_size("ecam", 0x1000));
        traps.register_mmio(ecam::GUEST_BASE, owner).unwrap();

        let err = Vpci::init(
            &VmConfig {
                vm_id: VmId(9),
                load_order: LoadOrder::PostLaunched,
                severity: 0,
                pci_devs: vec![host_bridge_config()],
            },
            harness.sim.platform(),
            &traps,
        );
        assert!(err.is_err());

        // Both ports are free for the next attempt.
        let retry = Vpci::init(
            &VmConfig {
                vm_id: VmId(9),
                load_order: LoadOrder::PreLaunched,
                severity: 0,
                pci_devs: Vec::new(),
            },
            harness.sim.platform(),
            &traps,
        );
        assert!(retry.is_ok());
    }

    #[test]
    fn static_functions_are_attached_to_the_vm_domain() {
        let harness = Harness::new();

        assert_eq!(
            harness.sim.iommu.domain_of(harness.service.vm()),
            Some(harness.service.domain())
        );
        assert_eq!(
            harness.sim.iommu.attachment(NIC),
            Some(harness.service.domain())
        );
    }

    #[test]
    fn guest_teardown_reclaims_functions() {
        let harness = Harness::with_assigned_nic();
        let guest = harness.guest.vm();

        harness.guest.deinit(Some(&harness.service));

        let nic = harness.service.devices()[0];
        assert_eq!(nic.owner, Ownership::Owned(harness.service.vm()));
        assert_eq!(nic.new_owner, None);
        assert_eq!(
            harness.sim.iommu.attachment(NIC),
            Some(harness.service.domain())
        );

        assert_eq!(harness.sim.interrupts.released_vms(), vec![guest]);
        assert_eq!(
            harness.sim.iommu.destroyed(),
            vec![harness.guest.domain()]
        );
        assert!(harness
            .guest
            .devices()
            .iter()
            .any(|dev| dev.owner == Ownership::Orphaned));
    }

    #[test]
    fn service_teardown_skips_functions_it_handed_out() {
        let harness = Harness::with_assigned_nic();

        harness.service.deinit(None);

        // The guest still holds the NIC.
        assert_eq!(
            harness.sim.iommu.attachment(NIC),
            Some(harness.guest.domain())
        );
        assert!(harness.sim.interrupts.released().is_empty());
    }

    #[test]
    fn service_teardown_detaches_owned_functions() {
        let harness = Harness::new();

        harness.service.deinit(None);

        assert_eq!(harness.sim.iommu.attachment(NIC), None);
        assert_eq!(
            harness
                .sim
                .interrupts
                .released()
                .iter()
                .map(|&(vm, bdf, _)| (vm, bdf))
                .collect::<Vec<_>>(),
            vec![(harness.service.vm(), NIC); 2]
        );
    }

    #[test]
    #[should_panic(expected = "through the service VM")]
    fn guests_need_the_service_vm_for_teardown() {
        let harness = Harness::new();

        harness.guest.deinit(None);
    }

    #[test]
    fn virtual_functions_link_to_their_physical_function() {
        let harness = Harness::with_virtual_function();
        {
            let table = harness.service.table.lock().unwrap();
            let vf = table.get(table.find(Harness::VF_BDF).unwrap());

            assert_eq!(vf.phyfun, table.find(Harness::PF_BDF));
        }

        // Only functions with SR-IOV have virtual functions.
        assert!(harness.service.add_vf(NIC, &host_bridge_config()).is_none());
    }
}
