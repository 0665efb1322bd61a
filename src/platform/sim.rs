//! # Simulated Platform
//!
//! In-memory stand-ins for the physical PCI segment, the IOMMU and the interrupt remapping
//! tables. They record what the vPCI code asks of them, so tests and the demonstration binary
//! can observe every side effect.

use std::{
    collections::{BTreeMap, BTreeSet},
    sync::{
        atomic::{AtomicBool, AtomicU16, Ordering},
        Arc, Mutex,
    },
};

use tracing::{debug, trace};

use crate::{
    device::{
        bus::{Request, RequestSize},
        pci::{
            address::Bdf,
            config_space::{ConfigSpace, ConfigSpaceBuilder},
            constants::config_space::{class, subclass, vendor},
        },
    },
    platform::{
        capability::{CapabilityKind, ShadowCapabilities},
        iommu::{DomainId, InterruptRemapping, Iommu, IommuError},
        pci::{bar_offset, PhysicalPci, ResetSupport},
        vm::VmId,
        Platform,
    },
};

/// A typical network function: a 64-bit BAR at 0, MSI-X in BAR 2 and an I/O BAR at 4.
#[must_use]
pub fn nic(device_id: u16) -> ConfigSpace {
    ConfigSpaceBuilder::new(vendor::INTEL, device_id)
        .class(class::NETWORK, subclass::ETHERNET, 0)
        .interrupt_pin(1)
        .mem64_prefetchable_bar(0, 0x4000)
        .mem32_nonprefetchable_bar(2, 0x1000)
        .io_bar(4, 0x20)
        .msi_capability(true)
        .msix_capability(8, 2, 0x0, 2, 0x800)
        .config_space()
}

/// A network function that can spawn virtual functions.
#[must_use]
pub fn sriov_nic() -> ConfigSpace {
    ConfigSpaceBuilder::new(vendor::INTEL, 0x1521)
        .class(class::NETWORK, subclass::ETHERNET, 0)
        .mem32_nonprefetchable_bar(0, 0x2_0000)
        .msix_capability(4, 0, 0x1_0000, 0, 0x1_8000)
        .sriov_capability(8)
        .config_space()
}

/// A virtual function of [`sriov_nic`].
#[must_use]
pub fn virtual_function() -> ConfigSpace {
    ConfigSpaceBuilder::new(vendor::INTEL, 0x1520)
        .class(class::NETWORK, subclass::ETHERNET, 0)
        .mem32_nonprefetchable_bar(0, 0x4000)
        .msix_capability(2, 0, 0x2000, 0, 0x3000)
        .config_space()
}

/// A PCI-to-PCI bridge.
#[must_use]
pub fn pci_bridge() -> ConfigSpace {
    ConfigSpaceBuilder::new(vendor::INTEL, 0x9d10)
        .class(class::BRIDGE, subclass::PCI_TO_PCI_BRIDGE, 0)
        .bridge()
        .config_space()
}

#[derive(Debug)]
struct SimFunction {
    config: ConfigSpace,
    reset: ResetSupport,
}

#[derive(Debug, Default)]
struct SimSegment {
    functions: BTreeMap<Bdf, SimFunction>,
    hidden: BTreeSet<Bdf>,
    writes: Vec<(Bdf, Request, u32)>,
}

/// A PCI segment whose functions are emulated Configuration Spaces.
#[derive(Debug, Default)]
pub struct SimulatedPci {
    mmcfg_base: u64,
    segment: Mutex<SimSegment>,
}

impl SimulatedPci {
    /// Create an empty segment whose ECAM window firmware reports at `mmcfg_base`.
    #[must_use]
    pub fn new(mmcfg_base: u64) -> Self {
        Self {
            mmcfg_base,
            segment: Mutex::default(),
        }
    }

    /// Plug a function into the segment.
    pub fn add_function(&self, bdf: Bdf, config: ConfigSpace, reset: ResetSupport) {
        debug!("Simulated function at {bdf}");

        self.segment
            .lock()
            .unwrap()
            .functions
            .insert(bdf, SimFunction { config, reset });
    }

    /// Hide a function from enumeration.
    pub fn hide(&self, bdf: Bdf) {
        self.segment.lock().unwrap().hidden.insert(bdf);
    }

    /// Program a BAR the way firmware does at boot. This is not recorded as a write.
    pub fn program_bar(&self, bdf: Bdf, idx: usize, value: u32) {
        if let Some(function) = self.segment.lock().unwrap().functions.get_mut(&bdf) {
            function.config.write(
                Request::new(bar_offset(idx), RequestSize::Size4),
                value.into(),
            );
        }
    }

    /// Reset a function, which clears its BARs and decoding.
    pub fn reset_function(&self, bdf: Bdf) {
        if let Some(function) = self.segment.lock().unwrap().functions.get_mut(&bdf) {
            for idx in 0..6 {
                function
                    .config
                    .write(Request::new(bar_offset(idx), RequestSize::Size4), 0);
            }
            function.config.write(
                Request::new(0x4, RequestSize::Size2),
                0,
            );
        }
    }

    /// All Configuration Space writes that reached the hardware, in order.
    #[must_use]
    pub fn writes(&self) -> Vec<(Bdf, Request, u32)> {
        self.segment.lock().unwrap().writes.clone()
    }

    /// Forget the recorded writes.
    pub fn clear_writes(&self) {
        self.segment.lock().unwrap().writes.clear();
    }
}

impl PhysicalPci for SimulatedPci {
    fn read_cfg(&self, bdf: Bdf, req: Request) -> u32 {
        let segment = self.segment.lock().unwrap();

        segment
            .functions
            .get(&bdf)
            .map_or(req.size.all_ones(), |function| function.config.read(req)) as u32
    }

    fn write_cfg(&self, bdf: Bdf, req: Request, value: u32) {
        trace!("{bdf}: physical write {req} <- {value:#x}");

        let mut segment = self.segment.lock().unwrap();

        segment.writes.push((bdf, req, value));
        if let Some(function) = segment.functions.get_mut(&bdf) {
            function.config.write(req, value.into());
        }
    }

    fn reset_support(&self, bdf: Bdf) -> ResetSupport {
        self.segment
            .lock()
            .unwrap()
            .functions
            .get(&bdf)
            .map_or(ResetSupport::NONE, |function| function.reset)
    }

    fn is_platform_hidden(&self, bdf: Bdf) -> bool {
        self.segment.lock().unwrap().hidden.contains(&bdf)
    }

    fn mmcfg_base(&self) -> u64 {
        self.mmcfg_base
    }
}

/// A single IOMMU domain move.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceMove {
    /// Where the function came from.
    pub from: Option<DomainId>,
    /// Where the function went.
    pub to: Option<DomainId>,
    /// The bus of the function.
    pub bus: u8,
    /// Device and function number.
    pub devfn: u8,
}

#[derive(Debug, Default)]
struct IommuState {
    domains: BTreeMap<DomainId, VmId>,
    attached: BTreeMap<(u8, u8), DomainId>,
    moves: Vec<DeviceMove>,
    destroyed: Vec<DomainId>,
}

/// An IOMMU that tracks which domain each function is attached to.
///
/// Moves are checked strictly: a function must be where the caller says it is.
#[derive(Debug, Default)]
pub struct SimulatedIommu {
    next_domain: AtomicU16,
    fail_moves: AtomicBool,
    state: Mutex<IommuState>,
}

impl SimulatedIommu {
    /// Make every following move fail.
    pub fn fail_moves(&self, fail: bool) {
        self.fail_moves.store(fail, Ordering::Relaxed);
    }

    /// The domain a function is attached to.
    #[must_use]
    pub fn attachment(&self, bdf: Bdf) -> Option<DomainId> {
        self.state
            .lock()
            .unwrap()
            .attached
            .get(&(bdf.bus, bdf.devfn()))
            .copied()
    }

    /// The domain created for `vm`, if it still exists.
    #[must_use]
    pub fn domain_of(&self, vm: VmId) -> Option<DomainId> {
        self.state
            .lock()
            .unwrap()
            .domains
            .iter()
            .find_map(|(&domain, &owner)| (owner == vm).then_some(domain))
    }

    /// All moves so far, in order.
    #[must_use]
    pub fn moves(&self) -> Vec<DeviceMove> {
        self.state.lock().unwrap().moves.clone()
    }

    /// All destroyed domains, in order.
    #[must_use]
    pub fn destroyed(&self) -> Vec<DomainId> {
        self.state.lock().unwrap().destroyed.clone()
    }
}

impl Iommu for SimulatedIommu {
    fn create_domain(&self, vm: VmId) -> DomainId {
        let domain = DomainId(self.next_domain.fetch_add(1, Ordering::Relaxed) + 1);

        self.state.lock().unwrap().domains.insert(domain, vm);
        domain
    }

    fn destroy_domain(&self, domain: DomainId) {
        let mut state = self.state.lock().unwrap();

        state.domains.remove(&domain);
        state.attached.retain(|_, attached| *attached != domain);
        state.destroyed.push(domain);
    }

    fn move_device(
        &self,
        from: Option<DomainId>,
        to: Option<DomainId>,
        bus: u8,
        devfn: u8,
    ) -> Result<(), IommuError> {
        if self.fail_moves.load(Ordering::Relaxed) {
            return Err(IommuError::Hardware("injected failure".to_owned()));
        }

        let mut state = self.state.lock().unwrap();
        let actual = state.attached.get(&(bus, devfn)).copied();

        if actual != from {
            return Err(IommuError::NotAttached {
                bus,
                devfn,
                expected: from,
                actual,
            });
        }

        match to {
            Some(domain) if !state.domains.contains_key(&domain) => {
                return Err(IommuError::NoSuchDomain(domain));
            }
            Some(domain) => {
                state.attached.insert((bus, devfn), domain);
            }
            None => {
                state.attached.remove(&(bus, devfn));
            }
        }

        state.moves.push(DeviceMove {
            from,
            to,
            bus,
            devfn,
        });
        Ok(())
    }
}

/// Interrupt remapping tables that only remember what was released.
#[derive(Debug, Default)]
pub struct RecordingInterrupts {
    released: Mutex<Vec<(VmId, Bdf, CapabilityKind)>>,
    released_vms: Mutex<Vec<VmId>>,
}

impl RecordingInterrupts {
    /// Per-function releases, in order.
    #[must_use]
    pub fn released(&self) -> Vec<(VmId, Bdf, CapabilityKind)> {
        self.released.lock().unwrap().clone()
    }

    /// VMs whose entries were released in bulk, in order.
    #[must_use]
    pub fn released_vms(&self) -> Vec<VmId> {
        self.released_vms.lock().unwrap().clone()
    }
}

impl InterruptRemapping for RecordingInterrupts {
    fn release_device_entries(&self, vm: VmId, bdf: Bdf, kind: CapabilityKind) {
        self.released.lock().unwrap().push((vm, bdf, kind));
    }

    fn release_all_entries(&self, vm: VmId) {
        self.released_vms.lock().unwrap().push(vm);
    }
}

/// The simulated collaborators, with typed handles for inspection.
#[derive(Debug, Clone)]
pub struct SimPlatform {
    /// The physical PCI segment.
    pub pci: Arc<SimulatedPci>,
    /// The IOMMU.
    pub iommu: Arc<SimulatedIommu>,
    /// The interrupt remapping tables.
    pub interrupts: Arc<RecordingInterrupts>,
}

impl SimPlatform {
    /// Create a platform whose ECAM window sits at `mmcfg_base`.
    #[must_use]
    pub fn new(mmcfg_base: u64) -> Self {
        Self {
            pci: Arc::new(SimulatedPci::new(mmcfg_base)),
            iommu: Arc::default(),
            interrupts: Arc::default(),
        }
    }

    /// The collaborators as the vPCI code consumes them.
    #[must_use]
    pub fn platform(&self) -> Arc<Platform> {
        Arc::new(Platform {
            pci: self.pci.clone(),
            iommu: self.iommu.clone(),
            interrupts: self.interrupts.clone(),
            capabilities: Arc::new(ShadowCapabilities),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn iommu_moves_are_checked() {
        let iommu = SimulatedIommu::default();
        let domain = iommu.create_domain(VmId(0));

        assert_eq!(iommu.move_device(None, Some(domain), 0, 0x18), Ok(()));
        assert!(matches!(
            iommu.move_device(None, Some(domain), 0, 0x18),
            Err(IommuError::NotAttached { .. })
        ));
        assert_eq!(iommu.attachment(Bdf::new(0, 3, 0)), Some(domain));

        iommu.destroy_domain(domain);
        assert_eq!(iommu.attachment(Bdf::new(0, 3, 0)), None);
        assert_eq!(
            iommu.move_device(None, Some(domain), 0, 0x18),
            Err(IommuError::NoSuchDomain(domain))
        );
    }

    #[test]
    fn injected_failures_fail_every_move() {
        let iommu = SimulatedIommu::default();
        let domain = iommu.create_domain(VmId(0));

        iommu.fail_moves(true);
        assert!(iommu.move_device(None, Some(domain), 0, 0).is_err());
        assert!(iommu.moves().is_empty());
    }

    #[test]
    fn absent_functions_read_all_ones() {
        let pci = SimulatedPci::default();

        assert_eq!(
            pci.read_cfg(Bdf::new(0, 1, 0), Request::new(0, RequestSize::Size2)),
            0xFFFF
        );
    }
}
