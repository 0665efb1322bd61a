//! # Device Registry
//!
//! The virtual functions of a VM live in a [`DeviceTable`]. The table is an append-only arena:
//! entries are never removed, so a [`DeviceHandle`] stays valid for the life of the VM. Entries
//! refer to each other by handle, never by reference.

use std::sync::Arc;

use tracing::debug;

use crate::{
    device::pci::{
        address::Bdf,
        config_space::{BarInfo, ConfigSpace},
        constants::config_space::MAX_BARS,
    },
    platform::{
        capability::{CapabilityKind, CapabilityRegion, MsixTableLocation},
        pci::{PhysicalBar, PhysicalDevice},
        vm::{DeviceFlags, EmulationType, PciDevConfig, VmId},
    },
};

use super::{bridge::BridgeOps, passthrough::PassthroughOps, VdevContext, VdevOpsRef};

/// The maximum number of virtual functions per VM.
pub const MAX_PCI_DEV_NUM: usize = 96;

/// A stable reference to an entry in some VM's device table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DeviceHandle {
    /// The VM whose table holds the entry.
    pub vm: VmId,
    /// The position in the table.
    pub slot: usize,
}

/// Which VM may access a table entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ownership {
    /// The entry belongs to this VM.
    Owned(VmId),
    /// The entry is a leftover of a guest that gave its function back. Nobody can reach it.
    Orphaned,
}

/// Where a physical function was handed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NewOwner {
    /// The entry in the guest's table.
    pub handle: DeviceHandle,
    /// The severity of the guest.
    pub severity: u8,
}

/// The emulated state of one BAR register.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct VirtualBar {
    /// Geometry of the register. Unimplemented BARs have none.
    pub info: Option<BarInfo>,

    /// The host physical base of the region.
    pub base_hpa: u64,

    /// The address bits the VM programmed.
    reg: u32,
}

impl VirtualBar {
    /// Mirror a physical BAR whose register currently holds `reg`.
    #[must_use]
    pub fn new(bar: Option<PhysicalBar>, reg: u32) -> Self {
        bar.map_or_else(Self::default, |bar| Self {
            info: Some(bar.info),
            base_hpa: bar.base,
            reg: reg & bar.info.address_mask(),
        })
    }

    /// The register value the VM reads.
    ///
    /// After the VM wrote all ones, this is the sizing mask. The type bits are always preserved.
    #[must_use]
    pub fn read(&self) -> u32 {
        self.info
            .map_or(0, |info| (self.reg & info.address_mask()) | info.type_bits())
    }

    /// Program the register. Writes to unimplemented BARs are ignored.
    pub fn write(&mut self, value: u32) {
        if let Some(info) = self.info {
            self.reg = value & info.address_mask();
        }
    }

    /// The size of the region in bytes.
    #[must_use]
    pub fn size(&self) -> u64 {
        self.info.map_or(0, |info| info.size)
    }
}

/// The MSI-X capability of a pass-through function.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MsixState {
    /// Where the capability lives.
    pub region: CapabilityRegion,
    /// Where the table lives.
    pub table: MsixTableLocation,
    /// The host physical base of the BAR that holds the table.
    pub mmio_hpa: u64,
    /// The size of that BAR.
    pub mmio_size: u64,
}

/// One PCI function as a VM sees it.
#[derive(Debug)]
pub struct VirtualDevice {
    /// The address the VM sees.
    pub bdf: Bdf,

    /// Who may access this entry.
    pub owner: Ownership,

    /// The physical function behind a pass-through entry.
    pub pdev: Option<PhysicalDevice>,

    /// The static configuration the entry was created from.
    pub config: PciDevConfig,

    /// The physical function of an SR-IOV virtual function.
    pub phyfun: Option<DeviceHandle>,

    /// Set while the function is handed to a guest.
    pub new_owner: Option<NewOwner>,

    /// How accesses are emulated.
    pub ops: VdevOpsRef,

    /// Extra flags set when the function was assigned.
    pub flags: DeviceFlags,

    /// Virtualized registers.
    pub vcfg: ConfigSpace,

    /// Emulated BARs.
    pub vbars: [VirtualBar; MAX_BARS],

    /// The number of BARs of the header layout.
    pub nr_bars: usize,

    /// The MSI capability.
    pub msi: Option<CapabilityRegion>,

    /// The MSI-X capability.
    pub msix: Option<MsixState>,

    /// The SR-IOV capability.
    pub sriov: Option<CapabilityRegion>,
}

/// The operations of a pass-through function that came without its own.
fn default_ops(config: &PciDevConfig) -> VdevOpsRef {
    assert_eq!(
        config.emu_type,
        EmulationType::PassThrough,
        "{}: only pass-through functions come without operations",
        config.vbdf
    );

    match &config.pdev {
        Some(pdev) if pdev.is_bridge() => Arc::new(BridgeOps),
        Some(_) => Arc::new(PassthroughOps),
        None => panic!("{}: pass-through function is not present", config.vbdf),
    }
}

impl VirtualDevice {
    fn new(owner: VmId, config: &PciDevConfig, phyfun: Option<DeviceHandle>) -> Self {
        let ops = config.ops.clone().unwrap_or_else(|| default_ops(config));

        Self {
            bdf: config.vbdf,
            owner: Ownership::Owned(owner),
            pdev: config.pdev.clone(),
            config: config.clone(),
            phyfun,
            new_owner: None,
            ops,
            flags: DeviceFlags::empty(),
            vcfg: ConfigSpace::shadow(),
            vbars: [VirtualBar::default(); MAX_BARS],
            nr_bars: 0,
            msi: None,
            msix: None,
            sriov: None,
        }
    }

    /// Whether the function needs full virtualization outside its header and capabilities.
    #[must_use]
    pub const fn is_quirk(&self) -> bool {
        self.flags.contains(DeviceFlags::QUIRK_PTDEV)
    }

    /// The capability an access at `offset` lands in.
    #[must_use]
    pub fn capability_at(&self, offset: u32) -> Option<CapabilityRegion> {
        [self.msi, self.msix.map(|msix| msix.region), self.sriov]
            .into_iter()
            .flatten()
            .find(|region| region.contains(offset))
    }

    /// Record a capability found during initialization.
    pub fn set_capability(&mut self, region: CapabilityRegion) {
        match region.kind {
            CapabilityKind::Msi => self.msi = Some(region),
            CapabilityKind::MsiX => {
                self.msix = Some(MsixState {
                    region,
                    table: MsixTableLocation::read_from(&region, &self.vcfg),
                    mmio_hpa: 0,
                    mmio_size: 0,
                });
            }
            CapabilityKind::SrIov => self.sriov = Some(region),
        }
    }

    /// Point the MSI-X state at the BAR that holds the table.
    pub fn update_msix_bar(&mut self) {
        if let Some(msix) = self.msix.as_mut() {
            if let Some(vbar) = self.vbars.get(msix.table.bar) {
                msix.mmio_hpa = vbar.base_hpa;
                msix.mmio_size = vbar.size();
            }
        }
    }

    /// Program BAR `idx` as the VM sees it.
    pub fn write_vbar(&mut self, idx: usize, value: u32) {
        if idx < self.nr_bars {
            self.vbars[idx].write(value);
        }
    }
}

/// The virtual functions of one VM.
#[derive(Debug)]
pub struct DeviceTable {
    vm: VmId,
    devices: Vec<VirtualDevice>,
}

impl DeviceTable {
    /// Create an empty table for `vm`.
    #[must_use]
    pub fn new(vm: VmId) -> Self {
        Self {
            vm,
            devices: Vec::with_capacity(MAX_PCI_DEV_NUM),
        }
    }

    /// The number of entries, including orphaned ones.
    #[must_use]
    pub fn len(&self) -> usize {
        self.devices.len()
    }

    /// Whether the table has no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    fn slot(&self, handle: DeviceHandle) -> usize {
        assert_eq!(handle.vm, self.vm, "{handle:?} belongs to another table");
        handle.slot
    }

    /// Resolve a handle into this table.
    #[must_use]
    pub fn get(&self, handle: DeviceHandle) -> &VirtualDevice {
        &self.devices[self.slot(handle)]
    }

    /// Resolve a handle into this table.
    pub fn get_mut(&mut self, handle: DeviceHandle) -> &mut VirtualDevice {
        let slot = self.slot(handle);
        &mut self.devices[slot]
    }

    /// Iterate over all entries with their handles.
    pub fn iter(&self) -> impl Iterator<Item = (DeviceHandle, &VirtualDevice)> + '_ {
        let vm = self.vm;

        self.devices
            .iter()
            .enumerate()
            .map(move |(slot, dev)| (DeviceHandle { vm, slot }, dev))
    }

    /// The handles of all entries.
    pub fn handles(&self) -> impl Iterator<Item = DeviceHandle> {
        let vm = self.vm;

        (0..self.devices.len()).map(move |slot| DeviceHandle { vm, slot })
    }

    /// Find the live entry at `bdf`, regardless of who owns it.
    #[must_use]
    pub fn find(&self, bdf: Bdf) -> Option<DeviceHandle> {
        self.iter()
            .find(|(_, dev)| dev.bdf == bdf && dev.owner != Ownership::Orphaned)
            .map(|(handle, _)| handle)
    }

    /// Find the entry at `bdf` that the table's VM may access.
    ///
    /// An entry the VM handed to a guest stays visible only if the VM's `severity` is strictly
    /// higher than the guest's.
    #[must_use]
    pub fn find_available(&self, bdf: Bdf, severity: u8) -> Option<DeviceHandle> {
        let handle = self.find(bdf)?;
        let dev = self.get(handle);

        if dev.owner == Ownership::Owned(self.vm) {
            return Some(handle);
        }

        match dev.new_owner {
            Some(new_owner) if severity > new_owner.severity => Some(handle),
            _ => None,
        }
    }

    /// The owner of an entry. Entries in other tables are assumed to belong to their table's VM.
    #[must_use]
    pub fn owner_of(&self, handle: DeviceHandle) -> Ownership {
        if handle.vm == self.vm {
            self.get(handle).owner
        } else {
            Ownership::Owned(handle.vm)
        }
    }

    /// The owner of the SR-IOV physical function of an entry.
    #[must_use]
    pub fn pf_owner(&self, handle: DeviceHandle) -> Option<Ownership> {
        self.get(handle).phyfun.map(|pf| self.owner_of(pf))
    }

    /// Create an entry from `config` and run its initialization.
    ///
    /// `phyfun` links an SR-IOV virtual function to its physical function.
    ///
    /// # Panics
    ///
    /// The table must not be full, and a configuration without operations must describe a
    /// present pass-through function.
    pub fn init_vdev(
        &mut self,
        ctx: &VdevContext<'_>,
        config: &PciDevConfig,
        phyfun: Option<DeviceHandle>,
    ) -> DeviceHandle {
        assert!(
            self.devices.len() < MAX_PCI_DEV_NUM,
            "{}: device table is full",
            self.vm
        );
        assert_eq!(ctx.vm, self.vm);

        let mut dev = VirtualDevice::new(self.vm, config, phyfun);
        let ctx = VdevContext {
            pf_owner: phyfun.map(|pf| self.owner_of(pf)),
            ..*ctx
        };

        let ops = dev.ops.clone();
        ops.init(&mut dev, &ctx);

        let handle = DeviceHandle {
            vm: self.vm,
            slot: self.devices.len(),
        };

        debug!("{}: {} at slot {}", self.vm, dev.bdf, handle.slot);

        self.devices.push(dev);
        handle
    }
}
