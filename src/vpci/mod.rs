//! # Virtual PCI
//!
//! Every VM gets a [`Vpci`] instance. It intercepts the VM's Configuration Space accesses through
//! port I/O (CF8h/CFCh) and ECAM and routes them to the virtual functions in the VM's device
//! table. Physical functions are handed between the service VM and guests with
//! [`Vpci::assign`] and [`Vpci::deassign`].
//!
//! ## Locking
//!
//! Each VM's device table sits behind its own lock. Operations that touch two VMs take the
//! service VM's lock first and the guest's second. [`ownership::TransferGuard`] is the only way
//! to hold both.

use std::sync::{atomic::AtomicU32, Arc, Mutex};

use crate::{
    device::pci::address::Bdf,
    platform::{
        iommu::DomainId,
        vm::{LoadOrder, VmId},
        Platform,
    },
};

pub mod bridge;
pub mod decode;
pub mod dispatch;
pub mod host_bridge;
pub mod lifecycle;
pub mod ownership;
pub mod passthrough;
pub mod registry;

#[cfg(test)]
mod testutils;

pub use dispatch::{VdevContext, VdevOps, VdevOpsRef};
pub use registry::{DeviceHandle, DeviceTable, NewOwner, Ownership, VirtualBar, VirtualDevice};

/// Errors of Configuration Space accesses and device hand-off.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum VpciError {
    /// No function the VM may see lives at this address. The access goes to the device model.
    #[error("no available function at {0}")]
    NotPresent(Bdf),

    /// A CONFIG_ADDRESS write selects a function the hypervisor does not handle.
    #[error("configuration address is not handled by the hypervisor")]
    Unclaimed,

    /// An access outside the virtualized registers of a function that needs full
    /// virtualization.
    #[error("{bdf}: register {offset:#x} of a quirk device is not virtualized")]
    QuirkRegion {
        /// The virtual address of the function.
        bdf: Bdf,
        /// The Configuration Space offset of the access.
        offset: u32,
    },

    /// The function cannot be moved between VMs in its current state.
    #[error("{0} cannot be handed over")]
    NotAssignable(Bdf),

    /// The function cannot be reset, so it cannot be handed to a guest.
    #[error("{0} supports neither FLR nor PM reset")]
    NoResetMechanism(Bdf),
}

/// The virtual PCI state of one VM.
#[derive(Debug)]
pub struct Vpci {
    vm: VmId,
    load_order: LoadOrder,
    severity: u8,

    /// The VM's IOMMU domain.
    domain: DomainId,

    platform: Arc<Platform>,

    /// The latched CONFIG_ADDRESS register. It is consumed by the next CONFIG_DATA access.
    addr: AtomicU32,

    /// Where the VM sees its ECAM window. Pre-launched VMs have none.
    mmcfg_base: Option<u64>,

    table: Mutex<DeviceTable>,
}

/// What a VM knows about one of its table entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceSummary {
    /// Where the entry lives.
    pub handle: DeviceHandle,
    /// The address the VM sees.
    pub bdf: Bdf,
    /// The physical function behind the entry.
    pub phys_bdf: Option<Bdf>,
    /// Who may access the entry.
    pub owner: Ownership,
    /// Where the function was handed to.
    pub new_owner: Option<NewOwner>,
}

impl Vpci {
    /// The VM this instance belongs to.
    #[must_use]
    pub const fn vm(&self) -> VmId {
        self.vm
    }

    /// How the VM was started.
    #[must_use]
    pub const fn load_order(&self) -> LoadOrder {
        self.load_order
    }

    /// The VM's severity.
    #[must_use]
    pub const fn severity(&self) -> u8 {
        self.severity
    }

    /// The VM's IOMMU domain.
    #[must_use]
    pub const fn domain(&self) -> DomainId {
        self.domain
    }

    /// The guest physical base of the VM's ECAM window.
    #[must_use]
    pub const fn mmcfg_base(&self) -> Option<u64> {
        self.mmcfg_base
    }

    /// A summary of every table entry, in insertion order.
    #[must_use]
    pub fn devices(&self) -> Vec<DeviceSummary> {
        let table = self.table.lock().unwrap();

        table
            .iter()
            .map(|(handle, dev)| DeviceSummary {
                handle,
                bdf: dev.bdf,
                phys_bdf: dev.pdev.as_ref().map(|pdev| pdev.bdf),
                owner: dev.owner,
                new_owner: dev.new_owner,
            })
            .collect()
    }

    /// Build the context the operations of a function run in.
    fn context(&self, pf_owner: Option<Ownership>) -> VdevContext<'_> {
        VdevContext {
            vm: self.vm,
            load_order: self.load_order,
            domain: self.domain,
            platform: &self.platform,
            pf_owner,
        }
    }
}
