//! # Platform Collaborators
//!
//! The virtual PCI code does not talk to hardware itself. It reaches the physical PCI segment,
//! the IOMMU, the interrupt remapping tables and the capability emulation through the traits in
//! this module. [`sim`] has in-memory implementations of all of them.

use std::sync::Arc;

pub mod capability;
pub mod iommu;
pub mod pci;
pub mod sim;
pub mod traps;
pub mod vm;

use capability::CapabilityHandler;
use iommu::{InterruptRemapping, Iommu};
use pci::PhysicalPci;

/// The collaborators of the virtual PCI code, shared by all VMs.
#[derive(Debug, Clone)]
pub struct Platform {
    /// Access to physical functions.
    pub pci: Arc<dyn PhysicalPci>,

    /// DMA isolation.
    pub iommu: Arc<dyn Iommu>,

    /// Host interrupts of pass-through functions.
    pub interrupts: Arc<dyn InterruptRemapping>,

    /// MSI, MSI-X and SR-IOV emulation.
    pub capabilities: Arc<dyn CapabilityHandler>,
}
