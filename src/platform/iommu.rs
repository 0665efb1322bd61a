//! # DMA and Interrupt Isolation
//!
//! Interfaces to the IOMMU, which decides which VM a function can DMA into, and to the interrupt
//! remapping tables, which hold the host interrupts of pass-through functions.

use std::fmt::{self, Debug};

use crate::{
    device::pci::address::Bdf,
    platform::{capability::CapabilityKind, vm::VmId},
};

/// An IOMMU translation domain. Each VM has exactly one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DomainId(pub u16);

impl fmt::Display for DomainId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "domain{}", self.0)
    }
}

/// Reasons why the IOMMU refused to move a function.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IommuError {
    /// The target domain does not exist.
    #[error("{0} does not exist")]
    NoSuchDomain(DomainId),

    /// The function was not attached where the caller expected it.
    #[error("{bus:02x}:{devfn:02x} is attached to {actual:?}, not {expected:?}")]
    NotAttached {
        /// Bus of the function.
        bus: u8,
        /// Device and function number.
        devfn: u8,
        /// The domain the caller expected.
        expected: Option<DomainId>,
        /// The domain the function is attached to.
        actual: Option<DomainId>,
    },

    /// The hardware refused the operation.
    #[error("translation tables could not be updated: {0}")]
    Hardware(String),
}

/// The IOMMU.
pub trait Iommu: Debug + Send + Sync {
    /// Create the translation domain of a VM.
    fn create_domain(&self, vm: VmId) -> DomainId;

    /// Tear down a translation domain.
    fn destroy_domain(&self, domain: DomainId);

    /// Move the function `bus:devfn` from one domain to another.
    ///
    /// `None` stands for the state where the function is attached to no VM and cannot DMA.
    fn move_device(
        &self,
        from: Option<DomainId>,
        to: Option<DomainId>,
        bus: u8,
        devfn: u8,
    ) -> Result<(), IommuError>;
}

/// The interrupt remapping tables.
pub trait InterruptRemapping: Debug + Send + Sync {
    /// Release the remapping entries a function's MSI or MSI-X capability holds in `vm`.
    fn release_device_entries(&self, vm: VmId, bdf: Bdf, kind: CapabilityKind);

    /// Release every pass-through interrupt entry of `vm`.
    fn release_all_entries(&self, vm: VmId);
}
