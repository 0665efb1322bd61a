//! # Configuration Space Dispatch
//!
//! A decoded access is routed to the operations of the virtual function it addresses. What
//! happens when the VM may not see any function at that address depends on the VM: guests get
//! [`VpciError::NotPresent`] so their device model can answer, the service VM gets the
//! behavior of an empty slot.

use std::{fmt::Debug, sync::Arc};

use tracing::{debug, info};

use crate::{
    device::{bus::Request, pci::address::Bdf},
    platform::{
        iommu::DomainId,
        vm::{LoadOrder, VmId},
        Platform,
    },
};

use super::{Ownership, VirtualDevice, Vpci, VpciError};

/// What the operations of a virtual function know about their VM.
#[derive(Debug, Clone, Copy)]
pub struct VdevContext<'a> {
    /// The VM whose table holds the function.
    pub vm: VmId,

    /// How that VM was started.
    pub load_order: LoadOrder,

    /// The VM's IOMMU domain.
    pub domain: DomainId,

    /// The platform collaborators.
    pub platform: &'a Platform,

    /// The owner of the function's SR-IOV physical function, if it has one.
    pub pf_owner: Option<Ownership>,
}

/// The emulation of one kind of virtual function.
///
/// Accesses are validated before they get here: the size is 1, 2 or 4 bytes and the offset is
/// naturally aligned.
pub trait VdevOps: Debug + Send + Sync {
    /// Prepare a freshly created function.
    fn init(&self, dev: &mut VirtualDevice, ctx: &VdevContext<'_>);

    /// Release what the function holds.
    fn deinit(&self, dev: &mut VirtualDevice, ctx: &VdevContext<'_>);

    /// Read from the Configuration Space.
    fn read_cfg(
        &self,
        dev: &VirtualDevice,
        ctx: &VdevContext<'_>,
        req: Request,
    ) -> Result<u32, VpciError>;

    /// Write to the Configuration Space.
    fn write_cfg(
        &self,
        dev: &mut VirtualDevice,
        ctx: &VdevContext<'_>,
        req: Request,
        value: u32,
    ) -> Result<(), VpciError>;
}

/// A shared reference to virtual function operations.
pub type VdevOpsRef = Arc<dyn VdevOps>;

impl Vpci {
    /// Whether the VM is a guest whose misses go to its device model.
    pub(crate) fn is_post_launched(&self) -> bool {
        self.load_order == LoadOrder::PostLaunched
    }

    /// Read from the Configuration Space of the function at `bdf`.
    pub fn read_cfg(&self, bdf: Bdf, req: Request) -> Result<u32, VpciError> {
        let table = self.table.lock().unwrap();

        match table.find_available(bdf, self.severity) {
            Some(handle) => {
                let ctx = self.context(table.pf_owner(handle));
                let dev = table.get(handle);

                dev.ops.read_cfg(dev, &ctx, req)
            }
            None if self.is_post_launched() => Err(VpciError::NotPresent(bdf)),
            None => {
                debug!("{}: read of absent {bdf} {req}", self.vm);
                Ok(req.size.all_ones() as u32)
            }
        }
    }

    /// Write to the Configuration Space of the function at `bdf`.
    pub fn write_cfg(&self, bdf: Bdf, req: Request, value: u32) -> Result<(), VpciError> {
        let mut table = self.table.lock().unwrap();

        match table.find_available(bdf, self.severity) {
            Some(handle) => {
                let ctx = self.context(table.pf_owner(handle));
                let dev = table.get_mut(handle);
                let ops = dev.ops.clone();

                ops.write_cfg(dev, &ctx, req, value)
            }
            None if self.is_post_launched() => Err(VpciError::NotPresent(bdf)),
            None => {
                info!("{}: {bdf} not found! {req} <- {value:#x}", self.vm);
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        device::bus::RequestSize,
        vpci::testutils::{Harness, ScratchOps},
    };

    #[test]
    fn guests_report_absent_functions() {
        let harness = Harness::new();
        let bdf = Bdf::new(0, 9, 0);
        let req = Request::new(0, RequestSize::Size4);

        assert_eq!(
            harness.guest.read_cfg(bdf, req),
            Err(VpciError::NotPresent(bdf))
        );
        assert_eq!(
            harness.guest.write_cfg(bdf, req, 0),
            Err(VpciError::NotPresent(bdf))
        );
    }

    #[test]
    fn the_service_vm_probes_empty_slots() {
        let harness = Harness::new();
        let bdf = Bdf::new(0, 9, 0);

        assert_eq!(
            harness
                .service
                .read_cfg(bdf, Request::new(0, RequestSize::Size2)),
            Ok(0xFFFF)
        );
        assert_eq!(
            harness
                .service
                .write_cfg(bdf, Request::new(0x10, RequestSize::Size4), 0),
            Ok(())
        );
        assert!(harness.sim.pci.writes().is_empty());
    }

    #[test]
    fn hits_reach_the_operations() {
        let harness = Harness::new();
        let req = Request::new(0, RequestSize::Size4);

        assert_eq!(
            harness.guest.read_cfg(Harness::SCRATCH_BDF, req),
            Ok(ScratchOps::ID)
        );
        assert_eq!(
            harness
                .guest
                .write_cfg(Harness::SCRATCH_BDF, Request::new(0x40, RequestSize::Size4), 7),
            Ok(())
        );
        assert_eq!(
            harness
                .guest
                .read_cfg(Harness::SCRATCH_BDF, Request::new(0x40, RequestSize::Size4)),
            Ok(7)
        );
    }
}
