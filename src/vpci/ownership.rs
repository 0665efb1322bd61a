//! # Device Hand-off
//!
//! Physical functions start out in the service VM. The device model hands one to a guest with
//! [`Vpci::assign`] and takes it back with [`Vpci::deassign`].
//!
//! The service VM's entry for the function stays in its table while the guest owns the function.
//! It records the new owner, so a service VM with a higher severity can still observe the
//! function. The guest gets an entry of its own. Once the function is back, the guest's entry is
//! orphaned.

use std::sync::MutexGuard;

use tracing::{error, info};

use crate::{
    device::{
        bus::{Request, RequestSize},
        pci::constants::config_space::offset,
    },
    platform::vm::{AssignRequest, LoadOrder},
};

use super::{
    passthrough::{move_domain, release_interrupts},
    DeviceHandle, DeviceTable, NewOwner, Ownership, Vpci, VpciError,
};

/// The device tables of the service VM and a guest, locked in the only permitted order.
pub struct TransferGuard<'a> {
    /// The service VM's table.
    pub service: MutexGuard<'a, DeviceTable>,
    /// The guest's table.
    pub guest: MutexGuard<'a, DeviceTable>,
}

impl<'a> TransferGuard<'a> {
    /// Lock the service VM's table, then the guest's.
    ///
    /// # Panics
    ///
    /// If `service` is not the service VM or `guest` is not a post-launched VM.
    pub fn lock(service: &'a Vpci, guest: &'a Vpci) -> Self {
        assert_eq!(
            service.load_order,
            LoadOrder::ServiceVm,
            "{} is not the service VM",
            service.vm
        );
        assert_eq!(
            guest.load_order,
            LoadOrder::PostLaunched,
            "{} is not a post-launched VM",
            guest.vm
        );

        let service_table = service.table.lock().unwrap();
        let guest_table = guest.table.lock().unwrap();

        Self {
            service: service_table,
            guest: guest_table,
        }
    }

    /// Give the function behind the service VM's entry `source` back to the service VM.
    pub(crate) fn reclaim(&mut self, service: &Vpci, guest: &Vpci, source: DeviceHandle) {
        let dev = self.service.get_mut(source);

        if let Some(new_owner) = dev.new_owner.take() {
            let target = self.guest.get_mut(new_owner.handle);

            if let Some(pbdf) = target.pdev.as_ref().map(|pdev| pdev.bdf) {
                move_domain(&service.platform, Some(guest.domain), Some(service.domain), pbdf);
                release_interrupts(&guest.platform, guest.vm, target);
            }

            target.owner = Ownership::Orphaned;
        }

        dev.owner = Ownership::Owned(service.vm);
    }
}

impl std::fmt::Debug for TransferGuard<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransferGuard")
            .field("service", &*self.service)
            .field("guest", &*self.guest)
            .finish()
    }
}

impl Vpci {
    /// Hand the physical function `req.phys_bdf` of the service VM to `guest`.
    ///
    /// `self` is the service VM. The function must be owned by the service VM, must not have
    /// SR-IOV and must support some reset method. It appears in the guest at `req.virt_bdf` with
    /// the interrupt routing and BAR values of `req`.
    ///
    /// # Panics
    ///
    /// If the IOMMU refuses to move the function.
    pub fn assign(&self, guest: &Self, req: &AssignRequest) -> Result<DeviceHandle, VpciError> {
        let mut tables = TransferGuard::lock(self, guest);

        let found = tables.service.find(req.phys_bdf);
        let pdev = found
            .map(|handle| tables.service.get(handle))
            .filter(|dev| dev.owner == Ownership::Owned(self.vm) && dev.sriov.is_none())
            .and_then(|dev| dev.pdev.clone());

        let (Some(source), Some(pdev)) = (found, pdev) else {
            error!(
                "{}: cannot assign {} to {} as {}",
                self.vm, req.phys_bdf, guest.vm, req.virt_bdf
            );
            return Err(VpciError::NotAssignable(req.phys_bdf));
        };

        if !pdev.reset.any() {
            error!("{} supports neither FLR nor PM reset", pdev.bdf);
            return Err(VpciError::NoResetMechanism(pdev.bdf));
        }

        // The device model reset the function, which wiped its BARs.
        self.platform.pci.restore_bars(&pdev);
        move_domain(&self.platform, Some(self.domain), None, pdev.bdf);

        let src = tables.service.get_mut(source);
        src.owner = Ownership::Owned(guest.vm);
        let (phyfun, src_vbars) = (src.phyfun, src.vbars);
        let mut config = src.config.clone();
        config.pdev = Some(pdev);

        let handle = tables
            .guest
            .init_vdev(&guest.context(None), &config, phyfun);
        let dev = tables.guest.get_mut(handle);

        dev.vcfg.write_direct(
            Request::new(offset::IRQ_LINE as u64, RequestSize::Size1),
            req.intr_line.into(),
        );
        dev.vcfg.write_direct(
            Request::new(offset::IRQ_PIN as u64, RequestSize::Size1),
            req.intr_pin.into(),
        );

        for idx in 0..dev.nr_bars {
            // Virtual functions have no BARs of their own. Their geometry comes from the PF.
            if dev.phyfun.is_some() {
                dev.vbars[idx] = src_vbars[idx];
                if dev.msix.is_some_and(|msix| msix.table.bar == idx) {
                    dev.update_msix_bar();
                }
            }
            dev.write_vbar(idx, req.bars[idx]);
        }

        dev.flags |= req.flags;
        dev.bdf = req.virt_bdf;

        tables.service.get_mut(source).new_owner = Some(NewOwner {
            handle,
            severity: guest.severity,
        });

        info!(
            "{}: assigned {} to {} as {}",
            self.vm, req.phys_bdf, guest.vm, req.virt_bdf
        );

        Ok(handle)
    }

    /// Take the physical function `req.phys_bdf` back from `guest`.
    ///
    /// `self` is the service VM.
    ///
    /// # Panics
    ///
    /// If the IOMMU refuses to move the function.
    pub fn deassign(&self, guest: &Self, req: &AssignRequest) -> Result<(), VpciError> {
        let mut tables = TransferGuard::lock(self, guest);

        let source = tables.service.find(req.phys_bdf).filter(|&handle| {
            let dev = tables.service.get(handle);
            dev.owner == Ownership::Owned(guest.vm) && dev.pdev.is_some()
        });

        let Some(source) = source else {
            error!(
                "{}: cannot take {} back from {}",
                self.vm, req.phys_bdf, guest.vm
            );
            return Err(VpciError::NotAssignable(req.phys_bdf));
        };

        tables.reclaim(self, guest, source);

        info!("{}: took {} back from {}", self.vm, req.phys_bdf, guest.vm);

        Ok(())
    }
}
