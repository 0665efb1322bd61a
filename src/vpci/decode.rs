//! # Configuration Access Decoding
//!
//! Guests reach the Configuration Space in two ways:
//!
//! - Configuration Mechanism #1: a write to CONFIG_ADDRESS (CF8h) selects a register, the next
//!   access to CONFIG_DATA (CFCh-CFFh) reads or writes it.
//! - ECAM: each function's Configuration Space is a 4 KiB page in a memory window.
//!
//! The trap handlers in this module decode both and hand the result to the dispatcher. Whatever
//! the hypervisor does not handle is declined with [`Forward`] and reaches the device model.

use std::sync::{atomic::Ordering, Arc};

use tracing::trace;

use crate::device::{
    bus::{Forward, IoHandler, Request, RequestSize},
    pci::{
        address::{decode_ecam, ConfigAddress},
        constants::{ecam, pio},
    },
};

use super::{Vpci, VpciError};

/// Whether a Configuration Space access of `size` bytes at `offset` is legal.
///
/// Accesses are 1, 2 or 4 bytes wide and naturally aligned.
#[must_use]
pub const fn is_valid_access(offset: u64, size: RequestSize) -> bool {
    !matches!(size, RequestSize::Size8) && size.is_aligned(offset)
}

impl Vpci {
    /// Read CONFIG_ADDRESS. `req` is relative to CF8h.
    #[must_use]
    pub fn cfgaddr_read(&self, req: Request) -> u32 {
        if is_config_address(req) {
            self.addr.load(Ordering::Acquire)
        } else {
            req.size.all_ones() as u32
        }
    }

    /// Write CONFIG_ADDRESS. `req` is relative to CF8h.
    ///
    /// Guests get [`VpciError::Unclaimed`] when the selected function is not handled by the
    /// hypervisor. The address is latched nevertheless.
    pub fn cfgaddr_write(&self, req: Request, value: u32) -> Result<(), VpciError> {
        if !is_config_address(req) {
            return Ok(());
        }

        let addr = ConfigAddress::from_raw(value);
        self.addr.store(addr.raw(), Ordering::Release);

        if self.is_post_launched() {
            let table = self.table.lock().unwrap();

            match table.find_available(addr.bdf(), self.severity) {
                Some(handle) if !table.get(handle).is_quirk() => {}
                _ => return Err(VpciError::Unclaimed),
            }
        }

        Ok(())
    }

    /// Consume the latched address for an access at `offset` into CONFIG_DATA.
    fn take_config_address(&self, offset: u64, size: RequestSize) -> Option<(ConfigAddress, u64)> {
        let addr = ConfigAddress::from_raw(self.addr.swap(0, Ordering::AcqRel));
        let reg = u64::from(addr.register()) + offset;

        (addr.enabled() && is_valid_access(reg, size)).then_some((addr, reg))
    }

    /// Read CONFIG_DATA. `req` is relative to CFCh.
    pub fn cfgdata_read(&self, req: Request) -> Result<u32, VpciError> {
        match self.take_config_address(req.addr, req.size) {
            Some((addr, reg)) => self.read_cfg(addr.bdf(), Request::new(reg, req.size)),
            None => Ok(req.size.all_ones() as u32),
        }
    }

    /// Write CONFIG_DATA. `req` is relative to CFCh.
    pub fn cfgdata_write(&self, req: Request, value: u32) -> Result<(), VpciError> {
        match self.take_config_address(req.addr, req.size) {
            Some((addr, reg)) => self.write_cfg(addr.bdf(), Request::new(reg, req.size), value),
            None => Ok(()),
        }
    }

    /// Read through the ECAM window. `req` is relative to the window base.
    pub fn ecam_read(&self, req: Request) -> Result<u32, VpciError> {
        let (bdf, reg) = decode_ecam(req.addr);
        let reg_req = Request::new(reg.into(), req.size);

        if !is_valid_access(reg_req.addr, req.size) {
            Ok(req.size.all_ones() as u32)
        } else if self.platform.pci.is_platform_hidden(bdf) {
            Ok(self.platform.pci.read_cfg(bdf, reg_req))
        } else {
            self.read_cfg(bdf, reg_req)
        }
    }

    /// Write through the ECAM window. `req` is relative to the window base.
    pub fn ecam_write(&self, req: Request, value: u32) -> Result<(), VpciError> {
        let (bdf, reg) = decode_ecam(req.addr);
        let reg_req = Request::new(reg.into(), req.size);

        if !is_valid_access(reg_req.addr, req.size) {
            Ok(())
        } else if self.platform.pci.is_platform_hidden(bdf) {
            self.platform.pci.write_cfg(bdf, reg_req, value);
            Ok(())
        } else {
            self.write_cfg(bdf, reg_req, value)
        }
    }
}

/// Whether `req`, relative to CF8h, is a dword access of CONFIG_ADDRESS itself.
const fn is_config_address(req: Request) -> bool {
    req.addr == 0 && matches!(req.size, RequestSize::Size4)
}

/// Decline what the hypervisor does not handle.
fn forward_on_error<T>(vm: &Vpci, result: Result<T, VpciError>) -> Result<T, Forward> {
    result.map_err(|err| {
        trace!("{}: forwarding to the device model: {err}", vm.vm());
        Forward
    })
}

/// The trap handler of CONFIG_ADDRESS.
///
/// The other ports of the trapped range, such as the reset control register at CF9h, belong to
/// the device model.
#[derive(Debug)]
pub struct ConfigAddressPort(pub Arc<Vpci>);

impl IoHandler for ConfigAddressPort {
    fn size(&self) -> u64 {
        pio::CONFIG_ADDRESS_LEN.into()
    }

    fn read(&self, req: Request) -> Result<u64, Forward> {
        if !is_config_address(req) {
            return Err(Forward);
        }

        Ok(self.0.cfgaddr_read(req).into())
    }

    fn write(&self, req: Request, value: u64) -> Result<(), Forward> {
        if !is_config_address(req) {
            return Err(Forward);
        }

        forward_on_error(&self.0, self.0.cfgaddr_write(req, value as u32))
    }
}

/// The trap handler of CONFIG_DATA.
#[derive(Debug)]
pub struct ConfigDataPort(pub Arc<Vpci>);

impl IoHandler for ConfigDataPort {
    fn size(&self) -> u64 {
        pio::CONFIG_DATA_LEN.into()
    }

    fn read(&self, req: Request) -> Result<u64, Forward> {
        forward_on_error(&self.0, self.0.cfgdata_read(req)).map(u64::from)
    }

    fn write(&self, req: Request, value: u64) -> Result<(), Forward> {
        forward_on_error(&self.0, self.0.cfgdata_write(req, value as u32))
    }
}

/// The trap handler of the ECAM window.
#[derive(Debug)]
pub struct EcamWindow(pub Arc<Vpci>);

impl IoHandler for EcamWindow {
    fn size(&self) -> u64 {
        ecam::WINDOW_SIZE
    }

    fn read(&self, req: Request) -> Result<u64, Forward> {
        forward_on_error(&self.0, self.0.ecam_read(req)).map(u64::from)
    }

    fn write(&self, req: Request, value: u64) -> Result<(), Forward> {
        forward_on_error(&self.0, self.0.ecam_write(req, value as u32))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        device::{
            bus::testutils::RecordingDeviceModel,
            pci::{address::Bdf, constants::config_space::vendor},
        },
        platform::vm::{AssignRequest, DeviceFlags},
        vpci::testutils::{Harness, ScratchOps},
    };
    use proptest::prelude::*;

    fn size_strategy() -> impl Strategy<Value = RequestSize> {
        prop_oneof![
            Just(RequestSize::Size1),
            Just(RequestSize::Size2),
            Just(RequestSize::Size4),
            Just(RequestSize::Size8),
        ]
    }

    fn select(vpci: &Vpci, bdf: Bdf, reg: u32) {
        vpci.cfgaddr_write(
            Request::new(0, RequestSize::Size4),
            ConfigAddress::new(true, bdf, reg).raw(),
        )
        .unwrap();
    }

    proptest! {
        #[test]
        fn only_aligned_narrow_accesses_are_valid(offset in 0u64..0x1000, size in size_strategy()) {
            let width = u64::from(size);

            prop_assert_eq!(
                is_valid_access(offset, size),
                width <= 4 && offset % width == 0
            );
        }

        #[test]
        fn reserved_bits_are_never_observable(value: u32) {
            let harness = Harness::new();
            let service = &harness.service;

            service.cfgaddr_write(Request::new(0, RequestSize::Size4), value).unwrap();

            prop_assert_eq!(
                service.cfgaddr_read(Request::new(0, RequestSize::Size4)),
                value & !0x7F00_0003
            );
        }

        #[test]
        fn invalid_data_accesses_read_all_ones(port in 0u64..4, size in size_strategy()) {
            prop_assume!(!is_valid_access(port, size));

            let harness = Harness::new();
            select(&harness.guest, Harness::SCRATCH_BDF, 0);

            prop_assert_eq!(
                harness.guest.cfgdata_read(Request::new(port, size)),
                Ok(size.all_ones() as u32)
            );
        }
    }

    #[test]
    fn the_latch_is_used_exactly_once() {
        let harness = Harness::new();
        let guest = &harness.guest;
        let req = Request::new(0, RequestSize::Size4);

        select(guest, Harness::SCRATCH_BDF, 0);

        assert_eq!(guest.cfgdata_read(req), Ok(ScratchOps::ID));
        assert_eq!(guest.cfgdata_read(req), Ok(0xFFFF_FFFF));
        assert_eq!(guest.cfgaddr_read(req), 0);
    }

    #[test]
    fn disabled_addresses_do_not_reach_functions() {
        let harness = Harness::new();
        let guest = &harness.guest;

        guest
            .cfgaddr_write(
                Request::new(0, RequestSize::Size4),
                ConfigAddress::new(false, Harness::SCRATCH_BDF, 0x40).raw(),
            )
            .unwrap();
        assert_eq!(
            guest.cfgdata_write(Request::new(0, RequestSize::Size4), 0x1234),
            Ok(())
        );

        select(guest, Harness::SCRATCH_BDF, 0x40);
        assert_eq!(
            guest.cfgdata_read(Request::new(0, RequestSize::Size4)),
            Ok(0)
        );
    }

    #[test]
    fn data_port_offsets_select_bytes() {
        let harness = Harness::new();
        let guest = &harness.guest;

        select(guest, Harness::SCRATCH_BDF, 0);
        assert_eq!(
            guest.cfgdata_read(Request::new(2, RequestSize::Size2)),
            Ok(ScratchOps::ID >> 16)
        );
    }

    #[test]
    fn wrong_address_port_accesses_are_ignored() {
        let harness = Harness::new();
        let service = &harness.service;

        service
            .cfgaddr_write(Request::new(0, RequestSize::Size2), 0x8000_0000)
            .unwrap();

        assert_eq!(service.cfgaddr_read(Request::new(0, RequestSize::Size4)), 0);
        assert_eq!(service.cfgaddr_read(Request::new(1, RequestSize::Size1)), 0xFF);
    }

    #[test]
    fn guests_forward_unknown_addresses() {
        let harness = Harness::new();
        let missing = Bdf::new(0, 0x1f, 0);

        assert_eq!(
            harness.guest.cfgaddr_write(
                Request::new(0, RequestSize::Size4),
                ConfigAddress::new(true, missing, 0).raw()
            ),
            Err(VpciError::Unclaimed)
        );

        // The address is latched anyway.
        assert_eq!(
            harness
                .guest
                .cfgaddr_read(Request::new(0, RequestSize::Size4)),
            ConfigAddress::new(true, missing, 0).raw()
        );
    }

    #[test]
    fn unclaimed_addresses_reach_the_device_model() {
        let harness = Harness::new();
        let model = Arc::new(RecordingDeviceModel::default());
        harness.guest_traps.set_pio_device_model(model.clone());

        let addr = ConfigAddress::new(true, Bdf::new(0, 0x1f, 0), 0).raw();
        harness.guest_traps.pio_write(
            Request::new(pio::CONFIG_ADDRESS.into(), RequestSize::Size4),
            addr.into(),
        );
        let value = harness
            .guest_traps
            .pio_read(Request::new(pio::CONFIG_DATA.into(), RequestSize::Size4));

        assert_eq!(value, RecordingDeviceModel::ANSWER);
        assert_eq!(model.writes.lock().unwrap().len(), 1);
        assert_eq!(model.reads.lock().unwrap().len(), 1);
    }

    #[test]
    fn reset_control_reaches_the_device_model() {
        let harness = Harness::new();
        let model = Arc::new(RecordingDeviceModel::default());
        harness.guest_traps.set_pio_device_model(model.clone());

        let reset_control = Request::new(0xCF9, RequestSize::Size1);
        harness.guest_traps.pio_write(reset_control, 0x6);

        assert_eq!(
            model.writes.lock().unwrap().as_slice(),
            [(reset_control, 0x6)]
        );
        assert_eq!(
            harness.guest_traps.pio_read(reset_control),
            RecordingDeviceModel::ANSWER & 0xFF
        );

        // Narrow accesses at CF8h are not CONFIG_ADDRESS accesses either.
        harness
            .guest_traps
            .pio_write(Request::new(pio::CONFIG_ADDRESS.into(), RequestSize::Size2), 0);

        assert_eq!(model.writes.lock().unwrap().len(), 2);
        assert_eq!(harness.guest.cfgaddr_read(Request::new(0, RequestSize::Size4)), 0);
    }

    #[test]
    fn quirk_devices_are_left_to_the_device_model() {
        let harness = Harness::new();
        let mut assign = AssignRequest::new(Harness::NIC_BDF, Harness::GUEST_NIC_BDF);
        assign.flags = DeviceFlags::QUIRK_PTDEV;
        harness.service.assign(&harness.guest, &assign).unwrap();

        let addr = ConfigAddress::new(true, Harness::GUEST_NIC_BDF, 0).raw();

        assert_eq!(
            harness
                .guest
                .cfgaddr_write(Request::new(0, RequestSize::Size4), addr),
            Err(VpciError::Unclaimed)
        );

        let model = Arc::new(RecordingDeviceModel::default());
        harness.guest_traps.set_pio_device_model(model.clone());

        let address_port = Request::new(pio::CONFIG_ADDRESS.into(), RequestSize::Size4);
        harness.guest_traps.pio_write(address_port, addr.into());

        assert_eq!(
            model.writes.lock().unwrap().as_slice(),
            [(address_port, u64::from(addr))]
        );
    }

    #[test]
    fn ecam_reads_the_physical_identity() {
        let harness = Harness::with_assigned_nic();
        let base = harness.guest.mmcfg_base().unwrap();

        let id = harness.guest_traps.mmio_read(Request::new(
            base + (u64::from(Harness::GUEST_NIC_BDF.value()) << 12),
            RequestSize::Size4,
        ));

        assert_eq!(id, u64::from(Harness::NIC_DEVICE_ID) << 16 | u64::from(vendor::INTEL));
    }

    #[test]
    fn hidden_functions_bypass_virtualization() {
        let harness = Harness::new();
        let hidden = Harness::HIDDEN_BDF;
        let offset = u64::from(hidden.value()) << 12;

        assert_eq!(
            harness
                .service
                .ecam_read(Request::new(offset, RequestSize::Size2)),
            Ok(u32::from(vendor::INTEL))
        );

        harness
            .service
            .ecam_write(Request::new(offset + 0x40, RequestSize::Size4), 0xAA)
            .unwrap();
        assert_eq!(
            harness.sim.pci.writes(),
            vec![(hidden, Request::new(0x40, RequestSize::Size4), 0xAA)]
        );
    }

    #[test]
    fn misaligned_ecam_accesses_are_dropped() {
        let harness = Harness::new();
        let offset = u64::from(Harness::HIDDEN_BDF.value()) << 12;

        assert_eq!(
            harness
                .service
                .ecam_read(Request::new(offset + 1, RequestSize::Size2)),
            Ok(0xFFFF)
        );
        harness
            .service
            .ecam_write(Request::new(offset + 2, RequestSize::Size4), 0)
            .unwrap();
        assert!(harness.sim.pci.writes().is_empty());
    }
}
