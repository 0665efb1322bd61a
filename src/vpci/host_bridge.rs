//! # Virtual Host Bridge
//!
//! Guests expect a host bridge at 00:00.0 before they look at anything else on bus 0. This one
//! is purely virtual: an i440FX-compatible identity and nothing behind it.

use std::sync::Arc;

use crate::{
    device::{
        bus::Request,
        pci::{
            address::Bdf,
            config_space::ConfigSpaceBuilder,
            constants::config_space::{class, device, subclass, vendor},
        },
    },
    platform::vm::PciDevConfig,
};

use super::{VdevContext, VdevOps, VirtualDevice, VpciError};

/// Where guests look for the host bridge.
pub const HOST_BRIDGE_BDF: Bdf = Bdf::new(0, 0, 0);

/// The operations of the virtual host bridge.
#[derive(Debug, Clone, Copy, Default)]
pub struct HostBridgeOps;

/// A static configuration entry for the virtual host bridge.
#[must_use]
pub fn host_bridge_config() -> PciDevConfig {
    PciDevConfig::emulated(HOST_BRIDGE_BDF, Arc::new(HostBridgeOps))
}

impl VdevOps for HostBridgeOps {
    fn init(&self, dev: &mut VirtualDevice, _ctx: &VdevContext<'_>) {
        dev.vcfg = ConfigSpaceBuilder::new(vendor::INTEL, device::I440FX_HOST_BRIDGE)
            .class(class::BRIDGE, subclass::HOST_BRIDGE, 0)
            .config_space();
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
