mod cli;

use anyhow::{Context, Result};
use clap::Parser;
use cli::Cli;
use hvpci::{
    device::{
        bus::{Request, RequestSize},
        pci::{
            address::{ecam_offset, Bdf, ConfigAddress},
            constants::{pio, MAX_BUS_DEVICES, MAX_DEVICE_FUNCTIONS},
        },
    },
    platform::{
        pci::{PhysicalDevice, ResetSupport},
        sim::{self, SimPlatform},
        traps::VmTraps,
        vm::{AssignRequest, LoadOrder, PciDevConfig, VmConfig, VmId},
    },
    vpci::{host_bridge::host_bridge_config, Vpci},
};
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

const SERVICE_VM: VmId = VmId(0);
const GUEST_VM: VmId = VmId(1);
const SERVICE_SEVERITY: u8 = 0x7F;

/// Where firmware put the memory BAR of the `n`-th simulated function.
fn firmware_bar(n: usize) -> u32 {
    0xFE00_0000 + (n as u32) * 0x10_0000
}

/// Plug the simulated functions into the platform and return the ones the service VM owns.
fn build_platform(args: &Cli, sim: &SimPlatform) -> Result<Vec<PciDevConfig>> {
    let defaults = [Bdf::new(0, 3, 0)];
    let devices = if args.devices.is_empty() {
        &defaults[..]
    } else {
        &args.devices[..]
    };

    let endpoints = devices
        .iter()
        .map(|&bdf| (bdf, ResetSupport::ALL))
        .chain(args.no_reset.iter().map(|&bdf| (bdf, ResetSupport::NONE)));

    let mut owned = Vec::new();
    for (n, (bdf, reset)) in endpoints.enumerate() {
        sim.pci.add_function(bdf, sim::nic(0x10d3 + n as u16), reset);
        sim.pci.program_bar(bdf, 2, firmware_bar(n));
        owned.push(bdf);
    }

    for &bdf in &args.bridges {
        sim.pci
            .add_function(bdf, sim::pci_bridge(), ResetSupport::NONE);
        owned.push(bdf);
    }

    for &bdf in &args.hidden {
        sim.pci.add_function(bdf, sim::nic(0x1539), ResetSupport::NONE);
        sim.pci.hide(bdf);
    }

    owned
        .into_iter()
        .map(|bdf| {
            let pdev = PhysicalDevice::probe(sim.pci.as_ref(), bdf)
                .with_context(|| format!("No function answers at {bdf}"))?;
            Ok(PciDevConfig::passthrough(bdf, pdev))
        })
        .collect()
}

/// Walk bus 0 like a guest's PCI driver does, once through CF8h/CFCh and once through ECAM.
fn enumerate(vpci: &Vpci, traps: &VmTraps) {
    let address_port = Request::new(pio::CONFIG_ADDRESS.into(), RequestSize::Size4);
    let data_port = Request::new(pio::CONFIG_DATA.into(), RequestSize::Size4);

    for dev in 0..MAX_BUS_DEVICES {
        for func in 0..MAX_DEVICE_FUNCTIONS {
            let bdf = Bdf::new(0, dev, func);

            traps.pio_write(address_port, ConfigAddress::new(true, bdf, 0).raw().into());
            let pio_id = traps.pio_read(data_port);

            let ecam_id = vpci.mmcfg_base().map(|base| {
                traps.mmio_read(Request::new(base + ecam_offset(bdf, 0), RequestSize::Size4))
            });

            match ecam_id {
                Some(ecam_id) if ecam_id != u64::from(u32::MAX) => {
                    info!("{}: {bdf} {pio_id:08x} (ECAM {ecam_id:08x})", vpci.vm());
                }
                _ if pio_id != u64::from(u32::MAX) => {
                    info!("{}: {bdf} {pio_id:08x}", vpci.vm());
                }
                _ => {}
            }
        }
    }
}

fn main() -> Result<()> {
    let args = Cli::parse();

    tracing_log::LogTracer::init().context("Failed to redirect log records")?;

    let subscriber = FmtSubscriber::builder()
        .with_max_level(match args.verbose {
            0 => Level::INFO,
            1 => Level::DEBUG,
            _ => Level::TRACE,
        })
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .context("Failed to set global tracing subscriber")?;

    let sim = SimPlatform::new(args.mmcfg_base);
    let service_devs = build_platform(&args, &sim)?;

    let service_traps = VmTraps::new();
    let service = Vpci::init(
        &VmConfig {
            vm_id: SERVICE_VM,
            load_order: LoadOrder::ServiceVm,
            severity: SERVICE_SEVERITY,
            pci_devs: service_devs,
        },
        sim.platform(),
        &service_traps,
    )
    .context("Failed to start the service VM")?;

    let guest_traps = VmTraps::new();
    let guest = Vpci::init(
        &VmConfig {
            vm_id: GUEST_VM,
            load_order: LoadOrder::PostLaunched,
            severity: args.guest_severity,
            pci_devs: vec![host_bridge_config()],
        },
        sim.platform(),
        &guest_traps,
    )
    .context("Failed to start the guest")?;

    for assignment in &args.assignments {
        let req = AssignRequest::new(assignment.phys, assignment.virt);

        if let Err(err) = service.assign(&guest, &req) {
            warn!("Skipping assignment of {}: {err}", assignment.phys);
        }
    }

    enumerate(&service, &service_traps);
    enumerate(&guest, &guest_traps);

    guest.deinit(Some(&service));
    service.deinit(None);

    info!(
        "Done after {} IOMMU moves and {} physical config writes",
        sim.iommu.moves().len(),
        sim.pci.writes().len()
    );

    Ok(())
}
