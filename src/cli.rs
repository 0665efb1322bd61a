//! This module implements the CLI interface.
//!
//! The binary simulates a small PCI segment, boots a service VM and one guest on it and walks
//! both through the virtual Configuration Space.
use std::str::FromStr;

use clap::Parser;
use hvpci::device::pci::address::{Bdf, ParseBdfError};

/// A function to hand to the guest, optionally at another address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Assignment {
    /// The function as the service VM sees it.
    pub phys: Bdf,
    /// Where the guest sees it.
    pub virt: Bdf,
}

impl FromStr for Assignment {
    type Err = ParseBdfError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once('=') {
            Some((phys, virt)) => Ok(Self {
                phys: phys.parse()?,
                virt: virt.parse()?,
            }),
            None => {
                let phys = s.parse()?;
                Ok(Self { phys, virt: phys })
            }
        }
    }
}

fn parse_address(s: &str) -> Result<u64, std::num::ParseIntError> {
    match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => s.parse(),
    }
}

#[derive(Parser, Debug)]
#[command(
    name = env!("CARGO_PKG_NAME"),
    version = env!("CARGO_PKG_VERSION"),
    author = env!("CARGO_PKG_AUTHORS"),
    about = env!("CARGO_PKG_DESCRIPTION"),
    long_about = None
)]
pub struct Cli {
    /// Enable verbose logging. Can be specified multiple times to
    /// increase verbosity.
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Simulate a network function at this address. Can be specified
    /// multiple times. Defaults to a single function at 00:03.0.
    #[arg(long = "device", value_name = "BDF")]
    pub devices: Vec<Bdf>,

    /// Simulate a PCI-to-PCI bridge at this address.
    #[arg(long = "bridge", value_name = "BDF")]
    pub bridges: Vec<Bdf>,

    /// Simulate a network function that supports no reset method.
    #[arg(long = "no-reset", value_name = "BDF")]
    pub no_reset: Vec<Bdf>,

    /// Simulate a function that firmware hides from enumeration. The
    /// service VM still reaches it through ECAM.
    #[arg(long = "hidden", value_name = "BDF")]
    pub hidden: Vec<Bdf>,

    /// Hand a function to the guest. The guest sees it at VIRT, or at
    /// the same address if VIRT is omitted.
    #[arg(long = "assign", value_name = "PHYS[=VIRT]")]
    pub assignments: Vec<Assignment>,

    /// The severity of the guest. The service VM only sees functions
    /// it handed to guests with a lower severity.
    #[arg(long, value_name = "N", default_value_t = 1)]
    pub guest_severity: u8,

    /// Where firmware places the ECAM window of the service VM.
    #[arg(long, value_name = "ADDR", value_parser = parse_address, default_value = "0xE0000000")]
    pub mmcfg_base: u64,
}
