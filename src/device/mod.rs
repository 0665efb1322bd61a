//! # Device Emulation Code
//!
//! Generic building blocks for emulated devices. This module should never depend on
//! hypervisor specific parts.

#![deny(missing_docs)]
#![deny(rustdoc::all)]
#![deny(clippy::must_use_candidate)]
#![deny(missing_debug_implementations)]

pub mod bus;
pub mod dynamic_bus;
pub mod pci;
pub mod register_set;
