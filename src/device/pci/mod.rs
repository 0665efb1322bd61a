//! # PCI Configuration Space Emulation
//!
//! Addressing of PCI functions in [`address`], the emulated Configuration Space in
//! [`config_space`] and the constants of the PCI specifications in [`constants`].

pub mod address;
pub mod config_space;
pub mod constants;
