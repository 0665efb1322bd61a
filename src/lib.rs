//! # Virtual PCI for a Type-1 Hypervisor
//!
//! This crate emulates the PCI Configuration Space that VMs see and moves physical functions
//! between the service VM and guests.
//!
//! - [`device`] has the generic plumbing: trap dispatch, register blocks and Configuration Space
//!   emulation.
//! - [`platform`] has the interfaces to what the hypervisor provides, plus simulated
//!   implementations of them.
//! - [`vpci`] is the per-VM Configuration Space emulation and the device hand-off.

pub mod device;
pub mod platform;
pub mod vpci;
