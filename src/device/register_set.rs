//! # Register Block Abstraction
//!
//! This module helps to emulate contiguous register blocks, such as a PCI Configuration Space,
//! where every bit is either guest-writable or fixed.

use std::{convert::TryInto, ops::Range};

use crate::device::bus::Request;

/// A builder for [`RegisterSet`] objects.
///
/// With this struct the register block can be incrementally constructed
/// and finally converted into a matching `RegisterSet` struct, whose
/// layout is immutable.
///
/// # Examples
///
/// ```
/// use hvpci::device::register_set::*;
///
/// let region: RegisterSet::<8> = RegisterSetBuilder::<8>::new()
///     .u8_ro_at(0, 0xAB)        // A completely read-only byte register containing 0xAB at offset 0.
///     .u8_at(1, 0x10, 0x0F)     // A byte register with writable low nibble at offset 1.
///     .u16_le_rw_at(2, 0xCAFE)  // A little-endian fully writable 16-bit value.
///     .u32_le_ro_at(4, 0xFFFF)  // A read-only 32-bit value.
///     .into();
/// ```
#[derive(Debug, Clone)]
pub struct RegisterSetBuilder<const SIZE: usize> {
    data: [u8; SIZE],
    rw_mask: [u8; SIZE],
}

impl<const SIZE: usize> Default for RegisterSetBuilder<SIZE> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const SIZE: usize> RegisterSetBuilder<SIZE> {
    /// Initialize a builder for a fully read-only register block where
    /// all bits are set.
    #[must_use]
    pub fn new() -> Self {
        Self {
            data: [0xFF; SIZE],
            rw_mask: [0; SIZE],
        }
    }

    fn init_u8_slice(&mut self, pos: usize, value_bytes: &[u8], write_mask_bytes: &[u8]) {
        assert_eq!(value_bytes.len(), write_mask_bytes.len());
        assert!(pos + value_bytes.len() <= SIZE);

        self.data[pos..pos + value_bytes.len()].copy_from_slice(value_bytes);
        self.rw_mask[pos..pos + value_bytes.len()].copy_from_slice(write_mask_bytes);
    }

    /// Place a byte at the specified address with a mask indicating
    /// which bits are writable.
    pub fn u8_at(&mut self, pos: usize, value: u8, write_mask: u8) -> &mut Self {
        self.init_u8_slice(pos, &[value], &[write_mask]);
        self
    }

    /// Place a read-only byte at the given position.
    pub fn u8_ro_at(&mut self, pos: usize, value: u8) -> &mut Self {
        self.u8_at(pos, value, 0)
    }

    /// Place a writable byte at the given position.
    pub fn u8_rw_at(&mut self, pos: usize, value: u8) -> &mut Self {
        self.u8_at(pos, value, 0xFF)
    }

    /// Place a 16-bit value at the specified address in little-endian
    /// order with a mask indicating which bits are writable.
    pub fn u16_le_at(&mut self, pos: usize, value: u16, write_mask: u16) -> &mut Self {
        self.init_u8_slice(pos, &value.to_le_bytes(), &write_mask.to_le_bytes());
        self
    }

    /// Place a read-only 16-bit value at the given position in
    /// little-endian order.
    pub fn u16_le_ro_at(&mut self, pos: usize, value: u16) -> &mut Self {
        self.u16_le_at(pos, value, 0)
    }

    /// Place a writable 16-bit value at the given position in
    /// little-endian order.
    pub fn u16_le_rw_at(&mut self, pos: usize, value: u16) -> &mut Self {
        self.u16_le_at(pos, value, 0xFFFF)
    }

    /// Place a 32-bit value at the specified address in little-endian
    /// order with a mask indicating which bits are writable.
    pub fn u32_le_at(&mut self, pos: usize, value: u32, write_mask: u32) -> &mut Self {
        self.init_u8_slice(pos, &value.to_le_bytes(), &write_mask.to_le_bytes());
        self
    }

    /// Place a read-only 32-bit value at the given position in
    /// little-endian order.
    pub fn u32_le_ro_at(&mut self, pos: usize, value: u32) -> &mut Self {
        self.u32_le_at(pos, value, 0)
    }

    /// Place a writable 32-bit value at the given position in
    /// little-endian order.
    pub fn u32_le_rw_at(&mut self, pos: usize, value: u32) -> &mut Self {
        self.u32_le_at(pos, value, 0xFFFF_FFFF)
    }

    /// Make a range of bytes fully writable without changing their current value.
    pub fn rw_range(&mut self, range: Range<usize>) -> &mut Self {
        assert!(range.end <= SIZE);

        self.rw_mask[range].fill(0xFF);
        self
    }

    /// Place an already existing register set at the given position.
    ///
    /// This allows to compose larger register sets out of smaller ones. The newly created register
    /// set will inherit the current value and read-write attributes of the given part.
    pub fn register_set_at<const PART_SIZE: usize>(
        &mut self,
        pos: usize,
        regs: &RegisterSet<PART_SIZE>,
    ) -> &mut Self {
        assert!(
            pos + PART_SIZE <= SIZE,
            "Not enough space for register set at given position"
        );

        self.init_u8_slice(pos, &regs.data, &regs.rw_mask);
        self
    }

    /// Construct the final register set from the build instructions.
    #[must_use]
    pub fn build(&self) -> RegisterSet<SIZE> {
        RegisterSet {
            data: self.data,
            rw_mask: self.rw_mask,
        }
    }
}

/// A helper for implementing register blocks.
///
/// Each `RegisterSet` contains a compile-time sized memory region with
/// configurable writability.
///
/// `RegisterSets` are constructed using [`RegisterSetBuilder`].
#[derive(Debug, Clone)]
pub struct RegisterSet<const SIZE: usize> {
    data: [u8; SIZE],
    rw_mask: [u8; SIZE],
}

impl<const SIZE: usize> From<&mut RegisterSetBuilder<SIZE>> for RegisterSet<SIZE> {
    fn from(builder: &mut RegisterSetBuilder<SIZE>) -> Self {
        builder.build()
    }
}

impl<const SIZE: usize> From<RegisterSetBuilder<SIZE>> for RegisterSet<SIZE> {
    fn from(builder: RegisterSetBuilder<SIZE>) -> Self {
        builder.build()
    }
}

/// Fold a sequence of bytes into a little-endian value.
///
/// **Note**: This function will cause a runtime error in case the
/// iterator yields more bytes than fit into an u64.
fn fold_iter_le(it: impl Iterator<Item = u8>) -> u64 {
    it.enumerate().fold(0, |acc, (pos, byte)| {
        let bytes_in_u64 = 8;
        assert!(pos < bytes_in_u64);

        acc | u64::from(byte) << (pos * 8)
    })
}

impl<const SIZE: usize> RegisterSet<SIZE> {
    /// The size of the register block in bytes.
    #[must_use]
    pub const fn size(&self) -> u64 {
        SIZE as u64
    }

    /// Read a little-endian value. Bytes beyond the end of the block read as all ones.
    #[must_use]
    pub fn read(&self, req: Request) -> u64 {
        fold_iter_le(req.iter_bytes().map(|r| -> u8 {
            r.addr
                .try_into()
                .ok()
                .and_then(|off: usize| self.data.get(off).copied())
                .unwrap_or(0xFF)
        }))
    }

    /// Write a little-endian value, changing only the writable bits.
    pub fn write(&mut self, req: Request, val: u64) {
        let le_bytes = val.to_le_bytes();

        for (req, &byte) in req.iter_bytes().zip(&le_bytes) {
            let Some(off) = req.addr.try_into().ok().filter(|&off: &usize| off < SIZE) else {
                continue;
            };

            // Keep read-only bits and populate writable bits with new content.
            self.data[off] = (self.data[off] & !self.rw_mask[off]) | (byte & self.rw_mask[off]);
        }
    }

    /// Write the underlying register value regardless of register writability.
    ///
    /// This is typically used by the device emulation logic itself to update
    /// read-only registers.
    pub fn write_direct(&mut self, req: Request, val: u64) {
        let le_bytes = val.to_le_bytes();

        for (req, &byte) in req.iter_bytes().zip(&le_bytes) {
            if let Some(slot) = req
                .addr
                .try_into()
                .ok()
                .and_then(|off: usize| self.data.get_mut(off))
            {
                *slot = byte;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::device::bus::RequestSize;

    #[test]
    fn fold_iter_le_works() {
        let no_bytes: [u8; 0] = [];
        assert_eq!(fold_iter_le(no_bytes.iter().copied()), 0);

        let some_bytes: [u8; 2] = [0x11, 0x22];
        assert_eq!(fold_iter_le(some_bytes.iter().copied()), 0x2211);
    }

    #[test]
    fn unspecified_registers_are_ro_and_have_all_bits_set() {
        let mut region: RegisterSet<8> = RegisterSetBuilder::<8>::new().into();

        assert_eq!(region.read(Request::new(1, RequestSize::Size1)), 0xFF);
        assert_eq!(
            region.read(Request::new(0, RequestSize::Size8)),
            0xFFFF_FFFF_FFFF_FFFF
        );

        region.write(Request::new(0, RequestSize::Size2), 0);
        assert_eq!(region.read(Request::new(0, RequestSize::Size2)), 0xFFFF);
    }

    #[test]
    fn accesses_beyond_the_end_are_harmless() {
        let mut region: RegisterSet<4> = RegisterSetBuilder::<4>::new()
            .u32_le_rw_at(0, 0x1122_3344)
            .into();

        region.write(Request::new(2, RequestSize::Size4), 0);
        region.write_direct(Request::new(3, RequestSize::Size4), 0);

        assert_eq!(region.read(Request::new(0, RequestSize::Size4)), 0x0000_3344);
        assert_eq!(region.read(Request::new(2, RequestSize::Size4)), 0xFFFF_0000);
    }

    #[test]
    fn partially_writable_registers_observe_write_mask() {
        let mut region: RegisterSet<2> = RegisterSetBuilder::<2>::new()
            .u16_le_at(0, 0xCAFE, 0x0F0F)
            .into();

        assert_eq!(region.read(Request::new(0, RequestSize::Size2)), 0xCAFE);

        region.write(Request::new(0, RequestSize::Size2), 0x4433);
        assert_eq!(region.read(Request::new(0, RequestSize::Size2)), 0xC4F3);
    }

    #[test]
    fn can_place_register_set() {
        let part: RegisterSet<4> = RegisterSetBuilder::<4>::new()
            .u32_le_at(0, 0x12345678, 0xFFFF0000)
            .into();
        let mut whole: RegisterSet<16> = RegisterSetBuilder::<16>::new()
            .register_set_at(4, &part)
            .into();

        assert_eq!(whole.read(Request::new(4, RequestSize::Size4)), 0x12345678);

        whole.write(Request::new(4, RequestSize::Size4), 0xABCDEF12);
        assert_eq!(whole.read(Request::new(4, RequestSize::Size4)), 0xABCD5678);
    }

    #[test]
    fn rw_range_keeps_content() {
        let mut region: RegisterSet<4> = RegisterSetBuilder::<4>::new()
            .u16_le_ro_at(0, 0xCAFE)
            .rw_range(1..3)
            .into();

        assert_eq!(region.read(Request::new(0, RequestSize::Size4)), 0xFFFF_CAFE);

        region.write(Request::new(0, RequestSize::Size4), 0);
        assert_eq!(region.read(Request::new(0, RequestSize::Size4)), 0xFF00_00FE);
    }

    #[test]
    fn write_direct_ignores_the_write_mask() {
        let mut region: RegisterSet<2> = RegisterSetBuilder::<2>::new()
            .u16_le_ro_at(0, 0xCAFE)
            .into();

        region.write_direct(Request::new(0, RequestSize::Size2), 0xD00D);
        assert_eq!(region.read(Request::new(0, RequestSize::Size2)), 0xD00D);
    }
}
