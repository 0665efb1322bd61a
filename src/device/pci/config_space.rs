//! # PCI Configuration Space Helpers
//!
//! This module contains helpers for creating and walking a PCI Configuration Space. To construct
//! a Configuration Space use [`ConfigSpaceBuilder`]. The capability walkers work on any function
//! that can be read, so they are used for emulated and physical functions alike.

use crate::device::{
    bus::{Request, RequestSize},
    register_set::{RegisterSet, RegisterSetBuilder},
};

use super::constants::config_space::{
    self, command, extended_header, header_type, mask,
    mask::CAPABILITIES_POINTER as CAPABILITY_POINTER_MASK, offset, status, BAR_ENTRY_SIZE,
    EXTENDED_CAPABILITIES, MAX_BARS, MAX_BRIDGE_BARS,
};

/// The offset at which we start to allocate capabilities.
const INITIAL_CAPABILITY_OFFSET: u8 = 0x40;

/// The size of a standard capability header (ID and next pointer).
const CAPABILITY_HEADER_SIZE: usize = 2;

/// The size of an extended capability header.
const EXTENDED_HEADER_SIZE: usize = 4;

/// What a single BAR register decodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BarKind {
    /// A port I/O window.
    Io,
    /// A memory window below 4 GiB.
    Mem32,
    /// The lower half of a 64-bit memory window.
    Mem64,
    /// The upper half of a 64-bit memory window. It carries no type bits.
    Mem64High,
}

/// Meta-information about a PCI BAR register.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BarInfo {
    /// The size of the whole region in bytes. Both halves of a 64-bit BAR carry the same size.
    pub size: u64,

    /// How this register decodes.
    pub kind: BarKind,

    /// Whether the memory window is prefetchable.
    pub prefetchable: bool,
}

impl BarInfo {
    /// The low bits of the register that describe the BAR type.
    #[must_use]
    pub const fn type_bits(&self) -> u32 {
        let prefetchable = if self.prefetchable {
            mask::MMIO_BAR_PREFETCHABLE
        } else {
            0
        };

        match self.kind {
            BarKind::Io => mask::PIO_BAR_MARKER,
            BarKind::Mem32 => prefetchable,
            BarKind::Mem64 => mask::MMIO_BAR_64_BIT | prefetchable,
            BarKind::Mem64High => 0,
        }
    }

    /// The address bits that stay set after the guest wrote all ones to size the BAR.
    #[must_use]
    pub const fn address_mask(&self) -> u32 {
        let size_mask = !(self.size - 1);

        match self.kind {
            BarKind::Io => size_mask as u32 & mask::PIO_BAR_ADDRESS,
            BarKind::Mem32 | BarKind::Mem64 => size_mask as u32 & mask::MMIO_BAR_ADDRESS,
            BarKind::Mem64High => (size_mask >> 32) as u32,
        }
    }
}

/// A builder for [`ConfigSpace`] objects.
#[derive(Debug, Clone)]
pub struct ConfigSpaceBuilder {
    reg_builder: RegisterSetBuilder<{ config_space::SIZE }>,
    multifunction: bool,
    bridge: bool,
    revision: u8,
    interrupt_pin: u8,
    interrupt_line: u8,
    status: u16,

    bars: [Option<BarInfo>; MAX_BARS],

    /// The offset in the Configuration Space where we add the next capability.
    ///
    /// This has to be a 4-byte aligned address as mandated by the PCI specification.
    next_capability_offset: u8,

    /// The offset where the capability pointer needs to be updated when we add a capability,
    last_capability_pointer: u8,

    /// Where the next extended capability goes.
    next_extended_offset: usize,

    /// The offset and header value of the last extended capability, whose next pointer we patch.
    last_extended_header: Option<(usize, u32)>,
}

impl ConfigSpaceBuilder {
    /// Create a builder for [`ConfigSpace`] with default settings.
    ///
    /// This will create a Configuration Space with default behavior for standard fields.
    ///
    /// There are pre-defined constants for [`vendor`](super::constants::config_space::vendor) and
    /// [`device`](super::constants::config_space::device) IDs.
    #[must_use]
    pub fn new(vendor: u16, device: u16) -> Self {
        let mut reg_builder = RegisterSetBuilder::<{ config_space::SIZE }>::new();

        reg_builder
            .u16_le_ro_at(offset::VENDOR, vendor)
            .u16_le_ro_at(offset::DEVICE, device)
            .u16_le_at(offset::COMMAND, 0, command::WRITABLE_BITS)
            .u8_rw_at(offset::CACHE_LINE_SIZE, 0)
            .u8_rw_at(offset::LATENCY_TIMER, 0)
            .u8_ro_at(offset::BIST, 0)
            .u32_le_ro_at(offset::ROM_BAR, 0)
            .u8_ro_at(offset::MIN_GNT, 0)
            .u8_ro_at(offset::MAX_LAT, 0)
            // An empty extended capability list.
            .u32_le_ro_at(EXTENDED_CAPABILITIES as usize, 0);

        for i in 0..MAX_BARS {
            // Unimplemented BARs are hardwired to zero.
            reg_builder.u32_le_ro_at(offset::BAR_0 + i * 4, 0);
        }

        Self {
            reg_builder,
            multifunction: false,
            bridge: false,
            revision: 0,
            interrupt_pin: 0,
            interrupt_line: 255,
            status: 0,
            bars: [None; MAX_BARS],

            // If you change the initial value, be sure to check whether we still set the `STATUS`
            // bit correctly when we finalize the Configuration Space.
            next_capability_offset: INITIAL_CAPABILITY_OFFSET,
            last_capability_pointer: offset::CAPABILITIES_POINTER as u8,

            next_extended_offset: EXTENDED_CAPABILITIES as usize,
            last_extended_header: None,
        }
    }

    /// Configure the class and subclass field.
    ///
    /// When these are not set, they default to `0xFF`, which is the undefined device class and
    /// subclass.
    ///
    /// There are pre-defined constants for [`class`](super::constants::config_space::class) and
    /// [`subclass`](super::constants::config_space::subclass) fields.
    #[must_use]
    pub fn class(mut self, class: u8, subclass: u8, prog_if: u8) -> Self {
        self.reg_builder
            .u8_ro_at(offset::CLASS, class)
            .u8_ro_at(offset::SUBCLASS, subclass)
            .u8_ro_at(offset::PROG_IF, prog_if);

        self
    }

    /// Configure the revision field for this device.
    ///
    /// When not specified, the revision defaults to 0.
    #[must_use]
    pub fn revision(mut self, revision: u8) -> Self {
        self.revision = revision;

        self
    }

    /// Configure the subsystem and subsystem vendor IDs.
    #[must_use]
    pub fn subsystem(mut self, subsystem_vendor_id: u16, subsystem_id: u16) -> Self {
        self.reg_builder
            .u16_le_ro_at(offset::SUBSYSTEM_VENDOR_ID, subsystem_vendor_id)
            .u16_le_ro_at(offset::SUBSYSTEM_ID, subsystem_id);

        self
    }

    /// Mark the device as a multifunction device.
    ///
    /// This is necessary for guests to probe additional functions on this device.
    #[must_use]
    pub fn multifunction(mut self) -> Self {
        self.multifunction = true;
        self
    }

    /// Use the type 1 header layout of a PCI-to-PCI bridge.
    ///
    /// Bridges have two BARs and writable bus number registers.
    #[must_use]
    pub fn bridge(mut self) -> Self {
        assert!(
            self.bars[MAX_BRIDGE_BARS..].iter().all(Option::is_none),
            "A bridge only has {MAX_BRIDGE_BARS} BARs"
        );

        self.bridge = true;
        self.reg_builder
            .u32_le_at(offset::PRIMARY_BUS, 0, 0x00FF_FFFF)
            .u32_le_ro_at(offset::BRIDGE_ROM_BAR, 0);

        self
    }

    /// Configure the PCI interrupt pin information field for this device.
    ///
    /// When not specified, the interrupt pin defaults to 0 (None).
    #[must_use]
    pub fn interrupt_pin(mut self, irq_pin: u8) -> Self {
        self.interrupt_pin = irq_pin;

        self
    }

    /// Configure the PCI interrupt line information field for this device.
    ///
    /// When not specified, the interrupt line defaults to `0xff` (not connected).
    #[must_use]
    pub fn interrupt_line(mut self, irq_line: u8) -> Self {
        self.interrupt_line = irq_line;

        self
    }

    fn claim_bar(&mut self, index: u8, info: BarInfo) {
        let index: usize = index.into();
        let max_bars = if self.bridge {
            MAX_BRIDGE_BARS
        } else {
            MAX_BARS
        };

        assert!(index < max_bars);
        assert_eq!(self.bars[index], None);
        assert!(info.size.is_power_of_two());

        self.reg_builder.u32_le_at(
            offset::BAR_0 + index * BAR_ENTRY_SIZE as usize,
            info.type_bits(),
            info.address_mask(),
        );
        self.bars[index] = Some(info);
    }

    /// Add a Base Address Register (BAR) for a non-prefetchable 32-bit memory region.
    ///
    /// Size must be a power of 2 and at least 16 bytes, but 4 KiB is the recommended minimum.
    #[must_use]
    pub fn mem32_nonprefetchable_bar(mut self, index: u8, size: u32) -> Self {
        assert!(size >= 16);

        self.claim_bar(
            index,
            BarInfo {
                size: size.into(),
                kind: BarKind::Mem32,
                prefetchable: false,
            },
        );
        self
    }

    /// Add a prefetchable 64-bit memory BAR. It occupies `index` and `index + 1`.
    #[must_use]
    pub fn mem64_prefetchable_bar(mut self, index: u8, size: u64) -> Self {
        assert!(size >= 16);

        let low = BarInfo {
            size,
            kind: BarKind::Mem64,
            prefetchable: true,
        };

        self.claim_bar(index, low);
        self.claim_bar(
            index + 1,
            BarInfo {
                kind: BarKind::Mem64High,
                ..low
            },
        );
        self
    }

    /// Add a port I/O BAR.
    #[must_use]
    pub fn io_bar(mut self, index: u8, size: u32) -> Self {
        assert!(size >= 4);

        self.claim_bar(
            index,
            BarInfo {
                size: size.into(),
                kind: BarKind::Io,
                prefetchable: false,
            },
        );
        self
    }

    /// Add a PCI capability to the Configuration Space.
    ///
    /// The given `regs` must not contain the generic PCI Capability header (ID and next
    /// pointer). These fields will be added automatically.
    #[must_use]
    pub fn capability<const CAP_SIZE: usize>(
        mut self,
        capability_id: u8,
        regs: &RegisterSet<CAP_SIZE>,
    ) -> Self {
        let offset = self.next_capability_offset;
        assert_eq!(offset & !CAPABILITY_POINTER_MASK, 0);

        let next_offset = usize::from(offset) + CAPABILITY_HEADER_SIZE + CAP_SIZE;
        assert!(next_offset <= u8::MAX.into());

        // The next capability must start at an aligned address.
        self.next_capability_offset =
            ((next_offset + !usize::from(CAPABILITY_POINTER_MASK)) as u8) & CAPABILITY_POINTER_MASK;

        self.reg_builder
            // Extend the capability pointer list to include the new capability.
            .u8_ro_at(self.last_capability_pointer.into(), offset)
            // Add the capability header. The next pointer will be written when we add the next
            // capability or when we finalize the Configuration Space.
            .u8_ro_at(offset.into(), capability_id)
            // Add the register body.
            .register_set_at(usize::from(offset) + CAPABILITY_HEADER_SIZE, regs);

        self.last_capability_pointer = offset + 1;
        self
    }

    /// Add a PCI Express extended capability behind the legacy Configuration Space.
    ///
    /// As with [`capability`](Self::capability), `regs` excludes the 4-byte header.
    #[must_use]
    pub fn extended_capability<const CAP_SIZE: usize>(
        mut self,
        capability_id: u16,
        version: u8,
        regs: &RegisterSet<CAP_SIZE>,
    ) -> Self {
        let offset = self.next_extended_offset;
        let next_offset = (offset + EXTENDED_HEADER_SIZE + CAP_SIZE).next_multiple_of(4);
        assert!(next_offset <= config_space::SIZE);

        if let Some((last_offset, last_header)) = self.last_extended_header {
            self.reg_builder.u32_le_ro_at(
                last_offset,
                last_header | (offset as u32) << extended_header::NEXT_SHIFT,
            );
        }

        let header = u32::from(capability_id) | u32::from(version & 0xF) << extended_header::VERSION_SHIFT;

        self.reg_builder
            .u32_le_ro_at(offset, header)
            .register_set_at(offset + EXTENDED_HEADER_SIZE, regs);

        self.last_extended_header = Some((offset, header));
        self.next_extended_offset = next_offset;
        self
    }

    /// Check whether there is a configured memory BAR with at least the given size.
    fn has_memory_bar(&self, bar_no: u8, minimum_size: u64) -> bool {
        matches!(
            self.bars[usize::from(bar_no)],
            Some(BarInfo { size, kind: BarKind::Mem32 | BarKind::Mem64, .. }) if size >= minimum_size
        )
    }

    /// Add an MSI capability with a single vector.
    #[must_use]
    pub fn msi_capability(self, address_64_bit: bool) -> Self {
        use config_space::msi::control;

        if address_64_bit {
            let msi_cap: RegisterSet<12> = RegisterSetBuilder::<12>::new()
                .u16_le_at(0, control::ADDRESS_64_BIT, control::WRITABLE_BITS)
                .u32_le_at(2, 0, !0b11)
                .u32_le_rw_at(6, 0)
                .u16_le_rw_at(10, 0)
                .into();

            self.capability(config_space::capability_id::MSI, &msi_cap)
        } else {
            let msi_cap: RegisterSet<8> = RegisterSetBuilder::<8>::new()
                .u16_le_at(0, 0, control::WRITABLE_BITS)
                .u32_le_at(2, 0, !0b11)
                .u16_le_rw_at(6, 0)
                .into();

            self.capability(config_space::capability_id::MSI, &msi_cap)
        }
    }

    /// Add a MSI-X capability.
    ///
    /// MSI-X allows devices to configure a large number of MSIs via two regions in their memory BARs:
    ///
    /// - the MSI-X table, an array of MSI address/data fields per MSI plus control bits,
    /// - the Pending Bit Array (PBA), a bit field that indicates which of these interrupts is currently pending.
    ///
    /// # Parameters
    ///
    /// - `msix_count`: The number of MSI-X vectors.
    /// - `table_bar_no`: The index of the BAR that contains the MSI-X table.
    /// - `table_bar_offset`: The offset of the MSI-X table in the given BAR in bytes. Must be 8-byte aligned.
    /// - `pba_bar_no`: The index of the BAR that contains the PBA.
    /// - `pba_bar_offset`: The offset of the PBA in the given BAR in bytes. Must be 8-byte aligned.
    #[must_use]
    pub fn msix_capability(
        self,
        msix_count: u16,
        table_bar_no: u8,
        table_bar_offset: u32,
        pba_bar_no: u8,
        pba_bar_offset: u32,
    ) -> Self {
        use config_space::msix;

        assert!(msix_count > 0);
        assert!(msix_count <= msix::MAX_VECTORS);

        assert_eq!(table_bar_offset & msix::table_info::REGION, 0);
        assert!(
            self.has_memory_bar(
                table_bar_no,
                u64::from(table_bar_offset) + u64::from(msix_count) * msix::TABLE_ENTRY_SIZE
            ),
            "MSI-X capability points to mismatching BAR for the MSI-X table"
        );

        assert_eq!(pba_bar_offset & msix::table_info::REGION, 0);

        // The PBA is an array of 64-bit words.
        let pba_bytes = u64::from(msix_count).div_ceil(64) * 8;
        assert!(self.has_memory_bar(pba_bar_no, u64::from(pba_bar_offset) + pba_bytes));

        let msix_cap: RegisterSet<10> = RegisterSetBuilder::<10>::new()
            // The capability stores the last valid MSI-X table index.
            .u16_le_at(0, msix_count - 1, msix::control::WRITABLE_BITS)
            .u32_le_ro_at(2, table_bar_offset | u32::from(table_bar_no))
            .u32_le_ro_at(6, pba_bar_offset | u32::from(pba_bar_no))
            .into();

        self.capability(config_space::capability_id::MSI_X, &msix_cap)
    }

    /// Add an SR-IOV extended capability announcing `total_vfs` virtual functions.
    #[must_use]
    pub fn sriov_capability(self, total_vfs: u16) -> Self {
        const BODY_SIZE: usize = config_space::sriov::SIZE as usize - EXTENDED_HEADER_SIZE;

        // TotalVFs sits at offset 0x0E of the capability, i.e. 0x0A into the body.
        let body: RegisterSet<BODY_SIZE> = RegisterSetBuilder::<BODY_SIZE>::new()
                .u32_le_ro_at(0, 0)
                .u32_le_at(4, 0, 0x0000_001F)
                .u16_le_ro_at(8, total_vfs)
                .u16_le_ro_at(10, total_vfs)
                .into();

        self.extended_capability(config_space::extended_capability_id::SRIOV, 1, &body)
    }

    /// Create the finalized Configuration Space object.
    #[must_use]
    pub fn config_space(mut self) -> ConfigSpace {
        let layout = if self.bridge {
            header_type::BRIDGE
        } else {
            header_type::TYPE_00
        };

        ConfigSpace {
            bars: self.bars,
            config_space: self
                .reg_builder
                // This field is written by firmware at boot time to indicate which PIC pin the
                // interrupt is routed to. A value of 255 means "no connection" and this is a good
                // default.
                .u8_rw_at(offset::IRQ_LINE, self.interrupt_line)
                // This is the physical PCI interrupt pin the device is connected to. A value of 0 means
                // that its not connected to any interrupt line.
                .u8_ro_at(offset::IRQ_PIN, self.interrupt_pin)
                // The status field is not actually read-only in hardware. It has error bits that can be
                // cleared by writing 1 into them. As we can never set these bits, we get the correct
                // semantics by hardcoding the error bits to zero.
                .u16_le_ro_at(
                    offset::STATUS,
                    self.status
                        | if self.next_capability_offset == INITIAL_CAPABILITY_OFFSET {
                            0
                        } else {
                            status::CAPABILITIES
                        },
                )
                .u8_ro_at(offset::REVISION, self.revision)
                .u8_ro_at(
                    offset::HEADER_TYPE,
                    layout
                        | if self.multifunction {
                            header_type::MULTIFUNCTION
                        } else {
                            0
                        },
                )
                // Finalize the list of capabilities by ending the pointer chain.
                .u8_ro_at(self.last_capability_pointer.into(), 0)
                .into(),
        }
    }
}

/// The Configuration Space of a PCI function.
///
/// Use [`ConfigSpaceBuilder`] to construct an emulated one, or [`ConfigSpace::shadow`] for a
/// plain buffer that backs virtualized registers.
///
/// # Limitations
///
/// This Configuration Space emulation is currently limited by not supporting any side effects for
/// writes. That means any register in the config space that needs to behave differently from memory
/// cannot be represented. This stems from the underlying limitation of [`RegisterSet`].
#[derive(Debug, Clone)]
pub struct ConfigSpace {
    config_space: RegisterSet<{ config_space::SIZE }>,
    bars: [Option<BarInfo>; MAX_BARS],
}

/// An iterator that yields offsets of standard PCI capabilities.
struct CapabilityIterator<F> {
    read: F,
    cap_offset: u8,
    remaining: usize,
}

impl<F: Fn(Request) -> u64> Iterator for CapabilityIterator<F> {
    type Item = u8;

    fn next(&mut self) -> Option<Self::Item> {
        if self.cap_offset == 0 || self.remaining == 0 {
            return None;
        }
        self.remaining -= 1;

        let cap_ptr = (self.read)(Request::new(self.cap_offset.into(), RequestSize::Size1)) as u8
            & CAPABILITY_POINTER_MASK;

        if cap_ptr < INITIAL_CAPABILITY_OFFSET {
            self.cap_offset = 0;
            None
        } else {
            // The pointer points to the ID field. The next offset is one byte after it.
            self.cap_offset = cap_ptr + 1;
            Some(cap_ptr)
        }
    }
}

/// Walk the standard capability list of a function.
///
/// `read` reads the function's Configuration Space. The walk stops at a null pointer or once the
/// list would have to loop.
pub fn capability_offsets(read: impl Fn(Request) -> u64) -> impl Iterator<Item = u8> {
    CapabilityIterator {
        read,
        cap_offset: offset::CAPABILITIES_POINTER as u8,
        remaining: (usize::from(u8::MAX) - usize::from(INITIAL_CAPABILITY_OFFSET)) / 4,
    }
}

/// An iterator over the extended capability list. Yields `(id, offset)`.
struct ExtendedCapabilityIterator<F> {
    read: F,
    cap_offset: u32,
    remaining: usize,
}

impl<F: Fn(Request) -> u64> Iterator for ExtendedCapabilityIterator<F> {
    type Item = (u16, u32);

    fn next(&mut self) -> Option<Self::Item> {
        if self.cap_offset < EXTENDED_CAPABILITIES || self.remaining == 0 {
            return None;
        }
        self.remaining -= 1;

        let header = (self.read)(Request::new(self.cap_offset.into(), RequestSize::Size4)) as u32;

        // Absent functions read as all ones and an empty list has a zero header.
        if header == 0 || header == u32::MAX {
            return None;
        }

        let current = self.cap_offset;
        self.cap_offset = (header >> extended_header::NEXT_SHIFT) & extended_header::NEXT_MASK;

        Some(((header & extended_header::ID_MASK) as u16, current))
    }
}

/// Walk the PCI Express extended capability list of a function.
pub fn extended_capability_offsets(
    read: impl Fn(Request) -> u64,
) -> impl Iterator<Item = (u16, u32)> {
    ExtendedCapabilityIterator {
        read,
        cap_offset: EXTENDED_CAPABILITIES,
        remaining: (config_space::SIZE - EXTENDED_CAPABILITIES as usize) / EXTENDED_HEADER_SIZE,
    }
}

impl ConfigSpace {
    /// A fully writable buffer that reads all ones until written.
    ///
    /// Pass-through devices keep their virtualized registers here. Every byte is writable,
    /// the access policy lives with the owner of the buffer.
    #[must_use]
    pub fn shadow() -> Self {
        Self {
            config_space: RegisterSetBuilder::<{ config_space::SIZE }>::new()
                .rw_range(0..config_space::SIZE)
                .build(),
            bars: [None; MAX_BARS],
        }
    }

    /// Read from the Configuration Space.
    #[must_use]
    pub fn read(&self, req: Request) -> u64 {
        self.config_space.read(req)
    }

    /// Write to the Configuration Space, honoring the writable bits of each register.
    pub fn write(&mut self, req: Request, value: u64) {
        self.config_space.write(req, value);
    }

    /// Write to the Configuration Space regardless of writability.
    pub fn write_direct(&mut self, req: Request, value: u64) {
        self.config_space.write_direct(req, value);
    }

    /// The size of the Configuration Space in bytes.
    #[must_use]
    pub const fn size(&self) -> u64 {
        self.config_space.size()
    }

    /// Iterate over all capabilities of the Configuration Space.
    ///
    /// The resulting iterator returns the Configuration Space offset of each standard PCI
    /// capability.
    pub fn iter_capability_offsets(&self) -> impl Iterator<Item = u8> + '_ {
        capability_offsets(|req| self.read(req))
    }

    /// Iterate over all extended capabilities as `(id, offset)` pairs.
    pub fn iter_extended_capabilities(&self) -> impl Iterator<Item = (u16, u32)> + '_ {
        extended_capability_offsets(|req| self.read(req))
    }

    /// Retrieve information about a specific BAR.
    #[must_use]
    pub fn bar(&self, bar_no: u8) -> Option<BarInfo> {
        self.bars.get(usize::from(bar_no)).and_then(|&b| b)
    }
}
