//! # Physical PCI Access
//!
//! The hypervisor reaches physical functions through [`PhysicalPci`]. What it learns about a
//! function when the platform is enumerated is kept in a [`PhysicalDevice`].

use std::{fmt::Debug, ops::Range};

use tracing::debug;

use crate::device::{
    bus::{Request, RequestSize},
    pci::{
        address::Bdf,
        config_space::{BarInfo, BarKind},
        constants::config_space::{
            header_type, mask, offset, vendor, BAR_ENTRY_SIZE, MAX_BARS, MAX_BRIDGE_BARS,
        },
    },
};

/// The hardware reset methods a function supports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ResetSupport {
    /// Reset by a D3hot to D0 transition.
    pub pm_reset: bool,
    /// PCI Express Function Level Reset.
    pub flr: bool,
    /// FLR through the Advanced Features capability.
    pub af_flr: bool,
}

impl ResetSupport {
    /// A function that supports every reset method.
    pub const ALL: Self = Self {
        pm_reset: true,
        flr: true,
        af_flr: true,
    };

    /// A function that cannot be reset.
    pub const NONE: Self = Self {
        pm_reset: false,
        flr: false,
        af_flr: false,
    };

    /// Whether any reset method is available.
    #[must_use]
    pub const fn any(self) -> bool {
        self.pm_reset || self.flr || self.af_flr
    }
}

/// A BAR as found during enumeration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PhysicalBar {
    /// The host physical base address of the whole region.
    pub base: u64,

    /// Size and decoding of this register.
    pub info: BarInfo,
}

/// A physical PCI function as found during enumeration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhysicalDevice {
    /// The physical address of the function.
    pub bdf: Bdf,

    /// The header layout without the multifunction bit.
    pub hdr_type: u8,

    /// Which reset methods the function supports.
    pub reset: ResetSupport,

    /// The decoded BARs. Unimplemented BARs are `None`.
    pub bars: [Option<PhysicalBar>; MAX_BARS],

    /// The raw BAR register values as last programmed. These are written back when the
    /// function lost its BARs in a reset.
    pub bar_regs: [u32; MAX_BARS],
}

impl PhysicalDevice {
    /// Enumerate the function at `bdf`. Returns `None` if nothing answers.
    ///
    /// BARs are sized by writing all ones and reading back which bits stick. The original
    /// register values are restored afterwards.
    #[must_use]
    pub fn probe(pci: &dyn PhysicalPci, bdf: Bdf) -> Option<Self> {
        let vendor_id = pci.read_cfg(bdf, Request::new(offset::VENDOR as u64, RequestSize::Size2));
        if vendor_id == u32::from(vendor::INVALID) {
            return None;
        }

        let hdr_type = pci.read_cfg(
            bdf,
            Request::new(offset::HEADER_TYPE as u64, RequestSize::Size1),
        ) as u8
            & header_type::LAYOUT_MASK;

        let mut dev = Self {
            bdf,
            hdr_type,
            reset: pci.reset_support(bdf),
            bars: [None; MAX_BARS],
            bar_regs: [0; MAX_BARS],
        };

        let nr_bars = dev.nr_bars();
        let mut idx = 0;
        while idx < nr_bars {
            idx += dev.probe_bar(pci, idx, nr_bars);
        }

        debug!("Found {bdf} with header type {hdr_type}: {:x?}", dev.bars);

        Some(dev)
    }

    /// Size the BAR at `idx` and return how many registers it occupies.
    fn probe_bar(&mut self, pci: &dyn PhysicalPci, idx: usize, nr_bars: usize) -> usize {
        let bdf = self.bdf;
        let size_register = |idx: usize| -> (u32, u32) {
            let req = Request::new(bar_offset(idx), RequestSize::Size4);
            let value = pci.read_cfg(bdf, req);

            pci.write_cfg(bdf, req, u32::MAX);
            let sizing = pci.read_cfg(bdf, req);
            pci.write_cfg(bdf, req, value);

            (value, sizing)
        };

        let (value, sizing) = size_register(idx);
        self.bar_regs[idx] = value;

        if value & mask::PIO_BAR_MARKER != 0 {
            let address_mask = sizing & mask::PIO_BAR_ADDRESS;
            if address_mask != 0 {
                self.bars[idx] = Some(PhysicalBar {
                    base: u64::from(value & mask::PIO_BAR_ADDRESS),
                    info: BarInfo {
                        size: 1 << address_mask.trailing_zeros(),
                        kind: BarKind::Io,
                        prefetchable: false,
                    },
                });
            }
            return 1;
        }

        let prefetchable = value & mask::MMIO_BAR_PREFETCHABLE != 0;
        let is_64_bit = value & mask::MMIO_BAR_TYPE == mask::MMIO_BAR_64_BIT && idx + 1 < nr_bars;

        if !is_64_bit {
            let address_mask = sizing & mask::MMIO_BAR_ADDRESS;
            if address_mask != 0 {
                self.bars[idx] = Some(PhysicalBar {
                    base: u64::from(value & mask::MMIO_BAR_ADDRESS),
                    info: BarInfo {
                        size: 1 << address_mask.trailing_zeros(),
                        kind: BarKind::Mem32,
                        prefetchable,
                    },
                });
            }
            return 1;
        }

        let (high_value, high_sizing) = size_register(idx + 1);
        self.bar_regs[idx + 1] = high_value;

        let address_mask =
            u64::from(high_sizing) << 32 | u64::from(sizing & mask::MMIO_BAR_ADDRESS);
        if address_mask != 0 {
            let base = u64::from(high_value) << 32 | u64::from(value & mask::MMIO_BAR_ADDRESS);
            let low = BarInfo {
                size: 1 << address_mask.trailing_zeros(),
                kind: BarKind::Mem64,
                prefetchable,
            };

            self.bars[idx] = Some(PhysicalBar { base, info: low });
            self.bars[idx + 1] = Some(PhysicalBar {
                base,
                info: BarInfo {
                    kind: BarKind::Mem64High,
                    ..low
                },
            });
        }

        2
    }

    /// Record that the BAR register at `idx` now holds `value` and move its region.
    ///
    /// Returns the registers that describe the moved region, both halves for a 64-bit BAR.
    pub fn set_bar_reg(&mut self, idx: usize, value: u32) -> Range<usize> {
        self.bar_regs[idx] = value;

        let Some(bar) = self.bars[idx] else {
            return idx..idx;
        };

        let (regs, base) = match bar.info.kind {
            BarKind::Io => (idx..idx + 1, u64::from(value & mask::PIO_BAR_ADDRESS)),
            BarKind::Mem32 => (idx..idx + 1, u64::from(value & mask::MMIO_BAR_ADDRESS)),
            BarKind::Mem64 | BarKind::Mem64High => {
                let low = if bar.info.kind == BarKind::Mem64 {
                    idx
                } else {
                    idx - 1
                };
                let base = u64::from(self.bar_regs[low + 1]) << 32
                    | u64::from(self.bar_regs[low] & mask::MMIO_BAR_ADDRESS);

                (low..low + 2, base)
            }
        };

        for bar in self.bars[regs.clone()].iter_mut().flatten() {
            bar.base = base;
        }

        regs
    }

    /// Whether the function is a PCI-to-PCI bridge.
    #[must_use]
    pub const fn is_bridge(&self) -> bool {
        self.hdr_type == header_type::BRIDGE
    }

    /// How many BAR registers the header layout has.
    #[must_use]
    pub const fn nr_bars(&self) -> usize {
        if self.is_bridge() {
            MAX_BRIDGE_BARS
        } else {
            MAX_BARS
        }
    }
}

/// The Configuration Space offset of BAR `idx`.
#[must_use]
pub const fn bar_offset(idx: usize) -> u64 {
    offset::BAR_0 as u64 + idx as u64 * BAR_ENTRY_SIZE as u64
}

/// The BAR index of a Configuration Space offset inside the BAR block.
#[must_use]
pub const fn bar_index(offset: u64) -> usize {
    ((offset - offset::BAR_0 as u64) / BAR_ENTRY_SIZE as u64) as usize
}

/// Access to physical PCI functions.
pub trait PhysicalPci: Debug + Send + Sync {
    /// Read from the Configuration Space of a physical function.
    ///
    /// Absent functions read as all ones.
    fn read_cfg(&self, bdf: Bdf, req: Request) -> u32;

    /// Write to the Configuration Space of a physical function.
    fn write_cfg(&self, bdf: Bdf, req: Request, value: u32);

    /// Which reset methods a function supports.
    fn reset_support(&self, bdf: Bdf) -> ResetSupport;

    /// Whether firmware hid the function from enumeration. Such functions are exposed to the
    /// service VM through the ECAM window without any virtualization.
    fn is_platform_hidden(&self, bdf: Bdf) -> bool;

    /// The host physical base of the ECAM window as reported by firmware.
    fn mmcfg_base(&self) -> u64;

    /// Whether a function lost its BAR programming, typically in a reset.
    fn need_bar_restore(&self, pdev: &PhysicalDevice) -> bool {
        (0..pdev.nr_bars()).any(|idx| {
            self.read_cfg(pdev.bdf, Request::new(bar_offset(idx), RequestSize::Size4))
                != pdev.bar_regs[idx]
        })
    }

    /// Write back the BAR programming found at enumeration.
    fn restore_bars(&self, pdev: &PhysicalDevice) {
        debug!("Restoring BARs of {}", pdev.bdf);

        for idx in 0..pdev.nr_bars() {
            self.write_cfg(
                pdev.bdf,
                Request::new(bar_offset(idx), RequestSize::Size4),
                pdev.bar_regs[idx],
            );
        }
    }
}
