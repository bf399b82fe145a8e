//! # Page-Table Entry (PTE)
//!
//! Every second-level slot holds one 32-bit [`PtEntry`]. The raw word is an
//! implementation detail; all readers go through [`PtEntry::state`], which
//! decodes it into the tagged [`PageState`].
//!
//! ### Bit layout
//!
//! | Bits   | Name      | Meaning |
//! |--------|-----------|---------|
//! | 0      | `valid`   | Page is resident; `number` is a frame number |
//! | 1      | `dirty`   | Resident page was modified since it was loaded |
//! | 2      | `swapped` | Page lives in swap; `number` is a slot index |
//! | 3–11   | reserved  | Always zero |
//! | 12–31  | `number`  | Frame number or swap slot, depending on the flags |
//!
//! `valid` and `swapped` are never set together; an entry with neither is
//! unmapped and has `number == 0`.

use bitfield_struct::bitfield;
use core::fmt;
use kernel_memory_addresses::PhysicalPage;

/// Largest swap slot index a page-table entry can encode.
pub const MAX_SWAP_SLOTS: u32 = 1 << 20;

/// Index of a page-sized slot in the swap area.
#[repr(transparent)]
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct SwapSlot(u32);

impl SwapSlot {
    #[inline]
    #[must_use]
    pub const fn new(index: u32) -> Self {
        debug_assert!(index < MAX_SWAP_SLOTS);
        Self(index)
    }

    #[inline]
    #[must_use]
    pub const fn index(self) -> u32 {
        self.0
    }

    /// Byte offset of this slot on the swap device.
    #[inline]
    #[must_use]
    pub const fn byte_offset(self) -> u64 {
        (self.0 as u64) * (kernel_memory_addresses::PAGE_SIZE as u64)
    }
}

impl fmt::Debug for SwapSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SwapSlot({})", self.0)
    }
}

impl fmt::Display for SwapSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "slot#{}", self.0)
    }
}

/// Translation state of one virtual page.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum PageState {
    /// Never touched, or dropped while clean: backed by the region's initial
    /// content.
    Unmapped,
    /// Occupies a coremap frame.
    Resident { frame: PhysicalPage, dirty: bool },
    /// Evicted; the contents live in a swap slot.
    Swapped(SwapSlot),
}

impl PageState {
    #[inline]
    #[must_use]
    pub const fn is_unmapped(self) -> bool {
        matches!(self, Self::Unmapped)
    }

    #[inline]
    #[must_use]
    pub const fn frame(self) -> Option<PhysicalPage> {
        match self {
            Self::Resident { frame, .. } => Some(frame),
            _ => None,
        }
    }

    #[inline]
    #[must_use]
    pub const fn swap_slot(self) -> Option<SwapSlot> {
        match self {
            Self::Swapped(slot) => Some(slot),
            _ => None,
        }
    }
}

/// Raw page-table entry word.
#[doc(alias = "PTE")]
#[bitfield(u32)]
pub struct PtEntry {
    /// Resident (bit 0).
    valid: bool,
    /// Modified since load (bit 1); only meaningful with `valid`.
    dirty: bool,
    /// In swap (bit 2).
    swapped: bool,
    #[bits(9)]
    __: u16,
    /// Frame number or swap slot (bits 12..=31).
    #[bits(20)]
    number: u32,
}

impl PtEntry {
    /// An unmapped entry.
    #[inline]
    #[must_use]
    pub const fn zero() -> Self {
        Self::new()
    }

    /// Decode the entry.
    #[inline]
    #[must_use]
    pub const fn state(self) -> PageState {
        if self.valid() {
            PageState::Resident {
                frame: PhysicalPage::new(self.number()),
                dirty: self.dirty(),
            }
        } else if self.swapped() {
            PageState::Swapped(SwapSlot::new(self.number()))
        } else {
            PageState::Unmapped
        }
    }

    /// Encode a [`PageState`].
    #[inline]
    #[must_use]
    pub const fn from_state(state: PageState) -> Self {
        match state {
            PageState::Unmapped => Self::new(),
            PageState::Resident { frame, dirty } => Self::new()
                .with_valid(true)
                .with_dirty(dirty)
                .with_number(frame.number()),
            PageState::Swapped(slot) => Self::new().with_swapped(true).with_number(slot.index()),
        }
    }

    #[inline]
    #[must_use]
    pub const fn is_unmapped(self) -> bool {
        !self.valid() && !self.swapped()
    }
}

impl From<PageState> for PtEntry {
    fn from(value: PageState) -> Self {
        Self::from_state(value)
    }
}
