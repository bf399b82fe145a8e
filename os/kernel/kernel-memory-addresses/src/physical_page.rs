use crate::{PAGE_SHIFT, PageOffset, PhysicalAddress};
use core::fmt;

/// A physical page frame, identified by its frame number.
///
/// Frame `n` covers the physical bytes `[n * PAGE_SIZE, (n + 1) * PAGE_SIZE)`.
#[repr(transparent)]
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct PhysicalPage(u32);

impl PhysicalPage {
    #[inline]
    #[must_use]
    pub const fn new(number: u32) -> Self {
        debug_assert!(number < (1 << (32 - PAGE_SHIFT)));
        Self(number)
    }

    /// The frame containing `addr` (aligns down).
    #[inline]
    #[must_use]
    pub const fn containing_address(addr: PhysicalAddress) -> Self {
        addr.page()
    }

    /// Frame number (physical page number).
    #[inline]
    #[must_use]
    pub const fn number(self) -> u32 {
        self.0
    }

    /// Frame number as an index into per-frame tables.
    #[inline]
    #[must_use]
    pub const fn index(self) -> usize {
        self.0 as usize
    }

    #[inline]
    #[must_use]
    pub const fn base(self) -> PhysicalAddress {
        PhysicalAddress::new(self.0 << PAGE_SHIFT)
    }

    #[inline]
    #[must_use]
    pub const fn join(self, off: PageOffset) -> PhysicalAddress {
        PhysicalAddress::new((self.0 << PAGE_SHIFT) | off.as_u32())
    }

    /// The frame `count` frames after this one.
    #[inline]
    #[must_use]
    pub const fn offset_by(self, count: u32) -> Self {
        Self(self.0 + count)
    }
}

impl fmt::Debug for PhysicalPage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PhysicalPage({:#07X})", self.0)
    }
}

impl fmt::Display for PhysicalPage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.base(), f)
    }
}

impl TryFrom<PhysicalAddress> for PhysicalPage {
    type Error = ();

    /// Succeeds only for page-aligned addresses.
    #[inline]
    fn try_from(pa: PhysicalAddress) -> Result<Self, ()> {
        if pa.is_page_aligned() {
            Ok(pa.page())
        } else {
            Err(())
        }
    }
}
