use crate::{DirectoryIndex, PAGE_SHIFT, PageOffset, TableIndex, VirtualAddress};
use core::fmt;

/// Virtual page, identified by its virtual page number.
///
/// ### Examples
/// ```rust
/// # use kernel_memory_addresses::*;
/// let va = VirtualAddress::new(0x0040_0abc);
/// let vp = va.page();
/// assert_eq!(vp.number(), 0x400);
/// assert_eq!(vp.join(va.offset()), va);
/// ```
#[repr(transparent)]
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct VirtualPage(u32);

impl VirtualPage {
    #[inline]
    #[must_use]
    pub const fn new(number: u32) -> Self {
        debug_assert!(number < (1 << (32 - PAGE_SHIFT)));
        Self(number)
    }

    /// Page that contains `addr` (aligns down to page boundary).
    #[inline]
    #[must_use]
    pub const fn containing_address(addr: VirtualAddress) -> Self {
        addr.page()
    }

    /// Rebuild a page from its two table indices.
    #[inline]
    #[must_use]
    pub const fn from_indices(dir: DirectoryIndex, table: TableIndex) -> Self {
        Self(((dir.as_usize() as u32) << 10) | table.as_usize() as u32)
    }

    #[inline]
    #[must_use]
    pub const fn number(self) -> u32 {
        self.0
    }

    #[inline]
    #[must_use]
    pub const fn base(self) -> VirtualAddress {
        VirtualAddress::new(self.0 << PAGE_SHIFT)
    }

    #[inline]
    #[must_use]
    pub const fn join(self, off: PageOffset) -> VirtualAddress {
        VirtualAddress::new((self.0 << PAGE_SHIFT) | off.as_u32())
    }

    #[inline]
    #[must_use]
    pub const fn indices(self) -> (DirectoryIndex, TableIndex) {
        (DirectoryIndex::from(self.base()), TableIndex::from(self.base()))
    }

    /// The page `count` pages after this one.
    #[inline]
    #[must_use]
    pub const fn offset_by(self, count: u32) -> Self {
        Self(self.0 + count)
    }
}

impl fmt::Display for VirtualPage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.base(), f)
    }
}

impl fmt::Debug for VirtualPage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VirtualPage({:#07X})", self.0)
    }
}

impl TryFrom<VirtualAddress> for VirtualPage {
    type Error = ();

    #[inline]
    fn try_from(va: VirtualAddress) -> Result<Self, ()> {
        if va.is_page_aligned() {
            Ok(va.page())
        } else {
            Err(())
        }
    }
}
