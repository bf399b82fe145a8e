//! # User Address Space
//!
//! An [`AddressSpace`] bundles the [`RegionList`] of a process with its
//! two-level [`PageTable`] behind one lock.
//!
//! ## Ownership
//!
//! - The address space owns its page table and therefore every frame and swap
//!   slot its entries name. Tearing it down is the job of the VM layer, which
//!   must empty the table first.
//! - Physical frames refer back to their owner only by [`AddressSpaceId`] and a
//!   weak handle; the coremap never keeps an address space alive.
//!
//! ## Locking
//!
//! [`AddressSpace::lock`] hands out the [`SpaceState`]. The lock ranks above
//! the coremap lock: code holding it may free frames and update the coremap,
//! but must not allocate, since allocating can evict from this very space.
//! Code holding the coremap lock must never wait for it.

mod check;
mod region;

pub use check::{AccessViolation, FaultType, RegionAccess, check_vaddr};
pub use region::{
    Backing, BreakChange, Region, RegionError, RegionKind, RegionList, RegionPerms,
    SegmentReadError, SegmentSource,
};

use crate::page_table::PageTable;
use core::fmt;
use core::sync::atomic::{AtomicU32, Ordering};
use spin::{Mutex, MutexGuard};

/// Identifier of an address space; doubles as the TLB's address-space tag.
#[repr(transparent)]
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct AddressSpaceId(u32);

static NEXT_ID: AtomicU32 = AtomicU32::new(1);

impl AddressSpaceId {
    /// A fresh, never before returned identifier.
    #[must_use]
    pub fn next() -> Self {
        Self(NEXT_ID.fetch_add(1, Ordering::Relaxed))
    }

    #[inline]
    #[must_use]
    pub const fn as_u32(self) -> u32 {
        self.0
    }
}

impl fmt::Debug for AddressSpaceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "as#{}", self.0)
    }
}

impl fmt::Display for AddressSpaceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// The lock-protected contents of an address space.
#[derive(Default)]
pub struct SpaceState {
    pub regions: RegionList,
    pub page_table: PageTable,
}

/// One user address space.
pub struct AddressSpace {
    id: AddressSpaceId,
    state: Mutex<SpaceState>,
}

impl Default for AddressSpace {
    fn default() -> Self {
        Self::new()
    }
}

impl AddressSpace {
    /// An empty address space with a fresh identifier.
    #[must_use]
    pub fn new() -> Self {
        Self::with_regions(RegionList::new())
    }

    /// An address space with the given regions and an empty page table.
    #[must_use]
    pub fn with_regions(regions: RegionList) -> Self {
        Self {
            id: AddressSpaceId::next(),
            state: Mutex::new(SpaceState {
                regions,
                page_table: PageTable::new(),
            }),
        }
    }

    #[inline]
    #[must_use]
    pub const fn id(&self) -> AddressSpaceId {
        self.id
    }

    /// Lock the regions and page table.
    #[inline]
    pub fn lock(&self) -> MutexGuard<'_, SpaceState> {
        self.state.lock()
    }

    /// Lock without spinning; `None` if someone else holds the lock.
    #[inline]
    pub fn try_lock(&self) -> Option<MutexGuard<'_, SpaceState>> {
        self.state.try_lock()
    }
}

impl fmt::Debug for AddressSpace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AddressSpace")
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}

impl Drop for AddressSpace {
    fn drop(&mut self) {
        let mapped = self.state.get_mut().page_table.mapped_pages();
        if mapped != 0 {
            log::warn!("{} dropped with {mapped} pages still mapped", self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::page_table::PageState;
    use kernel_memory_addresses::{PhysicalPage, VirtualPage};

    #[test]
    fn ids_are_unique() {
        let a = AddressSpace::new();
        let b = AddressSpace::new();
        assert_ne!(a.id(), b.id());
        assert!(a.id().as_u32() >= 1);
    }

    #[test]
    fn state_is_reachable_through_the_lock() {
        let space = AddressSpace::new();
        {
            let mut state = space.lock();
            state.regions.define_stack().unwrap();
            state.page_table.set(
                VirtualPage::new(0x7ffff),
                PageState::Resident {
                    frame: PhysicalPage::new(3),
                    dirty: true,
                },
            );
            assert!(space.try_lock().is_none());
        }
        let mut state = space.lock();
        assert!(state.regions.stack().is_some());
        assert_eq!(state.page_table.take_all().len(), 1);
    }
}
