//! # Page Fault Handling
//!
//! Entry point of the trap layer on a TLB miss or a store to a read-only TLB
//! entry. A fault is resolved in three steps:
//!
//! 1. [`check_vaddr`] decides whether the access is legal at all. Illegal
//!    accesses become [`VmError::SegmentationFault`] before anything is
//!    allocated.
//! 2. The page-table entry decides what to do:
//!    - *resident*: refill the TLB. A store to a clean page marks it dirty.
//!    - *unmapped*: allocate a frame and fill it from the region.
//!    - *swapped*: allocate a frame and read the slot back.
//! 3. The TLB entry is installed. Clean pages are always installed read-only
//!    so that the first store traps and the page is marked dirty.
//!
//! A frame is never allocated with the address-space lock held. The new frame
//! stays pinned while it is filled; once the lock is taken again the entry is
//! re-read, and if another thread resolved the same page in the meantime the
//! new frame is released and the fault is retried against the winner's entry.

use alloc::sync::Arc;
use kernel_alloc::PageBuf;
use kernel_memory_addresses::{PAGE_SIZE, PhysicalPage, VirtualAddress, VirtualPage};
use kernel_vmem::{
    AddressSpace, Backing, FaultType, PageState, Region, RegionAccess, SpaceState, check_vaddr,
};

use crate::{Vm, VmError};

/// How a fault was resolved.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum FaultOutcome {
    /// The page was resident; only the TLB (and maybe the dirty bit) changed.
    Refilled(PhysicalPage),
    /// First touch: the page was filled from its region.
    Loaded(PhysicalPage),
    /// The page was read back from swap.
    SwappedIn(PhysicalPage),
}

impl FaultOutcome {
    /// The frame now backing the page.
    #[must_use]
    pub const fn frame(self) -> PhysicalPage {
        match self {
            Self::Refilled(f) | Self::Loaded(f) | Self::SwappedIn(f) => f,
        }
    }
}

impl Vm {
    /// Handle a fault with a raw fault-type code from the trap layer against
    /// the current address space.
    ///
    /// # Errors
    /// [`VmError::InvalidFaultType`] for unknown codes,
    /// [`VmError::NoAddressSpace`] without a current address space, and the
    /// errors of [`Vm::handle_fault`].
    pub fn vm_fault(&self, fault_type: u32, address: VirtualAddress) -> Result<(), VmError> {
        let fault = FaultType::try_from(fault_type).map_err(VmError::InvalidFaultType)?;
        let Some(space) = self.current_space() else {
            return Err(VmError::NoAddressSpace(address));
        };
        self.handle_fault(&space, fault, address).map(|_| ())
    }

    /// Resolve `fault` at `address` in `space`.
    ///
    /// # Errors
    /// [`VmError::SegmentationFault`] for illegal accesses;
    /// [`VmError::OutOfMemory`], [`VmError::SwapExhausted`] and I/O errors
    /// when the page cannot be brought in.
    pub fn handle_fault(
        &self,
        space: &Arc<AddressSpace>,
        fault: FaultType,
        address: VirtualAddress,
    ) -> Result<FaultOutcome, VmError> {
        let page = address.page();
        loop {
            let mut state = space.lock();
            let access = self.check_access(&mut state, fault, address)?;
            let entry = state.page_table.get(page);

            if let PageState::Resident { frame, dirty } = entry {
                self.refill(space, &mut state, page, frame, dirty, fault, access);
                return Ok(FaultOutcome::Refilled(frame));
            }

            let Some(region) = state.regions.find(address).cloned() else {
                unreachable!("check_vaddr accepted {address} outside every region");
            };
            drop(state);

            log::trace!("{} {fault} fault at {address}: {entry:?}", space.id());
            if let Some(outcome) = self.load_page(space, &region, page, entry, fault)? {
                return Ok(outcome);
            }
            log::debug!("{} lost a race on {page}, retrying", space.id());
        }
    }

    /// Bring a swapped page of `space` back into memory.
    ///
    /// Returns `Ok(None)` if the page at `address` is not swapped out.
    ///
    /// # Errors
    /// Allocation and swap I/O errors.
    pub fn swap_in(
        &self,
        space: &Arc<AddressSpace>,
        address: VirtualAddress,
    ) -> Result<Option<PhysicalPage>, VmError> {
        let page = address.page();
        loop {
            let state = space.lock();
            let entry = state.page_table.get(page);
            if !matches!(entry, PageState::Swapped(_)) {
                return Ok(None);
            }
            let Some(region) = state.regions.find(address).cloned() else {
                return Ok(None);
            };
            drop(state);

            if let Some(outcome) = self.load_page(space, &region, page, entry, FaultType::Read)? {
                return Ok(Some(outcome.frame()));
            }
        }
    }

    fn check_access(
        &self,
        state: &mut SpaceState,
        fault: FaultType,
        address: VirtualAddress,
    ) -> Result<RegionAccess, VmError> {
        let access = check_vaddr(&state.regions, fault, address, self.stack_growth_margin)
            .map_err(|reason| {
                log::warn!("segmentation fault: {fault} at {address}: {reason}");
                VmError::SegmentationFault {
                    address,
                    fault,
                    reason,
                }
            })?;
        if let Some(to) = access.grow_stack_to {
            state.regions.grow_stack(to);
        }
        Ok(access)
    }

    /// Resident page: refresh its TLB entry. A store marks the page dirty.
    #[allow(clippy::too_many_arguments)]
    fn refill(
        &self,
        space: &AddressSpace,
        state: &mut SpaceState,
        page: VirtualPage,
        frame: PhysicalPage,
        dirty: bool,
        fault: FaultType,
        access: RegionAccess,
    ) {
        let dirty = if fault.is_write() && !dirty {
            state
                .page_table
                .set(page, PageState::Resident { frame, dirty: true });
            self.coremap.mark_dirty(frame);
            log::trace!("{} {page} is now dirty", space.id());
            true
        } else {
            dirty
        };
        self.coremap.touch(frame);
        self.tlb
            .install(space.id(), page, frame, dirty && access.writable);
    }

    /// Allocate and fill a frame for a non-resident `page`, then install it
    /// unless the entry changed from `expected` in the meantime.
    ///
    /// Returns `Ok(None)` when the race was lost.
    fn load_page(
        &self,
        space: &Arc<AddressSpace>,
        region: &Region,
        page: VirtualPage,
        expected: PageState,
        fault: FaultType,
    ) -> Result<Option<FaultOutcome>, VmError> {
        let from_swap = matches!(expected, PageState::Swapped(_));
        let dirty = from_swap || fault.is_write();
        let frame = self.alloc_user_frame(space, page, dirty)?;

        let mut buf: PageBuf = [0; PAGE_SIZE as usize];
        if !from_swap {
            if let Err(e) = self.fill_initial(region, page, frame, &mut buf) {
                self.release_pinned(frame);
                return Err(e);
            }
        }

        let mut state = space.lock();
        let still_legal = state
            .regions
            .find(page.base())
            .is_some_and(|r| r.kind() == region.kind());
        if state.page_table.get(page) != expected || !still_legal {
            drop(state);
            self.release_pinned(frame);
            return Ok(None);
        }

        let outcome = if let PageState::Swapped(slot) = expected {
            // The slot is only stable while the lock is held.
            if let Err(e) = self.swap.read(slot, &mut buf) {
                drop(state);
                self.release_pinned(frame);
                return Err(e.into());
            }
            self.memory.write_frame(frame, &buf);
            self.swap.free_slot(slot);
            log::debug!("{} {page} swapped in from {slot} to {frame}", space.id());
            FaultOutcome::SwappedIn(frame)
        } else {
            FaultOutcome::Loaded(frame)
        };

        state
            .page_table
            .set(page, PageState::Resident { frame, dirty });
        self.coremap.unpin(frame);
        self.tlb
            .install(space.id(), page, frame, dirty && region.is_writable());
        drop(state);
        Ok(Some(outcome))
    }

    /// Write the initial contents of `page` into `frame`.
    fn fill_initial(
        &self,
        region: &Region,
        page: VirtualPage,
        frame: PhysicalPage,
        buf: &mut PageBuf,
    ) -> Result<(), VmError> {
        if matches!(region.backing(), Backing::Zero) {
            self.memory.zero_frame(frame);
        } else {
            region.fill_initial(page, buf)?;
            self.memory.write_frame(frame, buf);
        }
        Ok(())
    }
}
