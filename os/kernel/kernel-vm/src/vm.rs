//! # The Virtual-Memory System
//!
//! [`Vm`] ties the coremap, frame contents, the swap store and the TLB
//! together. This module covers bootstrap, the allocator entry points and the
//! address-space lifecycle; the fault path lives in [`crate::fault`] and
//! eviction in [`crate::evict`].
//!
//! ## Lock order
//!
//! ```text
//! address space ──► coremap ──► swap bitmap
//! ```
//!
//! Nothing that may allocate a frame runs with an address-space lock held,
//! because allocating may evict a page of any address space.

use alloc::sync::Arc;
use kernel_alloc::{Claim, Coremap, CoremapSnapshot, CoremapStats, FrameOwner, PhysMemory};
use kernel_info::memory::{kvaddr_to_paddr, paddr_to_kvaddr};
use kernel_memory_addresses::{PhysicalAddress, PhysicalPage, VirtualAddress, VirtualPage};
use kernel_vmem::{AddressSpace, PageState, Tlb};
use spin::Mutex;

use crate::swap::SwapStore;
use crate::{VmConfig, VmError};

/// The virtual-memory system of one machine.
pub struct Vm {
    pub(crate) coremap: Coremap,
    pub(crate) memory: Arc<dyn PhysMemory>,
    pub(crate) swap: SwapStore,
    pub(crate) tlb: Arc<dyn Tlb>,
    pub(crate) stack_growth_margin: u32,
    current: Mutex<Option<Arc<AddressSpace>>>,
}

impl Vm {
    /// Size the coremap to physical memory, mark the kernel image fixed and
    /// everything else free, and take over the swap device.
    #[must_use]
    pub fn bootstrap(config: VmConfig) -> Self {
        let coremap = Coremap::new(&config.boot);
        let swap = SwapStore::new(config.swap);
        let vm = Self {
            coremap,
            memory: config.memory,
            swap,
            tlb: config.tlb,
            stack_growth_margin: config.stack_growth_margin,
            current: Mutex::new(None),
        };
        vm.tlb.invalidate_all();
        log::info!(
            "vm: {}, {} swap slots",
            vm.coremap.stats(),
            vm.swap.capacity()
        );
        vm
    }

    #[inline]
    #[must_use]
    pub const fn coremap(&self) -> &Coremap {
        &self.coremap
    }

    #[inline]
    #[must_use]
    pub const fn swap(&self) -> &SwapStore {
        &self.swap
    }

    #[must_use]
    pub fn stats(&self) -> CoremapStats {
        self.coremap.stats()
    }

    /// Log the coremap at `debug` level and return it.
    pub fn dump_coremap(&self) -> CoremapSnapshot {
        let snapshot = self.coremap.snapshot();
        for line in alloc::format!("{snapshot}").lines() {
            log::debug!("{line}");
        }
        snapshot
    }

    /// Allocate `count` contiguous kernel pages and return their kernel
    /// virtual address.
    ///
    /// # Errors
    /// [`VmError::OutOfMemory`] or [`VmError::SwapExhausted`] when no run can
    /// be made free.
    pub fn alloc_kpages(&self, count: u32) -> Result<VirtualAddress, VmError> {
        let base = self.get_pages_with_swap(count, &Claim::Kernel)?;
        Ok(paddr_to_kvaddr(base.base()))
    }

    /// Free a kernel allocation by its kernel virtual address.
    ///
    /// # Panics
    /// Panics if `kva` is not the start of a live kernel allocation.
    pub fn free_kpages(&self, kva: VirtualAddress) {
        let Some(pa) = kvaddr_to_paddr(kva) else {
            panic!("free_kpages({kva}): not a kernel segment address");
        };
        self.coremap.free_kernel_pages(pa);
    }

    /// Back the page at `va` of `space` with a fresh zeroed frame and map it
    /// resident and dirty.
    ///
    /// # Errors
    /// [`VmError::AlreadyMapped`] if the page is resident or swapped, or the
    /// allocation errors of [`Vm::alloc_kpages`].
    pub fn alloc_upages(
        &self,
        va: VirtualAddress,
        space: &Arc<AddressSpace>,
    ) -> Result<PhysicalAddress, VmError> {
        let page = va.page();
        if !space.lock().page_table.get(page).is_unmapped() {
            return Err(VmError::AlreadyMapped(va));
        }

        let frame = self.alloc_user_frame(space, page, true)?;
        self.memory.zero_frame(frame);

        let mut state = space.lock();
        if !state.page_table.get(page).is_unmapped() {
            drop(state);
            self.release_pinned(frame);
            return Err(VmError::AlreadyMapped(va));
        }
        state
            .page_table
            .set(page, PageState::Resident { frame, dirty: true });
        self.coremap.unpin(frame);
        drop(state);

        log::debug!("alloc_upages: {va} of {} -> {frame}", space.id());
        Ok(frame.base())
    }

    /// Release the user frame at `pa` and unmap it from its owner.
    ///
    /// # Panics
    /// Panics if `pa` is not a user frame.
    pub fn free_upages(&self, pa: PhysicalAddress) {
        let frame = pa.page();
        let Some(info) = self.coremap.info(frame).filter(|i| i.state.is_user()) else {
            panic!("free_upages({pa}): not a user page");
        };
        let (Some(owner), Some(vpage)) = (info.owner, info.vpage) else {
            panic!("free_upages({pa}): user page without an owner");
        };

        let space = self.coremap.owner_of(frame).filter(|s| s.id() == owner);
        let state = space.as_ref().map(|s| s.lock());
        let still_ours = self
            .coremap
            .info(frame)
            .is_some_and(|i| i.generation == info.generation && i.state.is_user());
        if !still_ours {
            log::warn!("free_upages({pa}): page was evicted concurrently");
            return;
        }
        if let Some(mut state) = state
            && state.page_table.get(vpage).frame() == Some(frame)
        {
            state.page_table.clear(vpage);
            self.tlb.invalidate(owner, vpage);
        }
        self.coremap.free_user_page(frame);
        log::debug!("free_upages: {pa} ({owner} {vpage})");
    }

    /// Create an empty address space.
    #[must_use]
    pub fn create_space(&self) -> Arc<AddressSpace> {
        let space = Arc::new(AddressSpace::new());
        log::debug!("created {}", space.id());
        space
    }

    /// Make `space` the current address space and flush the TLB.
    pub fn activate(&self, space: &Arc<AddressSpace>) {
        *self.current.lock() = Some(Arc::clone(space));
        self.tlb.invalidate_all();
    }

    /// Forget the current address space, e.g. for a kernel-only thread.
    pub fn deactivate(&self) {
        *self.current.lock() = None;
        self.tlb.invalidate_all();
    }

    #[must_use]
    pub fn current_space(&self) -> Option<Arc<AddressSpace>> {
        self.current.lock().clone()
    }

    /// Duplicate `parent` for a fork: same regions, and a private copy of
    /// every page that is resident or swapped.
    ///
    /// # Errors
    /// Allocation and swap errors; the partial copy is destroyed.
    pub fn copy_space(&self, parent: &Arc<AddressSpace>) -> Result<Arc<AddressSpace>, VmError> {
        let (regions, pages) = {
            let state = parent.lock();
            (state.regions.clone(), state.page_table.mappings())
        };
        let child = Arc::new(AddressSpace::with_regions(regions));

        for (page, _) in pages {
            if let Err(e) = self.copy_page(parent, &child, page) {
                self.destroy_space(&child);
                return Err(e);
            }
        }
        log::debug!("copied {} into {}", parent.id(), child.id());
        Ok(child)
    }

    fn copy_page(
        &self,
        parent: &Arc<AddressSpace>,
        child: &Arc<AddressSpace>,
        page: VirtualPage,
    ) -> Result<(), VmError> {
        let frame = self.alloc_user_frame(child, page, false)?;

        let state = parent.lock();
        let dirty = match state.page_table.get(page) {
            PageState::Resident { frame: src, dirty } => {
                self.memory.copy_frame(src, frame);
                dirty
            }
            PageState::Swapped(slot) => {
                let mut buf = [0; kernel_memory_addresses::PAGE_SIZE as usize];
                if let Err(e) = self.swap.read(slot, &mut buf) {
                    drop(state);
                    self.release_pinned(frame);
                    return Err(e.into());
                }
                self.memory.write_frame(frame, &buf);
                true
            }
            // Dropped clean since the snapshot; the child reloads it too.
            PageState::Unmapped => {
                drop(state);
                self.release_pinned(frame);
                return Ok(());
            }
        };
        drop(state);

        if dirty {
            self.coremap.mark_dirty(frame);
        }
        child
            .lock()
            .page_table
            .set(page, PageState::Resident { frame, dirty });
        self.coremap.unpin(frame);
        Ok(())
    }

    /// Tear down `space`: free every frame and swap slot it holds and drop
    /// its TLB entries.
    pub fn destroy_space(&self, space: &Arc<AddressSpace>) {
        let mut state = space.lock();
        let mappings = state.page_table.take_all();
        for (page, entry) in &mappings {
            self.release_entry(space, *page, *entry);
        }
        drop(state);
        self.tlb.invalidate_space(space.id());

        let mut current = self.current.lock();
        if current.as_ref().is_some_and(|c| Arc::ptr_eq(c, space)) {
            *current = None;
        }
        log::debug!("destroyed {} ({} pages)", space.id(), mappings.len());
    }

    /// Move the program break of `space` by `delta` and return the old break.
    ///
    /// # Errors
    /// [`VmError::Region`] if the heap cannot move that way.
    pub fn sbrk(&self, space: &Arc<AddressSpace>, delta: i32) -> Result<VirtualAddress, VmError> {
        let mut state = space.lock();
        let change = state.regions.sbrk(delta)?;
        if let Some((start, end)) = change.released {
            let dropped = state.page_table.take_range(start, Some(end));
            for (page, entry) in dropped {
                self.release_entry(space, page, entry);
            }
        }
        Ok(change.old_break)
    }

    /// Free what a removed page-table entry held. The caller holds the lock
    /// of `space`.
    fn release_entry(&self, space: &AddressSpace, page: VirtualPage, entry: PageState) {
        match entry {
            PageState::Resident { frame, .. } => {
                self.tlb.invalidate(space.id(), page);
                self.coremap.free_user_page(frame);
            }
            PageState::Swapped(slot) => self.swap.free_slot(slot),
            PageState::Unmapped => {}
        }
    }

    /// Allocate a pinned user frame for `page` of `space`, evicting if needed.
    pub(crate) fn alloc_user_frame(
        &self,
        space: &Arc<AddressSpace>,
        page: VirtualPage,
        dirty: bool,
    ) -> Result<PhysicalPage, VmError> {
        let claim = Claim::User {
            owner: FrameOwner::new(space),
            vpage: page,
            dirty,
        };
        self.get_pages_with_swap(1, &claim)
    }

    /// Free a pinned frame that never made it into a page table.
    pub(crate) fn release_pinned(&self, frame: PhysicalPage) {
        self.coremap.free_user_page(frame);
        self.coremap.unpin(frame);
    }
}
